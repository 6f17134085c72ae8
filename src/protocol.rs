//! Shared protocol constants for the ark framed transport

// Protocol header constants
pub const MAGIC: &[u8; 4] = b"ARK1";
pub const VERSION: u16 = 1;

/// Frame header length: MAGIC (4) | VERSION (2) | TYPE (1) | LENGTH (4)
pub const HEADER_LEN: usize = 11;

// Maximum frame payload size (16MB) - prevents DoS via memory exhaustion
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

// Maximum length of the requested-operation string in PUSH_REQ
pub const MAX_REQUEST_LEN: usize = 4096;

/// The one operation a session may request.
pub const PUSH_OPERATION: &str = "push-archive";

// Frame type IDs
pub mod frame {
    // Client -> server: requested operation line (UTF-8)
    pub const PUSH_REQ: u8 = 1;
    // Server -> client: dispatch accepted, stream may begin
    pub const OK: u8 = 2;
    // Server -> client: class u8 | message bytes
    pub const ERROR: u8 = 3;
    // Client -> server: chunk of the tar payload
    pub const TAR_DATA: u8 = 9;
    // Client -> server: payload complete
    pub const TAR_END: u8 = 10;
    // Server -> client: bytes u64 (promoted)
    pub const DONE: u8 = 7;
}

// Centralized timeout constants
pub mod timeouts {
    // Time allowed for the client to send PUSH_REQ after the handshake (ms)
    pub const REQUEST_MS: u64 = 5_000;

    // TLS handshake bound (ms)
    pub const HANDSHAKE_MS: u64 = 10_000;

    // Wait for OK/ERROR after PUSH_REQ; covers a queued lock wait (ms)
    pub const ADMIT_MS: u64 = 60_000;

    // Wait for DONE/ERROR after TAR_END; covers unpack tail and promotion (ms)
    pub const FINISH_MS: u64 = 600_000;

    // Base timeout for writes; absorbs receiver backpressure (ms)
    pub const WRITE_BASE_MS: u64 = 30_000;

    // Additional timeout per MB of data (ms)
    pub const PER_MB_MS: u64 = 100;

    // Connection establishment timeout (ms)
    pub const CONNECT_MS: u64 = 5_000;

    // Calculate write deadline based on payload size (ms)
    // 30s base + 100ms per 1MB payload (ceil)
    pub fn write_deadline_ms(payload_len: usize) -> u64 {
        let mb = (payload_len as u64 + 1_048_575) / 1_048_576;
        WRITE_BASE_MS + mb * PER_MB_MS
    }
}
