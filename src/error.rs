//! Error taxonomy for dispatch, transfer, and escalation

use thiserror::Error;

/// Result type used throughout the ingestion core.
pub type ArkResult<T> = Result<T, ArkError>;

/// Every way a push can end other than success.
#[derive(Error, Debug)]
pub enum ArkError {
    /// Identity has no registry entry.
    #[error("unknown client: {0}")]
    UnknownClient(String),

    /// Identity has an entry but it is disabled.
    #[error("client disabled: {0}")]
    DisabledClient(String),

    /// The session asked for something other than a push.
    #[error("forbidden operation: {0}")]
    ForbiddenOperation(String),

    /// Escalation request outside the allow-list.
    #[error("forbidden action: {0}")]
    ForbiddenAction(String),

    /// Destination lock is held (or its queue is full).
    #[error("destination busy: {0}")]
    Busy(String),

    /// Lock wait or transfer I/O exceeded its bound.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The payload stream ended early or was malformed.
    #[error("partial transfer: {0}")]
    PartialTransfer(String),

    /// Payload tried to leave the destination subtree or carried a
    /// forbidden entry kind.
    #[error("unsafe payload: {0}")]
    UnsafePayload(String),

    /// Local storage could not accept the transfer.
    #[error("storage failure: {0}")]
    StorageFailure(String),

    /// Manifest could not be loaded. Startup only.
    #[error("manifest error: {0}")]
    Manifest(String),
}

/// What the remote side is told about a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Authorization failure. Do not retry.
    Rejected,
    /// Capacity or timeout. Retry later.
    Retryable,
    /// Transfer failed. Retry the whole push.
    Failed,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Rejected => "rejected",
            ErrorClass::Retryable => "retry",
            ErrorClass::Failed => "failed",
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            ErrorClass::Rejected => 1,
            ErrorClass::Retryable => 2,
            ErrorClass::Failed => 3,
        }
    }

    pub fn from_wire(b: u8) -> Option<Self> {
        match b {
            1 => Some(ErrorClass::Rejected),
            2 => Some(ErrorClass::Retryable),
            3 => Some(ErrorClass::Failed),
            _ => None,
        }
    }
}

impl ArkError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ArkError::UnknownClient(_)
            | ArkError::DisabledClient(_)
            | ArkError::ForbiddenOperation(_)
            | ArkError::ForbiddenAction(_)
            | ArkError::UnsafePayload(_)
            | ArkError::Manifest(_) => ErrorClass::Rejected,
            ArkError::Busy(_) | ArkError::Timeout(_) => ErrorClass::Retryable,
            ArkError::PartialTransfer(_) | ArkError::StorageFailure(_) => ErrorClass::Failed,
        }
    }

    /// Capacity failures the client may simply try again.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }

    /// Short stable tag used as the audit `reason` prefix.
    pub fn kind(&self) -> &'static str {
        match self {
            ArkError::UnknownClient(_) => "unknown_client",
            ArkError::DisabledClient(_) => "disabled_client",
            ArkError::ForbiddenOperation(_) => "forbidden_operation",
            ArkError::ForbiddenAction(_) => "forbidden_action",
            ArkError::Busy(_) => "busy",
            ArkError::Timeout(_) => "timeout",
            ArkError::PartialTransfer(_) => "partial_transfer",
            ArkError::UnsafePayload(_) => "unsafe_payload",
            ArkError::StorageFailure(_) => "storage_failure",
            ArkError::Manifest(_) => "manifest",
        }
    }

    /// `reason` field of an audit record: the stable tag, then the detail.
    pub fn audit_reason(&self) -> String {
        format!("{}: {}", self.kind(), self)
    }

    /// Message safe to send to the remote party. Never names registry
    /// contents: unknown and disabled identities are indistinguishable.
    pub fn public_message(&self) -> String {
        match self {
            ArkError::UnknownClient(_) | ArkError::DisabledClient(_) => "push rejected".to_string(),
            ArkError::ForbiddenOperation(_) => "operation not permitted".to_string(),
            ArkError::ForbiddenAction(_) => "push rejected".to_string(),
            ArkError::Busy(_) => "destination busy, retry later".to_string(),
            ArkError::Timeout(_) => "timed out, retry later".to_string(),
            ArkError::UnsafePayload(m) => format!("payload rejected: {}", m),
            ArkError::PartialTransfer(_) => "transfer incomplete, retry the push".to_string(),
            ArkError::StorageFailure(_) => "server storage failure, retry the push".to_string(),
            ArkError::Manifest(_) => "server misconfigured".to_string(),
        }
    }

    /// Maps an I/O error raised while streaming a payload.
    pub(crate) fn from_stream_io(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::TimedOut => ArkError::Timeout(e.to_string()),
            ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::BrokenPipe
            | ErrorKind::InvalidData
            | ErrorKind::InvalidInput => ArkError::PartialTransfer(e.to_string()),
            _ => ArkError::StorageFailure(e.to_string()),
        }
    }
}
