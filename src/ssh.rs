//! SSH forced-command transport
//!
//! sshd authenticates the key and runs `arkd forced-command --identity <name>`
//! from the matching `authorized_keys` entry. Whatever the client typed
//! arrives in `SSH_ORIGINAL_COMMAND` and is only ever passed to the
//! dispatcher. The payload is a raw tar stream on stdin; the answer is one
//! status line on stdout plus an exit code.
//!
//! stdin is copied into the same bounded payload channel the TLS transport
//! uses, so idle and total transfer limits apply to both.

use std::io::{self, Read, Write};
use tokio::sync::mpsc;

use crate::dispatch::Dispatcher;
use crate::error::{ArkError, ErrorClass};
use crate::session::{Session, TransportKind, VerifiedIdentity};
use crate::tar_stream::{payload_channel, Chunk, StreamLimits, TarConfig};

/// Process exit code for a finished forced command.
pub fn exit_code(outcome: Result<u64, ErrorClass>) -> i32 {
    match outcome {
        Ok(_) => 0,
        Err(ErrorClass::Rejected) => 2,
        Err(ErrorClass::Retryable) => 75, // EX_TEMPFAIL
        Err(ErrorClass::Failed) => 1,
    }
}

fn status_line(outcome: &Result<u64, ArkError>) -> String {
    match outcome {
        Ok(bytes) => format!("OK bytes={}", bytes),
        Err(e) => {
            let tag = match e.class() {
                ErrorClass::Rejected => "REJECTED",
                ErrorClass::Retryable => "RETRY",
                ErrorClass::Failed => "FAILED",
            };
            format!("{} {}", tag, e.public_message())
        }
    }
}

/// Copy `input` into the payload channel on a plain thread. EOF becomes
/// `End`; a read error closes the channel without it, which the executor
/// sees as a truncated stream. The thread stops as soon as the receiver is
/// gone, or stays parked in `read` until the process exits.
fn spawn_stdin_pump<R>(mut input: R, tx: mpsc::Sender<Chunk>, chunk_size: usize)
where
    R: Read + Send + 'static,
{
    std::thread::spawn(move || {
        let mut buf = vec![0u8; chunk_size];
        loop {
            match input.read(&mut buf) {
                Ok(0) => {
                    let _ = tx.blocking_send(Chunk::End);
                    return;
                }
                Ok(n) => {
                    if tx.blocking_send(Chunk::Data(buf[..n].to_vec())).is_err() {
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    tracing::debug!(error = %e, "payload read failed");
                    return;
                }
            }
        }
    });
}

/// Run one forced-command session. `original_command` is the raw
/// `SSH_ORIGINAL_COMMAND` (absent when the client asked for a shell);
/// `limits` bound how long the executor waits on `payload`.
pub async fn run_forced_command<R, W>(
    dispatcher: &Dispatcher,
    identity: &str,
    original_command: Option<&str>,
    payload: R,
    limits: StreamLimits,
    out: &mut W,
) -> io::Result<Result<u64, ErrorClass>>
where
    R: Read + Send + 'static,
    W: Write,
{
    let session = Session::from_transport(
        VerifiedIdentity::new(identity),
        original_command.unwrap_or(""),
        TransportKind::SshForcedCommand,
        std::env::var("SSH_CLIENT").ok(),
    );
    let tar = TarConfig::default();
    let (tx, reader) = payload_channel(&tar, limits);
    spawn_stdin_pump(payload, tx, tar.chunk_size);
    let outcome = dispatcher.handle(&session, reader).await.map(|r| r.bytes);
    writeln!(out, "{}", status_line(&outcome))?;
    out.flush()?;
    Ok(outcome.map_err(|e| e.class()))
}
