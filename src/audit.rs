//! Append-only audit trail of dispatch decisions and transfer outcomes
//!
//! One line per event. Writing is best-effort: a failing sink is reported
//! on the operational log and never changes the outcome of a push.

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Accepted,
    Rejected,
    Failed,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Accepted => "accepted",
            Decision::Rejected => "rejected",
            Decision::Failed => "failed",
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub session: String,
    pub identity: String,
    pub decision: Decision,
    pub reason: String,
    pub bytes: u64,
}

impl AuditRecord {
    pub fn new(session: &str, identity: &str, decision: Decision, reason: impl Into<String>, bytes: u64) -> Self {
        Self {
            timestamp: Utc::now(),
            session: session.to_string(),
            identity: identity.to_string(),
            decision,
            reason: reason.into(),
            bytes,
        }
    }

    /// `key=value` rendering. Values that are not plain tokens are quoted.
    pub fn to_kv_line(&self) -> String {
        format!(
            "ts={} session={} identity={} decision={} bytes={} reason={}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            kv_value(&self.session),
            kv_value(&self.identity),
            self.decision.as_str(),
            self.bytes,
            kv_value(&self.reason),
        )
    }

    pub fn to_json_line(&self) -> String {
        // Serializing a struct of strings and integers cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

fn kv_value(v: &str) -> String {
    let plain = !v.is_empty()
        && v
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | '/' | '@'));
    if plain {
        return v.to_string();
    }
    let mut out = String::with_capacity(v.len() + 2);
    out.push('"');
    for c in v.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c if c.is_control() => out.push_str(&format!("\\u{{{:x}}}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditFormat {
    #[default]
    Kv,
    Json,
}

impl std::str::FromStr for AuditFormat {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "kv" => Ok(AuditFormat::Kv),
            "json" => Ok(AuditFormat::Json),
            other => Err(format!("unknown audit format {:?} (expected kv or json)", other)),
        }
    }
}

/// Where audit lines go.
pub trait AuditSink: Send + Sync {
    fn append(&self, record: &AuditRecord) -> std::io::Result<()>;
}

/// Appends lines to a file opened in append mode.
pub struct FileSink {
    file: Mutex<File>,
    format: AuditFormat,
}

impl FileSink {
    pub fn open<P: AsRef<Path>>(path: P, format: AuditFormat) -> std::io::Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
            format,
        })
    }
}

impl AuditSink for FileSink {
    fn append(&self, record: &AuditRecord) -> std::io::Result<()> {
        let line = match self.format {
            AuditFormat::Kv => record.to_kv_line(),
            AuditFormat::Json => record.to_json_line(),
        };
        outside_async_worker(|| {
            let mut f = self.file.lock();
            // Single write so concurrent lines never interleave
            f.write_all(format!("{}\n", line).as_bytes())?;
            f.flush()
        })
    }
}

/// Run blocking file I/O. On a multi-thread runtime worker the worker is
/// handed off first so other connections keep running; elsewhere `f` runs
/// in place.
fn outside_async_worker<T>(f: impl FnOnce() -> T) -> T {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == tokio::runtime::RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

/// Keeps records in memory; used by tests and `check-manifest` dry runs.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemorySink {
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }
}

impl AuditSink for MemorySink {
    fn append(&self, record: &AuditRecord) -> std::io::Result<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}

/// Front door for audit records.
#[derive(Clone)]
pub struct AuditLog {
    sink: Arc<dyn AuditSink>,
}

impl AuditLog {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    pub fn record(&self, record: AuditRecord) {
        tracing::debug!(
            identity = %record.identity,
            session = %record.session,
            decision = record.decision.as_str(),
            bytes = record.bytes,
            reason = %record.reason,
            "audit"
        );
        if let Err(e) = self.sink.append(&record) {
            tracing::warn!(
                error = %e,
                identity = %record.identity,
                decision = record.decision.as_str(),
                "audit sink write failed; record dropped"
            );
        }
    }
}
