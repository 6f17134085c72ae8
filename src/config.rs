//! Daemon configuration
//!
//! Read from TOML with a default for every field, then overridden from the
//! command line. `build_dispatcher` validates the result and wires the core.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::audit::{AuditFormat, AuditLog, AuditSink, FileSink};
use crate::broker::{Owner, PrivilegeBroker};
use crate::dispatch::Dispatcher;
use crate::executor::TransferExecutor;
use crate::lock_table::{Backpressure, LockTable};
use crate::protocol::timeouts::ADMIT_MS;
use crate::registry::{RegistryHandle, RESERVED_PREFIX};
use crate::tar_stream::{StreamLimits, TarConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackpressureMode {
    #[default]
    Reject,
    Queue,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ArkConfig {
    pub bind: String,
    pub archive_root: PathBuf,
    pub manifest: PathBuf,
    pub audit_log: PathBuf,
    pub audit_format: AuditFormat,
    pub tls_cert: PathBuf,
    pub tls_key: PathBuf,
    /// `sha256:<hex>=<identity>` lines. Without it every TLS client is
    /// identified by its bare fingerprint.
    pub authorized_clients: Option<PathBuf>,
    pub backpressure: BackpressureMode,
    pub queue_depth: usize,
    /// Queue mode only. Must stay below the client's admission wait
    /// (`ADMIT_MS`), or clients give up while still holding a queue slot.
    pub lock_wait_ms: u64,
    /// Longest gap between two payload chunks.
    pub idle_timeout_ms: u64,
    /// Bound on one whole push.
    pub transfer_timeout_ms: u64,
    pub owner_uid: Option<u32>,
    pub owner_gid: Option<u32>,
}

impl Default for ArkConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:9031".to_string(),
            archive_root: PathBuf::from("/srv/ark"),
            manifest: PathBuf::from("/etc/ark/clients.toml"),
            audit_log: PathBuf::from("/var/log/ark/audit.log"),
            audit_format: AuditFormat::Kv,
            tls_cert: PathBuf::from("/etc/ark/server-cert.pem"),
            tls_key: PathBuf::from("/etc/ark/server-key.pem"),
            authorized_clients: None,
            backpressure: BackpressureMode::Reject,
            queue_depth: 4,
            lock_wait_ms: 5_000,
            idle_timeout_ms: 30_000,
            transfer_timeout_ms: 6 * 60 * 60 * 1000,
            owner_uid: None,
            owner_gid: None,
        }
    }
}

impl ArkConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).context("parse config")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("in {}", path.display()))
    }

    pub fn with_archive_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.archive_root = root.into();
        self
    }

    pub fn with_manifest(mut self, manifest: impl Into<PathBuf>) -> Self {
        self.manifest = manifest.into();
        self
    }

    pub fn with_backpressure(mut self, mode: BackpressureMode, queue_depth: usize) -> Self {
        self.backpressure = mode;
        self.queue_depth = queue_depth;
        self
    }

    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait_ms = wait.as_millis() as u64;
        self
    }

    pub fn with_idle_timeout(mut self, idle: Duration) -> Self {
        self.idle_timeout_ms = idle.as_millis() as u64;
        self
    }

    pub fn backpressure_policy(&self) -> Backpressure {
        match self.backpressure {
            BackpressureMode::Reject => Backpressure::Reject,
            BackpressureMode::Queue => Backpressure::Queue {
                depth: self.queue_depth,
            },
        }
    }

    pub fn stream_limits(&self) -> StreamLimits {
        StreamLimits {
            idle: Duration::from_millis(self.idle_timeout_ms),
            total: Duration::from_millis(self.transfer_timeout_ms),
        }
    }

    pub fn owner(&self) -> Result<Option<Owner>> {
        match (self.owner_uid, self.owner_gid) {
            (Some(uid), Some(gid)) => Ok(Some(Owner { uid, gid })),
            (None, None) => Ok(None),
            _ => bail!("owner_uid and owner_gid must be set together"),
        }
    }

    /// The archive root, canonicalized. Must be an existing directory.
    pub fn canonical_root(&self) -> Result<PathBuf> {
        let root = self
            .archive_root
            .canonicalize()
            .with_context(|| format!("archive root {}", self.archive_root.display()))?;
        if !root.is_dir() {
            bail!("archive root {} is not a directory", root.display());
        }
        Ok(root)
    }

    /// Per-destination lock files shared by every `arkd` process on this root.
    pub fn lock_dir(&self, canonical_root: &Path) -> PathBuf {
        canonical_root.join(format!("{}locks", RESERVED_PREFIX))
    }

    pub fn open_audit_sink(&self) -> Result<Arc<dyn AuditSink>> {
        let sink = FileSink::open(&self.audit_log, self.audit_format)
            .with_context(|| format!("open audit log {}", self.audit_log.display()))?;
        Ok(Arc::new(sink))
    }

    /// Validate the configuration, load the manifest, and wire registry,
    /// lock table, broker, executor and dispatcher together.
    pub fn build_dispatcher(&self, sink: Arc<dyn AuditSink>) -> Result<Arc<Dispatcher>> {
        if self.backpressure == BackpressureMode::Queue && self.queue_depth == 0 {
            bail!("queue backpressure needs queue_depth >= 1");
        }
        if self.backpressure == BackpressureMode::Queue && self.lock_wait_ms >= ADMIT_MS {
            bail!(
                "lock_wait_ms ({}) must be below the client admission wait of {} ms",
                self.lock_wait_ms,
                ADMIT_MS
            );
        }
        if self.idle_timeout_ms == 0 || self.transfer_timeout_ms == 0 {
            bail!("idle_timeout_ms and transfer_timeout_ms must be positive");
        }
        let root = self.canonical_root()?;
        let owner = self.owner()?;
        let registry = RegistryHandle::from_manifest(&self.manifest, &root)
            .with_context(|| format!("load manifest {}", self.manifest.display()))?;
        tracing::info!(
            root = %root.display(),
            clients = registry.snapshot().len(),
            backpressure = ?self.backpressure_policy(),
            "registry loaded"
        );

        let audit = AuditLog::new(sink);
        let locks = LockTable::new(self.backpressure_policy(), Duration::from_millis(self.lock_wait_ms))
            .with_lock_dir(self.lock_dir(&root));
        let broker = Arc::new(PrivilegeBroker::new(root.clone(), owner));
        let executor = Arc::new(TransferExecutor::new(root, locks, broker, audit.clone()));
        Ok(Arc::new(Dispatcher::new(Arc::new(registry), executor, audit)))
    }

    pub fn tar_config(&self) -> TarConfig {
        TarConfig::default()
    }
}
