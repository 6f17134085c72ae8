//! Shared CLI helpers and small reusable Clap fragments

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use crate::audit::AuditFormat;
use crate::config::{ArkConfig, BackpressureMode};

/// Daemon options shared by `arkd serve`, `forced-command` and
/// `check-manifest`. Every flag overrides the config file.
#[derive(Clone, Debug, Default, Parser)]
pub struct DaemonOpts {
    /// Config file (TOML)
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Bind address (host:port)
    #[arg(long)]
    pub bind: Option<String>,

    /// Archive root every destination lives under
    #[arg(long)]
    pub archive_root: Option<PathBuf>,

    /// Client manifest (TOML)
    #[arg(long)]
    pub manifest: Option<PathBuf>,

    /// Audit log file
    #[arg(long)]
    pub audit_log: Option<PathBuf>,

    /// Audit line format: kv or json
    #[arg(long)]
    pub audit_format: Option<AuditFormat>,

    /// What to do when a destination is busy
    #[arg(long, value_enum)]
    pub backpressure: Option<BackpressureMode>,

    /// Waiters allowed per destination in queue mode
    #[arg(long)]
    pub queue_depth: Option<usize>,
}

impl DaemonOpts {
    /// Load the config file (or defaults) and apply flag overrides.
    pub fn resolve(&self) -> Result<ArkConfig> {
        let mut cfg = match &self.config {
            Some(path) => ArkConfig::load(path)?,
            None => ArkConfig::default(),
        };
        if let Some(v) = &self.bind {
            cfg.bind = v.clone();
        }
        if let Some(v) = &self.archive_root {
            cfg.archive_root = v.clone();
        }
        if let Some(v) = &self.manifest {
            cfg.manifest = v.clone();
        }
        if let Some(v) = &self.audit_log {
            cfg.audit_log = v.clone();
        }
        if let Some(v) = self.audit_format {
            cfg.audit_format = v;
        }
        if let Some(v) = self.backpressure {
            cfg.backpressure = v;
        }
        if let Some(v) = self.queue_depth {
            cfg.queue_depth = v;
        }
        Ok(cfg)
    }
}

/// Install the tracing subscriber. `RUST_LOG` wins over `verbose`.
pub fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));
    // Logs go to stderr: stdout carries the forced-command status line
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arkd.toml");
        std::fs::write(&path, "archive_root = \"/from/file\"\nqueue_depth = 9\n").unwrap();

        let opts = DaemonOpts::parse_from([
            "arkd",
            "--config",
            path.to_str().unwrap(),
            "--archive-root",
            "/from/flag",
            "--backpressure",
            "queue",
        ]);
        let cfg = opts.resolve().unwrap();
        assert_eq!(cfg.archive_root, PathBuf::from("/from/flag"));
        assert_eq!(cfg.backpressure, BackpressureMode::Queue);
        assert_eq!(cfg.queue_depth, 9);
    }
}
