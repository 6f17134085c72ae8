//! Client registry: identity -> destination routing
//!
//! The manifest is loaded once into an immutable table. Every destination is
//! checked at load time to resolve strictly inside the archive root, so no
//! later lookup can route a push outside the archive tree.

use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{ArkError, ArkResult};
use crate::protocol_core::{is_strict_descendant, safe_relative};

/// Prefix reserved for staging and quarantine directories.
pub const RESERVED_PREFIX: &str = ".ark-";

/// One routed client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientEntry {
    pub identity: String,
    /// Destination relative to the archive root, as written in the manifest.
    pub relative: PathBuf,
    /// Absolute destination (`archive_root.join(relative)`).
    pub destination: PathBuf,
    pub enabled: bool,
    /// Upper bound on the file bytes a single push may carry.
    pub quota_bytes: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManifestFile {
    #[serde(default, rename = "client")]
    clients: Vec<ManifestRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManifestRecord {
    identity: String,
    destination: PathBuf,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    quota_bytes: Option<u64>,
}

fn default_enabled() -> bool {
    true
}

/// Immutable identity table.
#[derive(Debug)]
pub struct ClientRegistry {
    archive_root: PathBuf,
    clients: HashMap<String, ClientEntry>,
}

impl ClientRegistry {
    /// Parse and validate a manifest. Any bad record fails the whole load.
    pub fn from_manifest_str(text: &str, archive_root: &Path) -> ArkResult<Self> {
        let parsed: ManifestFile =
            toml::from_str(text).map_err(|e| ArkError::Manifest(format!("parse: {}", e)))?;

        let mut clients: HashMap<String, ClientEntry> = HashMap::new();
        for (idx, rec) in parsed.clients.into_iter().enumerate() {
            let entry = validate_record(idx, rec, archive_root)?;
            if clients.contains_key(&entry.identity) {
                return Err(ArkError::Manifest(format!(
                    "record {}: duplicate identity {:?}",
                    idx, entry.identity
                )));
            }
            for other in clients.values() {
                if entry.relative.starts_with(&other.relative)
                    || other.relative.starts_with(&entry.relative)
                {
                    return Err(ArkError::Manifest(format!(
                        "record {}: destination {:?} overlaps {:?} of {:?}",
                        idx, entry.relative, other.relative, other.identity
                    )));
                }
            }
            clients.insert(entry.identity.clone(), entry);
        }

        Ok(Self {
            archive_root: archive_root.to_path_buf(),
            clients,
        })
    }

    pub fn load(manifest: &Path, archive_root: &Path) -> ArkResult<Self> {
        let text = std::fs::read_to_string(manifest).map_err(|e| {
            ArkError::Manifest(format!("read {}: {}", manifest.display(), e))
        })?;
        Self::from_manifest_str(&text, archive_root)
    }

    /// Look up an identity. Pure; safe for concurrent callers.
    pub fn resolve(&self, identity: &str) -> ArkResult<&ClientEntry> {
        match self.clients.get(identity) {
            None => Err(ArkError::UnknownClient(identity.to_string())),
            Some(entry) if !entry.enabled => Err(ArkError::DisabledClient(identity.to_string())),
            Some(entry) => Ok(entry),
        }
    }

    pub fn archive_root(&self) -> &Path {
        &self.archive_root
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Entries sorted by identity.
    pub fn entries(&self) -> Vec<&ClientEntry> {
        let mut v: Vec<_> = self.clients.values().collect();
        v.sort_by(|a, b| a.identity.cmp(&b.identity));
        v
    }
}

fn validate_record(idx: usize, rec: ManifestRecord, archive_root: &Path) -> ArkResult<ClientEntry> {
    let identity = rec.identity.trim();
    if identity.is_empty() {
        return Err(ArkError::Manifest(format!("record {}: empty identity", idx)));
    }
    if identity != rec.identity || identity.chars().any(|c| c.is_control() || c.is_whitespace()) {
        return Err(ArkError::Manifest(format!(
            "record {}: identity {:?} contains whitespace or control characters",
            idx, rec.identity
        )));
    }

    let relative = safe_relative(&rec.destination).map_err(|e| {
        ArkError::Manifest(format!(
            "record {} ({}): destination {:?}: {}",
            idx, identity, rec.destination, e
        ))
    })?;
    for comp in relative.iter() {
        if comp.to_string_lossy().starts_with(RESERVED_PREFIX) {
            return Err(ArkError::Manifest(format!(
                "record {} ({}): destination uses reserved prefix {:?}",
                idx, identity, RESERVED_PREFIX
            )));
        }
    }

    let destination = archive_root.join(&relative);
    if !is_strict_descendant(archive_root, &destination) {
        return Err(ArkError::Manifest(format!(
            "record {} ({}): destination escapes archive root",
            idx, identity
        )));
    }

    Ok(ClientEntry {
        identity: identity.to_string(),
        relative,
        destination,
        enabled: rec.enabled,
        quota_bytes: rec.quota_bytes,
    })
}

/// Shared, swappable view of the registry.
///
/// Readers grab an `Arc` snapshot; `reload` builds a complete new table off
/// to the side and swaps the pointer, serialized by its own lock.
pub struct RegistryHandle {
    current: RwLock<Arc<ClientRegistry>>,
    reload_lock: Mutex<()>,
    manifest: Option<PathBuf>,
}

impl RegistryHandle {
    pub fn new(registry: ClientRegistry) -> Self {
        Self {
            current: RwLock::new(Arc::new(registry)),
            reload_lock: Mutex::new(()),
            manifest: None,
        }
    }

    pub fn from_manifest(manifest: &Path, archive_root: &Path) -> ArkResult<Self> {
        let registry = ClientRegistry::load(manifest, archive_root)?;
        Ok(Self {
            current: RwLock::new(Arc::new(registry)),
            reload_lock: Mutex::new(()),
            manifest: Some(manifest.to_path_buf()),
        })
    }

    pub fn snapshot(&self) -> Arc<ClientRegistry> {
        self.current.read().clone()
    }

    /// Re-read the manifest. On error the previous table stays in place.
    pub fn reload(&self) -> ArkResult<usize> {
        let _serialized = self.reload_lock.lock();
        let manifest = self
            .manifest
            .as_deref()
            .ok_or_else(|| ArkError::Manifest("registry was not loaded from a file".into()))?;
        let root = self.snapshot().archive_root().to_path_buf();
        let fresh = Arc::new(ClientRegistry::load(manifest, &root)?);
        let count = fresh.len();
        *self.current.write() = fresh;
        Ok(count)
    }
}
