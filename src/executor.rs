//! Transfer executor: unpack a pushed archive and promote it atomically
//!
//! Every push is unpacked into a staging directory next to its destination.
//! Only a fully received and validated archive is promoted; anything else is
//! renamed to a quarantine name and never becomes visible at the canonical
//! path. The destination lock travels with the blocking unpack job, so it is
//! released only after promotion or quarantine has finished.

use chrono::Utc;
use std::fs;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::audit::{AuditLog, AuditRecord, Decision};
use crate::broker::{ActionKind, PrivilegeBroker};
use crate::error::{ArkError, ArkResult, ErrorClass};
use crate::lock_table::{ClientLock, LockTable};
use crate::protocol_core::{normalize_under_root, safe_relative};
use crate::registry::{ClientEntry, RESERVED_PREFIX};
use crate::session::Session;

// Bytes tolerated after the tar trailer (record padding from tar(1))
const MAX_TRAILING_BYTES: u64 = 1024 * 1024;

/// A dispatched push. Built only by the dispatcher, so the destination is
/// always the registry's, never the client's.
#[derive(Debug, Clone)]
pub struct PushRequest {
    session: String,
    identity: String,
    relative: PathBuf,
    destination: PathBuf,
    sources: Vec<String>,
    quota_bytes: Option<u64>,
}

impl PushRequest {
    pub(crate) fn new(session: &Session, entry: &ClientEntry, sources: Vec<String>) -> Self {
        Self {
            session: session.id().to_string(),
            identity: entry.identity.clone(),
            relative: entry.relative.clone(),
            destination: entry.destination.clone(),
            sources,
            quota_bytes: entry.quota_bytes,
        }
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn sources(&self) -> &[String] {
        &self.sources
    }
}

#[derive(Debug, Clone)]
pub struct TransferResult {
    pub identity: String,
    pub destination: PathBuf,
    pub files: u64,
    pub bytes: u64,
    pub elapsed: Duration,
}

pub struct TransferExecutor {
    archive_root: PathBuf,
    locks: LockTable,
    broker: Arc<PrivilegeBroker>,
    audit: AuditLog,
}

impl TransferExecutor {
    /// `archive_root` must be the canonical root the registry was loaded with.
    pub fn new(archive_root: PathBuf, locks: LockTable, broker: Arc<PrivilegeBroker>, audit: AuditLog) -> Self {
        Self {
            archive_root,
            locks,
            broker,
            audit,
        }
    }

    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    /// Take the destination lock according to the backpressure policy.
    /// Failures are audited as rejections.
    pub async fn reserve(&self, request: &PushRequest) -> ArkResult<ClientLock> {
        match self.locks.acquire(&request.destination).await {
            Ok(lock) => Ok(lock),
            Err(e) => {
                tracing::info!(
                    identity = %request.identity,
                    session = %request.session,
                    error = %e,
                    "destination lock not acquired"
                );
                self.audit.record(AuditRecord::new(
                    &request.session,
                    &request.identity,
                    Decision::Rejected,
                    e.audit_reason(),
                    0,
                ));
                Err(e)
            }
        }
    }

    /// Lock, receive, and promote.
    pub async fn execute<R>(&self, request: PushRequest, payload: R) -> ArkResult<TransferResult>
    where
        R: Read + Send + 'static,
    {
        let lock = self.reserve(&request).await?;
        self.execute_locked(request, lock, payload).await
    }

    /// Give up on a reserved push before any payload was read. The outcome
    /// is audited and the lock released.
    pub fn abandon(&self, request: PushRequest, lock: ClientLock, error: ArkError) -> ArkError {
        tracing::warn!(
            identity = %request.identity,
            session = %request.session,
            error = %error,
            "push abandoned before payload"
        );
        self.audit.record(AuditRecord::new(
            &request.session,
            &request.identity,
            decision_for(&error),
            error.audit_reason(),
            0,
        ));
        drop(lock);
        error
    }

    /// Receive and promote under a lock obtained from [`reserve`](Self::reserve).
    pub async fn execute_locked<R>(&self, request: PushRequest, lock: ClientLock, payload: R) -> ArkResult<TransferResult>
    where
        R: Read + Send + 'static,
    {
        let job = ReceiveJob {
            archive_root: self.archive_root.clone(),
            broker: self.broker.clone(),
            audit: self.audit.clone(),
            request,
        };
        match tokio::task::spawn_blocking(move || job.run(lock, payload)).await {
            Ok(result) => result,
            Err(e) => Err(ArkError::StorageFailure(format!("receiver task failed: {}", e))),
        }
    }
}

/// Audit decision for a push that did not complete.
fn decision_for(e: &ArkError) -> Decision {
    match e.class() {
        ErrorClass::Rejected => Decision::Rejected,
        _ => Decision::Failed,
    }
}

struct ReceiveJob {
    archive_root: PathBuf,
    broker: Arc<PrivilegeBroker>,
    audit: AuditLog,
    request: PushRequest,
}

impl ReceiveJob {
    fn run<R: Read>(self, lock: ClientLock, payload: R) -> ArkResult<TransferResult> {
        let started = Instant::now();
        let req = &self.request;
        let result = self.receive(payload).map(|(files, bytes)| TransferResult {
            identity: req.identity.clone(),
            destination: req.destination.clone(),
            files,
            bytes,
            elapsed: started.elapsed(),
        });

        match &result {
            Ok(r) => {
                tracing::info!(
                    identity = %r.identity,
                    session = %req.session,
                    files = r.files,
                    bytes = r.bytes,
                    secs = r.elapsed.as_secs_f64(),
                    "push promoted"
                );
                self.audit.record(AuditRecord::new(
                    &req.session,
                    &req.identity,
                    Decision::Accepted,
                    format!("promoted {} files", r.files),
                    r.bytes,
                ));
            }
            Err(e) => {
                tracing::warn!(identity = %req.identity, session = %req.session, error = %e, "push failed");
                self.audit.record(AuditRecord::new(
                    &req.session,
                    &req.identity,
                    decision_for(e),
                    e.audit_reason(),
                    0,
                ));
            }
        }
        drop(lock);
        result
    }

    fn receive<R: Read>(&self, payload: R) -> ArkResult<(u64, u64)> {
        let destination = self.confine()?;
        let parent = destination
            .parent()
            .ok_or_else(|| ArkError::StorageFailure("destination has no parent".into()))?
            .to_path_buf();
        if parent != self.archive_root {
            self.broker
                .escalate(&self.broker.action(ActionKind::CreateDirectory, &parent))?;
        }

        let name = destination
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let staging = parent.join(format!(
            "{}staging-{}-{}",
            RESERVED_PREFIX,
            name,
            uuid::Uuid::new_v4().simple()
        ));
        fs::create_dir(&staging)
            .map_err(|e| ArkError::StorageFailure(format!("create staging {}: {}", staging.display(), e)))?;

        let counts = match unpack(&staging, payload, &self.request.sources, self.request.quota_bytes) {
            Ok(counts) => counts,
            Err(e) => {
                quarantine(&staging, &parent, &name);
                return Err(e);
            }
        };

        if let Err(e) = promote(&staging, &destination) {
            quarantine(&staging, &parent, &name);
            return Err(ArkError::StorageFailure(format!("promote {}: {}", destination.display(), e)));
        }

        let normalize = self.broker.action(ActionKind::NormalizeOwnership, &destination);
        if let Err(e) = self.broker.escalate(&normalize) {
            // Data is already promoted; ownership is repaired on the next push
            tracing::warn!(destination = %destination.display(), error = %e, "ownership normalization failed");
        }
        Ok(counts)
    }

    /// Re-check the registry destination against the live filesystem: it
    /// must still resolve, without symlinks, to the same strict descendant
    /// of the archive root.
    fn confine(&self) -> ArkResult<PathBuf> {
        let resolved = normalize_under_root(&self.archive_root, &self.request.relative)
            .map_err(|e| ArkError::ForbiddenAction(format!("destination {}: {}", self.request.relative.display(), e)))?;
        if resolved != self.request.destination {
            return Err(ArkError::ForbiddenAction(format!(
                "destination {} resolves to {}",
                self.request.destination.display(),
                resolved.display()
            )));
        }
        Ok(resolved)
    }
}

/// Reader wrapper that remembers whether the payload hit EOF and whether the
/// payload itself (as opposed to the filesystem) failed.
struct StreamWatch<R> {
    inner: R,
    eof_seen: bool,
    failure: Option<(io::ErrorKind, String)>,
}

impl<R: Read> Read for StreamWatch<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.inner.read(buf) {
            Ok(0) if !buf.is_empty() => {
                self.eof_seen = true;
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e) => {
                self.failure = Some((e.kind(), e.to_string()));
                Err(e)
            }
        }
    }
}

enum EntryKind {
    File,
    Directory,
    Symlink,
    Skip,
}

fn unpack<R: Read>(staging: &Path, payload: R, sources: &[String], quota: Option<u64>) -> ArkResult<(u64, u64)> {
    let mut watch = StreamWatch {
        inner: payload,
        eof_seen: false,
        failure: None,
    };
    let outcome = {
        let mut archive = tar::Archive::new(&mut watch);
        archive.set_preserve_permissions(false);
        archive.set_unpack_xattrs(false);
        archive.set_overwrite(true);
        unpack_entries(&mut archive, staging, sources, quota)
    };

    let stream_failure = |watch: &mut StreamWatch<R>| {
        watch
            .failure
            .take()
            .map(|(kind, msg)| ArkError::from_stream_io(io::Error::new(kind, msg)))
    };

    let counts = match outcome {
        Ok(counts) => counts,
        Err(e) => {
            if let Some(failure) = stream_failure(&mut watch) {
                return Err(failure);
            }
            if watch.eof_seen {
                return Err(ArkError::PartialTransfer(format!("payload ended mid-archive: {}", e)));
            }
            return Err(e);
        }
    };
    if watch.eof_seen {
        return Err(ArkError::PartialTransfer("payload ended before the archive trailer".into()));
    }

    // Consume padding up to the transport's end marker
    let drained = io::copy(&mut (&mut watch).take(MAX_TRAILING_BYTES + 1), &mut io::sink());
    match drained {
        Ok(n) if n > MAX_TRAILING_BYTES => Err(ArkError::PartialTransfer("unexpected data after archive trailer".into())),
        Ok(_) => Ok(counts),
        Err(e) => Err(stream_failure(&mut watch).unwrap_or_else(|| ArkError::from_stream_io(e))),
    }
}

fn unpack_entries<R: Read>(
    archive: &mut tar::Archive<R>,
    staging: &Path,
    sources: &[String],
    quota: Option<u64>,
) -> ArkResult<(u64, u64)> {
    let mut files = 0u64;
    let mut bytes = 0u64;

    let entries = archive
        .entries()
        .map_err(|e| ArkError::PartialTransfer(format!("read archive: {}", e)))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| ArkError::PartialTransfer(format!("read entry: {}", e)))?;
        let (kind, rel) = classify(&entry, sources)?;
        match kind {
            EntryKind::Skip => continue,
            EntryKind::File => {
                let size = entry
                    .header()
                    .size()
                    .map_err(|e| ArkError::PartialTransfer(format!("entry size: {}", e)))?;
                bytes = bytes.saturating_add(size);
                if let Some(limit) = quota {
                    if bytes > limit {
                        return Err(ArkError::StorageFailure(format!(
                            "quota exceeded: {} bytes > {} bytes",
                            bytes, limit
                        )));
                    }
                }
                files += 1;
            }
            EntryKind::Directory | EntryKind::Symlink => {}
        }

        let inside = entry
            .unpack_in(staging)
            .map_err(|e| ArkError::StorageFailure(format!("unpack {}: {}", rel.display(), e)))?;
        if !inside {
            return Err(ArkError::UnsafePayload(format!("entry {} escapes destination", rel.display())));
        }
    }
    Ok((files, bytes))
}

/// Decide whether an entry may be unpacked. Anything not clearly safe is
/// refused.
fn classify<R: Read>(entry: &tar::Entry<'_, R>, sources: &[String]) -> ArkResult<(EntryKind, PathBuf)> {
    let et = entry.header().entry_type();
    if et.is_pax_global_extensions() {
        return Ok((EntryKind::Skip, PathBuf::new()));
    }

    let path = entry
        .path()
        .map_err(|e| ArkError::UnsafePayload(format!("unreadable entry path: {}", e)))?;
    let rel = safe_relative(&path).map_err(|e| ArkError::UnsafePayload(e.to_string()))?;

    if !sources.is_empty() {
        let top = rel
            .components()
            .next()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .unwrap_or_default();
        if !sources.iter().any(|s| *s == top) {
            return Err(ArkError::UnsafePayload(format!(
                "entry {} is outside the requested sources",
                rel.display()
            )));
        }
    }

    let kind = if et.is_file() || et.is_contiguous() {
        EntryKind::File
    } else if et.is_dir() {
        EntryKind::Directory
    } else if et.is_symlink() {
        let target = entry
            .link_name()
            .map_err(|e| ArkError::UnsafePayload(format!("unreadable link target: {}", e)))?
            .ok_or_else(|| ArkError::UnsafePayload(format!("symlink {} has no target", rel.display())))?;
        let escapes = target.as_os_str().is_empty()
            || target
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)));
        if escapes {
            return Err(ArkError::UnsafePayload(format!(
                "symlink {} -> {} leaves its directory",
                rel.display(),
                target.display()
            )));
        }
        EntryKind::Symlink
    } else {
        return Err(ArkError::UnsafePayload(format!(
            "entry {} has forbidden type {:?}",
            rel.display(),
            et
        )));
    };
    Ok((kind, rel))
}

/// Make `staging` visible at `destination` in one step.
fn promote(staging: &Path, destination: &Path) -> io::Result<()> {
    match fs::symlink_metadata(destination) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => fs::rename(staging, destination),
        Err(e) => Err(e),
        Ok(_) => {
            exchange(staging, destination)?;
            // `staging` now holds the previous generation
            match fs::remove_dir_all(staging) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => {
                    tracing::warn!(path = %staging.display(), error = %e, "failed to remove previous generation");
                }
                _ => {}
            }
            Ok(())
        }
    }
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
fn exchange(a: &Path, b: &Path) -> io::Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let ca = CString::new(a.as_os_str().as_bytes())?;
    let cb = CString::new(b.as_os_str().as_bytes())?;
    // SAFETY: both pointers come from live CStrings
    let rc = unsafe {
        libc::renameat2(
            libc::AT_FDCWD,
            ca.as_ptr(),
            libc::AT_FDCWD,
            cb.as_ptr(),
            libc::RENAME_EXCHANGE,
        )
    };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        // Filesystem or kernel without RENAME_EXCHANGE
        Some(libc::EINVAL) | Some(libc::ENOSYS) => exchange_by_rename(a, b),
        _ => Err(err),
    }
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
fn exchange(a: &Path, b: &Path) -> io::Result<()> {
    exchange_by_rename(a, b)
}

/// Two-rename swap. `b` is briefly absent but never partially written.
/// Once `a` is live at `b` the swap has succeeded, whatever happens to the
/// retired generation.
fn exchange_by_rename(a: &Path, b: &Path) -> io::Result<()> {
    let parent = b.parent().unwrap_or(Path::new("."));
    let retired = parent.join(format!("{}retired-{}", RESERVED_PREFIX, uuid::Uuid::new_v4().simple()));
    fs::rename(b, &retired)?;
    if let Err(e) = fs::rename(a, b) {
        let _ = fs::rename(&retired, b);
        return Err(e);
    }
    hand_back(&retired, a);
    Ok(())
}

/// Move the retired generation to `a`, where the caller expects it. If
/// that fails, drop it here instead.
fn hand_back(retired: &Path, a: &Path) {
    if let Err(e) = fs::rename(retired, a) {
        tracing::warn!(path = %retired.display(), error = %e, "could not hand back previous generation; removing it");
        if let Err(e) = fs::remove_dir_all(retired) {
            tracing::warn!(path = %retired.display(), error = %e, "failed to remove previous generation");
        }
    }
}

fn quarantine(staging: &Path, parent: &Path, name: &str) {
    let target = parent.join(format!(
        "{}quarantine-{}-{}-{}",
        RESERVED_PREFIX,
        name,
        Utc::now().format("%Y%m%dT%H%M%S"),
        uuid::Uuid::new_v4().simple()
    ));
    match fs::rename(staging, &target) {
        Ok(()) => tracing::warn!(path = %target.display(), "incomplete transfer quarantined"),
        Err(e) => {
            tracing::warn!(path = %staging.display(), error = %e, "quarantine rename failed; removing staging");
            let _ = fs::remove_dir_all(staging);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn tar_with(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn raw_entry(name: &str, kind: tar::EntryType, link: Option<&str>) -> Vec<u8> {
        let mut header = tar::Header::new_gnu();
        {
            let gnu = header.as_gnu_mut().unwrap();
            gnu.name[..name.len()].copy_from_slice(name.as_bytes());
            if let Some(link) = link {
                gnu.linkname[..link.len()].copy_from_slice(link.as_bytes());
            }
        }
        header.set_entry_type(kind);
        header.set_size(0);
        header.set_mode(0o777);
        header.set_cksum();
        let mut out = header.as_bytes().to_vec();
        out.extend_from_slice(&[0u8; 1024]);
        out
    }

    #[test]
    fn test_unpack_counts_file_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let payload = tar_with(&[("etc/hosts", b"abc"), ("etc/motd", b"hello")]);
        let (files, bytes) = unpack(dir.path(), Cursor::new(payload), &[], None).unwrap();
        assert_eq!((files, bytes), (2, 8));
        assert_eq!(fs::read(dir.path().join("etc/motd")).unwrap(), b"hello");
    }

    #[test]
    fn test_truncated_archive_is_partial() {
        let dir = tempfile::tempdir().unwrap();
        let payload = tar_with(&[("big.bin", &[7u8; 4096][..])]);
        let cut = payload[..1024].to_vec();
        let err = unpack(dir.path(), Cursor::new(cut), &[], None).unwrap_err();
        assert!(matches!(err, ArkError::PartialTransfer(_)), "{:?}", err);
    }

    #[test]
    fn test_traversal_entry_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let payload = raw_entry("../escape", tar::EntryType::Regular, None);
        let err = unpack(dir.path(), Cursor::new(payload), &[], None).unwrap_err();
        assert!(matches!(err, ArkError::UnsafePayload(_)), "{:?}", err);
    }

    #[test]
    fn test_symlink_leaving_directory_rejected() {
        let dir = tempfile::tempdir().unwrap();
        for target in ["/etc/passwd", "../../outside"] {
            let payload = raw_entry("link", tar::EntryType::Symlink, Some(target));
            let err = unpack(dir.path(), Cursor::new(payload), &[], None).unwrap_err();
            assert!(matches!(err, ArkError::UnsafePayload(_)), "{} -> {:?}", target, err);
        }
    }

    #[test]
    fn test_hardlink_and_device_rejected() {
        let dir = tempfile::tempdir().unwrap();
        for kind in [tar::EntryType::Link, tar::EntryType::Char, tar::EntryType::Fifo] {
            let payload = raw_entry("x", kind, Some("y"));
            let err = unpack(dir.path(), Cursor::new(payload), &[], None).unwrap_err();
            assert!(matches!(err, ArkError::UnsafePayload(_)));
        }
    }

    #[test]
    fn test_entries_outside_source_set_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let payload = tar_with(&[("etc/hosts", b"a"), ("home/x", b"b")]);
        let sources = vec!["etc".to_string()];
        let err = unpack(dir.path(), Cursor::new(payload), &sources, None).unwrap_err();
        assert!(matches!(err, ArkError::UnsafePayload(_)));
    }

    #[test]
    fn test_quota_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let payload = tar_with(&[("a", &[0u8; 600][..]), ("b", &[0u8; 600][..])]);
        let err = unpack(dir.path(), Cursor::new(payload), &[], Some(1000)).unwrap_err();
        assert!(matches!(err, ArkError::StorageFailure(_)));
    }

    #[test]
    fn test_promote_replaces_previous_generation() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("dobby");
        fs::create_dir(&dest).unwrap();
        fs::write(dest.join("old.txt"), b"old").unwrap();

        let staging = dir.path().join(".ark-staging-dobby-1");
        fs::create_dir(&staging).unwrap();
        fs::write(staging.join("new.txt"), b"new").unwrap();

        promote(&staging, &dest).unwrap();
        assert!(dest.join("new.txt").exists());
        assert!(!dest.join("old.txt").exists());
        assert!(!staging.exists());
    }

    #[test]
    fn test_exchange_by_rename_swaps() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::create_dir(&a).unwrap();
        fs::create_dir(&b).unwrap();
        fs::write(a.join("from_a"), b"").unwrap();
        fs::write(b.join("from_b"), b"").unwrap();

        exchange_by_rename(&a, &b).unwrap();
        assert!(b.join("from_a").exists());
        assert!(a.join("from_b").exists());
    }

    #[test]
    fn test_hand_back_failure_removes_retired_generation() {
        let dir = tempfile::tempdir().unwrap();
        let retired = dir.path().join(".ark-retired-1");
        fs::create_dir(&retired).unwrap();
        fs::write(retired.join("old.txt"), b"old").unwrap();

        // The rename target's parent is gone, so the hand-back fails
        hand_back(&retired, &dir.path().join("missing/.ark-staging-x-1"));
        assert!(!retired.exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_quarantine_moves_staging_aside() {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join(".ark-staging-x-1");
        fs::create_dir(&staging).unwrap();
        quarantine(&staging, dir.path(), "x");
        assert!(!staging.exists());
        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().any(|n| n.starts_with(".ark-quarantine-x-")));
    }
}
