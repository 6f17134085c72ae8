//! Per-destination exclusivity locks
//!
//! One async mutex per destination path. The table's own mutex only guards
//! slot insert/lookup and is never held across an await. Slots are never
//! removed: the number of destinations is bounded by the registry.
//!
//! With a lock directory configured, a holder also takes an exclusive
//! `flock` on a per-destination file, so separate `arkd` processes (one per
//! sshd forced command) exclude each other as well.

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::error::{ArkError, ArkResult};

// Retry interval while another process holds the destination file lock
const SHARED_LOCK_POLL: Duration = Duration::from_millis(50);

/// What to do when a destination is already being written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backpressure {
    /// Fail immediately with `Busy`.
    #[default]
    Reject,
    /// Wait (bounded) behind at most `depth` other waiters.
    Queue { depth: usize },
}

struct Slot {
    lock: Arc<AsyncMutex<()>>,
    waiting: AtomicUsize,
}

/// Exclusive `flock` on a lock file. Closing the file releases it.
struct FileLock {
    _file: File,
}

impl FileLock {
    /// `Ok(None)` when another open file description holds the lock.
    #[cfg(unix)]
    fn try_acquire(path: &Path) -> io::Result<Option<FileLock>> {
        use std::os::unix::io::AsRawFd;

        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        // SAFETY: the descriptor stays owned by `file` for the whole call
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc == 0 {
            return Ok(Some(FileLock { _file: file }));
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            Ok(None)
        } else {
            Err(err)
        }
    }

    #[cfg(not(unix))]
    fn try_acquire(path: &Path) -> io::Result<Option<FileLock>> {
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        Ok(Some(FileLock { _file: file }))
    }
}

/// Proof that the caller owns a destination. Dropping it releases the lock.
pub struct ClientLock {
    destination: PathBuf,
    _file: Option<FileLock>,
    _guard: OwnedMutexGuard<()>,
}

impl ClientLock {
    pub fn destination(&self) -> &Path {
        &self.destination
    }
}

impl std::fmt::Debug for ClientLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientLock")
            .field("destination", &self.destination)
            .finish()
    }
}

struct WaitTicket(Arc<Slot>);

impl Drop for WaitTicket {
    fn drop(&mut self) {
        self.0.waiting.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct LockTable {
    slots: Mutex<HashMap<PathBuf, Arc<Slot>>>,
    policy: Backpressure,
    lock_wait: Duration,
    lock_dir: Option<PathBuf>,
}

impl LockTable {
    pub fn new(policy: Backpressure, lock_wait: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            policy,
            lock_wait,
            lock_dir: None,
        }
    }

    /// Also hold a file lock under `dir` for every destination. The
    /// directory is created on first use.
    pub fn with_lock_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.lock_dir = Some(dir.into());
        self
    }

    fn slot(&self, destination: &Path) -> Arc<Slot> {
        self.slots
            .lock()
            .entry(destination.to_path_buf())
            .or_insert_with(|| {
                Arc::new(Slot {
                    lock: Arc::new(AsyncMutex::new(())),
                    waiting: AtomicUsize::new(0),
                })
            })
            .clone()
    }

    pub async fn acquire(&self, destination: &Path) -> ArkResult<ClientLock> {
        let started = Instant::now();
        let guard = self.acquire_local(destination).await?;
        let file = match &self.lock_dir {
            Some(dir) => Some(self.acquire_shared(dir, destination, started).await?),
            None => None,
        };
        Ok(ClientLock {
            destination: destination.to_path_buf(),
            _file: file,
            _guard: guard,
        })
    }

    async fn acquire_local(&self, destination: &Path) -> ArkResult<OwnedMutexGuard<()>> {
        let slot = self.slot(destination);
        if let Ok(guard) = slot.lock.clone().try_lock_owned() {
            return Ok(guard);
        }

        match self.policy {
            Backpressure::Reject => Err(ArkError::Busy(destination.display().to_string())),
            Backpressure::Queue { depth } => {
                let ahead = slot.waiting.fetch_add(1, Ordering::SeqCst);
                let _ticket = WaitTicket(slot.clone());
                if ahead >= depth {
                    return Err(ArkError::Busy(format!(
                        "{} (queue full at {})",
                        destination.display(),
                        depth
                    )));
                }
                tokio::time::timeout(self.lock_wait, slot.lock.clone().lock_owned())
                    .await
                    .map_err(|_| self.wait_expired(destination))
            }
        }
    }

    /// Take the cross-process file lock. Queue mode polls until the wait
    /// budget started at `started` runs out.
    async fn acquire_shared(&self, dir: &Path, destination: &Path, started: Instant) -> ArkResult<FileLock> {
        let path = lock_file(dir, destination);
        loop {
            let attempt = fs::create_dir_all(dir).and_then(|_| FileLock::try_acquire(&path));
            match attempt {
                Ok(Some(lock)) => return Ok(lock),
                Ok(None) => {}
                Err(e) => {
                    return Err(ArkError::StorageFailure(format!("lock file {}: {}", path.display(), e)));
                }
            }
            match self.policy {
                Backpressure::Reject => {
                    return Err(ArkError::Busy(format!(
                        "{} (held by another process)",
                        destination.display()
                    )));
                }
                Backpressure::Queue { .. } => {
                    if started.elapsed() >= self.lock_wait {
                        return Err(self.wait_expired(destination));
                    }
                    tokio::time::sleep(SHARED_LOCK_POLL).await;
                }
            }
        }
    }

    fn wait_expired(&self, destination: &Path) -> ArkError {
        ArkError::Timeout(format!(
            "waited {:?} for lock on {}",
            self.lock_wait,
            destination.display()
        ))
    }

    /// Whether some transfer in this process currently holds `destination`.
    pub fn is_held(&self, destination: &Path) -> bool {
        let slot = self.slots.lock().get(destination).cloned();
        match slot {
            Some(slot) => slot.lock.try_lock().is_err(),
            None => false,
        }
    }
}

/// Lock file for `destination`: named by a digest so any path maps to one
/// flat file name.
fn lock_file(dir: &Path, destination: &Path) -> PathBuf {
    let digest = Sha256::digest(destination.to_string_lossy().as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    dir.join(format!("{}.lock", hex))
}
