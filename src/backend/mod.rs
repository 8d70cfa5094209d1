//! Storage backend contract: slot lifecycle, locking, and snapshots.
//!
//! A backend owns the on-disk (or in-memory) layout that receives backup
//! data. Jobs interact with it exclusively through [`Backend`]: they obtain a
//! [`SlotHandle`] per host, serialise their work through [`Backend::lock`],
//! and leave snapshot creation to the orchestrator. Slot locks are advisory
//! `flock(2)` locks so that independently scheduled `backup` and `stream`
//! invocations against the same slot exclude each other across processes.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::thread;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod dummy;
pub mod localfs;
pub mod zfs;

pub use dummy::{DummyBackend, DummyOptions};
pub use localfs::{LocalFsBackend, LocalFsOptions};
pub use zfs::{ZfsBackend, ZfsCli, ZfsOptions};

/// File name of the advisory lock kept inside each slot.
pub const LOCK_FILE_NAME: &str = ".packrat.lock";

/// How often lock acquisition retries while the lock is held elsewhere.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Names a per-host storage location owned by a backend.
///
/// Handles are created by [`Backend::ensure_slot`] and never mutated by jobs
/// other than through transfers into `path`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SlotHandle {
    name: String,
    path: Utf8PathBuf,
}

impl SlotHandle {
    /// Creates a handle for a named slot rooted at `path`.
    #[must_use]
    pub const fn new(name: String, path: Utf8PathBuf) -> Self {
        Self { name, path }
    }

    /// Short name of the slot (typically the host label before the first dot).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Filesystem location backing the slot.
    #[must_use]
    pub fn path(&self) -> &camino::Utf8Path {
        &self.path
    }
}

impl std::fmt::Display for SlotHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path)
    }
}

/// Errors raised by backend operations.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Raised when backend options are missing or inconsistent.
    #[error("invalid backend configuration: {message}")]
    Configuration {
        /// Human-readable description of the problem.
        message: String,
    },
    /// Raised when a slot cannot be created or inspected.
    #[error("cannot prepare slot {name}: {message}")]
    Slot {
        /// Slot name that failed to materialise.
        name: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when taking a snapshot of a slot fails.
    #[error("snapshot of {slot} failed: {message}")]
    Snapshot {
        /// Slot whose snapshot failed.
        slot: String,
        /// Underlying failure description.
        message: String,
    },
    /// Raised when a slot lock cannot be acquired before the deadline.
    ///
    /// This is the only recoverable lock failure: callers surface it as a
    /// `locked` outcome for the affected slot instead of an error.
    #[error("timed out after {waited_secs}s waiting for lock on {slot}")]
    LockTimeout {
        /// Slot that stayed locked.
        slot: String,
        /// Seconds waited before giving up.
        waited_secs: u64,
    },
    /// Raised when the lock file cannot be opened or locked at all.
    #[error("cannot lock {slot}: {message}")]
    Lock {
        /// Slot whose lock file failed.
        slot: String,
        /// Operating system error string.
        message: String,
    },
}

/// RAII guard over one slot's advisory lock.
///
/// The lock is released unconditionally when the guard drops, on success and
/// error paths alike. At most one live guard can exist per slot at a time;
/// the exclusion is enforced by the kernel, not by the job holding the guard.
#[derive(Debug)]
pub struct SlotLock {
    file: File,
    path: Utf8PathBuf,
}

impl SlotLock {
    /// Acquires the lock file at `path`, polling until `timeout` elapses.
    ///
    /// A timeout of `None` blocks indefinitely.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::LockTimeout`] when the deadline passes while
    /// another holder keeps the lock, or [`BackendError::Lock`] when the lock
    /// file cannot be opened or `flock(2)` fails outright.
    pub fn acquire(path: Utf8PathBuf, timeout: Option<Duration>) -> Result<Self, BackendError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_std_path())
            .map_err(|err| BackendError::Lock {
                slot: path.to_string(),
                message: err.to_string(),
            })?;

        let started = Instant::now();
        let deadline = timeout.map(|limit| started + limit);
        loop {
            if try_flock(&file).map_err(|err| BackendError::Lock {
                slot: path.to_string(),
                message: err.to_string(),
            })? {
                return Ok(Self { file, path });
            }
            if let Some(limit) = deadline
                && Instant::now() >= limit
            {
                return Err(BackendError::LockTimeout {
                    slot: path.to_string(),
                    waited_secs: started.elapsed().as_secs(),
                });
            }
            thread::sleep(LOCK_POLL_INTERVAL);
        }
    }

    /// Path of the underlying lock file.
    #[must_use]
    pub fn path(&self) -> &camino::Utf8Path {
        &self.path
    }
}

impl Drop for SlotLock {
    fn drop(&mut self) {
        // SAFETY: the fd is owned by `self.file` and stays open for the call.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

/// Attempts a non-blocking exclusive flock; `Ok(false)` means contended.
fn try_flock(file: &File) -> std::io::Result<bool> {
    // SAFETY: the fd is owned by `file` and stays open for the call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        return Ok(false);
    }
    Err(err)
}

/// Capability contract implemented by storage backends.
///
/// Implementations must be safe for concurrent `ensure_slot`/`lock`/
/// `snapshot` calls: jobs may drive several hosts' workflows in parallel
/// against the same backend.
pub trait Backend: Send + Sync {
    /// Creates the slot if absent and returns its handle.
    ///
    /// Must be idempotent: repeat calls for the same name return the same
    /// handle.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Slot`] when the slot cannot be materialised.
    fn ensure_slot(&self, name: &str) -> Result<SlotHandle, BackendError>;

    /// Takes a point-in-time snapshot of the slot's current contents.
    ///
    /// Snapshotting is a best-effort post-step: callers log failures without
    /// revisiting the outcome of the transfer that preceded them.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Snapshot`] when the snapshot fails.
    fn snapshot(&self, slot: &SlotHandle) -> Result<(), BackendError>;

    /// Locks the slot for exclusive use, waiting up to `timeout`.
    ///
    /// The default implementation locks a file inside the slot directory,
    /// which suits every filesystem-backed backend.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::LockTimeout`] when the deadline elapses and
    /// [`BackendError::Lock`] on other locking failures.
    fn lock(&self, slot: &SlotHandle, timeout: Option<Duration>) -> Result<SlotLock, BackendError> {
        SlotLock::acquire(slot.path().join(LOCK_FILE_NAME), timeout)
    }
}
