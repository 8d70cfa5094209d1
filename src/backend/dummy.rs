//! In-memory backend for tests and dry runs.

use std::sync::Mutex;

use camino::Utf8PathBuf;
use serde::Deserialize;
use tracing::info;

use super::{Backend, BackendError, SlotHandle};

/// Options accepted by the dummy backend.
#[derive(Clone, Debug, Deserialize)]
pub struct DummyOptions {
    /// Directory slots are created under.
    pub path: Utf8PathBuf,
}

/// Backend that creates plain directories and only records snapshot calls.
///
/// Slot locking still works (it uses the default lock-file mechanism), which
/// makes this backend useful for exercising whole job workflows without a
/// real storage provider behind them.
#[derive(Debug)]
pub struct DummyBackend {
    basedir: Utf8PathBuf,
    snapshots: Mutex<Vec<String>>,
}

impl DummyBackend {
    /// Creates a dummy backend rooted at `basedir`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Configuration`] when the base directory cannot
    /// be created.
    pub fn new(basedir: Utf8PathBuf) -> Result<Self, BackendError> {
        std::fs::create_dir_all(&basedir).map_err(|err| BackendError::Configuration {
            message: format!("cannot create dummy base directory {basedir}: {err}"),
        })?;
        info!(%basedir, "initialised dummy backend");
        Ok(Self {
            basedir,
            snapshots: Mutex::new(Vec::new()),
        })
    }

    /// Creates a dummy backend from configuration options.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Configuration`] when the base directory cannot
    /// be created.
    pub fn from_options(options: DummyOptions) -> Result<Self, BackendError> {
        Self::new(options.path)
    }

    /// Slot names that have been snapshotted, in call order.
    ///
    /// # Panics
    ///
    /// Panics when the snapshot log mutex was poisoned by a test thread.
    #[must_use]
    pub fn snapshots(&self) -> Vec<String> {
        self.snapshots.lock().expect("snapshot log").clone()
    }
}

impl Backend for DummyBackend {
    fn ensure_slot(&self, name: &str) -> Result<SlotHandle, BackendError> {
        let path = self.basedir.join(name);
        std::fs::create_dir_all(&path).map_err(|err| BackendError::Slot {
            name: name.to_owned(),
            message: err.to_string(),
        })?;
        info!(slot = name, "ensured dummy slot");
        Ok(SlotHandle::new(name.to_owned(), path))
    }

    fn snapshot(&self, slot: &SlotHandle) -> Result<(), BackendError> {
        self.snapshots
            .lock()
            .map_err(|_| BackendError::Snapshot {
                slot: slot.to_string(),
                message: String::from("snapshot log poisoned"),
            })?
            .push(slot.name().to_owned());
        info!(slot = %slot, "recorded dummy snapshot");
        Ok(())
    }
}
