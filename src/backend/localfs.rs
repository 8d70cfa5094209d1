//! Local filesystem backend.
//!
//! Mainly there for demonstration and small installations: slots are plain
//! directories and snapshots are hardlink copies made with
//! `rsync --link-dest`, so unchanged files cost no additional space.

use camino::Utf8PathBuf;
use serde::Deserialize;
use tracing::info;

use super::{Backend, BackendError, SlotHandle};
use crate::exec::CommandRunner;
use crate::report::{format_time, now};
use crate::transfer::{DEFAULT_REMOTE_USER, TransferExecutor, TransferRequest};

/// Options accepted by the local filesystem backend.
///
/// Exactly one of `path` (explicit cluster directory) or `basedir` (shared
/// parent, extended with the cluster name) must be set.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct LocalFsOptions {
    /// Explicit directory for this cluster's data.
    #[serde(default)]
    pub path: Option<Utf8PathBuf>,
    /// Shared parent directory; the cluster name is appended.
    #[serde(default)]
    pub basedir: Option<Utf8PathBuf>,
}

/// Directory-per-slot backend with hardlink snapshots.
#[derive(Debug)]
pub struct LocalFsBackend<R: CommandRunner> {
    slotdir: Utf8PathBuf,
    snapshotdir: Utf8PathBuf,
    executor: TransferExecutor<R>,
}

impl<R: CommandRunner> LocalFsBackend<R> {
    /// Creates the backend, materialising its `slots/` and `snapshots/`
    /// directories.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Configuration`] when neither `path` nor
    /// `basedir` is set or the directories cannot be created.
    pub fn new(cluster: &str, options: LocalFsOptions, runner: R) -> Result<Self, BackendError> {
        let base = match (options.path, options.basedir) {
            (Some(path), _) => path,
            (None, Some(basedir)) => basedir.join(cluster),
            (None, None) => {
                return Err(BackendError::Configuration {
                    message: String::from(
                        "localfs backend needs at least one of the following options: path or basedir",
                    ),
                });
            }
        };
        let slotdir = base.join("slots");
        let snapshotdir = base.join("snapshots");
        for dir in [&slotdir, &snapshotdir] {
            std::fs::create_dir_all(dir).map_err(|err| BackendError::Configuration {
                message: format!("cannot create {dir}: {err}"),
            })?;
        }

        Ok(Self {
            slotdir,
            snapshotdir,
            executor: TransferExecutor::new(runner),
        })
    }

    /// Directory the slots live under.
    #[must_use]
    pub fn slotdir(&self) -> &camino::Utf8Path {
        &self.slotdir
    }

    /// Directory snapshots are written to.
    #[must_use]
    pub fn snapshotdir(&self) -> &camino::Utf8Path {
        &self.snapshotdir
    }
}

impl<R: CommandRunner> Backend for LocalFsBackend<R> {
    fn ensure_slot(&self, name: &str) -> Result<SlotHandle, BackendError> {
        let path = self.slotdir.join(name);
        if !path.is_dir() {
            info!(slot = name, %path, "creating missing slot directory");
            std::fs::create_dir_all(&path).map_err(|err| BackendError::Slot {
                name: name.to_owned(),
                message: err.to_string(),
            })?;
        }
        Ok(SlotHandle::new(name.to_owned(), path))
    }

    fn snapshot(&self, slot: &SlotHandle) -> Result<(), BackendError> {
        let snapshot_name = format!("{}-{}", slot.name(), format_time(now()));
        let destination = self.snapshotdir.join(&snapshot_name);
        info!(slot = %slot, snapshot = %snapshot_name, "creating hardlink snapshot");

        let options = vec![
            String::from("-a"),
            String::from("--link-dest"),
            slot.path().to_string(),
        ];
        self.executor
            .transfer(&TransferRequest {
                source: slot.path(),
                destination: &destination,
                source_host: None,
                user: DEFAULT_REMOTE_USER,
                private_key: None,
                options: &options,
                includes: &[],
                excludes: &[],
            })
            .map_err(|err| BackendError::Snapshot {
                slot: slot.to_string(),
                message: err.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedRunner;
    use tempfile::TempDir;

    fn backend(tmp: &TempDir, runner: ScriptedRunner) -> LocalFsBackend<ScriptedRunner> {
        let base =
            Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("temp path should be utf8");
        LocalFsBackend::new(
            "mycluster",
            LocalFsOptions {
                path: Some(base),
                basedir: None,
            },
            runner,
        )
        .expect("backend should build")
    }

    #[test]
    fn new_requires_path_or_basedir() {
        let err = LocalFsBackend::new("mycluster", LocalFsOptions::default(), ScriptedRunner::new())
            .expect_err("empty options should fail");
        assert!(
            matches!(err, BackendError::Configuration { .. }),
            "got {err:?}"
        );
    }

    #[test]
    fn basedir_is_extended_with_the_cluster_name() {
        let tmp = TempDir::new().expect("tempdir");
        let base =
            Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("temp path should be utf8");
        let backend = LocalFsBackend::new(
            "mycluster",
            LocalFsOptions {
                path: None,
                basedir: Some(base.clone()),
            },
            ScriptedRunner::new(),
        )
        .expect("backend should build");

        assert_eq!(backend.slotdir(), base.join("mycluster").join("slots"));
    }

    #[test]
    fn ensure_slot_creates_directory_once() {
        let tmp = TempDir::new().expect("tempdir");
        let backend = backend(&tmp, ScriptedRunner::new());

        let slot = backend.ensure_slot("host01").expect("ensure slot");
        assert!(slot.path().is_dir());
        let again = backend.ensure_slot("host01").expect("repeat ensure");
        assert_eq!(slot, again);
    }

    #[test]
    fn snapshot_runs_rsync_with_link_dest() {
        let tmp = TempDir::new().expect("tempdir");
        let runner = ScriptedRunner::new();
        runner.push_success();
        let backend = backend(&tmp, runner.clone());
        let slot = backend.ensure_slot("host01").expect("ensure slot");

        backend.snapshot(&slot).expect("snapshot should succeed");

        let command = runner.commands().pop().expect("one rsync call");
        assert!(command.starts_with("rsync -a --link-dest"), "{command}");
        assert!(
            command.contains(&format!("--link-dest {}", slot.path())),
            "{command}"
        );
        assert!(command.contains("/snapshots/host01-"), "{command}");
    }

    #[test]
    fn snapshot_failure_surfaces_as_snapshot_error() {
        let tmp = TempDir::new().expect("tempdir");
        let runner = ScriptedRunner::new();
        runner.push_failure(23);
        let backend = backend(&tmp, runner);
        let slot = backend.ensure_slot("host01").expect("ensure slot");

        let err = backend.snapshot(&slot).expect_err("snapshot should fail");
        assert!(matches!(err, BackendError::Snapshot { .. }), "got {err:?}");
    }
}
