//! ZFS backend: one dataset per slot, native snapshots.
//!
//! The `libzfs` bindings do not cover dataset creation and recursive
//! snapshots well enough, so this backend drives the `zfs` CLI. Dataset
//! names are derived from mountpoints by dropping the leading slash, which
//! matches the layout produced by `zfs create` with inherited mountpoints.

use std::collections::BTreeSet;
use std::ffi::OsString;
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use super::{Backend, BackendError, SlotHandle};
use crate::exec::CommandRunner;
use crate::report::{format_time, now};

/// Default path to the `zfs` executable.
pub const DEFAULT_ZFS_BIN: &str = "/usr/sbin/zfs";

/// Options accepted by the ZFS backend.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ZfsOptions {
    /// Explicit mountpoint of this cluster's dataset.
    #[serde(default)]
    pub path: Option<Utf8PathBuf>,
    /// Shared parent mountpoint; the cluster name is appended.
    #[serde(default)]
    pub basedir: Option<Utf8PathBuf>,
    /// Path to the `zfs` executable.
    #[serde(default)]
    pub zfs_bin: Option<String>,
}

/// Error raised by a failing `zfs` invocation.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("failed to run `{command}`: {message}")]
pub struct ZfsCommandError {
    /// Command line that failed.
    pub command: String,
    /// Exit status and stderr, or the spawn failure.
    pub message: String,
}

/// Thin typed wrapper over the `zfs` CLI.
#[derive(Clone, Debug)]
pub struct ZfsCli<R: CommandRunner> {
    bin: String,
    runner: R,
}

impl<R: CommandRunner> ZfsCli<R> {
    /// Creates a wrapper using `bin` as the `zfs` executable.
    #[must_use]
    pub fn new(bin: impl Into<String>, runner: R) -> Self {
        Self {
            bin: bin.into(),
            runner,
        }
    }

    fn run(&self, args: &[&str]) -> Result<String, ZfsCommandError> {
        let os_args: Vec<OsString> = args.iter().map(OsString::from).collect();
        let command = format!("{} {}", self.bin, args.join(" "));
        let output = self
            .runner
            .run(&self.bin, &os_args, None)
            .map_err(|err| ZfsCommandError {
                command: command.clone(),
                message: err.to_string(),
            })?;
        if output.is_success() {
            return Ok(output.stdout);
        }
        Err(ZfsCommandError {
            command,
            message: format!("exit {}: {}", output.status_text(), output.stderr),
        })
    }

    /// Lists filesystem datasets under `path` and returns their mountpoints.
    ///
    /// # Errors
    ///
    /// Returns [`ZfsCommandError`] when `zfs list` fails, for example when no
    /// dataset exists at `path` yet.
    pub fn list(&self, path: &Utf8Path) -> Result<BTreeSet<Utf8PathBuf>, ZfsCommandError> {
        let stdout = self.run(&["list", "-H", "-r", "-t", "filesystem", path.as_str()])?;
        let mut mountpoints = BTreeSet::new();
        for line in stdout.lines() {
            // zfs list -H: name, used, avail, refer, mountpoint.
            if let Some(mountpoint) = line.split('\t').nth(4) {
                mountpoints.insert(Utf8PathBuf::from(mountpoint));
            }
        }
        Ok(mountpoints)
    }

    /// Creates the dataset mounted at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ZfsCommandError`] when `zfs create` fails.
    pub fn create(&self, path: &Utf8Path) -> Result<(), ZfsCommandError> {
        self.run(&["create", "-p", dataset_name(path)]).map(|_| ())
    }

    /// Takes a recursive snapshot named `<dataset>@<label>`.
    ///
    /// # Errors
    ///
    /// Returns [`ZfsCommandError`] when `zfs snapshot` fails.
    pub fn snapshot(&self, path: &Utf8Path, label: &str) -> Result<(), ZfsCommandError> {
        let target = format!("{}@{label}", dataset_name(path));
        self.run(&["snapshot", "-r", &target]).map(|_| ())
    }
}

/// Dataset name for a mountpoint: the path without its leading slash.
fn dataset_name(path: &Utf8Path) -> &str {
    path.as_str().trim_start_matches('/')
}

/// Dataset-per-slot backend over the `zfs` CLI.
///
/// The dataset listing is cached at construction so `ensure_slot` only
/// shells out for genuinely missing datasets.
#[derive(Debug)]
pub struct ZfsBackend<R: CommandRunner> {
    slotdir: Utf8PathBuf,
    datasets: Mutex<BTreeSet<Utf8PathBuf>>,
    cli: ZfsCli<R>,
}

impl<R: CommandRunner> ZfsBackend<R> {
    /// Creates the backend, materialising the cluster dataset when absent.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Configuration`] when neither `path` nor
    /// `basedir` is set or the cluster dataset cannot be created or listed.
    pub fn new(cluster: &str, options: ZfsOptions, runner: R) -> Result<Self, BackendError> {
        let slotdir = match (options.path, options.basedir) {
            (Some(path), _) => path,
            (None, Some(basedir)) => basedir.join(cluster),
            (None, None) => {
                return Err(BackendError::Configuration {
                    message: String::from(
                        "zfs backend needs at least one of the following options: path or basedir",
                    ),
                });
            }
        };
        let bin = options
            .zfs_bin
            .unwrap_or_else(|| String::from(DEFAULT_ZFS_BIN));
        let cli = ZfsCli::new(bin, runner);

        let datasets = match cli.list(&slotdir) {
            Ok(found) => found,
            Err(_) => {
                info!(dataset = %slotdir, "creating missing cluster dataset");
                cli.create(&slotdir)
                    .map_err(|err| BackendError::Configuration {
                        message: err.to_string(),
                    })?;
                cli.list(&slotdir)
                    .map_err(|err| BackendError::Configuration {
                        message: err.to_string(),
                    })?
            }
        };

        Ok(Self {
            slotdir,
            datasets: Mutex::new(datasets),
            cli,
        })
    }

    /// Mountpoint of the cluster dataset.
    #[must_use]
    pub fn slotdir(&self) -> &Utf8Path {
        &self.slotdir
    }
}

impl<R: CommandRunner> Backend for ZfsBackend<R> {
    fn ensure_slot(&self, name: &str) -> Result<SlotHandle, BackendError> {
        let path = self.slotdir.join(name);
        let mut datasets = self.datasets.lock().map_err(|_| BackendError::Slot {
            name: name.to_owned(),
            message: String::from("dataset cache poisoned"),
        })?;
        if !datasets.contains(&path) {
            info!(dataset = %path, "creating missing slot dataset");
            self.cli.create(&path).map_err(|err| BackendError::Slot {
                name: name.to_owned(),
                message: err.to_string(),
            })?;
            datasets.insert(path.clone());
        }
        Ok(SlotHandle::new(name.to_owned(), path))
    }

    fn snapshot(&self, slot: &SlotHandle) -> Result<(), BackendError> {
        if !slot.path().starts_with(&self.slotdir) || slot.path() == self.slotdir {
            return Err(BackendError::Snapshot {
                slot: slot.to_string(),
                message: format!("not a sub-directory of {}", self.slotdir),
            });
        }
        let label = format_time(now());
        info!(slot = %slot, %label, "taking zfs snapshot");
        self.cli
            .snapshot(slot.path(), &label)
            .map_err(|err| BackendError::Snapshot {
                slot: slot.to_string(),
                message: err.to_string(),
            })
    }
}
