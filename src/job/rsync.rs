//! Multi-host rsync backup job.
//!
//! The workhorse job: for every configured host it locks the host's slot,
//! runs the configured pre-scripts remotely, pulls every configured path
//! with rsync, releases the lock, and finishes with the post-scripts. Each
//! host is isolated: whatever goes wrong inside one host's workflow is
//! folded into that host's [`SlotOutcome`] and the remaining hosts proceed.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::Deserialize;
use tracing::{error, info, warn};

use super::{Job, JobError};
use crate::backend::{Backend, BackendError, SlotHandle};
use crate::exec::CommandRunner;
use crate::outcome::SlotOutcome;
use crate::transfer::{
    DEFAULT_REMOTE_USER, DEFAULT_RSYNC_OPTIONS, DEFAULT_SCRIPT_TIMEOUT, ScriptRequest,
    TransferExecutor, TransferRequest,
};

/// Whether hosts are processed one after another or concurrently.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum RunStyle {
    /// Hosts run strictly one after another.
    #[default]
    Seq,
    /// Hosts run concurrently with no ordering guarantees between them.
    Parallel,
}

/// Options accepted by the rsync job.
#[derive(Clone, Debug, Deserialize)]
pub struct RsyncOptions {
    /// Hosts to back up; slot names derive from the label before the first
    /// dot.
    pub hosts: Vec<String>,
    /// Paths pulled from every host.
    pub paths: Vec<Utf8PathBuf>,
    /// SSH identity file used for transfers and scripts.
    pub private_key: Utf8PathBuf,
    /// Remote user; defaults to `root`.
    #[serde(default)]
    pub user: Option<String>,
    /// rsync `--include` patterns.
    #[serde(default)]
    pub includes: Vec<String>,
    /// rsync `--exclude` patterns.
    #[serde(default)]
    pub excludes: Vec<String>,
    /// Scripts run on each host before its transfers, inside the slot lock.
    #[serde(default)]
    pub pre_scripts: Vec<String>,
    /// Scripts run on each host after all its transfers succeeded.
    #[serde(default)]
    pub post_scripts: Vec<String>,
    /// Host scheduling; defaults to sequential.
    #[serde(default)]
    pub run_style: RunStyle,
    /// Seconds to wait for a slot lock; absent waits indefinitely.
    #[serde(default)]
    pub lock_timeout: Option<u64>,
    /// Seconds allowed per remote script; defaults to 120.
    #[serde(default)]
    pub script_timeout: Option<u64>,
}

/// One host paired with the slot it backs up into.
#[derive(Clone, Debug)]
pub(crate) struct HostSlot {
    pub(crate) host: String,
    pub(crate) slot: SlotHandle,
}

/// Generic multi-host rsync backup job.
pub struct RsyncJob<R: CommandRunner> {
    hosts: Vec<HostSlot>,
    paths: Vec<Utf8PathBuf>,
    user: String,
    private_key: Utf8PathBuf,
    includes: Vec<String>,
    excludes: Vec<String>,
    rsync_options: Vec<String>,
    pre_scripts: Vec<String>,
    post_scripts: Vec<String>,
    finalize_scripts: Vec<String>,
    run_style: RunStyle,
    lock_timeout: Option<Duration>,
    script_timeout: Duration,
    backend: Arc<dyn Backend>,
    executor: TransferExecutor<R>,
}

impl<R: CommandRunner> RsyncJob<R> {
    /// Builds the job and ensures every host's slot exists.
    ///
    /// Slot creation happens here, not per backup, so misconfigured storage
    /// surfaces immediately instead of mid-run.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] when a slot cannot be materialised.
    pub fn new(
        options: RsyncOptions,
        backend: Arc<dyn Backend>,
        runner: R,
    ) -> Result<Self, BackendError> {
        let mut hosts = Vec::with_capacity(options.hosts.len());
        for host in options.hosts {
            let slot = backend.ensure_slot(short_name(&host))?;
            hosts.push(HostSlot { host, slot });
        }

        Ok(Self {
            hosts,
            paths: options.paths,
            user: options
                .user
                .unwrap_or_else(|| String::from(DEFAULT_REMOTE_USER)),
            private_key: options.private_key,
            includes: options.includes,
            excludes: options.excludes,
            rsync_options: DEFAULT_RSYNC_OPTIONS
                .iter()
                .map(|option| (*option).to_owned())
                .collect(),
            pre_scripts: options.pre_scripts,
            post_scripts: options.post_scripts,
            finalize_scripts: Vec::new(),
            run_style: options.run_style,
            lock_timeout: options.lock_timeout.map(Duration::from_secs),
            script_timeout: options
                .script_timeout
                .map_or(DEFAULT_SCRIPT_TIMEOUT, Duration::from_secs),
            backend,
            executor: TransferExecutor::new(runner),
        })
    }

    /// Adds scripts that run on each host after its backup attempt,
    /// regardless of the attempt's outcome.
    ///
    /// A failing finalize script downgrades a successful host to `failure`:
    /// these scripts exist to end externally visible states (like a database
    /// backup mode), so skipping them silently is not an option.
    #[must_use]
    pub fn with_finalize_scripts(mut self, scripts: Vec<String>) -> Self {
        self.finalize_scripts = scripts;
        self
    }

    pub(crate) fn host_slots(&self) -> &[HostSlot] {
        &self.hosts
    }

    pub(crate) fn user(&self) -> &str {
        &self.user
    }

    pub(crate) fn private_key(&self) -> &camino::Utf8Path {
        &self.private_key
    }

    pub(crate) fn rsync_options(&self) -> &[String] {
        &self.rsync_options
    }

    pub(crate) fn run_remote_script(
        &self,
        host: &str,
        command: &str,
    ) -> Result<(), crate::transfer::ScriptError> {
        self.executor.run_script(&ScriptRequest {
            host,
            user: &self.user,
            private_key: Some(&self.private_key),
            command,
            timeout: self.script_timeout,
        })
    }

    /// Runs one host's full workflow and folds every failure into the
    /// returned outcome.
    fn backup_host(&self, pair: &HostSlot) -> SlotOutcome {
        let outcome = self.backup_host_locked(pair);
        self.finalize_host(pair, outcome)
    }

    /// Lock, pre-scripts, transfers, unlock, post-scripts; in that order.
    fn backup_host_locked(&self, pair: &HostSlot) -> SlotOutcome {
        let lock = match self.backend.lock(&pair.slot, self.lock_timeout) {
            Ok(lock) => lock,
            Err(err @ BackendError::LockTimeout { .. }) => {
                warn!(host = %pair.host, "slot is locked, skipping backup");
                return SlotOutcome::locked(pair.slot.clone(), err.to_string());
            }
            Err(err) => {
                error!(host = %pair.host, error = %err, "cannot lock slot");
                return SlotOutcome::unknown(pair.slot.clone(), err.to_string());
            }
        };

        for script in &self.pre_scripts {
            if let Err(err) = self.run_remote_script(&pair.host, script) {
                error!(host = %pair.host, error = %err, "pre-script failed, aborting host");
                return SlotOutcome::failure(pair.slot.clone(), err.to_string());
            }
        }

        // The first failing path marks the host failed but the remaining
        // paths are still attempted: a partial slot is more useful than an
        // empty one.
        let mut first_failure = None;
        for path in &self.paths {
            info!(host = %pair.host, %path, "running rsync");
            let result = self.executor.transfer(&TransferRequest {
                source: path,
                destination: pair.slot.path(),
                source_host: Some(&pair.host),
                user: &self.user,
                private_key: Some(&self.private_key),
                options: &self.rsync_options,
                includes: &self.includes,
                excludes: &self.excludes,
            });
            if let Err(err) = result {
                error!(host = %pair.host, %path, error = %err, "rsync failed");
                if first_failure.is_none() {
                    first_failure = Some(err.to_string());
                }
            }
        }

        drop(lock);

        if let Some(detail) = first_failure {
            return SlotOutcome::failure(pair.slot.clone(), detail);
        }

        for script in &self.post_scripts {
            // The data already moved; a post-hook failure is logged but the
            // host stays successful.
            if let Err(err) = self.run_remote_script(&pair.host, script) {
                warn!(host = %pair.host, error = %err, "post-script failed after successful transfer");
            }
        }

        SlotOutcome::success(pair.slot.clone())
    }

    /// Runs the finalize scripts whatever the attempt produced.
    fn finalize_host(&self, pair: &HostSlot, outcome: SlotOutcome) -> SlotOutcome {
        let mut outcome = outcome;
        for script in &self.finalize_scripts {
            if let Err(err) = self.run_remote_script(&pair.host, script) {
                error!(host = %pair.host, error = %err, "finalize script failed");
                if outcome.status == crate::outcome::Status::Success {
                    outcome = SlotOutcome::failure(pair.slot.clone(), err.to_string());
                }
            }
        }
        outcome
    }

    fn run_hosts<F>(&self, per_host: F) -> Vec<SlotOutcome>
    where
        F: Fn(&HostSlot) -> SlotOutcome + Sync,
    {
        match self.run_style {
            RunStyle::Seq => self.hosts.iter().map(per_host).collect(),
            RunStyle::Parallel => thread::scope(|scope| {
                let worker = &per_host;
                let handles: Vec<_> = self
                    .hosts
                    .iter()
                    .map(|pair| scope.spawn(move || worker(pair)))
                    .collect();
                handles
                    .into_iter()
                    .zip(&self.hosts)
                    .map(|(handle, pair)| {
                        handle.join().unwrap_or_else(|_| {
                            SlotOutcome::unknown(pair.slot.clone(), "host worker panicked")
                        })
                    })
                    .collect()
            }),
        }
    }
}

impl<R: CommandRunner> Job for RsyncJob<R> {
    fn name(&self) -> &'static str {
        "rsync"
    }

    fn backup(&self) -> Result<Vec<SlotOutcome>, JobError> {
        Ok(self.run_hosts(|pair| self.backup_host(pair)))
    }
}

/// Host label before the first dot.
fn short_name(host: &str) -> &str {
    host.split('.').next().unwrap_or(host)
}
