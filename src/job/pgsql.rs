//! PostgreSQL backup job: rsync of the data directory plus WAL shipping.
//!
//! Backups wrap the generic rsync workflow in backup-mode markers so the
//! copied data directory is consistent, and exclude the WAL directory from
//! the main transfer. The WAL directory ships separately through
//! [`Job::stream`], which runs far more frequently than backups and
//! therefore takes the slot lock with its own, much shorter timeout.

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::Deserialize;
use tracing::{error, info, warn};

use super::rsync::{HostSlot, RsyncJob, RsyncOptions, RunStyle};
use super::{Job, JobError};
use crate::backend::{Backend, BackendError};
use crate::exec::CommandRunner;
use crate::outcome::SlotOutcome;
use crate::transfer::{TransferExecutor, TransferRequest};

/// Script that puts PostgreSQL into backup mode before the transfer.
pub const START_BACKUP_SCRIPT: &str = r#"psql -c "SELECT pg_backup_start('packrat', true);""#;

/// Script that ends backup mode; runs whatever the transfer produced.
pub const STOP_BACKUP_SCRIPT: &str = r#"psql -c "SELECT pg_backup_stop();""#;

/// Default seconds a stream waits for the slot lock before reporting
/// `locked`.
pub const DEFAULT_STREAM_TIMEOUT: u64 = 60;

/// Options accepted by the pgsql job.
#[derive(Clone, Debug, Deserialize)]
pub struct PgsqlOptions {
    /// Hosts running PostgreSQL.
    pub hosts: Vec<String>,
    /// PostgreSQL data directory transferred by backups.
    pub datadir: Utf8PathBuf,
    /// WAL archive directory; excluded from backups, shipped by streams.
    pub waldir: Utf8PathBuf,
    /// SSH identity file used for transfers and scripts.
    pub private_key: Utf8PathBuf,
    /// Remote user; defaults to `root`.
    #[serde(default)]
    pub user: Option<String>,
    /// Extra rsync `--exclude` patterns on top of the WAL directory.
    #[serde(default)]
    pub excludes: Vec<String>,
    /// Scripts run after the mandatory start-backup marker.
    #[serde(default)]
    pub pre_scripts: Vec<String>,
    /// Scripts run after a host's transfers succeeded.
    #[serde(default)]
    pub post_scripts: Vec<String>,
    /// Host scheduling; defaults to sequential.
    #[serde(default)]
    pub run_style: RunStyle,
    /// Seconds to wait for a slot lock during backups; absent waits
    /// indefinitely.
    #[serde(default)]
    pub lock_timeout: Option<u64>,
    /// Seconds allowed per remote script; defaults to 120.
    #[serde(default)]
    pub script_timeout: Option<u64>,
    /// Remove shipped WAL segments from the source; defaults to true to
    /// bound WAL growth there.
    #[serde(default = "default_delete_wal")]
    pub delete_wal: bool,
    /// Seconds a stream waits for the slot lock; defaults to 60.
    #[serde(default)]
    pub stream_timeout: Option<u64>,
}

const fn default_delete_wal() -> bool {
    true
}

/// Rsync job specialisation for PostgreSQL with WAL shipping.
pub struct PgsqlJob<R: CommandRunner> {
    inner: RsyncJob<R>,
    waldir: Utf8PathBuf,
    stream_options: Vec<String>,
    stream_timeout: Duration,
    backend: Arc<dyn Backend>,
    executor: TransferExecutor<R>,
}

impl<R: CommandRunner + Clone> PgsqlJob<R> {
    /// Builds the job and ensures every host's slot exists.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] when a slot cannot be materialised.
    pub fn new(
        options: PgsqlOptions,
        backend: Arc<dyn Backend>,
        runner: R,
    ) -> Result<Self, BackendError> {
        let mut excludes = vec![options.waldir.to_string()];
        excludes.extend(options.excludes);

        let mut pre_scripts = vec![String::from(START_BACKUP_SCRIPT)];
        pre_scripts.extend(options.pre_scripts);

        let inner_options = RsyncOptions {
            hosts: options.hosts,
            paths: vec![options.datadir],
            private_key: options.private_key,
            user: options.user,
            includes: Vec::new(),
            excludes,
            pre_scripts,
            post_scripts: options.post_scripts,
            run_style: options.run_style,
            lock_timeout: options.lock_timeout,
            script_timeout: options.script_timeout,
        };
        let inner = RsyncJob::new(inner_options, Arc::clone(&backend), runner.clone())?
            .with_finalize_scripts(vec![String::from(STOP_BACKUP_SCRIPT)]);

        let mut stream_options: Vec<String> = inner
            .rsync_options()
            .iter()
            .cloned()
            .collect();
        if options.delete_wal {
            stream_options.push(String::from("--remove-source-files"));
        }

        Ok(Self {
            inner,
            waldir: options.waldir,
            stream_options,
            stream_timeout: Duration::from_secs(
                options.stream_timeout.unwrap_or(DEFAULT_STREAM_TIMEOUT),
            ),
            backend,
            executor: TransferExecutor::new(runner),
        })
    }

    /// Ships one host's WAL directory under the stream lock timeout.
    fn stream_host(&self, pair: &HostSlot) -> SlotOutcome {
        let lock = match self.backend.lock(&pair.slot, Some(self.stream_timeout)) {
            Ok(lock) => lock,
            Err(err @ BackendError::LockTimeout { .. }) => {
                // Lock contention is an expected, externally observable
                // outcome here: a concurrent backup simply wins this round.
                warn!(host = %pair.host, "slot is locked, skipping stream");
                return SlotOutcome::locked(pair.slot.clone(), err.to_string());
            }
            Err(err) => {
                error!(host = %pair.host, error = %err, "cannot lock slot for stream");
                return SlotOutcome::unknown(pair.slot.clone(), err.to_string());
            }
        };

        info!(host = %pair.host, waldir = %self.waldir, "running rsync (stream)");
        let result = self.executor.transfer(&TransferRequest {
            source: &self.waldir,
            destination: pair.slot.path(),
            source_host: Some(&pair.host),
            user: self.inner.user(),
            private_key: Some(self.inner.private_key()),
            options: &self.stream_options,
            includes: &[],
            excludes: &[],
        });
        drop(lock);

        match result {
            Ok(()) => SlotOutcome::success(pair.slot.clone()),
            Err(err) => {
                error!(host = %pair.host, error = %err, "stream transfer failed");
                SlotOutcome::failure(pair.slot.clone(), err.to_string())
            }
        }
    }
}

impl<R: CommandRunner + Clone> Job for PgsqlJob<R> {
    fn name(&self) -> &'static str {
        "pgsql"
    }

    fn backup(&self) -> Result<Vec<SlotOutcome>, JobError> {
        self.inner.backup()
    }

    fn stream(&self) -> Result<Vec<SlotOutcome>, JobError> {
        Ok(self
            .inner
            .host_slots()
            .iter()
            .map(|pair| self.stream_host(pair))
            .collect())
    }
}
