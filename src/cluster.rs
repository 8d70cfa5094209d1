//! Cluster orchestration: one job bound to one backend.
//!
//! The cluster owns the run lifecycle: it builds the backend first and the
//! job second (jobs depend on backends, never the reverse), drives the
//! operation, snapshots the slots that succeeded, merges the per-slot
//! outcomes into one status, and always leaves a persisted report behind —
//! a completely failed run is still an observable fact.

use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info};

use crate::backend::Backend;
use crate::config::{ConfigError, Settings};
use crate::job::{Job, JobError};
use crate::outcome::{SlotOutcome, Status};
use crate::registry::{BackendContext, JobContext, PluginError, PluginRegistry};
use crate::report::{Report, ReportError, ReportStore, now};

/// Errors raised while building or driving a cluster.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Raised when settings are missing or invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Raised when a plugin cannot be resolved or constructed.
    #[error(transparent)]
    Plugin(#[from] PluginError),
    /// Raised when the job refuses an operation.
    #[error(transparent)]
    Job(#[from] JobError),
    /// Raised when the run report cannot be persisted.
    #[error(transparent)]
    Report(#[from] ReportError),
}

/// One backup configuration: a named pairing of job and backend.
pub struct Cluster {
    name: String,
    job_name: String,
    job: Box<dyn Job>,
    backend: Arc<dyn Backend>,
    reports: ReportStore,
}

impl Cluster {
    /// Assembles a cluster from prebuilt parts.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        job_name: impl Into<String>,
        job: Box<dyn Job>,
        backend: Arc<dyn Backend>,
        reports: ReportStore,
    ) -> Self {
        Self {
            name: name.into(),
            job_name: job_name.into(),
            job,
            backend,
            reports,
        }
    }

    /// Resolves and constructs the cluster's backend and job from settings.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError`] when the settings are incomplete or a plugin
    /// cannot be resolved or built.
    pub fn from_settings(
        settings: &Settings,
        registry: &PluginRegistry,
    ) -> Result<Self, ClusterError> {
        let (backend_name, backend_options) = settings.backend()?;
        let backend = registry.backend(&backend_name)?(&BackendContext {
            cluster: settings.name(),
            options: &backend_options,
        })?;

        let (job_name, job_options) = settings.job()?;
        let job = registry.job(&job_name)?(&JobContext {
            cluster: settings.name(),
            options: &job_options,
            backend: Arc::clone(&backend),
        })?;
        info!(
            cluster = settings.name(),
            job = %job_name,
            backend = %backend_name,
            "cluster assembled"
        );

        Ok(Self::new(
            settings.name(),
            job_name,
            job,
            backend,
            ReportStore::new(settings.report_dir()),
        ))
    }

    /// Cluster name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs a backup, snapshots successful slots, and persists the report.
    ///
    /// Snapshotting is a best-effort post-step: a failed snapshot is logged
    /// but never flips the slot's transfer outcome.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError`] when the job refuses to run or the report
    /// cannot be written; isolated slot failures are captured in the report
    /// instead.
    pub fn backup(&self) -> Result<Report, ClusterError> {
        let start_time = now();
        info!(cluster = %self.name, "starting backup");
        let slots = self.job.backup()?;

        for outcome in &slots {
            if outcome.status != Status::Success {
                continue;
            }
            if let Err(err) = self.backend.snapshot(&outcome.slot) {
                error!(slot = %outcome.slot, error = %err, "snapshot failed after successful transfer");
            }
        }

        let status = Status::merge(&slots);
        let report = Report {
            cluster: self.name.clone(),
            job_name: self.job_name.clone(),
            job_type: String::from("backup"),
            start_time,
            end_time: now(),
            status,
            slots,
        };
        self.reports.write(&report)?;
        info!(cluster = %self.name, %status, "backup finished");
        Ok(report)
    }

    /// Runs the job's incremental pull phase; no snapshots, no report.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Job`] when the job has no stream phase.
    pub fn stream(&self) -> Result<Vec<SlotOutcome>, ClusterError> {
        info!(cluster = %self.name, "starting stream");
        Ok(self.job.stream()?)
    }

    /// Restores a named snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Job`] when the job does not implement
    /// restore; none of the built-in jobs currently does.
    pub fn restore(&self, snapshot: &str) -> Result<(), ClusterError> {
        info!(cluster = %self.name, snapshot, "starting restore");
        Ok(self.job.restore(snapshot)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, DummyBackend, SlotHandle};
    use crate::config::{ClusterConfig, GlobalConfig};
    use camino::Utf8PathBuf;
    use tempfile::TempDir;

    struct CannedJob {
        outcomes: Vec<SlotOutcome>,
    }

    impl Job for CannedJob {
        fn name(&self) -> &'static str {
            "canned"
        }

        fn backup(&self) -> Result<Vec<SlotOutcome>, JobError> {
            Ok(self.outcomes.clone())
        }
    }

    struct BrokenSnapshotBackend {
        inner: DummyBackend,
    }

    impl Backend for BrokenSnapshotBackend {
        fn ensure_slot(&self, name: &str) -> Result<SlotHandle, BackendError> {
            self.inner.ensure_slot(name)
        }

        fn snapshot(&self, slot: &SlotHandle) -> Result<(), BackendError> {
            Err(BackendError::Snapshot {
                slot: slot.to_string(),
                message: String::from("simulated snapshot failure"),
            })
        }
    }

    fn utf8(tmp: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("temp path should be utf8")
    }

    fn slot(base: &Utf8PathBuf, name: &str) -> SlotHandle {
        SlotHandle::new(name.to_owned(), base.join(name))
    }

    #[test]
    fn backup_snapshots_only_successful_slots_and_persists_the_report() {
        let tmp = TempDir::new().expect("tempdir");
        let base = utf8(&tmp);
        let backend = Arc::new(DummyBackend::new(base.join("data")).expect("dummy backend"));
        let outcomes = vec![
            SlotOutcome::success(slot(&base, "host01")),
            SlotOutcome::failure(slot(&base, "host02"), "rsync exited 23"),
            SlotOutcome::success(slot(&base, "host03")),
        ];
        let cluster = Cluster::new(
            "mycluster",
            "rsync",
            Box::new(CannedJob { outcomes }),
            Arc::clone(&backend) as Arc<dyn Backend>,
            ReportStore::new(base.join("reports")),
        );

        let report = cluster.backup().expect("backup should run");

        assert_eq!(report.status, Status::Partial);
        assert_eq!(
            backend.snapshots(),
            vec![String::from("host01"), String::from("host03")],
            "the failed slot must not be snapshotted"
        );

        let store = ReportStore::new(base.join("reports"));
        let persisted = store.last("mycluster").expect("report persisted");
        assert_eq!(persisted, report);
    }

    #[test]
    fn snapshot_failure_does_not_flip_the_slot_status() {
        let tmp = TempDir::new().expect("tempdir");
        let base = utf8(&tmp);
        let inner = DummyBackend::new(base.join("data")).expect("dummy backend");
        let backend: Arc<dyn Backend> = Arc::new(BrokenSnapshotBackend { inner });
        let outcomes = vec![SlotOutcome::success(slot(&base, "host01"))];
        let cluster = Cluster::new(
            "mycluster",
            "rsync",
            Box::new(CannedJob { outcomes }),
            backend,
            ReportStore::new(base.join("reports")),
        );

        let report = cluster.backup().expect("backup should run");

        assert_eq!(report.status, Status::Success);
        assert_eq!(
            report.slots.first().map(|o| o.status),
            Some(Status::Success)
        );
    }

    #[test]
    fn a_fully_failed_run_still_writes_a_report() {
        let tmp = TempDir::new().expect("tempdir");
        let base = utf8(&tmp);
        let backend = Arc::new(DummyBackend::new(base.join("data")).expect("dummy backend"));
        let outcomes = vec![
            SlotOutcome::failure(slot(&base, "host01"), "down"),
            SlotOutcome::failure(slot(&base, "host02"), "down"),
        ];
        let cluster = Cluster::new(
            "mycluster",
            "rsync",
            Box::new(CannedJob { outcomes }),
            Arc::clone(&backend) as Arc<dyn Backend>,
            ReportStore::new(base.join("reports")),
        );

        let report = cluster.backup().expect("backup should run");

        assert_eq!(report.status, Status::Failure);
        assert!(backend.snapshots().is_empty());
        let persisted = ReportStore::new(base.join("reports"))
            .last("mycluster")
            .expect("report persisted");
        assert_eq!(persisted.status, Status::Failure);
    }

    #[test]
    fn stream_on_a_job_without_stream_phase_is_unsupported() {
        let tmp = TempDir::new().expect("tempdir");
        let base = utf8(&tmp);
        let backend: Arc<dyn Backend> =
            Arc::new(DummyBackend::new(base.join("data")).expect("dummy backend"));
        let cluster = Cluster::new(
            "mycluster",
            "canned",
            Box::new(CannedJob {
                outcomes: Vec::new(),
            }),
            backend,
            ReportStore::new(base.join("reports")),
        );

        let err = cluster.stream().expect_err("stream must be unsupported");
        assert!(
            matches!(
                err,
                ClusterError::Job(JobError::Unsupported {
                    operation: "stream",
                    ..
                })
            ),
            "got {err:?}"
        );
    }

    #[test]
    fn from_settings_builds_backend_first_then_job() {
        let tmp = TempDir::new().expect("tempdir");
        let base = utf8(&tmp);
        let global: GlobalConfig = serde_yaml::from_str(&format!(
            "report_dir: {}\nbackend_options:\n  dummy:\n    path: {}\n",
            base.join("reports"),
            base.join("data"),
        ))
        .expect("global should parse");
        let cluster_config: ClusterConfig = serde_yaml::from_str(
            "job: rsync\nbackend: dummy\noptions:\n  hosts: [host01]\n  paths: [/var/log]\n  private_key: /etc/packrat/backup.key\n",
        )
        .expect("cluster should parse");
        let settings = Settings::from_parts("mycluster", cluster_config, global);

        let cluster = Cluster::from_settings(&settings, &PluginRegistry::builtin())
            .expect("cluster should assemble");

        assert_eq!(cluster.name(), "mycluster");
        // The job's construction already ensured the slot via the backend.
        assert!(base.join("data").join("host01").is_dir());
    }

    #[test]
    fn unknown_job_plugin_fails_cluster_construction() {
        let tmp = TempDir::new().expect("tempdir");
        let base = utf8(&tmp);
        let global: GlobalConfig = serde_yaml::from_str(&format!(
            "backend_options:\n  dummy:\n    path: {}\n",
            base.join("data"),
        ))
        .expect("global should parse");
        let cluster_config: ClusterConfig =
            serde_yaml::from_str("job: tarball\nbackend: dummy\n").expect("cluster should parse");
        let settings = Settings::from_parts("mycluster", cluster_config, global);

        let Err(err) = Cluster::from_settings(&settings, &PluginRegistry::builtin()) else {
            panic!("unknown job must fail");
        };
        assert!(
            matches!(err, ClusterError::Plugin(PluginError::NotFound { .. })),
            "got {err:?}"
        );
    }
}
