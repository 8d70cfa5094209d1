//! Immutable run reports and their on-disk store.
//!
//! Every backup or restore invocation produces exactly one [`Report`],
//! persisted as YAML under `<root>/<cluster>/<start-time>.yaml`. Reports are
//! write-once: the orchestrator creates them, the status checker reads them,
//! nothing mutates them. Snapshot names reuse the same timestamp convention
//! so a report and the snapshots it triggered sort together.

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::ambient_authority;
use cap_std::fs_utf8::Dir;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::PrimitiveDateTime;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use tracing::{debug, warn};

use crate::outcome::{SlotOutcome, Status};

/// Default directory reports are persisted under.
pub const DEFAULT_REPORT_DIR: &str = "/var/lib/packrat/reports";

/// Timestamp format shared by report filenames and snapshot names.
pub const TIME_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");

time::serde::format_description!(
    report_time,
    PrimitiveDateTime,
    "[year]-[month]-[day]T[hour]:[minute]:[second]"
);

/// Returns the current wall-clock time, truncated to whole seconds.
#[must_use]
pub fn now() -> PrimitiveDateTime {
    let current = time::OffsetDateTime::now_utc();
    let seconds = current.replace_nanosecond(0).unwrap_or(current);
    PrimitiveDateTime::new(seconds.date(), seconds.time())
}

/// Renders a timestamp with [`TIME_FORMAT`].
#[must_use]
pub fn format_time(value: PrimitiveDateTime) -> String {
    value
        .format(TIME_FORMAT)
        .unwrap_or_else(|_| value.to_string())
}

/// Errors raised while serializing, reading, or writing reports.
#[derive(Debug, Error)]
pub enum ReportError {
    /// Raised when a report cannot be rendered to YAML.
    #[error("failed to serialize report for {cluster}: {message}")]
    Serialize {
        /// Cluster the report belongs to.
        cluster: String,
        /// Serializer error message.
        message: String,
    },
    /// Raised when report YAML cannot be parsed.
    #[error("failed to parse report {path}: {message}")]
    Parse {
        /// File that could not be parsed.
        path: Utf8PathBuf,
        /// Parser error message.
        message: String,
    },
    /// Raised when report files or directories cannot be accessed.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// Raised when a cluster has no readable reports at all.
    #[error("no reports found for {cluster} under {root}")]
    NoReports {
        /// Cluster that was queried.
        cluster: String,
        /// Store root that was searched.
        root: Utf8PathBuf,
    },
}

/// Immutable record of one backup/stream/restore run.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Report {
    /// Cluster the run belonged to.
    pub cluster: String,
    /// Job plugin that performed the run.
    pub job_name: String,
    /// Operation kind: `backup`, `stream`, or `restore`.
    pub job_type: String,
    /// Wall-clock start of the run; part of the persistence key.
    #[serde(with = "report_time")]
    pub start_time: PrimitiveDateTime,
    /// Wall-clock end of the run.
    #[serde(with = "report_time")]
    pub end_time: PrimitiveDateTime,
    /// Merged cluster-level status.
    pub status: Status,
    /// Per-slot outcomes, in the order the job produced them.
    pub slots: Vec<SlotOutcome>,
}

impl Report {
    /// Renders the report as YAML.
    ///
    /// # Errors
    ///
    /// Returns [`ReportError::Serialize`] when rendering fails.
    pub fn serialize(&self) -> Result<String, ReportError> {
        serde_yaml::to_string(self).map_err(|err| ReportError::Serialize {
            cluster: self.cluster.clone(),
            message: err.to_string(),
        })
    }

    /// Parses a report from YAML text.
    ///
    /// # Errors
    ///
    /// Returns [`ReportError::Parse`] when the text is not a valid report.
    pub fn deserialize(path: &Utf8Path, text: &str) -> Result<Self, ReportError> {
        serde_yaml::from_str(text).map_err(|err| ReportError::Parse {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
    }

    /// File name this report persists under (`<start-time>.yaml`).
    #[must_use]
    pub fn file_name(&self) -> String {
        format!("{}.yaml", format_time(self.start_time))
    }

    /// Number of slots that reported success.
    #[must_use]
    pub fn successful_slots(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.status == Status::Success)
            .count()
    }
}

/// Read/write access to the report directory tree.
#[derive(Clone, Debug)]
pub struct ReportStore {
    root: Utf8PathBuf,
}

impl ReportStore {
    /// Creates a store rooted at `root`.
    #[must_use]
    pub const fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    /// Root directory the store operates under.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Persists a report and returns the path it was written to.
    ///
    /// # Errors
    ///
    /// Returns [`ReportError`] when the report cannot be rendered or the
    /// file cannot be written.
    pub fn write(&self, report: &Report) -> Result<Utf8PathBuf, ReportError> {
        let cluster_dir = self.root.join(&report.cluster);
        let text = report.serialize()?;
        let file_name = report.file_name();

        Dir::create_ambient_dir_all(&cluster_dir, ambient_authority()).map_err(|err| {
            ReportError::Io {
                path: cluster_dir.clone(),
                message: err.to_string(),
            }
        })?;
        let dir =
            Dir::open_ambient_dir(&cluster_dir, ambient_authority()).map_err(|err| {
                ReportError::Io {
                    path: cluster_dir.clone(),
                    message: err.to_string(),
                }
            })?;
        dir.write(&file_name, &text).map_err(|err| ReportError::Io {
            path: cluster_dir.join(&file_name),
            message: err.to_string(),
        })?;

        let path = cluster_dir.join(&file_name);
        debug!(report = %path, "report written");
        Ok(path)
    }

    /// Reads one report file.
    ///
    /// # Errors
    ///
    /// Returns [`ReportError::Io`] when the file cannot be read and
    /// [`ReportError::Parse`] when its content is invalid.
    pub fn read(&self, path: &Utf8Path) -> Result<Report, ReportError> {
        let parent = path.parent().unwrap_or_else(|| Utf8Path::new("."));
        let file_name = path.file_name().ok_or_else(|| ReportError::Io {
            path: path.to_path_buf(),
            message: String::from("report path is missing a filename"),
        })?;

        let dir = Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| {
            ReportError::Io {
                path: parent.to_path_buf(),
                message: err.to_string(),
            }
        })?;
        let text = dir
            .read_to_string(file_name)
            .map_err(|err| ReportError::Io {
                path: path.to_path_buf(),
                message: err.to_string(),
            })?;
        Report::deserialize(path, &text)
    }

    /// Returns the most recent report for a cluster.
    ///
    /// # Errors
    ///
    /// Returns [`ReportError::NoReports`] when the cluster directory is
    /// missing or holds no report files, and propagates read failures of the
    /// newest file.
    pub fn last(&self, cluster: &str) -> Result<Report, ReportError> {
        let mut paths = self.report_paths(cluster)?;
        paths.sort();
        let newest = paths.pop().ok_or_else(|| ReportError::NoReports {
            cluster: cluster.to_owned(),
            root: self.root.clone(),
        })?;
        self.read(&newest)
    }

    /// Returns every readable report for a cluster whose start time falls
    /// inside `[from, to]`, oldest first.
    ///
    /// Files with unparseable names or content are skipped with a warning so
    /// one corrupt report cannot hide the rest of the history.
    ///
    /// # Errors
    ///
    /// Returns [`ReportError::NoReports`] when the cluster directory is
    /// missing.
    pub fn in_range(
        &self,
        cluster: &str,
        from: PrimitiveDateTime,
        to: PrimitiveDateTime,
    ) -> Result<Vec<Report>, ReportError> {
        let mut paths = self.report_paths(cluster)?;
        paths.sort();

        let mut reports = Vec::new();
        for path in paths {
            let Some(stem) = path.file_stem() else {
                continue;
            };
            let Ok(start) = PrimitiveDateTime::parse(stem, TIME_FORMAT) else {
                warn!(report = %path, "skipping report with unparseable name");
                continue;
            };
            if start < from || start > to {
                continue;
            }
            match self.read(&path) {
                Ok(report) => reports.push(report),
                Err(err) => warn!(report = %path, error = %err, "skipping unreadable report"),
            }
        }
        Ok(reports)
    }

    fn report_paths(&self, cluster: &str) -> Result<Vec<Utf8PathBuf>, ReportError> {
        let cluster_dir = self.root.join(cluster);
        let entries = cluster_dir
            .read_dir_utf8()
            .map_err(|_| ReportError::NoReports {
                cluster: cluster.to_owned(),
                root: self.root.clone(),
            })?;

        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| ReportError::Io {
                path: cluster_dir.clone(),
                message: err.to_string(),
            })?;
            let path = entry.path().to_path_buf();
            if path.extension() == Some("yaml") {
                paths.push(path);
            }
        }
        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SlotHandle;
    use tempfile::TempDir;
    use time::macros::datetime;

    fn store(tmp: &TempDir) -> ReportStore {
        let root =
            Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("temp path should be utf8");
        ReportStore::new(root)
    }

    fn sample_report() -> Report {
        Report {
            cluster: String::from("mycluster"),
            job_name: String::from("rsync"),
            job_type: String::from("backup"),
            start_time: datetime!(2026-01-15 01:00:00),
            end_time: datetime!(2026-01-15 02:00:00),
            status: Status::Partial,
            slots: vec![
                SlotOutcome::success(SlotHandle::new(
                    String::from("host01"),
                    Utf8PathBuf::from("/backup/mycluster/slots/host01"),
                )),
                SlotOutcome::failure(
                    SlotHandle::new(
                        String::from("host02"),
                        Utf8PathBuf::from("/backup/mycluster/slots/host02"),
                    ),
                    "rsync exited 23",
                ),
            ],
        }
    }

    #[test]
    fn report_round_trips_field_for_field() {
        let report = sample_report();
        let text = report.serialize().expect("serialize");
        let back =
            Report::deserialize(Utf8Path::new("mem.yaml"), &text).expect("deserialize");

        assert_eq!(back, report);
        assert_eq!(back.slots, report.slots, "slot order must be preserved");
    }

    #[test]
    fn file_name_uses_start_time() {
        assert_eq!(sample_report().file_name(), "2026-01-15T01:00:00.yaml");
    }

    #[test]
    fn write_then_read_back() {
        let tmp = TempDir::new().expect("tempdir");
        let reports = store(&tmp);
        let report = sample_report();

        let path = reports.write(&report).expect("write report");
        assert!(path.as_str().ends_with("mycluster/2026-01-15T01:00:00.yaml"));

        let back = reports.read(&path).expect("read report");
        assert_eq!(back, report);
    }

    #[test]
    fn last_returns_newest_report() {
        let tmp = TempDir::new().expect("tempdir");
        let reports = store(&tmp);

        let mut older = sample_report();
        older.start_time = datetime!(2026-01-14 01:00:00);
        older.status = Status::Success;
        reports.write(&older).expect("write older");
        reports.write(&sample_report()).expect("write newer");

        let last = reports.last("mycluster").expect("last report");
        assert_eq!(last.start_time, datetime!(2026-01-15 01:00:00));
        assert_eq!(last.status, Status::Partial);
    }

    #[test]
    fn last_errors_when_cluster_has_no_reports() {
        let tmp = TempDir::new().expect("tempdir");
        let err = store(&tmp)
            .last("missing")
            .expect_err("missing cluster should error");
        assert!(matches!(err, ReportError::NoReports { .. }), "got {err:?}");
    }

    #[test]
    fn in_range_filters_by_start_time_and_skips_garbage() {
        let tmp = TempDir::new().expect("tempdir");
        let reports = store(&tmp);

        let mut early = sample_report();
        early.start_time = datetime!(2026-01-10 01:00:00);
        reports.write(&early).expect("write early");
        reports.write(&sample_report()).expect("write in-range");

        let cluster_dir = reports.root().join("mycluster");
        std::fs::write(cluster_dir.join("not-a-date.yaml"), "status: success")
            .expect("write garbage");

        let found = reports
            .in_range(
                "mycluster",
                datetime!(2026-01-14 00:00:00),
                datetime!(2026-01-16 00:00:00),
            )
            .expect("range query");

        assert_eq!(found.len(), 1);
        assert_eq!(
            found.first().map(|report| report.start_time),
            Some(datetime!(2026-01-15 01:00:00))
        );
    }

    #[test]
    fn successful_slot_count() {
        assert_eq!(sample_report().successful_slots(), 1);
    }
}
