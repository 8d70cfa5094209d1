//! Monitoring-facing status check over persisted reports.
//!
//! Reads the newest report per cluster and folds run statuses into the
//! four-level severity scale monitoring systems expect. Reports older than
//! the configured age are downgraded to unknown: a backup that stopped
//! happening is just as alarming as one that failed.

use time::Duration;

use crate::outcome::Status;
use crate::report::{Report, ReportStore, now};

/// Monitoring severity, ordered least to most severe for merging.
///
/// The order deliberately ranks `Unknown` above `Warning`: not knowing
/// whether backups run is worse than knowing they partially did.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum Severity {
    /// Everything succeeded.
    Ok,
    /// Degraded but data moved (partial or lock contention).
    Warning,
    /// No usable signal.
    Unknown,
    /// Backups failed.
    Critical,
}

impl Severity {
    /// Conventional monitoring exit code for this severity.
    #[must_use]
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::Warning => 1,
            Self::Critical => 2,
            Self::Unknown => 3,
        }
    }

    /// Uppercase label used in check output.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Warning => "WARNING",
            Self::Critical => "CRITICAL",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl From<Status> for Severity {
    fn from(status: Status) -> Self {
        match status {
            Status::Success => Self::Ok,
            Status::Partial | Status::Locked => Self::Warning,
            Status::Failure => Self::Critical,
            Status::Unknown => Self::Unknown,
        }
    }
}

/// Aggregated result of checking one or more clusters.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CheckOutcome {
    /// Worst severity across all checked clusters.
    pub severity: Severity,
    /// One display line per cluster.
    pub lines: Vec<String>,
    /// Header line summarising the whole check.
    pub summary: String,
}

/// Checks the newest report of every named cluster.
///
/// Clusters without a readable report contribute an `UNKNOWN` line instead
/// of failing the whole check.
#[must_use]
pub fn check_clusters(store: &ReportStore, clusters: &[String], max_age_days: u64) -> CheckOutcome {
    let mut lines = Vec::with_capacity(clusters.len());
    let mut severity = Severity::Ok;
    let mut succeeded = 0usize;

    for cluster in clusters {
        let cluster_severity = match store.last(cluster) {
            Ok(report) => {
                let aged = report_severity(&report, max_age_days);
                if report.status == Status::Success {
                    succeeded += 1;
                }
                lines.push(format!(
                    "[{}] {} slots: {}/{} succeeded",
                    aged.label(),
                    cluster,
                    report.successful_slots(),
                    report.slots.len()
                ));
                aged
            }
            Err(err) => {
                lines.push(format!("[UNKNOWN] {cluster}: {err}"));
                Severity::Unknown
            }
        };
        severity = severity.max(cluster_severity);
    }

    let summary = format!(
        "{} packrat backups - {}/{}",
        severity.label(),
        succeeded,
        clusters.len()
    );
    CheckOutcome {
        severity,
        lines,
        summary,
    }
}

/// Severity of one report, downgraded to unknown once it is stale.
fn report_severity(report: &Report, max_age_days: u64) -> Severity {
    let age_limit = Duration::days(i64::try_from(max_age_days).unwrap_or(i64::MAX));
    if now() >= report.start_time.saturating_add(age_limit) {
        return Severity::Unknown;
    }
    Severity::from(report.status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SlotHandle;
    use crate::outcome::SlotOutcome;
    use camino::Utf8PathBuf;
    use tempfile::TempDir;
    use time::PrimitiveDateTime;

    fn store(tmp: &TempDir) -> ReportStore {
        let root =
            Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("temp path should be utf8");
        ReportStore::new(root)
    }

    fn write_report(store: &ReportStore, cluster: &str, status: Status, start: PrimitiveDateTime) {
        let slot = SlotHandle::new(
            String::from("host01"),
            Utf8PathBuf::from("/slots/host01"),
        );
        let outcome = match status {
            Status::Success => SlotOutcome::success(slot),
            _ => SlotOutcome::failure(slot, "boom"),
        };
        let report = Report {
            cluster: cluster.to_owned(),
            job_name: String::from("rsync"),
            job_type: String::from("backup"),
            start_time: start,
            end_time: start,
            status,
            slots: vec![outcome],
        };
        store.write(&report).expect("write report");
    }

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|item| (*item).to_owned()).collect()
    }

    #[test]
    fn all_green_clusters_merge_to_ok() {
        let tmp = TempDir::new().expect("tempdir");
        let reports = store(&tmp);
        write_report(&reports, "web", Status::Success, now());
        write_report(&reports, "db", Status::Success, now());

        let outcome = check_clusters(&reports, &names(&["web", "db"]), 1);

        assert_eq!(outcome.severity, Severity::Ok);
        assert_eq!(outcome.summary, "OK packrat backups - 2/2");
        assert!(
            outcome
                .lines
                .iter()
                .all(|line| line.contains("slots: 1/1 succeeded")),
            "{:?}",
            outcome.lines
        );
    }

    #[test]
    fn one_failed_cluster_turns_the_check_critical() {
        let tmp = TempDir::new().expect("tempdir");
        let reports = store(&tmp);
        write_report(&reports, "web", Status::Success, now());
        write_report(&reports, "db", Status::Failure, now());

        let outcome = check_clusters(&reports, &names(&["web", "db"]), 1);

        assert_eq!(outcome.severity, Severity::Critical);
        assert_eq!(outcome.summary, "CRITICAL packrat backups - 1/2");
    }

    #[test]
    fn partial_and_locked_are_warnings() {
        let tmp = TempDir::new().expect("tempdir");
        let reports = store(&tmp);
        write_report(&reports, "web", Status::Partial, now());
        write_report(&reports, "db", Status::Locked, now());

        let outcome = check_clusters(&reports, &names(&["web", "db"]), 1);

        assert_eq!(outcome.severity, Severity::Warning);
    }

    #[test]
    fn a_stale_success_is_reported_unknown() {
        let tmp = TempDir::new().expect("tempdir");
        let reports = store(&tmp);
        let old_start = now().saturating_sub(Duration::days(3));
        write_report(&reports, "web", Status::Success, old_start);

        let outcome = check_clusters(&reports, &names(&["web"]), 1);

        assert_eq!(outcome.severity, Severity::Unknown);
        assert!(
            outcome
                .lines
                .first()
                .is_some_and(|line| line.starts_with("[UNKNOWN]")),
            "{:?}",
            outcome.lines
        );
    }

    #[test]
    fn a_cluster_without_reports_is_unknown_but_does_not_fail_the_check() {
        let tmp = TempDir::new().expect("tempdir");
        let reports = store(&tmp);
        write_report(&reports, "web", Status::Success, now());

        let outcome = check_clusters(&reports, &names(&["web", "ghost"]), 1);

        assert_eq!(outcome.severity, Severity::Unknown);
        assert_eq!(outcome.lines.len(), 2);
        assert!(
            outcome
                .lines
                .last()
                .is_some_and(|line| line.contains("no reports found")),
            "{:?}",
            outcome.lines
        );
    }

    #[test]
    fn severity_merge_order_matches_the_exit_codes() {
        assert!(Severity::Critical > Severity::Unknown);
        assert!(Severity::Unknown > Severity::Warning);
        assert!(Severity::Warning > Severity::Ok);
        assert_eq!(Severity::Ok.exit_code(), 0);
        assert_eq!(Severity::Warning.exit_code(), 1);
        assert_eq!(Severity::Critical.exit_code(), 2);
        assert_eq!(Severity::Unknown.exit_code(), 3);
    }
}
