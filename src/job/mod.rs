//! Job contract: pluggable transfer/backup strategies.
//!
//! A job drives one backup method across one or more hosts against a
//! backend. Per-host failures never escape a job: they are converted to
//! [`SlotOutcome`]s at the host-loop boundary, so `backup` and `stream` only
//! error for capabilities a variant does not implement.

use thiserror::Error;

use crate::outcome::SlotOutcome;

pub mod pgsql;
pub mod rsync;
pub mod vault;

/// Errors raised by job operations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum JobError {
    /// Raised when a job variant intentionally does not implement an
    /// operation. Distinct from configuration errors: the job is configured
    /// correctly, the capability just does not exist.
    #[error("the {job} job does not support {operation}")]
    Unsupported {
        /// Job plugin name.
        job: &'static str,
        /// Operation that was requested.
        operation: &'static str,
    },
}

/// Capability contract implemented by job plugins.
pub trait Job: Send + Sync {
    /// Plugin name, used in logs and `Unsupported` errors.
    fn name(&self) -> &'static str;

    /// Runs a full backup and returns one outcome per slot.
    ///
    /// # Errors
    ///
    /// Implementations only error for missing capabilities or programmer
    /// mistakes; isolated host failures are reported through the outcomes.
    fn backup(&self) -> Result<Vec<SlotOutcome>, JobError>;

    /// Pulls incremental data to shrink the next backup.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Unsupported`] unless the variant defines an
    /// incremental pull phase.
    fn stream(&self) -> Result<Vec<SlotOutcome>, JobError> {
        Err(JobError::Unsupported {
            job: self.name(),
            operation: "stream",
        })
    }

    /// Restores a named snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Unsupported`] unless the variant implements
    /// restore; none of the built-in jobs currently does.
    fn restore(&self, snapshot: &str) -> Result<(), JobError> {
        let _ = snapshot;
        Err(JobError::Unsupported {
            job: self.name(),
            operation: "restore",
        })
    }
}
