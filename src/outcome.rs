//! Per-slot outcomes and the cluster-level status merge rule.

use serde::{Deserialize, Serialize};

use crate::backend::SlotHandle;

/// Status of one slot's backup/stream attempt, or of a whole run.
///
/// Slots only ever report `success`, `failure`, `locked`, or `unknown`;
/// `partial` exists solely at the cluster level, produced by [`Status::merge`]
/// when some (but not all) slots failed.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// The data moved (or the whole run succeeded).
    Success,
    /// Some slots succeeded while at least one failed. Cluster level only.
    Partial,
    /// The transfer or a mandatory pre-step failed.
    Failure,
    /// The slot lock could not be acquired before the deadline.
    Locked,
    /// No outcome was recorded; never conflated with success.
    Unknown,
}

impl Status {
    /// Merges per-slot statuses into one cluster-level status.
    ///
    /// Precedence, evaluated in order: all `failure` is `failure`; any
    /// `failure` is `partial`; any `locked` is `locked`; all `success` is
    /// `success`; anything else (including an empty input) is `unknown`.
    /// The result is total, deterministic, and independent of input order.
    #[must_use]
    pub fn merge<'a, I>(outcomes: I) -> Self
    where
        I: IntoIterator<Item = &'a SlotOutcome>,
    {
        let mut total = 0usize;
        let mut failures = 0usize;
        let mut locked = 0usize;
        let mut successes = 0usize;
        for outcome in outcomes {
            total += 1;
            match outcome.status {
                Self::Failure => failures += 1,
                Self::Locked => locked += 1,
                Self::Success => successes += 1,
                Self::Partial | Self::Unknown => {}
            }
        }

        if total == 0 {
            return Self::Unknown;
        }
        if failures == total {
            return Self::Failure;
        }
        if failures > 0 {
            return Self::Partial;
        }
        if locked > 0 {
            return Self::Locked;
        }
        if successes == total {
            return Self::Success;
        }
        Self::Unknown
    }

    /// Lowercase label used in reports and log lines.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failure => "failure",
            Self::Locked => "locked",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable record of one slot's backup or stream attempt.
///
/// Produced exactly once per host and job invocation, then handed to the
/// cluster for aggregation and reporting.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SlotOutcome {
    /// Slot the attempt targeted.
    pub slot: SlotHandle,
    /// Result of the attempt.
    pub status: Status,
    /// Optional failure detail for operators.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl SlotOutcome {
    /// Records a successful attempt.
    #[must_use]
    pub const fn success(slot: SlotHandle) -> Self {
        Self {
            slot,
            status: Status::Success,
            detail: None,
        }
    }

    /// Records a failed attempt with a reason.
    #[must_use]
    pub fn failure(slot: SlotHandle, detail: impl Into<String>) -> Self {
        Self {
            slot,
            status: Status::Failure,
            detail: Some(detail.into()),
        }
    }

    /// Records a lock-contention outcome.
    #[must_use]
    pub fn locked(slot: SlotHandle, detail: impl Into<String>) -> Self {
        Self {
            slot,
            status: Status::Locked,
            detail: Some(detail.into()),
        }
    }

    /// Records an attempt that failed outside the known taxonomy.
    #[must_use]
    pub fn unknown(slot: SlotHandle, detail: impl Into<String>) -> Self {
        Self {
            slot,
            status: Status::Unknown,
            detail: Some(detail.into()),
        }
    }
}
