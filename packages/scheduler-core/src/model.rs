//! Catalog entities: [`Job`], [`Run`], and [`Manager`].
//!
//! Mirrors the shape of the teacher's `kernel/jobs/job.rs` record style
//! (plain structs with `sqlx::FromRow`-friendly fields, `chrono::DateTime<Utc>`
//! timestamps, small `serde`-derived status enums) but models the sentinel
//! "no manager" value as `Option<Uuid>` rather than a magic id, per the
//! option/maybe modeling note in the source spec.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A schedulable unit. Keyed by `name`, which is chosen by the operator and
/// never changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub name: String,
    pub enabled: bool,
    pub next_run_at: DateTime<Utc>,
    /// Milliseconds between runs. `0` means one-shot.
    pub interval_ms: i64,
    /// `0` disables the execution-timeout policy.
    pub run_execution_timeout_ms: i64,
    /// `0` disables the start-timeout policy.
    pub run_start_timeout_ms: i64,
    /// `0` disables the heartbeat-timeout policy.
    pub heartbeat_timeout_ms: i64,
    /// `0` means unbounded.
    pub max_queue_count: i64,
    pub allow_concurrent_runs: bool,
    /// `None` is the sentinel "no manager owns this job".
    pub manager_id: Option<Uuid>,
    pub heartbeat: DateTime<Utc>,
}

impl Job {
    /// A fresh, unmanaged job as an operator would create it.
    pub fn new(name: impl Into<String>, next_run_at: DateTime<Utc>, interval_ms: i64) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            enabled: true,
            next_run_at,
            interval_ms,
            run_execution_timeout_ms: 0,
            run_start_timeout_ms: 0,
            heartbeat_timeout_ms: 0,
            max_queue_count: 0,
            allow_concurrent_runs: false,
            manager_id: None,
            heartbeat: now,
        }
    }

    pub fn is_unmanaged(&self) -> bool {
        self.manager_id.is_none()
    }
}

/// A single attempt to execute a [`Job`] at or after a chosen instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub job_name: String,
    pub status: RunStatus,
    pub created_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub heartbeat: DateTime<Utc>,
}

impl Run {
    /// A freshly-fired run: `createdTime = heartbeat = nextRunAt` per the
    /// dispatcher's firing loop (§4.2 step 1).
    pub fn fired(job_name: impl Into<String>, fired_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_name: job_name.into(),
            status: RunStatus::Pending,
            created_time: fired_at,
            start_time: None,
            end_time: None,
            heartbeat: fired_at,
        }
    }
}

/// Run lifecycle status. `Cancelled`, `Completed`, and `Failed` are terminal
/// (absorbing) per invariant R1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Cancelling,
    Cancelled,
    Completed,
    Failed,
}

impl RunStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Completed | Self::Failed)
    }

    /// Parse a wire-format status string (from `JobStatusMessage`), rejecting
    /// anything outside the six accepted values per §4.2's status handler.
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "cancelling" => Some(Self::Cancelling),
            "cancelled" => Some(Self::Cancelled),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub const fn as_wire(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Cancelling => "cancelling",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// A manager's self-registration record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerRecord {
    pub id: Uuid,
    pub hostname: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_wire_round_trip() {
        for s in [
            "pending",
            "running",
            "cancelling",
            "cancelled",
            "completed",
            "failed",
        ] {
            let parsed = RunStatus::from_wire(s).expect("known status");
            assert_eq!(parsed.as_wire(), s);
        }
        assert!(RunStatus::from_wire("bogus").is_none());
    }

    #[test]
    fn terminal_states() {
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::Cancelling.is_terminal());
    }

    #[test]
    fn fresh_job_is_unmanaged() {
        let job = Job::new("nightly-export", Utc::now(), 60_000);
        assert!(job.is_unmanaged());
        assert!(job.enabled);
    }
}
