//! Repository ports: the abstract document-store contract that
//! `scheduler-postgres` (and, in tests, [`crate::testing`]'s in-memory
//! doubles) implement.
//!
//! Partial updates and filters are modeled as plain structs of `Option<T>`
//! fields — the "undefined vs. null vs. value" shape the source design notes
//! ask for — built with `..Default::default()` the way callers assemble a
//! sparse patch.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::SchedulerError;
use crate::model::{Job, ManagerRecord, Run, RunStatus};

pub type RepoResult<T> = Result<T, SchedulerError>;

/// Sparse patch for [`JobRepo::edit`]. Every field left `None` is left
/// untouched on the stored record.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub enabled: Option<bool>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub interval_ms: Option<i64>,
    pub run_execution_timeout_ms: Option<i64>,
    pub run_start_timeout_ms: Option<i64>,
    pub heartbeat_timeout_ms: Option<i64>,
    pub max_queue_count: Option<i64>,
    pub allow_concurrent_runs: Option<bool>,
    /// `Some(None)` clears ownership (sets the sentinel); `None` leaves the
    /// current owner untouched.
    pub manager_id: Option<Option<Uuid>>,
    pub heartbeat: Option<DateTime<Utc>>,
}

/// Filter for [`JobRepo::unlock`]. All populated fields are ANDed together.
#[derive(Debug, Clone, Default)]
pub struct JobUnlockFilter {
    pub manager_id: Option<Uuid>,
    pub job_names: Option<Vec<String>>,
    /// When `Some(true)`, only rows currently owned by some manager match.
    pub is_managed: Option<bool>,
    pub heartbeat_before: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait JobRepo: Send + Sync {
    async fn browse(&self) -> RepoResult<Vec<Job>>;
    async fn read(&self, name: &str) -> RepoResult<Job>;
    async fn add(&self, job: Job) -> RepoResult<()>;
    async fn edit(&self, name: &str, update: JobUpdate) -> RepoResult<()>;
    async fn delete(&self, name: &str) -> RepoResult<()>;

    /// Atomically claim up to `take` jobs (`0` = unlimited) on behalf of
    /// `manager_id`, preferring rows already owned by `manager_id` over
    /// unowned ones. Returns the claimed rows, each with `manager_id` set to
    /// `manager_id`.
    async fn lock(&self, manager_id: Uuid, take: u32) -> RepoResult<Vec<Job>>;

    /// Clear `manager_id` (set the sentinel) on every row matching `filter`.
    /// Returns the number of rows touched.
    async fn unlock(&self, filter: JobUnlockFilter) -> RepoResult<u64>;

    /// Bulk-write `heartbeat = now()` on every row owned by `manager_id`.
    /// Returns the number of rows touched.
    async fn heartbeat(&self, manager_id: Uuid, now: DateTime<Utc>) -> RepoResult<u64>;
}

/// Sparse patch for [`RunRepo::edit`].
#[derive(Debug, Clone, Default)]
pub struct RunUpdate {
    pub status: Option<RunStatus>,
    pub start_time: Option<Option<DateTime<Utc>>>,
    pub end_time: Option<Option<DateTime<Utc>>>,
    pub heartbeat: Option<DateTime<Utc>>,
}

/// Filter for [`RunRepo::browse`]. All populated fields are ANDed together.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub job_name: Option<String>,
    pub status: Option<RunStatus>,
    pub created_before: Option<DateTime<Utc>>,
    pub started_before: Option<DateTime<Utc>>,
    pub heartbeat_before: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait RunRepo: Send + Sync {
    async fn browse(&self, filter: RunFilter) -> RepoResult<Vec<Run>>;
    async fn read(&self, id: Uuid) -> RepoResult<Run>;
    async fn add(&self, run: Run) -> RepoResult<()>;
    async fn edit(&self, id: Uuid, update: RunUpdate) -> RepoResult<()>;
    async fn delete(&self, id: Uuid) -> RepoResult<()>;
}

#[async_trait]
pub trait ManagerRepo: Send + Sync {
    async fn browse(&self) -> RepoResult<Vec<ManagerRecord>>;
    async fn read(&self, id: Uuid) -> RepoResult<ManagerRecord>;
    async fn add(&self, manager: ManagerRecord) -> RepoResult<()>;
    async fn delete(&self, id: Uuid) -> RepoResult<()>;
}
