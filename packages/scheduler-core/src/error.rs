//! Error kinds shared across the repository port, the message bus port, and
//! the four workers.
//!
//! Grounded on the teacher's `ErrorKind` enum in `kernel/jobs/job.rs`: a
//! small `thiserror`-derived enum for the handful of kinds callers actually
//! need to branch on, plus a `should_retry`-style helper. Component-internal
//! plumbing (the worker `run` loops) stays on `anyhow::Result` the way the
//! teacher's `JobWorker::run` does; only port boundaries return
//! `SchedulerError` so callers can match on kind.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid id: {0}")]
    InvalidId(String),

    #[error("transient I/O failure: {0}")]
    Transient(#[source] anyhow::Error),

    #[error("unsupported value for {field}: {value}")]
    Unsupported { field: &'static str, value: String },

    #[error("lease violation: {0}")]
    LeaseViolation(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl SchedulerError {
    /// Mirrors the teacher's `ErrorKind::should_retry`: only failures that
    /// look transient are worth retrying at the call site.
    pub fn should_retry(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}
