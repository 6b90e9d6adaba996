//! Job custodian: a cluster-wide reaper, safe to run as multiple concurrent
//! instances, that reclaims jobs whose owning manager has stopped
//! heartbeating. Uses a single bulk [`JobRepo::unlock`] call rather than
//! reading and writing rows one at a time.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::repo::{JobRepo, JobUnlockFilter};
use crate::worker::Worker;

pub struct JobCustodian {
    job_repo: Arc<dyn JobRepo>,
    poll_interval: Duration,
    heartbeat_timeout: Duration,
}

impl JobCustodian {
    pub fn new(
        job_repo: Arc<dyn JobRepo>,
        poll_interval: Duration,
        heartbeat_timeout: Duration,
    ) -> Self {
        Self {
            job_repo,
            poll_interval,
            heartbeat_timeout,
        }
    }

    async fn tick(&self) {
        let cutoff =
            Utc::now() - ChronoDuration::from_std(self.heartbeat_timeout).unwrap_or_default();
        let filter = JobUnlockFilter {
            is_managed: Some(true),
            heartbeat_before: Some(cutoff),
            ..Default::default()
        };
        match self.job_repo.unlock(filter).await {
            Ok(0) => {}
            Ok(count) => info!(count, "reclaimed jobs from unresponsive managers"),
            Err(err) => error!(error = %err, "failed reclaiming stale job leases"),
        }
    }
}

#[async_trait]
impl Worker for JobCustodian {
    async fn run(self: Box<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => self.tick().await,
            }
        }

        Ok(())
    }
}
