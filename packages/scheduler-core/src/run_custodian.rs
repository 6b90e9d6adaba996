//! Per-job run custodian: enforces the three timeout policies
//! (heartbeat-stall restart, pending-start timeout, execution timeout) on a
//! fixed tick. Unlike the dispatcher, a tick that errors is logged and
//! retried on the next tick rather than stopping the worker — a stuck
//! repository call shouldn't take the whole job offline.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::bus::{self, MessageBus, ROUTING_KEY_ACTION};
use crate::messages::{JobAction, JobActionMessage};
use crate::model::{Job, Run, RunStatus};
use crate::repo::{RunFilter, RunRepo, RunUpdate};
use crate::worker::Worker;

pub struct RunCustodian {
    run_repo: Arc<dyn RunRepo>,
    bus: Arc<dyn MessageBus>,
    job_rx: watch::Receiver<Job>,
    tick_interval: std::time::Duration,
}

impl RunCustodian {
    pub fn new(
        run_repo: Arc<dyn RunRepo>,
        bus: Arc<dyn MessageBus>,
        job_rx: watch::Receiver<Job>,
        tick_interval: std::time::Duration,
    ) -> Self {
        Self {
            run_repo,
            bus,
            job_rx,
            tick_interval,
        }
    }

    async fn tick(&self, job: &Job) {
        let now = Utc::now();

        if job.heartbeat_timeout_ms > 0 {
            self.restart_stuck_runs(job, now).await;
        }
        if job.run_start_timeout_ms > 0 {
            self.cancel_pending_timeouts(job, now).await;
        }
        if job.run_execution_timeout_ms > 0 {
            self.cancel_execution_timeouts(job, now).await;
        }
    }

    async fn restart_stuck_runs(&self, job: &Job, now: DateTime<Utc>) {
        let cutoff = now - ChronoDuration::milliseconds(job.heartbeat_timeout_ms);
        let stuck = match self
            .run_repo
            .browse(RunFilter {
                job_name: Some(job.name.clone()),
                status: Some(RunStatus::Running),
                heartbeat_before: Some(cutoff),
                ..Default::default()
            })
            .await
        {
            Ok(runs) => runs,
            Err(err) => {
                error!(job_name = %job.name, error = %err, "failed listing stalled runs");
                return;
            }
        };

        for run in stuck {
            let update = RunUpdate {
                status: Some(RunStatus::Pending),
                ..Default::default()
            };
            if let Err(err) = self.run_repo.edit(run.id, update).await {
                error!(job_name = %job.name, run_id = %run.id, error = %err, "failed restarting stalled run");
            }
        }
    }

    async fn cancel_pending_timeouts(&self, job: &Job, now: DateTime<Utc>) {
        let cutoff = now - ChronoDuration::milliseconds(job.run_start_timeout_ms);
        let timed_out = match self
            .run_repo
            .browse(RunFilter {
                job_name: Some(job.name.clone()),
                status: Some(RunStatus::Pending),
                created_before: Some(cutoff),
                ..Default::default()
            })
            .await
        {
            Ok(runs) => runs,
            Err(err) => {
                error!(job_name = %job.name, error = %err, "failed listing runs stuck pending");
                return;
            }
        };

        for run in timed_out {
            self.cancel(job, &run).await;
        }
    }

    async fn cancel_execution_timeouts(&self, job: &Job, now: DateTime<Utc>) {
        let cutoff = now - ChronoDuration::milliseconds(job.run_execution_timeout_ms);
        let timed_out = match self
            .run_repo
            .browse(RunFilter {
                job_name: Some(job.name.clone()),
                status: Some(RunStatus::Running),
                started_before: Some(cutoff),
                ..Default::default()
            })
            .await
        {
            Ok(runs) => runs,
            Err(err) => {
                error!(job_name = %job.name, error = %err, "failed listing long-running runs");
                return;
            }
        };

        for run in timed_out {
            self.cancel(job, &run).await;
        }
    }

    async fn cancel(&self, job: &Job, run: &Run) {
        let update = RunUpdate {
            status: Some(RunStatus::Cancelling),
            ..Default::default()
        };
        if let Err(err) = self.run_repo.edit(run.id, update).await {
            error!(job_name = %job.name, run_id = %run.id, error = %err, "failed marking run cancelling");
            return;
        }

        let payload = match serde_json::to_vec(&JobActionMessage {
            job_name: job.name.clone(),
            run_id: run.id,
            action: JobAction::Cancel,
        }) {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(job_name = %job.name, run_id = %run.id, error = %err, "failed encoding cancel action");
                return;
            }
        };

        if let Err(err) = self
            .bus
            .publish(&bus::job_exchange(&job.name), ROUTING_KEY_ACTION, payload)
            .await
        {
            warn!(job_name = %job.name, run_id = %run.id, error = %err, "failed publishing cancel action");
        }
    }
}

#[async_trait]
impl Worker for RunCustodian {
    async fn run(mut self: Box<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        let mut job = self.job_rx.borrow().clone();
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = self.job_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    job = self.job_rx.borrow_and_update().clone();
                }
                _ = interval.tick() => {
                    self.tick(&job).await;
                }
            }
        }

        Ok(())
    }
}
