//! Per-job dispatcher: fires runs on `nextRunAt` and keeps run status/
//! heartbeat in sync with what workers report over the bus.
//!
//! Grounded on the teacher's `JobWorker::run` in `kernel/jobs/worker.rs` for
//! the `tokio::select!` shutdown shape, and `kernel/jobs/job_store.rs`'s
//! `mark_succeeded`/`heartbeat` for the "one repo write per event" idiom.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::bus::{self, HandlerOutcome, MessageBus, MessageHandler};
use crate::error::SchedulerError;
use crate::messages::{JobAction, JobActionMessage, JobHeartbeatMessage, JobStatusMessage};
use crate::model::{Job, Run, RunStatus};
use crate::repo::{JobRepo, JobUpdate, RunRepo, RunUpdate};
use crate::worker::Worker;

/// Computes the next fire time per the monotonic-catch-up rule: if the job
/// is still due (no `interval_ms`, or the deadline hasn't elapsed), the
/// deadline is unchanged; otherwise it jumps forward by whole intervals
/// until it's back in the future.
pub fn next_run_after(
    next_run_at: DateTime<Utc>,
    interval_ms: i64,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    if interval_ms <= 0 {
        return next_run_at;
    }
    let elapsed_ms = (now - next_run_at).num_milliseconds();
    if elapsed_ms <= 0 {
        return next_run_at;
    }
    let intervals = elapsed_ms / interval_ms + 1;
    next_run_at + ChronoDuration::milliseconds(intervals * interval_ms)
}

pub struct Dispatcher {
    job_repo: Arc<dyn JobRepo>,
    run_repo: Arc<dyn RunRepo>,
    bus: Arc<dyn MessageBus>,
    job_rx: watch::Receiver<Job>,
}

impl Dispatcher {
    pub fn new(
        job_repo: Arc<dyn JobRepo>,
        run_repo: Arc<dyn RunRepo>,
        bus: Arc<dyn MessageBus>,
        job_rx: watch::Receiver<Job>,
    ) -> Self {
        Self {
            job_repo,
            run_repo,
            bus,
            job_rx,
        }
    }

    async fn declare_topology(&self) -> anyhow::Result<()> {
        let job_name = self.job_rx.borrow().name.clone();
        let exchange = bus::job_exchange(&job_name);
        self.bus
            .register(&exchange, bus::job_bindings(&job_name))
            .await
            .context("registering job topology")?;
        self.bus
            .subscribe(
                &bus::status_queue(&job_name),
                Arc::new(StatusHandler {
                    run_repo: self.run_repo.clone(),
                }),
            )
            .await
            .context("subscribing to status queue")?;
        self.bus
            .subscribe(
                &bus::heartbeat_queue(&job_name),
                Arc::new(HeartbeatHandler {
                    run_repo: self.run_repo.clone(),
                }),
            )
            .await
            .context("subscribing to heartbeat queue")?;
        Ok(())
    }

    async fn teardown_topology(&self, job_name: &str) {
        for queue in [bus::status_queue(job_name), bus::heartbeat_queue(job_name)] {
            if let Err(err) = self.bus.unsubscribe(&queue).await {
                warn!(%queue, error = %err, "failed to unsubscribe on dispatcher shutdown");
            }
        }
    }

    /// Fire one run: create it, publish the run action, and persist the
    /// advanced `nextRunAt`. Returns the new deadline on success.
    async fn fire(&self, job: &Job) -> anyhow::Result<DateTime<Utc>> {
        let fired_at = job.next_run_at;
        let run = Run::fired(&job.name, fired_at);
        self.run_repo
            .add(run.clone())
            .await
            .context("persisting fired run")?;

        let payload = serde_json::to_vec(&JobActionMessage {
            job_name: job.name.clone(),
            run_id: run.id,
            action: JobAction::Run,
        })
        .context("encoding run action")?;
        self.bus
            .publish(
                &bus::job_exchange(&job.name),
                bus::ROUTING_KEY_ACTION,
                payload,
            )
            .await
            .context("publishing run action")?;

        let new_next_run_at = next_run_after(job.next_run_at, job.interval_ms, Utc::now());
        self.job_repo
            .edit(
                &job.name,
                JobUpdate {
                    next_run_at: Some(new_next_run_at),
                    ..Default::default()
                },
            )
            .await
            .context("advancing nextRunAt")?;

        debug!(job_name = %job.name, run_id = %run.id, next_run_at = %new_next_run_at, "fired run");
        Ok(new_next_run_at)
    }
}

#[async_trait]
impl Worker for Dispatcher {
    async fn run(mut self: Box<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        self.declare_topology().await?;
        let mut job = self.job_rx.borrow().clone();
        let job_name = job.name.clone();

        loop {
            let now = Utc::now();
            let wait = (job.next_run_at - now)
                .to_std()
                .unwrap_or(std::time::Duration::ZERO);

            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = self.job_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    job = self.job_rx.borrow_and_update().clone();
                    continue;
                }
                _ = tokio::time::sleep(wait) => {
                    match self.fire(&job).await {
                        Ok(new_next_run_at) => job.next_run_at = new_next_run_at,
                        Err(err) => {
                            error!(job_name = %job_name, error = %err, "dispatcher fire failed, stopping; next refresh will restart it");
                            break;
                        }
                    }
                }
            }
        }

        self.teardown_topology(&job_name).await;
        Ok(())
    }
}

struct StatusHandler {
    run_repo: Arc<dyn RunRepo>,
}

#[async_trait]
impl MessageHandler for StatusHandler {
    async fn handle(&self, payload: Vec<u8>) -> HandlerOutcome {
        let msg: JobStatusMessage = match serde_json::from_slice(&payload) {
            Ok(msg) => msg,
            Err(err) => return HandlerOutcome::nack(err.into(), false),
        };
        let Some(status) = RunStatus::from_wire(&msg.status) else {
            return HandlerOutcome::nack(
                anyhow::anyhow!("unrecognized run status: {}", msg.status),
                false,
            );
        };

        let run = match self.run_repo.read(msg.run_id).await {
            Ok(run) => run,
            Err(err) => return outcome_from_repo_error(err),
        };

        let now = Utc::now();
        let update = RunUpdate {
            status: Some(status),
            start_time: (status == RunStatus::Running && run.start_time.is_none())
                .then_some(Some(now)),
            end_time: (status.is_terminal() && run.end_time.is_none()).then_some(Some(now)),
            ..Default::default()
        };

        match self.run_repo.edit(msg.run_id, update).await {
            Ok(()) => HandlerOutcome::ack(),
            Err(err) => outcome_from_repo_error(err),
        }
    }
}

struct HeartbeatHandler {
    run_repo: Arc<dyn RunRepo>,
}

#[async_trait]
impl MessageHandler for HeartbeatHandler {
    async fn handle(&self, payload: Vec<u8>) -> HandlerOutcome {
        let msg: JobHeartbeatMessage = match serde_json::from_slice(&payload) {
            Ok(msg) => msg,
            Err(err) => return HandlerOutcome::nack(err.into(), false),
        };

        let update = RunUpdate {
            heartbeat: Some(Utc::now()),
            ..Default::default()
        };
        match self.run_repo.edit(msg.run_id, update).await {
            Ok(()) => HandlerOutcome::ack(),
            Err(err) => outcome_from_repo_error(err),
        }
    }
}

fn outcome_from_repo_error(err: SchedulerError) -> HandlerOutcome {
    let requeue = err.should_retry();
    HandlerOutcome::nack(err.into(), requeue)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_run_stays_put_when_still_due() {
        let t0 = Utc::now();
        let next = next_run_after(t0, 60_000, t0 - ChronoDuration::seconds(1));
        assert_eq!(next, t0);
    }

    #[test]
    fn next_run_catches_up_by_whole_intervals() {
        let t0 = Utc::now();
        // Three and a half intervals have elapsed; nextRunAt should jump to
        // the first multiple strictly after `now`.
        let now = t0 + ChronoDuration::milliseconds(60_000 * 3 + 30_000);
        let next = next_run_after(t0, 60_000, now);
        assert!(next > now);
        assert_eq!(next, t0 + ChronoDuration::milliseconds(60_000 * 4));
    }

    #[test]
    fn zero_interval_never_advances() {
        let t0 = Utc::now();
        let next = next_run_after(t0, 0, t0 + ChronoDuration::hours(1));
        assert_eq!(next, t0);
    }
}
