//! The manager: claims jobs from the catalog, owns a per-job
//! [`Dispatcher`]/[`RunCustodian`] pair for each job it holds, heartbeats its
//! leases, and releases everything on shutdown.
//!
//! Grounded on the teacher's `JobWorker` in `kernel/jobs/worker.rs` for the
//! claim-loop/graceful-shutdown shape, generalized from "one worker polling
//! one job queue" to "one manager owning many per-job worker pairs" as the
//! source component design requires. The working set is a plain
//! `std::sync::Mutex<HashMap<..>>`, following the teacher's
//! `running_jobs: Arc<RwLock<HashMap<Uuid, CancellationToken>>>` — diffing
//! happens entirely under the lock (no I/O), and the resulting start/stop
//! actions run after the lock is released.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::bus::MessageBus;
use crate::dispatcher::Dispatcher;
use crate::model::{Job, ManagerRecord};
use crate::repo::{JobRepo, JobUnlockFilter, ManagerRepo, RunRepo};
use crate::run_custodian::RunCustodian;
use crate::worker::Worker;

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub hostname: String,
    /// `0` means unlimited.
    pub max_jobs: u32,
    pub cache_refresh_interval: Duration,
    pub heartbeat_interval: Duration,
    pub cleanup_interval: Duration,
}

struct JobWorkerHandle {
    job_tx: watch::Sender<Job>,
    dispatcher_token: CancellationToken,
    dispatcher_handle: JoinHandle<anyhow::Result<()>>,
    custodian_token: CancellationToken,
    custodian_handle: JoinHandle<anyhow::Result<()>>,
}

impl JobWorkerHandle {
    async fn stop(self, job_name: &str) {
        self.dispatcher_token.cancel();
        self.custodian_token.cancel();
        if let Err(err) = self.dispatcher_handle.await {
            warn!(job_name, error = %err, "dispatcher task panicked during shutdown");
        }
        if let Err(err) = self.custodian_handle.await {
            warn!(job_name, error = %err, "run custodian task panicked during shutdown");
        }
    }
}

pub struct Manager {
    pub id: Uuid,
    config: ManagerConfig,
    job_repo: Arc<dyn JobRepo>,
    run_repo: Arc<dyn RunRepo>,
    manager_repo: Arc<dyn ManagerRepo>,
    bus: Arc<dyn MessageBus>,
    working_set: Mutex<HashMap<String, JobWorkerHandle>>,
}

impl Manager {
    pub fn new(
        config: ManagerConfig,
        job_repo: Arc<dyn JobRepo>,
        run_repo: Arc<dyn RunRepo>,
        manager_repo: Arc<dyn ManagerRepo>,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            config,
            job_repo,
            run_repo,
            manager_repo,
            bus,
            working_set: Mutex::new(HashMap::new()),
        }
    }

    /// Drives claim/refresh, heartbeat, and graceful release until
    /// `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        self.manager_repo
            .add(ManagerRecord {
                id: self.id,
                hostname: self.config.hostname.clone(),
            })
            .await?;
        info!(manager_id = %self.id, hostname = %self.config.hostname, "manager registered");

        let mut refresh_ticker = tokio::time::interval(self.config.cache_refresh_interval);
        refresh_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut heartbeat_ticker = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = refresh_ticker.tick() => {
                    if let Err(err) = self.refresh().await {
                        error!(manager_id = %self.id, error = %err, "refresh failed");
                    }
                }
                _ = heartbeat_ticker.tick() => {
                    if let Err(err) = self.job_repo.heartbeat(self.id, Utc::now()).await {
                        error!(manager_id = %self.id, error = %err, "heartbeat write failed");
                    }
                }
            }
        }

        self.release_all().await;
        Ok(())
    }

    /// One claim/refresh cycle: lock up to `max_jobs` rows, start workers
    /// for newly-claimed jobs, push updated snapshots to jobs we already
    /// hold, and stop+unlock workers for jobs we no longer hold.
    async fn refresh(&self) -> anyhow::Result<()> {
        let claimed = self.job_repo.lock(self.id, self.config.max_jobs).await?;
        let mut claimed_by_name: HashMap<String, Job> =
            claimed.into_iter().map(|j| (j.name.clone(), j)).collect();

        let mut stale: Vec<(String, JobWorkerHandle)> = Vec::new();
        let fresh: Vec<Job>;
        {
            let mut working_set = self.working_set.lock().unwrap();
            let stale_names: Vec<String> = working_set
                .keys()
                .filter(|name| !claimed_by_name.contains_key(*name))
                .cloned()
                .collect();
            for name in stale_names {
                if let Some(handle) = working_set.remove(&name) {
                    stale.push((name, handle));
                }
            }
            for (name, handle) in working_set.iter() {
                if let Some(job) = claimed_by_name.remove(name) {
                    let _ = handle.job_tx.send(job);
                }
            }
            fresh = claimed_by_name.into_values().collect();
        }

        let stale_names: Vec<String> = stale.iter().map(|(name, _)| name.clone()).collect();
        for (name, handle) in stale {
            handle.stop(&name).await;
        }
        if !stale_names.is_empty() {
            let count = self
                .job_repo
                .unlock(JobUnlockFilter {
                    manager_id: Some(self.id),
                    job_names: Some(stale_names),
                    ..Default::default()
                })
                .await?;
            info!(manager_id = %self.id, count, "released jobs dropped from the working set");
        }

        for job in fresh {
            let name = job.name.clone();
            let handle = self.spawn_job_worker(job);
            self.working_set.lock().unwrap().insert(name, handle);
        }

        Ok(())
    }

    fn spawn_job_worker(&self, job: Job) -> JobWorkerHandle {
        let job_name = job.name.clone();
        let (job_tx, job_rx) = watch::channel(job);

        let dispatcher = Dispatcher::new(
            self.job_repo.clone(),
            self.run_repo.clone(),
            self.bus.clone(),
            job_rx.clone(),
        );
        let dispatcher_token = CancellationToken::new();
        let dispatcher_child = dispatcher_token.clone();
        let dispatcher_handle =
            tokio::spawn(async move { Box::new(dispatcher).run(dispatcher_child).await });

        let custodian = RunCustodian::new(
            self.run_repo.clone(),
            self.bus.clone(),
            job_rx,
            self.config.cleanup_interval,
        );
        let custodian_token = CancellationToken::new();
        let custodian_child = custodian_token.clone();
        let custodian_handle =
            tokio::spawn(async move { Box::new(custodian).run(custodian_child).await });

        info!(manager_id = %self.id, job_name = %job_name, "claimed job");

        JobWorkerHandle {
            job_tx,
            dispatcher_token,
            dispatcher_handle,
            custodian_token,
            custodian_handle,
        }
    }

    async fn release_all(&self) {
        let handles: Vec<(String, JobWorkerHandle)> =
            self.working_set.lock().unwrap().drain().collect();
        for (name, handle) in handles {
            handle.stop(&name).await;
        }

        match self
            .job_repo
            .unlock(JobUnlockFilter {
                manager_id: Some(self.id),
                ..Default::default()
            })
            .await
        {
            Ok(count) => info!(manager_id = %self.id, count, "released owned jobs on shutdown"),
            Err(err) => {
                error!(manager_id = %self.id, error = %err, "failed releasing jobs on shutdown")
            }
        }
    }
}
