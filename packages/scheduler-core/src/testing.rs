//! Deterministic, DB-free and broker-free test doubles for the repository
//! and message bus ports. Grounded on the teacher's `TestNats` (in
//! `kernel/nats.rs`) and `TestJobManager` (in `kernel/jobs/manager.rs`):
//! `RwLock`-guarded in-memory state plus small inspection helpers, instead
//! of a mocking framework.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::bus::{HandlerOutcome, MessageBus, MessageHandler};
use crate::error::SchedulerError;
use crate::model::{Job, ManagerRecord, Run};
use crate::repo::{
    JobRepo, JobUnlockFilter, JobUpdate, ManagerRepo, RepoResult, RunFilter, RunRepo, RunUpdate,
};

#[derive(Default)]
pub struct InMemoryJobRepo {
    jobs: RwLock<HashMap<String, Job>>,
}

impl InMemoryJobRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, job: Job) {
        self.jobs.write().unwrap().insert(job.name.clone(), job);
    }
}

#[async_trait]
impl JobRepo for InMemoryJobRepo {
    async fn browse(&self) -> RepoResult<Vec<Job>> {
        Ok(self.jobs.read().unwrap().values().cloned().collect())
    }

    async fn read(&self, name: &str) -> RepoResult<Job> {
        self.jobs
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| SchedulerError::NotFound(name.to_string()))
    }

    async fn add(&self, job: Job) -> RepoResult<()> {
        self.jobs.write().unwrap().insert(job.name.clone(), job);
        Ok(())
    }

    async fn edit(&self, name: &str, update: JobUpdate) -> RepoResult<()> {
        let mut jobs = self.jobs.write().unwrap();
        let job = jobs
            .get_mut(name)
            .ok_or_else(|| SchedulerError::NotFound(name.to_string()))?;
        apply_job_update(job, update);
        Ok(())
    }

    async fn delete(&self, name: &str) -> RepoResult<()> {
        self.jobs
            .write()
            .unwrap()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| SchedulerError::NotFound(name.to_string()))
    }

    async fn lock(&self, manager_id: Uuid, take: u32) -> RepoResult<Vec<Job>> {
        let mut jobs = self.jobs.write().unwrap();
        let mut owned: Vec<&mut Job> = jobs
            .values_mut()
            .filter(|j| j.manager_id == Some(manager_id) || j.manager_id.is_none())
            .collect();
        // Rows already owned by this manager come first, matching the
        // `ORDER BY manager_id DESC` claim-query ordering.
        owned.sort_by_key(|j| j.manager_id != Some(manager_id));

        let limit = if take == 0 {
            owned.len()
        } else {
            take as usize
        };
        let mut claimed = Vec::new();
        for job in owned.into_iter().take(limit) {
            job.manager_id = Some(manager_id);
            claimed.push(job.clone());
        }
        Ok(claimed)
    }

    async fn unlock(&self, filter: JobUnlockFilter) -> RepoResult<u64> {
        let mut jobs = self.jobs.write().unwrap();
        let mut count = 0u64;
        for job in jobs.values_mut() {
            if !job_matches_unlock_filter(job, &filter) {
                continue;
            }
            job.manager_id = None;
            count += 1;
        }
        Ok(count)
    }

    async fn heartbeat(&self, manager_id: Uuid, now: DateTime<Utc>) -> RepoResult<u64> {
        let mut jobs = self.jobs.write().unwrap();
        let mut count = 0u64;
        for job in jobs.values_mut() {
            if job.manager_id == Some(manager_id) {
                job.heartbeat = now;
                count += 1;
            }
        }
        Ok(count)
    }
}

fn job_matches_unlock_filter(job: &Job, filter: &JobUnlockFilter) -> bool {
    if let Some(manager_id) = filter.manager_id {
        if job.manager_id != Some(manager_id) {
            return false;
        }
    }
    if let Some(names) = &filter.job_names {
        if !names.contains(&job.name) {
            return false;
        }
    }
    if let Some(is_managed) = filter.is_managed {
        if job.manager_id.is_some() != is_managed {
            return false;
        }
    }
    if let Some(cutoff) = filter.heartbeat_before {
        if job.heartbeat >= cutoff {
            return false;
        }
    }
    true
}

fn apply_job_update(job: &mut Job, update: JobUpdate) {
    if let Some(v) = update.enabled {
        job.enabled = v;
    }
    if let Some(v) = update.next_run_at {
        job.next_run_at = v;
    }
    if let Some(v) = update.interval_ms {
        job.interval_ms = v;
    }
    if let Some(v) = update.run_execution_timeout_ms {
        job.run_execution_timeout_ms = v;
    }
    if let Some(v) = update.run_start_timeout_ms {
        job.run_start_timeout_ms = v;
    }
    if let Some(v) = update.heartbeat_timeout_ms {
        job.heartbeat_timeout_ms = v;
    }
    if let Some(v) = update.max_queue_count {
        job.max_queue_count = v;
    }
    if let Some(v) = update.allow_concurrent_runs {
        job.allow_concurrent_runs = v;
    }
    if let Some(v) = update.manager_id {
        job.manager_id = v;
    }
    if let Some(v) = update.heartbeat {
        job.heartbeat = v;
    }
}

#[derive(Default)]
pub struct InMemoryRunRepo {
    runs: RwLock<HashMap<Uuid, Run>>,
}

impl InMemoryRunRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunRepo for InMemoryRunRepo {
    async fn browse(&self, filter: RunFilter) -> RepoResult<Vec<Run>> {
        Ok(self
            .runs
            .read()
            .unwrap()
            .values()
            .filter(|r| run_matches_filter(r, &filter))
            .cloned()
            .collect())
    }

    async fn read(&self, id: Uuid) -> RepoResult<Run> {
        self.runs
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))
    }

    async fn add(&self, run: Run) -> RepoResult<()> {
        self.runs.write().unwrap().insert(run.id, run);
        Ok(())
    }

    async fn edit(&self, id: Uuid, update: RunUpdate) -> RepoResult<()> {
        let mut runs = self.runs.write().unwrap();
        let run = runs
            .get_mut(&id)
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
        if let Some(v) = update.status {
            run.status = v;
        }
        if let Some(v) = update.start_time {
            run.start_time = v;
        }
        if let Some(v) = update.end_time {
            run.end_time = v;
        }
        if let Some(v) = update.heartbeat {
            run.heartbeat = v;
        }
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> RepoResult<()> {
        self.runs
            .write()
            .unwrap()
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))
    }
}

fn run_matches_filter(run: &Run, filter: &RunFilter) -> bool {
    if let Some(job_name) = &filter.job_name {
        if &run.job_name != job_name {
            return false;
        }
    }
    if let Some(status) = filter.status {
        if run.status != status {
            return false;
        }
    }
    if let Some(cutoff) = filter.created_before {
        if run.created_time >= cutoff {
            return false;
        }
    }
    if let Some(cutoff) = filter.started_before {
        match run.start_time {
            Some(started) if started < cutoff => {}
            _ => return false,
        }
    }
    if let Some(cutoff) = filter.heartbeat_before {
        if run.heartbeat >= cutoff {
            return false;
        }
    }
    true
}

#[derive(Default)]
pub struct InMemoryManagerRepo {
    managers: RwLock<HashMap<Uuid, ManagerRecord>>,
}

impl InMemoryManagerRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ManagerRepo for InMemoryManagerRepo {
    async fn browse(&self) -> RepoResult<Vec<ManagerRecord>> {
        Ok(self.managers.read().unwrap().values().cloned().collect())
    }

    async fn read(&self, id: Uuid) -> RepoResult<ManagerRecord> {
        self.managers
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))
    }

    async fn add(&self, manager: ManagerRecord) -> RepoResult<()> {
        self.managers.write().unwrap().insert(manager.id, manager);
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> RepoResult<()> {
        self.managers
            .write()
            .unwrap()
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))
    }
}

/// An in-process publish/subscribe double: `publish` calls registered
/// handlers inline. Keeps every published message for test inspection, the
/// way the teacher's `TestNats` does.
#[derive(Default)]
pub struct InProcessBus {
    subscriptions: RwLock<HashMap<String, Arc<dyn MessageHandler>>>,
    published: RwLock<Vec<PublishedMessage>>,
}

#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
}

impl InProcessBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published_messages(&self) -> Vec<PublishedMessage> {
        self.published.read().unwrap().clone()
    }

    pub fn was_published_to(&self, exchange: &str) -> bool {
        self.published
            .read()
            .unwrap()
            .iter()
            .any(|m| m.exchange == exchange)
    }

    pub fn has_subscription(&self, queue: &str) -> bool {
        self.subscriptions.read().unwrap().contains_key(queue)
    }
}

#[async_trait]
impl MessageBus for InProcessBus {
    async fn connect(&self) -> Result<(), SchedulerError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), SchedulerError> {
        Ok(())
    }

    async fn register(
        &self,
        _exchange: &str,
        _bindings: HashMap<String, Vec<String>>,
    ) -> Result<(), SchedulerError> {
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
    ) -> Result<(), SchedulerError> {
        self.published.write().unwrap().push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload: payload.clone(),
        });

        // Route to every queue whose name matches the job-scoped convention
        // for this routing key: "<job>.<routing_key>".
        let suffix = format!(".{routing_key}");
        let handlers: Vec<Arc<dyn MessageHandler>> = self
            .subscriptions
            .read()
            .unwrap()
            .iter()
            .filter(|(queue, _)| queue.ends_with(&suffix))
            .map(|(_, handler)| handler.clone())
            .collect();

        for handler in handlers {
            // A synchronous double has nowhere to redeliver a nack to;
            // failures are surfaced via the returned outcome for assertions.
            let _ = handler.handle(payload.clone()).await;
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), SchedulerError> {
        self.subscriptions
            .write()
            .unwrap()
            .insert(queue.to_string(), handler);
        Ok(())
    }

    async fn unsubscribe(&self, queue: &str) -> Result<(), SchedulerError> {
        self.subscriptions.write().unwrap().remove(queue);
        Ok(())
    }
}

/// Drives one [`HandlerOutcome`] to completion for tests that want to assert
/// on ack/nack behavior directly, without going through a bus.
pub async fn invoke_handler(handler: &dyn MessageHandler, payload: Vec<u8>) -> HandlerOutcome {
    handler.handle(payload).await
}
