//! End-to-end scenario tests against the in-memory doubles: deterministic,
//! no database or broker required. Grounded on the teacher's crate-root
//! `tests/` integration test convention.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use scheduler_core::bus::{job_exchange, ROUTING_KEY_STATUS};
use scheduler_core::job_custodian::JobCustodian;
use scheduler_core::manager::{Manager, ManagerConfig};
use scheduler_core::messages::JobStatusMessage;
use scheduler_core::repo::{JobRepo, JobUnlockFilter, RunFilter, RunRepo};
use scheduler_core::run_custodian::RunCustodian;
use scheduler_core::testing::{
    InMemoryJobRepo, InMemoryManagerRepo, InMemoryRunRepo, InProcessBus,
};
use scheduler_core::worker::Worker;
use scheduler_core::{Job, ManagerRepo, MessageBus, Run, RunStatus};

/// Polls `predicate` until it returns `true` or `timeout` elapses, avoiding a
/// fixed sleep in tests whose workers run on their own timers.
async fn wait_until<F, Fut>(timeout: Duration, mut predicate: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition did not become true within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn manager_claims_fires_and_releases_a_due_job() {
    let job_repo = Arc::new(InMemoryJobRepo::new());
    let run_repo = Arc::new(InMemoryRunRepo::new());
    let manager_repo = Arc::new(InMemoryManagerRepo::new());
    let bus = Arc::new(InProcessBus::new());

    let job = Job::new(
        "nightly-export",
        Utc::now() - chrono::Duration::milliseconds(10),
        0,
    );
    job_repo.seed(job.clone());

    let manager = Arc::new(Manager::new(
        ManagerConfig {
            hostname: "test-host".to_string(),
            max_jobs: 0,
            cache_refresh_interval: Duration::from_millis(10),
            heartbeat_interval: Duration::from_millis(20),
            cleanup_interval: Duration::from_millis(20),
        },
        job_repo.clone(),
        run_repo.clone(),
        manager_repo.clone(),
        bus.clone(),
    ));

    let shutdown = CancellationToken::new();
    let manager_id = manager.id;
    let join = tokio::spawn(manager.clone().run(shutdown.clone()));

    wait_until(Duration::from_secs(2), || async {
        job_repo.read(&job.name).await.unwrap().manager_id == Some(manager_id)
    })
    .await;

    wait_until(Duration::from_secs(2), || async {
        !run_repo
            .browse(RunFilter {
                job_name: Some(job.name.clone()),
                ..Default::default()
            })
            .await
            .unwrap()
            .is_empty()
    })
    .await;

    wait_until(Duration::from_secs(2), || async {
        bus.was_published_to(&job_exchange(&job.name))
    })
    .await;

    shutdown.cancel();
    join.await.unwrap().unwrap();

    // Graceful shutdown must release the job back to the sentinel state.
    let released = job_repo.read(&job.name).await.unwrap();
    assert_eq!(released.manager_id, None);

    let registered = manager_repo.read(manager_id).await.unwrap();
    assert_eq!(registered.hostname, "test-host");
}

#[tokio::test]
async fn dispatcher_status_message_marks_run_running() {
    let job_repo = Arc::new(InMemoryJobRepo::new());
    let run_repo = Arc::new(InMemoryRunRepo::new());
    let manager_repo = Arc::new(InMemoryManagerRepo::new());
    let bus = Arc::new(InProcessBus::new());

    let job = Job::new(
        "emails-digest",
        Utc::now() - chrono::Duration::milliseconds(10),
        0,
    );
    job_repo.seed(job.clone());

    let manager = Arc::new(Manager::new(
        ManagerConfig {
            hostname: "test-host".to_string(),
            max_jobs: 0,
            cache_refresh_interval: Duration::from_millis(10),
            heartbeat_interval: Duration::from_millis(50),
            cleanup_interval: Duration::from_millis(50),
        },
        job_repo.clone(),
        run_repo.clone(),
        manager_repo,
        bus.clone(),
    ));

    let shutdown = CancellationToken::new();
    let join = tokio::spawn(manager.clone().run(shutdown.clone()));

    wait_until(Duration::from_secs(2), || async {
        bus.has_subscription("emails-digest.status")
    })
    .await;

    let run_id = wait_until_run_exists(&run_repo, &job.name).await;

    let status_msg = JobStatusMessage {
        job_name: job.name.clone(),
        run_id,
        status: "running".to_string(),
    };
    bus.publish(
        &job_exchange(&job.name),
        ROUTING_KEY_STATUS,
        serde_json::to_vec(&status_msg).unwrap(),
    )
    .await
    .unwrap();

    wait_until(Duration::from_secs(2), || async {
        run_repo.read(run_id).await.unwrap().status == RunStatus::Running
    })
    .await;

    let run = run_repo.read(run_id).await.unwrap();
    assert!(run.start_time.is_some());

    shutdown.cancel();
    join.await.unwrap().unwrap();
}

async fn wait_until_run_exists(run_repo: &Arc<InMemoryRunRepo>, job_name: &str) -> Uuid {
    wait_until(Duration::from_secs(2), || async {
        !run_repo
            .browse(RunFilter {
                job_name: Some(job_name.to_string()),
                ..Default::default()
            })
            .await
            .unwrap()
            .is_empty()
    })
    .await;
    run_repo
        .browse(RunFilter {
            job_name: Some(job_name.to_string()),
            ..Default::default()
        })
        .await
        .unwrap()
        .remove(0)
        .id
}

#[tokio::test]
async fn run_custodian_restarts_a_heartbeat_stalled_run() {
    let run_repo = Arc::new(InMemoryRunRepo::new());
    let bus = Arc::new(InProcessBus::new());

    let mut job = Job::new("report-builder", Utc::now(), 60_000);
    job.heartbeat_timeout_ms = 50;

    let mut run = Run::fired(&job.name, Utc::now());
    run.status = RunStatus::Running;
    run.heartbeat = Utc::now() - chrono::Duration::milliseconds(500);
    let run_id = run.id;
    run_repo.add(run).await.unwrap();

    let (_tx, rx) = tokio::sync::watch::channel(job);
    let custodian = Box::new(RunCustodian::new(
        run_repo.clone(),
        bus,
        rx,
        Duration::from_millis(15),
    ));
    let shutdown = CancellationToken::new();
    let shutdown_clone = shutdown.clone();
    let join = tokio::spawn(custodian.run(shutdown_clone));

    wait_until(Duration::from_secs(2), || async {
        run_repo.read(run_id).await.unwrap().status == RunStatus::Pending
    })
    .await;

    shutdown.cancel();
    join.await.unwrap().unwrap();
}

#[tokio::test]
async fn run_custodian_cancels_a_run_stuck_pending() {
    let run_repo = Arc::new(InMemoryRunRepo::new());
    let bus = Arc::new(InProcessBus::new());

    let mut job = Job::new("slow-starter", Utc::now(), 60_000);
    job.run_start_timeout_ms = 50;

    let mut run = Run::fired(&job.name, Utc::now() - chrono::Duration::milliseconds(500));
    run.created_time = Utc::now() - chrono::Duration::milliseconds(500);
    let run_id = run.id;
    run_repo.add(run).await.unwrap();

    let (_tx, rx) = tokio::sync::watch::channel(job.clone());
    let custodian = Box::new(RunCustodian::new(
        run_repo.clone(),
        bus.clone(),
        rx,
        Duration::from_millis(15),
    ));
    let shutdown = CancellationToken::new();
    let shutdown_clone = shutdown.clone();
    let join = tokio::spawn(custodian.run(shutdown_clone));

    wait_until(Duration::from_secs(2), || async {
        run_repo.read(run_id).await.unwrap().status == RunStatus::Cancelling
    })
    .await;

    assert!(bus.was_published_to(&job_exchange(&job.name)));

    shutdown.cancel();
    join.await.unwrap().unwrap();
}

#[tokio::test]
async fn job_custodian_reclaims_jobs_from_an_unresponsive_manager() {
    let job_repo = Arc::new(InMemoryJobRepo::new());

    let dead_manager = Uuid::new_v4();
    let mut job = Job::new("abandoned-job", Utc::now(), 60_000);
    job.manager_id = Some(dead_manager);
    job.heartbeat = Utc::now() - chrono::Duration::milliseconds(500);
    job_repo.seed(job.clone());

    let custodian = Box::new(JobCustodian::new(
        job_repo.clone(),
        Duration::from_millis(15),
        Duration::from_millis(50),
    ));
    let shutdown = CancellationToken::new();
    let shutdown_clone = shutdown.clone();
    let join = tokio::spawn(custodian.run(shutdown_clone));

    wait_until(Duration::from_secs(2), || async {
        job_repo.read(&job.name).await.unwrap().manager_id.is_none()
    })
    .await;

    shutdown.cancel();
    join.await.unwrap().unwrap();
}

#[tokio::test]
async fn job_custodian_leaves_healthy_managers_alone() {
    let job_repo = Arc::new(InMemoryJobRepo::new());

    let live_manager = Uuid::new_v4();
    let mut job = Job::new("healthy-job", Utc::now(), 60_000);
    job.manager_id = Some(live_manager);
    job.heartbeat = Utc::now();
    job_repo.seed(job.clone());

    // One reclaim pass with a generous cutoff should not touch a fresh heartbeat.
    let filter = JobUnlockFilter {
        is_managed: Some(true),
        heartbeat_before: Some(Utc::now() - chrono::Duration::seconds(60)),
        ..Default::default()
    };
    let count = job_repo.unlock(filter).await.unwrap();
    assert_eq!(count, 0);
    assert_eq!(
        job_repo.read(&job.name).await.unwrap().manager_id,
        Some(live_manager)
    );
}
