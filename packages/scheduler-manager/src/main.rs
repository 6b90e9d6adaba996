//! Manager process binary: claims jobs, dispatches runs, and enforces
//! per-job timeout policies until asked to shut down.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use scheduler_core::manager::{Manager, ManagerConfig};
use scheduler_core::{MessageBus, SchedulerConfig};
use scheduler_nats::NatsMessageBus;
use scheduler_postgres::{PostgresJobRepo, PostgresManagerRepo, PostgresRunRepo};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "manager exited with a fatal error");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let config = SchedulerConfig::from_env().context("loading configuration")?;

    let pool = connect_db_with_retry(&config.db_connection_string).await?;
    scheduler_postgres::run_migrations(&pool)
        .await
        .context("running database migrations")?;

    let bus = Arc::new(NatsMessageBus::new(
        config.messagebus_connection_string.clone(),
    ));
    connect_bus_with_retry(bus.as_ref()).await?;

    let job_repo = Arc::new(PostgresJobRepo::new(pool.clone()));
    let run_repo = Arc::new(PostgresRunRepo::new(pool.clone()));
    let manager_repo = Arc::new(PostgresManagerRepo::new(pool));

    let manager = Arc::new(Manager::new(
        ManagerConfig {
            hostname: config.hostname.clone(),
            max_jobs: config.max_jobs,
            cache_refresh_interval: config.cache_refresh_interval,
            heartbeat_interval: config.heartbeat_interval,
            cleanup_interval: config.cleanup_interval,
        },
        job_repo,
        run_repo,
        manager_repo,
        bus.clone(),
    ));

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        signal_token.cancel();
    });

    manager.run(shutdown).await.context("manager run loop")?;
    bus.close()
        .await
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

/// Retries the initial DB connection with exponential backoff, capped at
/// 30s, per the startup retry budget.
async fn connect_db_with_retry(connection_string: &str) -> Result<sqlx::PgPool> {
    let mut attempt: u32 = 0;
    loop {
        match PgPoolOptions::new()
            .max_connections(10)
            .connect(connection_string)
            .await
        {
            Ok(pool) => return Ok(pool),
            Err(err) if attempt < 5 => {
                let delay = Duration::from_secs(2u64.pow(attempt).min(30));
                error!(error = %err, attempt, "database connection failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                return Err(err).context("connecting to database after retry budget exhausted")
            }
        }
    }
}

async fn connect_bus_with_retry(bus: &NatsMessageBus) -> Result<()> {
    let mut attempt: u32 = 0;
    loop {
        match bus.connect().await {
            Ok(()) => return Ok(()),
            Err(err) if attempt < 5 => {
                let delay = Duration::from_secs(2u64.pow(attempt).min(30));
                error!(error = %err, attempt, "message bus connection failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                return Err(anyhow::anyhow!(err.to_string()))
                    .context("connecting to message bus after retry budget exhausted")
            }
        }
    }
}
