//! Job custodian process binary: a cluster-wide reaper that reclaims jobs
//! whose owning manager has stopped heartbeating. Safe to run as multiple
//! concurrent instances.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use scheduler_core::job_custodian::JobCustodian;
use scheduler_core::worker::Worker;
use scheduler_core::SchedulerConfig;
use scheduler_postgres::PostgresJobRepo;
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
            error!(error = %err, "job custodian exited with a fatal error");
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

    let job_repo = Arc::new(PostgresJobRepo::new(pool));
    let custodian = Box::new(JobCustodian::new(
        job_repo,
        config.cleanup_interval,
        config.heartbeat_timeout,
    ));

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        signal_token.cancel();
    });

    custodian
        .run(shutdown)
        .await
        .context("job custodian run loop")
}

async fn connect_db_with_retry(connection_string: &str) -> Result<sqlx::PgPool> {
    let mut attempt: u32 = 0;
    loop {
        match PgPoolOptions::new()
            .max_connections(5)
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
