//! PostgreSQL implementation of the `JobRepo`/`RunRepo`/`ManagerRepo` ports,
//! grounded on the teacher's `kernel/jobs/job.rs` (`claim_jobs`'s
//! `FOR UPDATE SKIP LOCKED` CTE + conditional `UPDATE`) and
//! `kernel/jobs/job_store.rs` (plain `sqlx::query`/`query_as` calls against
//! a shared `PgPool`, no query builder).

mod job_repo;
mod manager_repo;
mod run_repo;

pub use job_repo::PostgresJobRepo;
pub use manager_repo::PostgresManagerRepo;
pub use run_repo::PostgresRunRepo;

/// Embeds and runs the crate's migrations against `pool`, the way the
/// teacher's `server::main` calls `sqlx::migrate!("./migrations")`.
pub async fn run_migrations(pool: &sqlx::PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

fn transient(err: sqlx::Error) -> scheduler_core::SchedulerError {
    scheduler_core::SchedulerError::Transient(err.into())
}
