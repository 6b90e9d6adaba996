use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use scheduler_core::repo::{JobRepo, JobUnlockFilter, JobUpdate, RepoResult};
use scheduler_core::{Job, SchedulerError};

use crate::transient;

#[derive(FromRow)]
struct JobRow {
    name: String,
    enabled: bool,
    next_run_at: DateTime<Utc>,
    interval_ms: i64,
    run_execution_timeout_ms: i64,
    run_start_timeout_ms: i64,
    heartbeat_timeout_ms: i64,
    max_queue_count: i64,
    allow_concurrent_runs: bool,
    manager_id: Option<Uuid>,
    heartbeat: DateTime<Utc>,
}

impl From<JobRow> for Job {
    fn from(row: JobRow) -> Self {
        Job {
            name: row.name,
            enabled: row.enabled,
            next_run_at: row.next_run_at,
            interval_ms: row.interval_ms,
            run_execution_timeout_ms: row.run_execution_timeout_ms,
            run_start_timeout_ms: row.run_start_timeout_ms,
            heartbeat_timeout_ms: row.heartbeat_timeout_ms,
            max_queue_count: row.max_queue_count,
            allow_concurrent_runs: row.allow_concurrent_runs,
            manager_id: row.manager_id,
            heartbeat: row.heartbeat,
        }
    }
}

const JOB_COLUMNS: &str = "name, enabled, next_run_at, interval_ms, run_execution_timeout_ms, \
     run_start_timeout_ms, heartbeat_timeout_ms, max_queue_count, allow_concurrent_runs, \
     manager_id, heartbeat";

pub struct PostgresJobRepo {
    pool: PgPool,
}

impl PostgresJobRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobRepo for PostgresJobRepo {
    async fn browse(&self) -> RepoResult<Vec<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY name");
        let rows: Vec<JobRow> = sqlx::query_as(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(transient)?;
        Ok(rows.into_iter().map(Job::from).collect())
    }

    async fn read(&self, name: &str) -> RepoResult<Job> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE name = $1");
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(transient)?;
        row.map(Job::from)
            .ok_or_else(|| SchedulerError::NotFound(name.to_string()))
    }

    async fn add(&self, job: Job) -> RepoResult<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                name, enabled, next_run_at, interval_ms, run_execution_timeout_ms,
                run_start_timeout_ms, heartbeat_timeout_ms, max_queue_count,
                allow_concurrent_runs, manager_id, heartbeat
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(&job.name)
        .bind(job.enabled)
        .bind(job.next_run_at)
        .bind(job.interval_ms)
        .bind(job.run_execution_timeout_ms)
        .bind(job.run_start_timeout_ms)
        .bind(job.heartbeat_timeout_ms)
        .bind(job.max_queue_count)
        .bind(job.allow_concurrent_runs)
        .bind(job.manager_id)
        .bind(job.heartbeat)
        .execute(&self.pool)
        .await
        .map_err(transient)?;
        Ok(())
    }

    async fn edit(&self, name: &str, update: JobUpdate) -> RepoResult<()> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("UPDATE jobs SET updated_at = NOW()");

        if let Some(v) = update.enabled {
            builder.push(", enabled = ").push_bind(v);
        }
        if let Some(v) = update.next_run_at {
            builder.push(", next_run_at = ").push_bind(v);
        }
        if let Some(v) = update.interval_ms {
            builder.push(", interval_ms = ").push_bind(v);
        }
        if let Some(v) = update.run_execution_timeout_ms {
            builder.push(", run_execution_timeout_ms = ").push_bind(v);
        }
        if let Some(v) = update.run_start_timeout_ms {
            builder.push(", run_start_timeout_ms = ").push_bind(v);
        }
        if let Some(v) = update.heartbeat_timeout_ms {
            builder.push(", heartbeat_timeout_ms = ").push_bind(v);
        }
        if let Some(v) = update.max_queue_count {
            builder.push(", max_queue_count = ").push_bind(v);
        }
        if let Some(v) = update.allow_concurrent_runs {
            builder.push(", allow_concurrent_runs = ").push_bind(v);
        }
        if let Some(v) = update.manager_id {
            builder.push(", manager_id = ").push_bind(v);
        }
        if let Some(v) = update.heartbeat {
            builder.push(", heartbeat = ").push_bind(v);
        }

        builder.push(" WHERE name = ").push_bind(name.to_string());

        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(transient)?;
        if result.rows_affected() == 0 {
            return Err(SchedulerError::NotFound(name.to_string()));
        }
        Ok(())
    }

    async fn delete(&self, name: &str) -> RepoResult<()> {
        let result = sqlx::query("DELETE FROM jobs WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(transient)?;
        if result.rows_affected() == 0 {
            return Err(SchedulerError::NotFound(name.to_string()));
        }
        Ok(())
    }

    async fn lock(&self, manager_id: Uuid, take: u32) -> RepoResult<Vec<Job>> {
        let sql = if take == 0 {
            format!(
                r#"
                WITH next_jobs AS (
                    SELECT name FROM jobs
                    WHERE manager_id = $1 OR manager_id IS NULL
                    ORDER BY (manager_id = $1) DESC, name
                    FOR UPDATE SKIP LOCKED
                )
                UPDATE jobs SET manager_id = $1, updated_at = NOW()
                WHERE name IN (SELECT name FROM next_jobs)
                RETURNING {JOB_COLUMNS}
                "#
            )
        } else {
            format!(
                r#"
                WITH next_jobs AS (
                    SELECT name FROM jobs
                    WHERE manager_id = $1 OR manager_id IS NULL
                    ORDER BY (manager_id = $1) DESC, name
                    LIMIT $2
                    FOR UPDATE SKIP LOCKED
                )
                UPDATE jobs SET manager_id = $1, updated_at = NOW()
                WHERE name IN (SELECT name FROM next_jobs)
                RETURNING {JOB_COLUMNS}
                "#
            )
        };

        let rows: Vec<JobRow> = if take == 0 {
            sqlx::query_as(&sql)
                .bind(manager_id)
                .fetch_all(&self.pool)
                .await
                .map_err(transient)?
        } else {
            sqlx::query_as(&sql)
                .bind(manager_id)
                .bind(take as i64)
                .fetch_all(&self.pool)
                .await
                .map_err(transient)?
        };

        Ok(rows.into_iter().map(Job::from).collect())
    }

    async fn unlock(&self, filter: JobUnlockFilter) -> RepoResult<u64> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("UPDATE jobs SET manager_id = NULL, updated_at = NOW() WHERE TRUE");

        if let Some(manager_id) = filter.manager_id {
            builder.push(" AND manager_id = ").push_bind(manager_id);
        }
        if let Some(names) = &filter.job_names {
            builder
                .push(" AND name = ANY(")
                .push_bind(names.clone())
                .push(")");
        }
        if let Some(is_managed) = filter.is_managed {
            if is_managed {
                builder.push(" AND manager_id IS NOT NULL");
            } else {
                builder.push(" AND manager_id IS NULL");
            }
        }
        if let Some(cutoff) = filter.heartbeat_before {
            builder.push(" AND heartbeat < ").push_bind(cutoff);
        }

        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(transient)?;
        Ok(result.rows_affected())
    }

    async fn heartbeat(&self, manager_id: Uuid, now: DateTime<Utc>) -> RepoResult<u64> {
        let result =
            sqlx::query("UPDATE jobs SET heartbeat = $1, updated_at = NOW() WHERE manager_id = $2")
                .bind(now)
                .bind(manager_id)
                .execute(&self.pool)
                .await
                .map_err(transient)?;
        Ok(result.rows_affected())
    }
}
