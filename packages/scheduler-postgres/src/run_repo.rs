use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use scheduler_core::repo::{RepoResult, RunFilter, RunRepo, RunUpdate};
use scheduler_core::{Run, RunStatus, SchedulerError};

use crate::transient;

#[derive(FromRow)]
struct RunRow {
    id: Uuid,
    job_name: String,
    status: String,
    created_time: DateTime<Utc>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    heartbeat: DateTime<Utc>,
}

impl TryFrom<RunRow> for Run {
    type Error = SchedulerError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        let status =
            RunStatus::from_wire(&row.status).ok_or_else(|| SchedulerError::Unsupported {
                field: "status",
                value: row.status.clone(),
            })?;
        Ok(Run {
            id: row.id,
            job_name: row.job_name,
            status,
            created_time: row.created_time,
            start_time: row.start_time,
            end_time: row.end_time,
            heartbeat: row.heartbeat,
        })
    }
}

const RUN_COLUMNS: &str = "id, job_name, status, created_time, start_time, end_time, heartbeat";

pub struct PostgresRunRepo {
    pool: PgPool,
}

impl PostgresRunRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunRepo for PostgresRunRepo {
    async fn browse(&self, filter: RunFilter) -> RepoResult<Vec<Run>> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {RUN_COLUMNS} FROM runs WHERE TRUE"));

        if let Some(job_name) = &filter.job_name {
            builder.push(" AND job_name = ").push_bind(job_name.clone());
        }
        if let Some(status) = filter.status {
            builder.push(" AND status = ").push_bind(status.as_wire());
        }
        if let Some(cutoff) = filter.created_before {
            builder.push(" AND created_time < ").push_bind(cutoff);
        }
        if let Some(cutoff) = filter.started_before {
            builder.push(" AND start_time < ").push_bind(cutoff);
        }
        if let Some(cutoff) = filter.heartbeat_before {
            builder.push(" AND heartbeat < ").push_bind(cutoff);
        }

        let rows: Vec<RunRow> = builder
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(transient)?;
        rows.into_iter().map(Run::try_from).collect()
    }

    async fn read(&self, id: Uuid) -> RepoResult<Run> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = $1");
        let row: Option<RunRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(transient)?;
        match row {
            Some(row) => Run::try_from(row),
            None => Err(SchedulerError::NotFound(id.to_string())),
        }
    }

    async fn add(&self, run: Run) -> RepoResult<()> {
        sqlx::query(
            r#"
            INSERT INTO runs (id, job_name, status, created_time, start_time, end_time, heartbeat)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(run.id)
        .bind(&run.job_name)
        .bind(run.status.as_wire())
        .bind(run.created_time)
        .bind(run.start_time)
        .bind(run.end_time)
        .bind(run.heartbeat)
        .execute(&self.pool)
        .await
        .map_err(transient)?;
        Ok(())
    }

    async fn edit(&self, id: Uuid, update: RunUpdate) -> RepoResult<()> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new("UPDATE runs SET id = id");

        if let Some(status) = update.status {
            builder.push(", status = ").push_bind(status.as_wire());
        }
        if let Some(v) = update.start_time {
            builder.push(", start_time = ").push_bind(v);
        }
        if let Some(v) = update.end_time {
            builder.push(", end_time = ").push_bind(v);
        }
        if let Some(v) = update.heartbeat {
            builder.push(", heartbeat = ").push_bind(v);
        }

        builder.push(" WHERE id = ").push_bind(id);

        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(transient)?;
        if result.rows_affected() == 0 {
            return Err(SchedulerError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> RepoResult<()> {
        let result = sqlx::query("DELETE FROM runs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(transient)?;
        if result.rows_affected() == 0 {
            return Err(SchedulerError::NotFound(id.to_string()));
        }
        Ok(())
    }
}
