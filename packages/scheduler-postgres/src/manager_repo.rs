use async_trait::async_trait;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use scheduler_core::repo::{ManagerRepo, RepoResult};
use scheduler_core::{ManagerRecord, SchedulerError};

use crate::transient;

#[derive(FromRow)]
struct ManagerRow {
    id: Uuid,
    hostname: String,
}

impl From<ManagerRow> for ManagerRecord {
    fn from(row: ManagerRow) -> Self {
        ManagerRecord {
            id: row.id,
            hostname: row.hostname,
        }
    }
}

pub struct PostgresManagerRepo {
    pool: PgPool,
}

impl PostgresManagerRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ManagerRepo for PostgresManagerRepo {
    async fn browse(&self) -> RepoResult<Vec<ManagerRecord>> {
        let rows: Vec<ManagerRow> = sqlx::query_as("SELECT id, hostname FROM managers ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(transient)?;
        Ok(rows.into_iter().map(ManagerRecord::from).collect())
    }

    async fn read(&self, id: Uuid) -> RepoResult<ManagerRecord> {
        let row: Option<ManagerRow> =
            sqlx::query_as("SELECT id, hostname FROM managers WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(transient)?;
        row.map(ManagerRecord::from)
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))
    }

    async fn add(&self, manager: ManagerRecord) -> RepoResult<()> {
        sqlx::query(
            "INSERT INTO managers (id, hostname) VALUES ($1, $2) \
             ON CONFLICT (id) DO UPDATE SET hostname = EXCLUDED.hostname",
        )
        .bind(manager.id)
        .bind(&manager.hostname)
        .execute(&self.pool)
        .await
        .map_err(transient)?;
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> RepoResult<()> {
        let result = sqlx::query("DELETE FROM managers WHERE id = $1")
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
