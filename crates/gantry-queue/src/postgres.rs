//! Build queue backed by PostgreSQL.

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use gantry_core::{BuildPackage, Error, Result};

use crate::{Queue, QueuedItem};

#[derive(Debug, sqlx::FromRow)]
struct QueueRow {
    id: Uuid,
    item: serde_json::Value,
}

/// Queue driver over a shared Postgres instance.
///
/// Claims use `FOR UPDATE SKIP LOCKED` so concurrent workers never contend
/// on the same item; route eligibility is filtered in SQL with array
/// containment.
pub struct PostgresQueue {
    pool: PgPool,
}

impl PostgresQueue {
    pub async fn connect(address: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(address)
            .await
            .map_err(|e| Error::InvalidConfiguration(format!("queue address: {e}")))?;
        Ok(Self { pool })
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Enqueue an envelope. The control plane does this in production;
    /// exposed for development and tests.
    pub async fn enqueue(&self, package: &BuildPackage) -> Result<Uuid> {
        let item = serde_json::to_value(package)
            .map_err(|e| Error::Internal(format!("encode queue item: {e}")))?;
        let routes: Vec<String> = package.routes().to_vec();

        let row: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO build_queue (id, routes, item, status, created_at)
            VALUES ($1, $2, $3, 'pending', NOW())
            RETURNING id
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(&routes)
        .bind(item)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::Api(format!("enqueue: {e}")))?;

        Ok(row.0)
    }
}

#[async_trait]
impl Queue for PostgresQueue {
    async fn pop(&self, worker: &str, routes: &[String]) -> Result<Option<QueuedItem>> {
        let offered: Vec<String> = routes.to_vec();

        let row: Option<QueueRow> = sqlx::query_as(
            r#"
            UPDATE build_queue
            SET status = 'claimed', claimed_by = $1, claimed_at = NOW()
            WHERE id = (
                SELECT id FROM build_queue
                WHERE status = 'pending' AND routes <@ $2
                ORDER BY created_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING id, item
            "#,
        )
        .bind(worker)
        .bind(&offered)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Api(format!("claim: {e}")))?;

        match row {
            None => Ok(None),
            Some(row) => {
                let package: BuildPackage = serde_json::from_value(row.item)
                    .map_err(|e| Error::InvalidConfiguration(format!("queue item {}: {e}", row.id)))?;
                Ok(Some(QueuedItem {
                    id: row.id,
                    package,
                }))
            }
        }
    }

    async fn ack(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE build_queue SET status = 'completed' WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Api(format!("ack: {e}")))?;
        Ok(())
    }

    async fn fail(&self, id: Uuid, message: &str) -> Result<()> {
        sqlx::query("UPDATE build_queue SET status = 'failed', error = $2 WHERE id = $1")
            .bind(id)
            .bind(message)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Api(format!("fail: {e}")))?;
        Ok(())
    }
}
