//! PostgreSQL implementation of [`QueueAdapter`].
//!
//! Grounded directly on the row-locking claim pattern used for the run
//! store: a `SELECT ... FOR UPDATE SKIP LOCKED` CTE feeding an `UPDATE`
//! so concurrent dispatcher workers never double-claim a job. This
//! schema (`durable_queue_jobs`, `durable_queue_schedules`) is private
//! to the queue adapter — it is not part of the `workflow_runs` data
//! model in §3.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};

use async_trait::async_trait;
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::adapter::{Job, QueueAdapter, QueueError, SendOptions};

/// PostgreSQL-backed [`QueueAdapter`].
#[derive(Clone)]
pub struct PostgresQueueAdapter {
    pool: PgPool,
}

impl PostgresQueueAdapter {
    /// Wrap an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Idempotently ensure the queue's own tables exist.
    pub async fn migrate(&self) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS durable_queue_jobs (
                id TEXT PRIMARY KEY,
                queue_name TEXT NOT NULL,
                payload JSONB NOT NULL,
                visible_at TIMESTAMPTZ NOT NULL,
                expires_at TIMESTAMPTZ,
                attempt INT NOT NULL DEFAULT 0,
                claimed BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(transport)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS durable_queue_jobs_claim_idx \
             ON durable_queue_jobs (queue_name, visible_at) WHERE NOT claimed",
        )
        .execute(&self.pool)
        .await
        .map_err(transport)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS durable_queue_schedules (
                queue_name TEXT PRIMARY KEY,
                cron_expression TEXT NOT NULL,
                payload JSONB NOT NULL,
                timezone TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(transport)?;

        Ok(())
    }
}

fn transport(e: sqlx::Error) -> QueueError {
    QueueError::Transport(Box::new(e))
}

#[async_trait]
impl QueueAdapter for PostgresQueueAdapter {
    #[instrument(skip(self))]
    async fn create_queue(&self, _name: &str) -> Result<(), QueueError> {
        // Jobs carry their queue name inline; no separate queue row is
        // needed, so creation is a no-op beyond schema migration.
        Ok(())
    }

    #[instrument(skip(self, payload))]
    async fn send(
        &self,
        queue_name: &str,
        payload: Value,
        options: SendOptions,
    ) -> Result<String, QueueError> {
        let id = Uuid::new_v4().to_string();
        let visible_at = options.start_after.unwrap_or_else(Utc::now);
        let expires_at: Option<DateTime<Utc>> = options
            .expire_in_seconds
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs as i64));

        sqlx::query(
            r#"
            INSERT INTO durable_queue_jobs (id, queue_name, payload, visible_at, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&id)
        .bind(queue_name)
        .bind(&payload)
        .bind(visible_at)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(transport)?;

        debug!(%queue_name, job_id = %id, "enqueued job");
        Ok(id)
    }

    #[instrument(skip(self))]
    async fn claim(&self, queue_name: &str, batch_size: usize) -> Result<Vec<Job>, QueueError> {
        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM durable_queue_jobs
                WHERE queue_name = $1
                  AND NOT claimed
                  AND visible_at <= NOW()
                  AND (expires_at IS NULL OR expires_at > NOW())
                ORDER BY visible_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE durable_queue_jobs q
            SET claimed = TRUE, attempt = attempt + 1
            FROM claimable c
            WHERE q.id = c.id
            RETURNING q.id, q.queue_name, q.payload, q.attempt
            "#,
        )
        .bind(queue_name)
        .bind(batch_size as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to claim queue jobs: {e}");
            transport(e)
        })?;

        Ok(rows
            .into_iter()
            .map(|row| Job {
                id: row.get("id"),
                queue_name: row.get("queue_name"),
                payload: row.get("payload"),
                attempt: row.get::<i32, _>("attempt") as u32,
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn ack(&self, _queue_name: &str, job_id: &str) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM durable_queue_jobs WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(transport)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn nack(&self, _queue_name: &str, job_id: &str) -> Result<(), QueueError> {
        sqlx::query("UPDATE durable_queue_jobs SET claimed = FALSE WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(transport)?;
        Ok(())
    }

    #[instrument(skip(self, payload))]
    async fn schedule(
        &self,
        queue_name: &str,
        cron_expression: &str,
        payload: Value,
        tz: chrono_tz::Tz,
    ) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            INSERT INTO durable_queue_schedules (queue_name, cron_expression, payload, timezone)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (queue_name) DO UPDATE
                SET cron_expression = EXCLUDED.cron_expression,
                    payload = EXCLUDED.payload,
                    timezone = EXCLUDED.timezone
            "#,
        )
        .bind(queue_name)
        .bind(cron_expression)
        .bind(&payload)
        .bind(tz.to_string())
        .execute(&self.pool)
        .await
        .map_err(transport)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unschedule(&self, queue_name: &str) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM durable_queue_schedules WHERE queue_name = $1")
            .bind(queue_name)
            .execute(&self.pool)
            .await
            .map_err(transport)?;
        Ok(())
    }

    async fn stop(&self) -> Result<(), QueueError> {
        Ok(())
    }
}
