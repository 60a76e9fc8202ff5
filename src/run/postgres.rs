//! PostgreSQL implementation of [`RunStore`].

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};

use async_trait::async_trait;
use tracing::{debug, error, instrument};

use crate::id::RunId;

use super::model::{RunStatus, Timeline, WorkflowRun};
use super::store::{ListRunsFilter, NewRun, Page, RunPatch, RunStore, StoreError};

/// PostgreSQL-backed [`RunStore`].
///
/// # Example
///
/// ```ignore
/// use durastep::run::PostgresRunStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/mydb").await?;
/// let store = PostgresRunStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresRunStore {
    pool: PgPool,
}

impl PostgresRunStore {
    /// Wrap an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Borrow the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn status_str(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Pending => "pending",
        RunStatus::Running => "running",
        RunStatus::Paused => "paused",
        RunStatus::Completed => "completed",
        RunStatus::Failed => "failed",
        RunStatus::Cancelled => "cancelled",
    }
}

fn parse_status(raw: &str) -> Result<RunStatus, StoreError> {
    Ok(match raw {
        "pending" => RunStatus::Pending,
        "running" => RunStatus::Running,
        "paused" => RunStatus::Paused,
        "completed" => RunStatus::Completed,
        "failed" => RunStatus::Failed,
        "cancelled" => RunStatus::Cancelled,
        other => {
            return Err(StoreError::Database(sqlx::Error::Decode(
                format!("unknown run status '{other}'").into(),
            )))
        }
    })
}

fn row_to_run(row: &sqlx::postgres::PgRow) -> Result<WorkflowRun, StoreError> {
    let id: String = row.get("id");
    let id: RunId = id
        .parse()
        .map_err(|e| StoreError::Database(sqlx::Error::Decode(Box::new(IdDecodeError(e)))))?;
    let status: String = row.get("status");
    let timeline_json: Value = row.get("timeline");
    let timeline: Timeline = serde_json::from_value(timeline_json)
        .map_err(|e| StoreError::Database(sqlx::Error::Decode(Box::new(e))))?;

    Ok(WorkflowRun {
        id,
        workflow_id: row.get("workflow_id"),
        resource_id: row.get("resource_id"),
        status: parse_status(&status)?,
        input: row.get("input"),
        output: row.get("output"),
        error: row.get("error"),
        current_step_id: row.get("current_step_id"),
        timeline,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        paused_at: row.get("paused_at"),
        resumed_at: row.get("resumed_at"),
        completed_at: row.get("completed_at"),
        timeout_at: row.get("timeout_at"),
        retry_count: row.get::<i32, _>("retry_count") as u32,
        max_retries: row.get::<i32, _>("max_retries") as u32,
        job_id: row.get("job_id"),
        cron: row.get("cron"),
        timezone: row.get("timezone"),
        idempotency_key: row.get("idempotency_key"),
    })
}

#[derive(Debug, thiserror::Error)]
#[error("invalid run id in database: {0}")]
struct IdDecodeError(crate::id::ParseRunIdError);

#[async_trait]
impl RunStore for PostgresRunStore {
    #[instrument(skip(self, new_run))]
    async fn insert(&self, new_run: NewRun) -> Result<WorkflowRun, StoreError> {
        let id = RunId::generate();
        let now = Utc::now();

        if let Some(key) = &new_run.idempotency_key {
            if let Some(existing) = self
                .find_active_by_idempotency_key(&new_run.workflow_id, key)
                .await?
            {
                return Ok(existing);
            }
        }

        let row = sqlx::query(
            r#"
            INSERT INTO workflow_runs
                (id, workflow_id, resource_id, status, input, timeline,
                 created_at, updated_at, timeout_at, retry_count, max_retries,
                 cron, timezone, idempotency_key)
            VALUES ($1, $2, $3, 'running', $4, '{}'::jsonb,
                    $5, $5, $6, 0, $7, $8, $9, $10)
            ON CONFLICT (workflow_id, idempotency_key)
                WHERE idempotency_key IS NOT NULL AND status NOT IN ('completed', 'failed', 'cancelled')
                DO NOTHING
            RETURNING *
            "#,
        )
        .bind(id.to_string())
        .bind(&new_run.workflow_id)
        .bind(&new_run.resource_id)
        .bind(&new_run.input)
        .bind(now)
        .bind(new_run.timeout_at)
        .bind(new_run.max_retries as i32)
        .bind(&new_run.cron)
        .bind(&new_run.timezone)
        .bind(&new_run.idempotency_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to insert run: {e}");
            StoreError::Database(e)
        })?;

        match row {
            Some(row) => row_to_run(&row),
            None => {
                // Lost the idempotency race; the concurrent insert won.
                let key = new_run.idempotency_key.expect("conflict implies a key");
                self.find_active_by_idempotency_key(&new_run.workflow_id, &key)
                    .await?
                    .ok_or(StoreError::IdempotencyConflict(key))
            }
        }
    }

    #[instrument(skip(self))]
    async fn get(
        &self,
        run_id: RunId,
        resource_id: Option<&str>,
    ) -> Result<WorkflowRun, StoreError> {
        let row = sqlx::query(
            r#"SELECT * FROM workflow_runs WHERE id = $1 AND ($2::text IS NULL OR resource_id = $2)"#,
        )
        .bind(run_id.to_string())
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Database)?
        .ok_or(StoreError::NotFound(run_id))?;

        row_to_run(&row)
    }

    #[instrument(skip(self))]
    async fn get_last_completed(
        &self,
        workflow_id: &str,
    ) -> Result<Option<WorkflowRun>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM workflow_runs
            WHERE workflow_id = $1 AND status = 'completed'
            ORDER BY completed_at DESC
            LIMIT 1
            "#,
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        row.as_ref().map(row_to_run).transpose()
    }

    #[instrument(skip(self))]
    async fn find_active_by_idempotency_key(
        &self,
        workflow_id: &str,
        key: &str,
    ) -> Result<Option<WorkflowRun>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM workflow_runs
            WHERE workflow_id = $1 AND idempotency_key = $2
              AND status NOT IN ('completed', 'failed', 'cancelled')
            LIMIT 1
            "#,
        )
        .bind(workflow_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        row.as_ref().map(row_to_run).transpose()
    }

    #[instrument(skip(self, patch))]
    async fn update(
        &self,
        run_id: RunId,
        resource_id: Option<&str>,
        patch: RunPatch,
    ) -> Result<WorkflowRun, StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::Database)?;
        let run = apply_patch_locked(&mut tx, run_id, resource_id, patch).await?;
        tx.commit().await.map_err(StoreError::Database)?;
        Ok(run)
    }

    #[instrument(skip(self, decide))]
    async fn with_exclusive(
        &self,
        run_id: RunId,
        resource_id: Option<&str>,
        decide: Box<dyn FnOnce(&WorkflowRun) -> RunPatch + Send>,
    ) -> Result<WorkflowRun, StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::Database)?;

        let row = sqlx::query(
            r#"SELECT * FROM workflow_runs WHERE id = $1 AND ($2::text IS NULL OR resource_id = $2) FOR UPDATE"#,
        )
        .bind(run_id.to_string())
        .bind(resource_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(StoreError::Database)?
        .ok_or(StoreError::NotFound(run_id))?;

        let current = row_to_run(&row)?;
        let patch = decide(&current);

        let updated = apply_patch_locked(&mut tx, run_id, resource_id, patch).await?;
        tx.commit().await.map_err(StoreError::Database)?;
        Ok(updated)
    }

    #[instrument(skip(self))]
    async fn list(&self, filter: ListRunsFilter) -> Result<Page<WorkflowRun>, StoreError> {
        let limit = filter.clamped_limit() as i64;

        let after_created_at: Option<DateTime<Utc>> = match filter.starting_after {
            Some(id) => Some(self.get(id, None).await?.created_at),
            None => None,
        };
        let before_created_at: Option<DateTime<Utc>> = match filter.ending_before {
            Some(id) => Some(self.get(id, None).await?.created_at),
            None => None,
        };

        let statuses: Vec<&str> = filter.statuses.iter().map(|s| status_str(*s)).collect();

        let rows = sqlx::query(
            r#"
            SELECT * FROM workflow_runs
            WHERE ($1::text IS NULL OR resource_id = $1)
              AND ($2::text IS NULL OR workflow_id = $2)
              AND (array_length($3::text[], 1) IS NULL OR status = ANY($3))
              AND ($4::timestamptz IS NULL OR created_at < $4)
              AND ($5::timestamptz IS NULL OR created_at > $5)
            ORDER BY created_at DESC
            LIMIT $6
            "#,
        )
        .bind(&filter.resource_id)
        .bind(&filter.workflow_id)
        .bind(&statuses)
        .bind(after_created_at)
        .bind(before_created_at)
        .bind(limit + 1)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        let mut items = rows.iter().map(row_to_run).collect::<Result<Vec<_>, _>>()?;
        let has_more = items.len() as i64 > limit;
        items.truncate(limit as usize);

        Ok(Page { items, has_more })
    }

    #[instrument(skip(self))]
    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_runs (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                resource_id TEXT,
                status TEXT NOT NULL,
                input JSONB NOT NULL,
                output JSONB,
                error TEXT,
                current_step_id TEXT,
                timeline JSONB NOT NULL DEFAULT '{}'::jsonb,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                paused_at TIMESTAMPTZ,
                resumed_at TIMESTAMPTZ,
                completed_at TIMESTAMPTZ,
                timeout_at TIMESTAMPTZ,
                retry_count INT NOT NULL DEFAULT 0,
                max_retries INT NOT NULL DEFAULT 0,
                job_id TEXT,
                cron TEXT,
                timezone TEXT,
                idempotency_key TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        // Additive-only: a table created by an earlier version of this
        // crate may predate the cron columns or the partial index.
        for stmt in [
            "ALTER TABLE workflow_runs ADD COLUMN IF NOT EXISTS cron TEXT",
            "ALTER TABLE workflow_runs ADD COLUMN IF NOT EXISTS timezone TEXT",
            "ALTER TABLE workflow_runs ADD COLUMN IF NOT EXISTS idempotency_key TEXT",
            "CREATE INDEX IF NOT EXISTS workflow_runs_workflow_id_idx ON workflow_runs (workflow_id)",
            "CREATE INDEX IF NOT EXISTS workflow_runs_created_at_idx ON workflow_runs (created_at)",
            "CREATE INDEX IF NOT EXISTS workflow_runs_resource_id_idx ON workflow_runs (resource_id)",
            r#"CREATE UNIQUE INDEX IF NOT EXISTS workflow_runs_idempotency_idx
                 ON workflow_runs (workflow_id, idempotency_key)
                 WHERE idempotency_key IS NOT NULL
                   AND status NOT IN ('completed', 'failed', 'cancelled')"#,
            r#"CREATE INDEX IF NOT EXISTS workflow_runs_cron_completed_idx
                 ON workflow_runs (workflow_id, completed_at DESC)
                 WHERE cron IS NOT NULL AND status = 'completed'"#,
        ] {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(StoreError::Database)?;
        }

        debug!("workflow_runs schema is up to date");
        Ok(())
    }
}

async fn apply_patch_locked(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    run_id: RunId,
    resource_id: Option<&str>,
    patch: RunPatch,
) -> Result<WorkflowRun, StoreError> {
    // `timeline_merge` is applied with jsonb `||`, which overwrites on a
    // key collision; callers only ever populate it after confirming
    // (under this same lock) that the key is still absent, which is
    // what actually makes output entries write-once.
    let timeline_merge =
        serde_json::to_value(&patch.timeline_merge).map_err(|e| StoreError::Database(
            sqlx::Error::Encode(Box::new(e)),
        ))?;

    let row = sqlx::query(
        r#"
        UPDATE workflow_runs SET
            status = COALESCE($3, status),
            output = COALESCE($4, output),
            error = CASE WHEN $5 THEN $6 ELSE error END,
            current_step_id = COALESCE($7, current_step_id),
            timeline = timeline || $8::jsonb,
            paused_at = CASE WHEN $9 THEN $10 ELSE paused_at END,
            resumed_at = COALESCE($11, resumed_at),
            completed_at = COALESCE($12, completed_at),
            retry_count = COALESCE($13, retry_count),
            job_id = COALESCE($14, job_id),
            updated_at = NOW()
        WHERE id = $1 AND ($2::text IS NULL OR resource_id = $2)
        RETURNING *
        "#,
    )
    .bind(run_id.to_string())
    .bind(resource_id)
    .bind(patch.status.map(status_str))
    .bind(&patch.output)
    .bind(patch.error.is_some())
    .bind(patch.error.clone().flatten())
    .bind(&patch.current_step_id)
    .bind(timeline_merge)
    .bind(patch.paused_at.is_some())
    .bind(patch.paused_at.flatten())
    .bind(patch.resumed_at)
    .bind(patch.completed_at)
    .bind(patch.retry_count.map(|c| c as i32))
    .bind(&patch.job_id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(StoreError::Database)?
    .ok_or(StoreError::NotFound(run_id))?;

    row_to_run(&row)
}
