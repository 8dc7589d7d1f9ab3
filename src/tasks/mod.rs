//! # Task Queue (C5) — the dense subsystem
//!
//! Priority+FIFO dequeue with dependency gating, delay scheduling,
//! exponential-backoff retry, batch processing, and cleanup. Dependencies
//! and delay travel inside `params` under reserved keys (see
//! `tasks::models`); the dequeue contract re-checks dependency readiness
//! inside the same atomic statement that claims the task, so a task whose
//! dependencies regress between poll and claim is skipped, not consumed.

mod batch;
mod models;

pub use batch::{process_batch, BatchOutcome, TaskHandler};
pub use models::{EnqueueRequest, Task, TaskPriority, TaskStatus};

use crate::config::FabricConfig;
use crate::errors::{FabricError, FabricResult};
use crate::store::{OperationLogEntry, StoreGateway};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

const ENTITY: &str = "task";

#[derive(Debug, Clone)]
pub struct TaskQueue {
    store: Arc<StoreGateway>,
    retry_backoff_seconds: Vec<u64>,
}

impl TaskQueue {
    pub fn new(store: Arc<StoreGateway>, config: &FabricConfig) -> Self {
        Self {
            store,
            retry_backoff_seconds: config.retry_backoff_seconds.clone(),
        }
    }

    fn backoff_for(&self, retry_count: i32) -> u64 {
        let idx = (retry_count.max(0) as usize).min(self.retry_backoff_seconds.len() - 1);
        self.retry_backoff_seconds[idx]
    }

    pub async fn enqueue(&self, req: EnqueueRequest) -> FabricResult<Uuid> {
        let task_id = Uuid::new_v4();
        let params = req.build_params();

        sqlx::query(
            r#"
            INSERT INTO tasks (task_id, agent, kind, params, priority, status, retry_count, max_retries)
            VALUES ($1, $2, $3, $4, $5, 'pending', 0, $6)
            "#,
        )
        .bind(task_id)
        .bind(&req.agent)
        .bind(&req.kind)
        .bind(&params)
        .bind(req.priority)
        .bind(req.max_retries)
        .execute(self.store.pool())
        .await
        .map_err(FabricError::classify)?;

        self.store
            .log_operation(OperationLogEntry::success(
                &req.agent,
                "task_enqueue",
                serde_json::json!({"task_id": task_id, "kind": req.kind}),
            ))
            .await;
        Ok(task_id)
    }

    /// Transactional batch enqueue: either all rows are inserted or none.
    pub async fn enqueue_batch(&self, requests: Vec<EnqueueRequest>) -> FabricResult<Vec<Uuid>> {
        let mut tx = self.store.pool().begin().await.map_err(FabricError::classify)?;
        let mut ids = Vec::with_capacity(requests.len());

        for req in &requests {
            let task_id = Uuid::new_v4();
            let params = req.build_params();
            sqlx::query(
                r#"
                INSERT INTO tasks (task_id, agent, kind, params, priority, status, retry_count, max_retries)
                VALUES ($1, $2, $3, $4, $5, 'pending', 0, $6)
                "#,
            )
            .bind(task_id)
            .bind(&req.agent)
            .bind(&req.kind)
            .bind(&params)
            .bind(req.priority)
            .bind(req.max_retries)
            .execute(&mut *tx)
            .await
            .map_err(FabricError::classify)?;
            ids.push(task_id);
        }

        tx.commit().await.map_err(FabricError::classify)?;
        Ok(ids)
    }

    /// Atomically pick the single best-eligible task for `agent` and mark
    /// it `processing`. A single `UPDATE ... FOR UPDATE SKIP LOCKED`
    /// statement makes the select-and-claim serializable against
    /// concurrent dequeuers on the same agent without a separate
    /// `SELECT` round trip.
    pub async fn dequeue(&self, agent: &str, kinds: Option<&[String]>) -> FabricResult<Option<Task>> {
        let kinds_filter: Option<Vec<String>> = kinds.map(|k| k.to_vec());

        let task = sqlx::query_as::<_, Task>(
            r#"
            WITH candidate AS (
                SELECT task_id
                FROM tasks
                WHERE status = 'pending'
                  AND agent = $1
                  AND (params->>'_delay_until' IS NULL OR (params->>'_delay_until')::timestamptz <= now())
                  AND ($2::text[] IS NULL OR array_length($2::text[], 1) IS NULL OR kind = ANY($2))
                  AND NOT EXISTS (
                      SELECT 1
                      FROM jsonb_array_elements_text(COALESCE(params->'_dependencies', '[]'::jsonb)) AS dep(id)
                      JOIN tasks dep_task ON dep_task.task_id = dep.id::uuid
                      WHERE dep_task.status != 'completed'
                  )
                ORDER BY priority ASC, created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE tasks
            SET status = 'processing', started_at = now()
            WHERE task_id IN (SELECT task_id FROM candidate)
            RETURNING task_id, agent, kind, params, priority, status, result, error,
                      retry_count, max_retries, created_at, started_at, completed_at
            "#,
        )
        .bind(agent)
        .bind(kinds_filter)
        .fetch_optional(self.store.pool())
        .await
        .map_err(FabricError::classify)?;

        if let Some(ref t) = task {
            info!(task_id = %t.task_id, agent, kind = %t.kind, "dequeued task");
        }
        Ok(task)
    }

    pub async fn get(&self, task_id: Uuid) -> FabricResult<Task> {
        sqlx::query_as::<_, Task>(
            r#"
            SELECT task_id, agent, kind, params, priority, status, result, error,
                   retry_count, max_retries, created_at, started_at, completed_at
            FROM tasks WHERE task_id = $1
            "#,
        )
        .bind(task_id)
        .fetch_optional(self.store.pool())
        .await
        .map_err(FabricError::classify)?
        .ok_or_else(|| FabricError::NotFound {
            entity: ENTITY,
            id: task_id.to_string(),
        })
    }

    pub async fn complete(
        &self,
        task_id: Uuid,
        result: serde_json::Value,
        processing_ms: Option<i64>,
    ) -> FabricResult<()> {
        sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'completed', completed_at = now(), result = $2
            WHERE task_id = $1
            "#,
        )
        .bind(task_id)
        .bind(&result)
        .execute(self.store.pool())
        .await
        .map_err(FabricError::classify)?;

        self.store
            .log_operation(
                OperationLogEntry::success(
                    "task_queue",
                    "task_complete",
                    serde_json::json!({"task_id": task_id}),
                )
                .with_duration(processing_ms.unwrap_or(0)),
            )
            .await;
        Ok(())
    }

    /// Returns `true` iff the task will be retried. Increments
    /// `retry_count` and reschedules with backoff when
    /// `retry && retry_count < max_retries`; otherwise transitions to
    /// terminal `failed`.
    pub async fn fail(&self, task_id: Uuid, error: &str, retry: bool) -> FabricResult<bool> {
        let task = self.get(task_id).await?;

        if retry && task.retry_count < task.max_retries {
            let new_retry_count = task.retry_count + 1;
            let delay = self.backoff_for(new_retry_count);
            let delay_until = chrono::Utc::now() + chrono::Duration::seconds(delay as i64);

            sqlx::query(
                r#"
                UPDATE tasks
                SET status = 'pending',
                    retry_count = $2,
                    error = $3,
                    params = jsonb_set(params, '{_delay_until}', to_jsonb($4::text))
                WHERE task_id = $1
                "#,
            )
            .bind(task_id)
            .bind(new_retry_count)
            .bind(error)
            .bind(delay_until.to_rfc3339())
            .execute(self.store.pool())
            .await
            .map_err(FabricError::classify)?;

            warn!(task_id = %task_id, retry_count = new_retry_count, delay_s = delay, "task failed, retry scheduled");
            Ok(true)
        } else {
            sqlx::query(
                r#"
                UPDATE tasks
                SET status = 'failed', completed_at = now(), error = $2
                WHERE task_id = $1
                "#,
            )
            .bind(task_id)
            .bind(error)
            .execute(self.store.pool())
            .await
            .map_err(FabricError::classify)?;

            warn!(task_id = %task_id, "task failed permanently");
            Ok(false)
        }
    }

    /// Conditional `pending -> failed` transition. No-op if already
    /// running or terminal.
    pub async fn cancel(&self, task_id: Uuid, reason: &str) -> FabricResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'failed', completed_at = now(), error = $2
            WHERE task_id = $1 AND status = 'pending'
            "#,
        )
        .bind(task_id)
        .bind(format!("Cancelled: {reason}"))
        .execute(self.store.pool())
        .await
        .map_err(FabricError::classify)?;
        Ok(result.rows_affected() == 1)
    }

    /// Hard-delete `completed|failed` tasks with `completed_at` older
    /// than `retention_days`. Never touches active states.
    pub async fn cleanup_completed(&self, retention_days: i64) -> FabricResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM tasks
            WHERE status IN ('completed', 'failed')
              AND completed_at < now() - ($1 || ' days')::interval
            "#,
        )
        .bind(retention_days)
        .execute(self.store.pool())
        .await
        .map_err(FabricError::classify)?;
        Ok(result.rows_affected())
    }

    pub async fn get_dependencies(&self, task_id: Uuid) -> FabricResult<Vec<Uuid>> {
        Ok(self.get(task_id).await?.dependencies())
    }

    /// Tasks whose `_dependencies` include `task_id`.
    pub async fn get_dependents(&self, task_id: Uuid) -> FabricResult<Vec<Uuid>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT task_id FROM tasks
            WHERE params->'_dependencies' @> to_jsonb($1::text)
            "#,
        )
        .bind(task_id.to_string())
        .fetch_all(self.store.pool())
        .await
        .map_err(FabricError::classify)?;
        Ok(ids)
    }
}
