//! # Session Store (C4)
//!
//! Multi-agent conversation state: append-only turns, a mutable top-level
//! state map, and an active/paused/completed/failed lifecycle. Active
//! sessions are read-through cached in-process; the cache is never the
//! source of truth and is invalidated on every write and on terminal
//! transitions.

mod models;

pub use models::{Session, SessionRow, SessionStatus, Turn};

use crate::errors::{FabricError, FabricResult};
use crate::store::{OperationLogEntry, StoreGateway};
use moka::future::Cache;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const ENTITY: &str = "session";

#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub user_id: String,
    pub status: SessionStatus,
    pub turn_count: usize,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub user_id: Option<String>,
    pub status: Option<SessionStatus>,
    pub since: Option<chrono::DateTime<chrono::Utc>>,
    pub until: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    store: Arc<StoreGateway>,
    active_cache: Cache<Uuid, Session>,
}

impl SessionStore {
    pub fn new(store: Arc<StoreGateway>) -> Self {
        Self {
            store,
            active_cache: Cache::builder()
                .max_capacity(10_000)
                .time_to_idle(Duration::from_secs(600))
                .build(),
        }
    }

    pub async fn create(
        &self,
        user_id: &str,
        agents: &[String],
        initial_state: Option<Value>,
        metadata: Option<Value>,
    ) -> FabricResult<Uuid> {
        let session_id = Uuid::new_v4();
        let state = initial_state.unwrap_or_else(|| serde_json::json!({}));
        let metadata = metadata.unwrap_or_else(|| serde_json::json!({}));

        sqlx::query(
            r#"
            INSERT INTO sessions (session_id, user_id, agents, state, history, metadata, status)
            VALUES ($1, $2, $3, $4, '[]'::jsonb, $5, 'active')
            "#,
        )
        .bind(session_id)
        .bind(user_id)
        .bind(serde_json::to_value(agents)?)
        .bind(&state)
        .bind(&metadata)
        .execute(self.store.pool())
        .await
        .map_err(FabricError::classify)?;

        self.store
            .log_operation(OperationLogEntry::success(
                user_id,
                "session_create",
                serde_json::json!({"session_id": session_id}),
            ))
            .await;
        Ok(session_id)
    }

    /// Read-through: checks the in-process cache first for active
    /// sessions, falling back to the store and repopulating on miss.
    pub async fn get(&self, session_id: Uuid) -> FabricResult<Option<Session>> {
        if let Some(cached) = self.active_cache.get(&session_id).await {
            return Ok(Some(cached));
        }

        let row = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT session_id, user_id, agents, state, history, metadata, status,
                   created_at, updated_at, completed_at
            FROM sessions WHERE session_id = $1
            "#,
        )
        .bind(session_id)
        .fetch_optional(self.store.pool())
        .await
        .map_err(FabricError::classify)?;

        let session = row.map(Session::from);
        if let Some(ref s) = session {
            if s.status == SessionStatus::Active || s.status == SessionStatus::Paused {
                self.active_cache.insert(session_id, s.clone()).await;
            }
        }
        Ok(session)
    }

    async fn require(&self, session_id: Uuid) -> FabricResult<Session> {
        self.get(session_id)
            .await?
            .ok_or_else(|| FabricError::NotFound {
                entity: ENTITY,
                id: session_id.to_string(),
            })
    }

    /// Merge (top-level keys) or fully replace the state map. `NotFound`
    /// if the session does not exist.
    pub async fn update_state(&self, session_id: Uuid, patch: Value, merge: bool) -> FabricResult<()> {
        let session = self.require(session_id).await?;

        let new_state = if merge {
            let mut base = session.state.clone();
            if let (Value::Object(base_map), Value::Object(patch_map)) = (&mut base, &patch) {
                for (k, v) in patch_map {
                    base_map.insert(k.clone(), v.clone());
                }
            }
            base
        } else {
            patch
        };

        sqlx::query("UPDATE sessions SET state = $2, updated_at = now() WHERE session_id = $1")
            .bind(session_id)
            .bind(&new_state)
            .execute(self.store.pool())
            .await
            .map_err(FabricError::classify)?;

        self.active_cache.invalidate(&session_id).await;
        Ok(())
    }

    /// Append one turn to `history`. Fails with `InvalidState` if the
    /// session is terminal (history and state are immutable there).
    pub async fn append_turn(
        &self,
        session_id: Uuid,
        agent: &str,
        kind: &str,
        content: Value,
        processing_ms: Option<i64>,
        metadata: Option<Value>,
    ) -> FabricResult<()> {
        let session = self.require(session_id).await?;
        if matches!(session.status, SessionStatus::Completed | SessionStatus::Failed) {
            return Err(FabricError::InvalidState {
                entity: ENTITY,
                id: session_id.to_string(),
                from: session.status.to_string(),
                to: "append_turn".to_string(),
            });
        }

        let turn = Turn {
            agent: agent.to_string(),
            kind: kind.to_string(),
            content,
            ts: chrono::Utc::now(),
            processing_ms,
            metadata: metadata.unwrap_or_else(|| serde_json::json!({})),
        };

        sqlx::query(
            r#"
            UPDATE sessions
            SET history = history || $2::jsonb, updated_at = now()
            WHERE session_id = $1
            "#,
        )
        .bind(session_id)
        .bind(serde_json::to_value(vec![&turn])?)
        .execute(self.store.pool())
        .await
        .map_err(FabricError::classify)?;

        self.active_cache.invalidate(&session_id).await;
        Ok(())
    }

    async fn transition(
        &self,
        session_id: Uuid,
        allowed_from: &[SessionStatus],
        to: SessionStatus,
        extra_sql: &str,
    ) -> FabricResult<()> {
        let session = self.require(session_id).await?;
        if !allowed_from.contains(&session.status) {
            return Err(FabricError::InvalidState {
                entity: ENTITY,
                id: session_id.to_string(),
                from: session.status.to_string(),
                to: to.to_string(),
            });
        }

        let sql = format!(
            "UPDATE sessions SET status = $2, updated_at = now() {extra_sql} WHERE session_id = $1"
        );
        sqlx::query(&sql)
            .bind(session_id)
            .bind(to)
            .execute(self.store.pool())
            .await
            .map_err(FabricError::classify)?;

        self.active_cache.invalidate(&session_id).await;
        Ok(())
    }

    pub async fn pause(&self, session_id: Uuid) -> FabricResult<()> {
        self.transition(session_id, &[SessionStatus::Active], SessionStatus::Paused, "")
            .await
    }

    pub async fn resume(&self, session_id: Uuid) -> FabricResult<()> {
        self.transition(session_id, &[SessionStatus::Paused], SessionStatus::Active, "")
            .await
    }

    /// Terminal transition. Optionally records `outcome` under
    /// `metadata.outcome` and/or replaces `state` with `final_state`.
    pub async fn complete(
        &self,
        session_id: Uuid,
        outcome: Option<&str>,
        final_state: Option<Value>,
    ) -> FabricResult<()> {
        let session = self.require(session_id).await?;
        if !matches!(session.status, SessionStatus::Active | SessionStatus::Paused) {
            return Err(FabricError::InvalidState {
                entity: ENTITY,
                id: session_id.to_string(),
                from: session.status.to_string(),
                to: SessionStatus::Completed.to_string(),
            });
        }

        let mut metadata = session.metadata.clone();
        if let (Some(outcome), Value::Object(map)) = (outcome, &mut metadata) {
            map.insert("outcome".to_string(), Value::String(outcome.to_string()));
        }
        let state = final_state.unwrap_or(session.state.clone());

        sqlx::query(
            r#"
            UPDATE sessions
            SET status = 'completed', completed_at = now(), updated_at = now(),
                metadata = $2, state = $3
            WHERE session_id = $1
            "#,
        )
        .bind(session_id)
        .bind(&metadata)
        .bind(&state)
        .execute(self.store.pool())
        .await
        .map_err(FabricError::classify)?;

        self.active_cache.invalidate(&session_id).await;
        Ok(())
    }

    /// Terminal transition with an error. `details` merge into metadata
    /// under `error_details`.
    pub async fn fail(&self, session_id: Uuid, error: &str, details: Option<Value>) -> FabricResult<()> {
        let session = self.require(session_id).await?;
        if !matches!(session.status, SessionStatus::Active | SessionStatus::Paused) {
            return Err(FabricError::InvalidState {
                entity: ENTITY,
                id: session_id.to_string(),
                from: session.status.to_string(),
                to: SessionStatus::Failed.to_string(),
            });
        }

        let mut metadata = session.metadata.clone();
        if let Value::Object(map) = &mut metadata {
            map.insert("error".to_string(), Value::String(error.to_string()));
            if let Some(details) = details {
                map.insert("error_details".to_string(), details);
            }
        }

        sqlx::query(
            r#"
            UPDATE sessions
            SET status = 'failed', completed_at = now(), updated_at = now(), metadata = $2
            WHERE session_id = $1
            "#,
        )
        .bind(session_id)
        .bind(&metadata)
        .execute(self.store.pool())
        .await
        .map_err(FabricError::classify)?;

        self.active_cache.invalidate(&session_id).await;
        Ok(())
    }

    /// Transition `active|paused` sessions older than `max_age_hours` to
    /// `failed` with `metadata.cleanup_reason = "expired"`.
    pub async fn cleanup_expired(&self, max_age_hours: i64) -> FabricResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET status = 'failed', completed_at = now(), updated_at = now(),
                metadata = metadata || '{"cleanup_reason": "expired"}'::jsonb
            WHERE status IN ('active', 'paused')
              AND created_at < now() - ($1 || ' hours')::interval
            "#,
        )
        .bind(max_age_hours)
        .execute(self.store.pool())
        .await
        .map_err(FabricError::classify)?;

        self.active_cache.invalidate_all();
        Ok(result.rows_affected())
    }

    pub async fn list_active_for_user(&self, user_id: &str) -> FabricResult<Vec<Session>> {
        let rows = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT session_id, user_id, agents, state, history, metadata, status,
                   created_at, updated_at, completed_at
            FROM sessions
            WHERE user_id = $1 AND status IN ('active', 'paused')
            ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(self.store.pool())
        .await
        .map_err(FabricError::classify)?;
        Ok(rows.into_iter().map(Session::from).collect())
    }

    pub async fn summarize(&self, filter: &SessionFilter) -> FabricResult<Vec<SessionSummary>> {
        let rows = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT session_id, user_id, agents, state, history, metadata, status,
                   created_at, updated_at, completed_at
            FROM sessions
            WHERE ($1::text IS NULL OR user_id = $1)
              AND ($2::session_status IS NULL OR status = $2)
              AND ($3::timestamptz IS NULL OR created_at >= $3)
              AND ($4::timestamptz IS NULL OR created_at <= $4)
            ORDER BY created_at DESC
            "#,
        )
        .bind(&filter.user_id)
        .bind(filter.status)
        .bind(filter.since)
        .bind(filter.until)
        .fetch_all(self.store.pool())
        .await
        .map_err(FabricError::classify)?;

        Ok(rows
            .into_iter()
            .map(|r| {
                let history: Vec<Turn> = serde_json::from_value(r.history).unwrap_or_default();
                SessionSummary {
                    session_id: r.session_id,
                    user_id: r.user_id,
                    status: r.status,
                    turn_count: history.len(),
                    created_at: r.created_at,
                }
            })
            .collect())
    }

    /// Full-text search via substring match over the serialized history.
    pub async fn search_history(&self, needle: &str, limit: i64) -> FabricResult<Vec<Uuid>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT session_id FROM sessions
            WHERE history::text ILIKE '%' || $1 || '%'
            ORDER BY updated_at DESC
            LIMIT $2
            "#,
        )
        .bind(needle)
        .bind(limit)
        .fetch_all(self.store.pool())
        .await
        .map_err(FabricError::classify)?;
        Ok(ids)
    }
}
