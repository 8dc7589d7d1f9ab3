//! Best-effort operation audit log. Never read by the core; written
//! non-fatally by every other component via `StoreGateway::log_operation`.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;

/// One row destined for `ops_log`.
#[derive(Debug, Clone)]
pub struct OperationLogEntry {
    pub agent: String,
    pub op_type: String,
    pub op_data: Value,
    pub duration_ms: Option<i64>,
    pub success: bool,
    pub error: Option<String>,
}

impl OperationLogEntry {
    pub fn success(agent: impl Into<String>, op_type: impl Into<String>, op_data: Value) -> Self {
        Self {
            agent: agent.into(),
            op_type: op_type.into(),
            op_data,
            duration_ms: None,
            success: true,
            error: None,
        }
    }

    pub fn failure(
        agent: impl Into<String>,
        op_type: impl Into<String>,
        op_data: Value,
        error: impl Into<String>,
    ) -> Self {
        Self {
            agent: agent.into(),
            op_type: op_type.into(),
            op_data,
            duration_ms: None,
            success: false,
            error: Some(error.into()),
        }
    }

    pub fn with_duration(mut self, duration_ms: i64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub(crate) async fn persist(&self, pool: &PgPool) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO ops_log (ts, agent, op_type, op_data, duration_ms, success, error)
            VALUES (now(), $1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&self.agent)
        .bind(&self.op_type)
        .bind(&self.op_data)
        .bind(self.duration_ms)
        .bind(self.success)
        .bind(&self.error)
        .execute(pool)
        .await?;
        Ok(())
    }
}

/// Row shape for reads (never used by the core, kept for operator tooling
/// that reads the log out-of-band).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OperationLogRow {
    pub ts: DateTime<Utc>,
    pub agent: String,
    pub op_type: String,
    pub op_data: Value,
    pub duration_ms: Option<i64>,
    pub success: bool,
    pub error: Option<String>,
}
