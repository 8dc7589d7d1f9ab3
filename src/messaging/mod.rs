//! # Message Bus (C2)
//!
//! Durable per-channel publish/poll with optional unicast recipient,
//! priority ordering, and a single-winner processed transition. Poll is
//! read-only: it never leases or locks, so concurrent pollers may observe
//! the same unprocessed message. The conditional `ack` update is the only
//! primitive that decides a winner.

mod models;

pub use models::Message;

use crate::errors::{FabricError, FabricResult};
use crate::store::{OperationLogEntry, StoreGateway};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

const DEFAULT_PRIORITY: i16 = 5;

/// Durable, per-channel message bus.
#[derive(Debug, Clone)]
pub struct MessageBus {
    store: Arc<StoreGateway>,
}

impl MessageBus {
    pub fn new(store: Arc<StoreGateway>) -> Self {
        Self { store }
    }

    /// Insert one message row and return its assigned id. Priority is an
    /// integer 1-10 where lower is more urgent; out-of-range values are
    /// clamped rather than rejected, since the column itself enforces the
    /// bound and a clamp is friendlier to callers than a round-trip error.
    pub async fn publish(
        &self,
        channel: &str,
        sender: &str,
        payload: Value,
        recipient: Option<&str>,
        priority: Option<i16>,
    ) -> FabricResult<i64> {
        let priority = priority.unwrap_or(DEFAULT_PRIORITY).clamp(1, 10);
        let start = Instant::now();

        let result = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO messages (channel, sender, recipient, payload, priority)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(channel)
        .bind(sender)
        .bind(recipient)
        .bind(&payload)
        .bind(priority)
        .fetch_one(self.store.pool())
        .await;

        let op_data = serde_json::json!({"channel": channel, "recipient": recipient, "priority": priority});
        match result {
            Ok(id) => {
                self.store
                    .log_operation(
                        OperationLogEntry::success(sender, "publish", op_data)
                            .with_duration(start.elapsed().as_millis() as i64),
                    )
                    .await;
                info!(channel, id, priority, "published message");
                Ok(id)
            }
            Err(e) => {
                let classified = FabricError::classify(e);
                self.store
                    .log_operation(OperationLogEntry::failure(
                        sender,
                        "publish",
                        op_data,
                        classified.to_string(),
                    ))
                    .await;
                Err(classified)
            }
        }
    }

    /// Return up to `limit` messages for `channel` addressed to `agent`
    /// (broadcast or unicast), ordered `(priority ASC, created_at ASC, id
    /// ASC)`. Read-only: never mutates `processed`.
    pub async fn poll(
        &self,
        channel: &str,
        agent: &str,
        limit: i64,
        include_processed: bool,
    ) -> FabricResult<Vec<Message>> {
        let rows = sqlx::query_as::<_, Message>(
            r#"
            SELECT id, channel, sender, recipient, payload, priority,
                   created_at, processed, processed_at, processed_by
            FROM messages
            WHERE channel = $1
              AND (recipient IS NULL OR recipient = $2)
              AND (processed = false OR $3)
            ORDER BY priority ASC, created_at ASC, id ASC
            LIMIT $4
            "#,
        )
        .bind(channel)
        .bind(agent)
        .bind(include_processed)
        .bind(limit)
        .fetch_all(self.store.pool())
        .await
        .map_err(FabricError::classify)?;

        Ok(rows)
    }

    /// Conditional update: `processed=true` iff currently `false`. Returns
    /// true iff this call was the winner, giving at-most-one acknowledger
    /// per message under concurrent pollers.
    pub async fn ack(&self, message_id: i64, agent: &str) -> FabricResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET processed = true, processed_at = now(), processed_by = $2
            WHERE id = $1 AND processed = false
            "#,
        )
        .bind(message_id)
        .bind(agent)
        .execute(self.store.pool())
        .await
        .map_err(FabricError::classify)?;

        let won = result.rows_affected() == 1;
        debug!(message_id, agent, won, "ack attempt");
        self.store
            .log_operation(OperationLogEntry::success(
                agent,
                "ack",
                serde_json::json!({"message_id": message_id, "won": won}),
            ))
            .await;
        Ok(won)
    }

    /// Best-effort unprocessed counter for gauges.
    pub async fn unprocessed_count(&self, channel: &str, agent: &str) -> FabricResult<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT count(*) FROM messages
            WHERE channel = $1 AND processed = false
              AND (recipient IS NULL OR recipient = $2)
            "#,
        )
        .bind(channel)
        .bind(agent)
        .fetch_one(self.store.pool())
        .await
        .map_err(FabricError::classify)?;
        Ok(count)
    }
}
