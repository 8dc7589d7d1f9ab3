//! # Subscription / Notification Service (C6)
//!
//! In-process subscriber registry keyed by channel, with ALL/DIRECT/PATTERN
//! fan-out modes. Subscriptions are persisted so they survive restart, but
//! fan-out itself only ever reaches in-process subscribers — there is no
//! cross-process delivery mechanism, a deliberate limitation (see
//! DESIGN.md). A rehydrated subscription has no callback until its
//! owning agent calls
//! `subscribe()` again in the new process.

use crate::errors::{FabricError, FabricResult};
use crate::store::StoreGateway;
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "subscription_kind", rename_all = "UPPERCASE")]
pub enum SubscriptionKind {
    All,
    Direct,
    Pattern,
}

pub type Callback = Arc<dyn Fn(&str, &Value) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Clone)]
struct Subscriber {
    agent: String,
    kind: SubscriptionKind,
    pattern: Option<String>,
    callback: Option<Callback>,
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("agent", &self.agent)
            .field("kind", &self.kind)
            .field("pattern", &self.pattern)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct SubscriptionRow {
    agent: String,
    channel: String,
    kind: SubscriptionKind,
    pattern: Option<String>,
}

pub type EventHandler = Arc<dyn Fn(&str, &Value) -> BoxFuture<'static, ()> + Send + Sync>;

/// In-process registry, persisted for restart survival.
#[derive(Clone)]
pub struct NotificationService {
    store: Arc<StoreGateway>,
    registry: Arc<DashMap<String, Vec<Subscriber>>>,
    event_handlers: Arc<DashMap<String, Vec<EventHandler>>>,
}

impl std::fmt::Debug for NotificationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationService")
            .field("channels", &self.registry.len())
            .finish()
    }
}

impl NotificationService {
    pub fn new(store: Arc<StoreGateway>) -> Self {
        Self {
            store,
            registry: Arc::new(DashMap::new()),
            event_handlers: Arc::new(DashMap::new()),
        }
    }

    /// Register a handler that runs for every `notify` call carrying this
    /// `event_kind`, before subscriber fan-out.
    pub fn on_event(&self, event_kind: &str, handler: EventHandler) {
        self.event_handlers
            .entry(event_kind.to_string())
            .or_default()
            .push(handler);
    }

    /// Persist the `(agent, channel)` subscription (upsert) and register
    /// it, with a live callback, in the in-process registry.
    pub async fn subscribe(
        &self,
        agent: &str,
        channel: &str,
        kind: SubscriptionKind,
        pattern: Option<String>,
        callback: Callback,
    ) -> FabricResult<()> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions (agent, channel, kind, pattern)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (agent, channel) DO UPDATE SET kind = EXCLUDED.kind, pattern = EXCLUDED.pattern
            "#,
        )
        .bind(agent)
        .bind(channel)
        .bind(kind)
        .bind(&pattern)
        .execute(self.store.pool())
        .await
        .map_err(FabricError::classify)?;

        self.register_in_process(agent, channel, kind, pattern, Some(callback));
        Ok(())
    }

    pub async fn unsubscribe(&self, agent: &str, channel: &str) -> FabricResult<()> {
        sqlx::query("DELETE FROM subscriptions WHERE agent = $1 AND channel = $2")
            .bind(agent)
            .bind(channel)
            .execute(self.store.pool())
            .await
            .map_err(FabricError::classify)?;

        if let Some(mut subs) = self.registry.get_mut(channel) {
            subs.retain(|s| s.agent != agent);
        }
        Ok(())
    }

    fn register_in_process(
        &self,
        agent: &str,
        channel: &str,
        kind: SubscriptionKind,
        pattern: Option<String>,
        callback: Option<Callback>,
    ) {
        let subscriber = Subscriber {
            agent: agent.to_string(),
            kind,
            pattern,
            callback,
        };
        let mut subs = self.registry.entry(channel.to_string()).or_default();
        subs.retain(|s| s.agent != agent);
        subs.push(subscriber);
    }

    /// Load all persisted subscriptions into the in-process registry at
    /// startup. Rehydrated entries have no callback.
    pub async fn rehydrate(&self) -> FabricResult<usize> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as("SELECT agent, channel, kind, pattern FROM subscriptions")
            .fetch_all(self.store.pool())
            .await
            .map_err(FabricError::classify)?;

        let count = rows.len();
        for row in rows {
            self.register_in_process(&row.agent, &row.channel, row.kind, row.pattern, None);
        }
        debug!(count, "rehydrated subscriptions from store");
        Ok(count)
    }

    /// Evaluate predicates synchronously and invoke matching callbacks.
    /// All callbacks complete before this returns; failures are isolated
    /// (logged, never propagated).
    pub async fn notify(&self, channel: &str, event_kind: &str, data: Value, source: Option<&str>) -> usize {
        let _ = source;

        if let Some(handlers) = self.event_handlers.get(event_kind) {
            for handler in handlers.clone() {
                handler(event_kind, &data).await;
            }
        }

        let subscribers = match self.registry.get(channel) {
            Some(subs) => subs.clone(),
            None => return 0,
        };

        let mut fanout = 0usize;
        for sub in subscribers {
            if !matches(&sub, &data) {
                continue;
            }
            fanout += 1;
            if let Some(callback) = &sub.callback {
                callback(event_kind, &data).await;
            }
        }
        fanout
    }
}

fn matches(sub: &Subscriber, data: &Value) -> bool {
    match sub.kind {
        SubscriptionKind::All => true,
        SubscriptionKind::Direct => data
            .get("recipient")
            .and_then(|v| v.as_str())
            .is_some_and(|r| r == sub.agent),
        SubscriptionKind::Pattern => {
            let Some(pattern) = &sub.pattern else {
                warn!(agent = %sub.agent, "PATTERN subscription with no pattern configured");
                return false;
            };
            data.to_string().contains(pattern.as_str())
        }
    }
}
