//! # Result Cache (C3)
//!
//! TTL-indexed key -> value store with access counters, pattern
//! invalidation, and a scheduled cleanup sweep owned by the Coordination
//! Hub. Namespacing is the caller's concern: a supplied namespace is
//! prefixed verbatim as `ns:key` and never interpreted here.

use crate::errors::{FabricError, FabricResult};
use crate::store::{OperationLogEntry, StoreGateway};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Live, process-local hit/miss counters backing the advisory `hit_rate`
/// field in `stats()`. Reset on process restart; computed from real
/// traffic rather than reported as a constant.
#[derive(Debug, Default)]
struct HitCounters {
    hits: AtomicU64,
    misses: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub total_entries: i64,
    pub live_entries: i64,
    pub expired_entries: i64,
    pub hit_rate: f64,
}

#[derive(Debug, Clone)]
pub struct ResultCache {
    store: Arc<StoreGateway>,
    counters: Arc<HitCounters>,
}

fn namespaced(namespace: Option<&str>, key: &str) -> String {
    match namespace {
        Some(ns) => format!("{ns}:{key}"),
        None => key.to_string(),
    }
}

impl ResultCache {
    pub fn new(store: Arc<StoreGateway>) -> Self {
        Self {
            store,
            counters: Arc::new(HitCounters::default()),
        }
    }

    /// Upsert: on key collision, overwrite `value`/`kind`/`expires_at`,
    /// increment `access_count`, and refresh `last_accessed`.
    pub async fn set(
        &self,
        key: &str,
        value: Value,
        ttl: Duration,
        agent: &str,
        kind: Option<&str>,
        namespace: Option<&str>,
    ) -> FabricResult<()> {
        let key = namespaced(namespace, key);
        let expires_at = chrono::Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default();

        sqlx::query(
            r#"
            INSERT INTO cache (key, agent, value, kind, expires_at, created_at, access_count, last_accessed)
            VALUES ($1, $2, $3, $4, $5, now(), 0, now())
            ON CONFLICT (key) DO UPDATE SET
                value = EXCLUDED.value,
                kind = EXCLUDED.kind,
                expires_at = EXCLUDED.expires_at,
                access_count = cache.access_count + 1,
                last_accessed = now()
            "#,
        )
        .bind(&key)
        .bind(agent)
        .bind(&value)
        .bind(kind)
        .bind(expires_at)
        .execute(self.store.pool())
        .await
        .map_err(FabricError::classify)?;

        self.store
            .log_operation(OperationLogEntry::success(
                agent,
                "cache_set",
                serde_json::json!({"key": key}),
            ))
            .await;
        Ok(())
    }

    /// Returns the value iff `expires_at > now`, bumping `access_count`
    /// and `last_accessed` on hit. A miss never writes.
    pub async fn get(
        &self,
        key: &str,
        agent: &str,
        namespace: Option<&str>,
    ) -> FabricResult<Option<Value>> {
        let key = namespaced(namespace, key);

        let row: Option<(Value,)> = sqlx::query_as(
            r#"
            UPDATE cache
            SET access_count = access_count + 1, last_accessed = now()
            WHERE key = $1 AND expires_at > now()
            RETURNING value
            "#,
        )
        .bind(&key)
        .fetch_optional(self.store.pool())
        .await
        .map_err(FabricError::classify)?;

        match row {
            Some((value,)) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                let _ = agent;
                Ok(Some(value))
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    /// Wildcard delete by SQL-LIKE syntax against `key`.
    pub async fn invalidate(&self, pattern: &str, agent: &str) -> FabricResult<u64> {
        let result = sqlx::query("DELETE FROM cache WHERE key LIKE $1")
            .bind(pattern)
            .execute(self.store.pool())
            .await
            .map_err(FabricError::classify)?;
        let count = result.rows_affected();
        self.store
            .log_operation(OperationLogEntry::success(
                agent,
                "cache_invalidate",
                serde_json::json!({"pattern": pattern, "count": count}),
            ))
            .await;
        Ok(count)
    }

    pub async fn invalidate_by_agent(&self, agent: &str) -> FabricResult<u64> {
        let result = sqlx::query("DELETE FROM cache WHERE agent = $1")
            .bind(agent)
            .execute(self.store.pool())
            .await
            .map_err(FabricError::classify)?;
        Ok(result.rows_affected())
    }

    pub async fn invalidate_by_kind(&self, kind: &str) -> FabricResult<u64> {
        let result = sqlx::query("DELETE FROM cache WHERE kind = $1")
            .bind(kind)
            .execute(self.store.pool())
            .await
            .map_err(FabricError::classify)?;
        Ok(result.rows_affected())
    }

    /// Extend the TTL by `delta_seconds`, only if the entry is still live.
    pub async fn extend_ttl(&self, key: &str, delta_seconds: i64, namespace: Option<&str>) -> FabricResult<bool> {
        let key = namespaced(namespace, key);
        let result = sqlx::query(
            r#"
            UPDATE cache
            SET expires_at = expires_at + ($2 || ' seconds')::interval
            WHERE key = $1 AND expires_at > now()
            "#,
        )
        .bind(&key)
        .bind(delta_seconds)
        .execute(self.store.pool())
        .await
        .map_err(FabricError::classify)?;
        Ok(result.rows_affected() == 1)
    }

    /// Physical delete of expired rows. Called by the cleanup scheduler
    /// the Coordination Hub starts, and directly by tests/operators.
    pub async fn cleanup_expired(&self) -> FabricResult<u64> {
        let result = sqlx::query("DELETE FROM cache WHERE expires_at <= now()")
            .execute(self.store.pool())
            .await
            .map_err(FabricError::classify)?;
        Ok(result.rows_affected())
    }

    pub async fn stats(&self) -> FabricResult<CacheStats> {
        let (total, live): (i64, i64) = sqlx::query_as(
            r#"
            SELECT count(*), count(*) FILTER (WHERE expires_at > now())
            FROM cache
            "#,
        )
        .fetch_one(self.store.pool())
        .await
        .map_err(FabricError::classify)?;

        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let hit_rate = if hits + misses == 0 {
            0.0
        } else {
            hits as f64 / (hits + misses) as f64
        };

        Ok(CacheStats {
            total_entries: total,
            live_entries: live,
            expired_entries: total - live,
            hit_rate,
        })
    }

    /// Background cleanup loop: sweeps every `interval`, sleeping 60s and
    /// retrying on failure instead of giving up, until `stop` fires.
    pub async fn run_cleanup_loop(
        self: Arc<Self>,
        interval: Duration,
        mut stop: tokio::sync::watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = stop.changed() => {
                    if *stop.borrow() {
                        return;
                    }
                    continue;
                }
            }

            match self.cleanup_expired().await {
                Ok(n) => {
                    if n > 0 {
                        tracing::debug!(deleted = n, "cache cleanup swept expired entries");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "cache cleanup failed, retrying in 60s");
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(60)) => {}
                        _ = stop.changed() => {
                            if *stop.borrow() {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }
}
