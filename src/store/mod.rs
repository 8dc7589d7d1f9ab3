//! # Store Gateway (C1)
//!
//! Pooled Postgres access with retry-with-backoff on transient faults and
//! best-effort operation logging. Every other component holds an
//! `Arc<StoreGateway>` and goes through `pool()` for its queries; the
//! retry/backoff wrapper here is reserved for call sites that want it
//! explicitly (connection acquisition, health checks) since most component
//! queries use `sqlx`'s pool directly and rely on `FabricError::classify`
//! to surface the right kind.

mod ops_log;

pub use ops_log::OperationLogEntry;

use crate::config::FabricConfig;
use crate::errors::{FabricError, FabricResult};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const MAX_RETRY_ATTEMPTS: u32 = 3;
const MIN_BACKOFF: Duration = Duration::from_secs(4);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Result of a health probe, the shape the Coordination Hub returns from
/// `health_check()`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub response_time_ms: u64,
    pub pool_name: String,
    pub pool_size: u32,
    pub ts: chrono::DateTime<chrono::Utc>,
}

/// Pooled connection gateway. Cheap to clone (wraps an `sqlx::PgPool`,
/// itself an `Arc` internally).
#[derive(Debug, Clone)]
pub struct StoreGateway {
    pool: PgPool,
    pool_size: u32,
    database: String,
}

impl StoreGateway {
    /// Build a connection pool from configuration and run pending
    /// migrations. Misconfiguration (bad DSN, unreachable host after
    /// retries) is a `Fatal` error — this runs once at startup.
    pub async fn connect(config: &FabricConfig) -> FabricResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&config.connection_string())
            .await
            .map_err(|e| FabricError::Fatal(format!("failed to connect to store: {e}")))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| FabricError::Fatal(format!("migration failed: {e}")))?;

        Ok(Self {
            pool,
            pool_size: config.pool_size,
            database: config.database.clone(),
        })
    }

    /// Construct directly from an already-open pool (used by tests that
    /// manage their own schema/pool lifecycle).
    pub fn from_pool(pool: PgPool, database: impl Into<String>) -> Self {
        let pool_size = pool.options().get_max_connections();
        Self {
            pool,
            pool_size,
            database: database.into(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run `op` with retry-with-backoff on transient faults (connection
    /// reset, pool timeout). Up to `MAX_RETRY_ATTEMPTS` attempts,
    /// exponential backoff between `MIN_BACKOFF` and `MAX_BACKOFF` with
    /// up to 20% jitter so concurrently-retrying callers don't all wake
    /// on the same tick. Non-transient faults are returned immediately.
    pub async fn with_retry<T, F, Fut>(&self, mut op: F) -> FabricResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, sqlx::Error>>,
    {
        let mut attempt = 0u32;
        let mut backoff = MIN_BACKOFF;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    let classified = FabricError::classify(e);
                    attempt += 1;
                    if !classified.is_transient() || attempt >= MAX_RETRY_ATTEMPTS {
                        return Err(classified);
                    }
                    let jitter = 1.0 + fastrand::f64() * 0.2;
                    let sleep_for = backoff.mul_f64(jitter);
                    warn!(attempt, backoff_ms = sleep_for.as_millis() as u64, "retrying transient store error");
                    tokio::time::sleep(sleep_for).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    /// Best-effort audit write. Never propagates failure to the caller;
    /// logs via `tracing::warn!` instead so a broken audit path can never
    /// poison the caller's critical path.
    pub async fn log_operation(&self, entry: OperationLogEntry) {
        if let Err(e) = entry.persist(&self.pool).await {
            warn!(error = %e, agent = %entry.agent, op_type = %entry.op_type, "ops_log write failed");
        }
    }

    /// Trivial probe query used by the Coordination Hub's health check.
    pub async fn health_check(&self) -> HealthStatus {
        let start = Instant::now();
        let status = match sqlx::query("SELECT 1").execute(&self.pool).await {
            Ok(_) => "healthy",
            Err(e) => {
                debug!(error = %e, "health check query failed");
                "unhealthy"
            }
        };
        HealthStatus {
            status: status.to_string(),
            response_time_ms: start.elapsed().as_millis() as u64,
            pool_name: self.database.clone(),
            pool_size: self.pool_size,
            ts: chrono::Utc::now(),
        }
    }
}
