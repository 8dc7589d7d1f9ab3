//! # Fabric Configuration
//!
//! Layered configuration: built-in defaults, an optional TOML file, then
//! `FABRIC_*` environment variables, using the `config` crate. Programmatic
//! construction is also supported — every field has a setter so embedding
//! code never has to round-trip through environment variables just to
//! configure the fabric in-process (e.g. in tests).

use serde::{Deserialize, Serialize};

/// Recognized configuration for the coordination fabric.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    /// Max concurrent pool connections.
    pub pool_size: u32,
    pub tls_disabled: bool,
    /// Cache cleanup sweep period, in seconds.
    pub cleanup_interval_s: u64,
    /// Task retry backoff schedule, in seconds, indexed by `retry_count`
    /// (clamped to the last entry once retry_count exceeds its length).
    pub retry_backoff_seconds: Vec<u64>,
    pub poll_base_interval_s: u64,
    pub poll_max_interval_s: u64,
    pub poll_backoff_factor: f64,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: String::new(),
            database: "coord_fabric".to_string(),
            pool_size: 10,
            tls_disabled: false,
            cleanup_interval_s: 3600,
            retry_backoff_seconds: vec![1, 5, 15, 60, 300],
            poll_base_interval_s: 5,
            poll_max_interval_s: 60,
            poll_backoff_factor: 1.5,
        }
    }
}

impl FabricConfig {
    /// Load configuration from defaults, an optional `fabric.toml` in the
    /// current directory, and `FABRIC_*` environment variables, in that
    /// order of increasing precedence.
    pub fn from_env() -> Result<Self, crate::errors::FabricError> {
        let _ = dotenvy::dotenv();

        let defaults = FabricConfig::default();
        let builder = config::Config::builder()
            .set_default("host", defaults.host.clone())
            .map_err(cfg_err)?
            .set_default("port", defaults.port as i64)
            .map_err(cfg_err)?
            .set_default("user", defaults.user.clone())
            .map_err(cfg_err)?
            .set_default("password", defaults.password.clone())
            .map_err(cfg_err)?
            .set_default("database", defaults.database.clone())
            .map_err(cfg_err)?
            .set_default("pool_size", defaults.pool_size as i64)
            .map_err(cfg_err)?
            .set_default("tls_disabled", defaults.tls_disabled)
            .map_err(cfg_err)?
            .set_default("cleanup_interval_s", defaults.cleanup_interval_s as i64)
            .map_err(cfg_err)?
            .set_default("poll_base_interval_s", defaults.poll_base_interval_s as i64)
            .map_err(cfg_err)?
            .set_default("poll_max_interval_s", defaults.poll_max_interval_s as i64)
            .map_err(cfg_err)?
            .set_default("poll_backoff_factor", defaults.poll_backoff_factor)
            .map_err(cfg_err)?
            .add_source(config::File::with_name("fabric").required(false))
            .add_source(config::Environment::with_prefix("FABRIC").separator("_"));

        let built = builder.build().map_err(cfg_err)?;

        let host = built.get_string("host").map_err(cfg_err)?;
        let port = built.get_int("port").map_err(cfg_err)? as u16;
        let user = built.get_string("user").map_err(cfg_err)?;
        let password = built.get_string("password").unwrap_or_default();
        let database = built.get_string("database").map_err(cfg_err)?;
        let pool_size = built.get_int("pool_size").map_err(cfg_err)? as u32;
        let tls_disabled = built.get_bool("tls_disabled").unwrap_or(false);
        let cleanup_interval_s = built.get_int("cleanup_interval_s").map_err(cfg_err)? as u64;
        let poll_base_interval_s =
            built.get_int("poll_base_interval_s").map_err(cfg_err)? as u64;
        let poll_max_interval_s = built.get_int("poll_max_interval_s").map_err(cfg_err)? as u64;
        let poll_backoff_factor = built.get_float("poll_backoff_factor").map_err(cfg_err)?;

        // `retry_backoff_seconds` is a list; config-rs has no typed getter
        // for primitive vecs across all sources uniformly, so fall back to
        // the default unless explicitly overridden via env as CSV.
        let retry_backoff_seconds = std::env::var("FABRIC_RETRY_BACKOFF_SECONDS")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .filter_map(|s| s.trim().parse::<u64>().ok())
                    .collect::<Vec<_>>()
            })
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.retry_backoff_seconds);

        Ok(FabricConfig {
            host,
            port,
            user,
            password,
            database,
            pool_size,
            tls_disabled,
            cleanup_interval_s,
            retry_backoff_seconds,
            poll_base_interval_s,
            poll_max_interval_s,
            poll_backoff_factor,
        })
    }

    /// Build a `postgres://` connection string from this configuration.
    pub fn connection_string(&self) -> String {
        let sslmode = if self.tls_disabled { "disable" } else { "prefer" };
        format!(
            "postgres://{user}:{password}@{host}:{port}/{database}?sslmode={sslmode}",
            user = self.user,
            password = self.password,
            host = self.host,
            port = self.port,
            database = self.database,
        )
    }

    /// Backoff delay, in seconds, for the given `retry_count`, clamped to
    /// `min(retry_count, len(backoff) - 1)`.
    pub fn backoff_for(&self, retry_count: u32) -> u64 {
        let idx = (retry_count as usize).min(self.retry_backoff_seconds.len() - 1);
        self.retry_backoff_seconds[idx]
    }
}

fn cfg_err(e: config::ConfigError) -> crate::errors::FabricError {
    crate::errors::FabricError::Fatal(format!("configuration error: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = FabricConfig::default();
        assert_eq!(c.pool_size, 10);
        assert_eq!(c.cleanup_interval_s, 3600);
        assert_eq!(c.retry_backoff_seconds, vec![1, 5, 15, 60, 300]);
        assert_eq!(c.poll_base_interval_s, 5);
        assert_eq!(c.poll_max_interval_s, 60);
        assert!((c.poll_backoff_factor - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn backoff_clamps_to_last_entry() {
        let c = FabricConfig::default();
        assert_eq!(c.backoff_for(0), 1);
        assert_eq!(c.backoff_for(1), 5);
        assert_eq!(c.backoff_for(4), 300);
        assert_eq!(c.backoff_for(100), 300);
    }

    #[test]
    fn connection_string_includes_sslmode() {
        let c = FabricConfig::default();
        assert!(c.connection_string().contains("sslmode=prefer"));
        let mut c2 = c.clone();
        c2.tls_disabled = true;
        assert!(c2.connection_string().contains("sslmode=disable"));
    }
}
