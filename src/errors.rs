//! # Fabric Error Types
//!
//! Unified error handling for the coordination fabric. Every store-touching
//! operation returns `FabricResult<T>`; `sqlx::Error` is classified into the
//! taxonomy kinds at the boundary so callers can match on intent
//! (`Transient`, `Integrity`, `NotFound`, ...) instead of driver internals.

use thiserror::Error;

/// Fabric operation result type.
pub type FabricResult<T> = Result<T, FabricError>;

/// Taxonomy of fabric errors: a small set of semantic kinds every caller
/// can match on regardless of which store-touching operation raised it.
#[derive(Debug, Error)]
pub enum FabricError {
    /// Connection reset, pool exhaustion, or timeout. Retried internally by
    /// the store gateway up to its retry budget before surfacing here.
    #[error("transient store error: {0}")]
    Transient(String),

    /// Duplicate key or foreign-key violation.
    #[error("integrity violation: {0}")]
    Integrity(String),

    /// The referenced entity does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// The requested lifecycle transition is not legal from the current
    /// state. No side effect occurs when this is returned.
    #[error("invalid state transition for {entity} {id}: {from} -> {to}")]
    InvalidState {
        entity: &'static str,
        id: String,
        from: String,
        to: String,
    },

    /// A caller-registered handler (task handler, poll handler,
    /// notification callback) failed.
    #[error("handler failed: {0}")]
    HandlerFailure(String),

    /// Misconfiguration or schema mismatch. Surfaced at `start()`, never
    /// mid-operation.
    #[error("fatal configuration error: {0}")]
    Fatal(String),

    /// Unclassified database error, already carrying its own kind via
    /// `#[source]` once it passes through `classify`.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FabricError {
    /// Classify a raw `sqlx::Error` into the fabric's error taxonomy.
    ///
    /// Connection resets and pool exhaustion become `Transient`;
    /// constraint violations become `Integrity`; everything else is left
    /// as `Database` so callers still see the underlying driver error.
    pub fn classify(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                FabricError::Transient(err.to_string())
            }
            sqlx::Error::Database(db_err) => {
                if db_err.is_unique_violation() || db_err.is_foreign_key_violation() {
                    FabricError::Integrity(err.to_string())
                } else if db_err
                    .code()
                    .is_some_and(|c| c.as_ref().starts_with("08"))
                {
                    // SQLSTATE class 08: connection exception
                    FabricError::Transient(err.to_string())
                } else {
                    FabricError::Database(err)
                }
            }
            sqlx::Error::RowNotFound => FabricError::NotFound {
                entity: "row",
                id: "<unknown>".to_string(),
            },
            _ => FabricError::Database(err),
        }
    }

    /// True when the error is worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, FabricError::Transient(_))
    }
}
