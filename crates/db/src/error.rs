//! Typed error type for the db crate.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// The store did not answer within its per-call budget.
    #[error("database call timed out after {0:?}")]
    Timeout(Duration),

    /// A stored row could not be mapped back to a domain value.
    #[error("invalid row: {0}")]
    InvalidRow(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The store refused the call (e.g. it is shutting down or unreachable).
    #[error("store unavailable: {0}")]
    Unavailable(String),
}
