//! Pool construction and schema migrations for the instance store.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use crate::DbError;

/// Type alias for the shared Postgres pool used by the instance store.
pub type DbPool = PgPool;

/// Connect to `database_url` with at most `max_connections` connections.
/// Callers waiting longer than `acquire_timeout` for a connection get an error.
pub async fn create_pool(
    database_url: &str,
    max_connections: u32,
    acquire_timeout: Duration,
) -> Result<DbPool, DbError> {
    info!(
        "Connecting to workflow store (max_connections={}, acquire_timeout={:?})",
        max_connections, acquire_timeout
    );
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(acquire_timeout)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Bring the schema up to date using the SQL files under the workspace
/// `migrations/` directory, embedded at compile time.
pub async fn run_migrations(pool: &DbPool) -> Result<(), DbError> {
    info!("Applying workflow store migrations");
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}
