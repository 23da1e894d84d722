//! PostgreSQL connection pool.

use sqlx::postgres::PgPoolOptions;
use std::time::Duration;

pub type DbPool = sqlx::PgPool;

/// Connect to PostgreSQL. `acquire_timeout` should not exceed the per-call storage timeout,
/// otherwise a saturated pool shows up as a timeout instead of a pool error.
pub async fn create_pool(database_url: &str, acquire_timeout: Duration) -> Result<DbPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(acquire_timeout.min(Duration::from_secs(5)))
        .connect(database_url)
        .await
}
