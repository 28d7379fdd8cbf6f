use crate::errors::{Error, Result};
use crate::metrics::DB_FAILURES_TOTAL;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use tracing::{error, info, warn};

/// Opens the coordinator database and brings the schema up to date.
pub async fn make_pool(database_url: &str, max_connections: u32) -> Result<SqlitePool> {
    info!("Opening database...");
    let pool = connect(database_url, max_connections).await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

/// Opens a pool without touching the schema. Used for the external record store.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Single-connection in-memory database with the full schema.
///
/// The connection is never recycled, otherwise the database would vanish with it.
pub async fn memory_pool() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}

/// Runs `op` again on transient store failures, with exponential backoff.
pub async fn retry_transient<T, F, Fut>(label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempts = 0;
    let max_attempts = 5;

    loop {
        attempts += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempts >= max_attempts || !is_retryable(&e) {
                    error!(
                        "{} failed permanently after {} attempts: {}",
                        label, attempts, e
                    );
                    return Err(e);
                }

                let wait_ms = 100 * 2_u64.pow(attempts - 1).min(32);
                warn!(
                    "{} failed (attempt {}/{}), retrying in {}ms: {}",
                    label, attempts, max_attempts, wait_ms, e
                );
                DB_FAILURES_TOTAL.inc();
                tokio::time::sleep(Duration::from_millis(wait_ms)).await;
            }
        }
    }
}

/// Whether a device or caller should simply try again later.
pub fn is_retryable(err: &Error) -> bool {
    match err {
        Error::Database(db_err) => is_transient_error(db_err),
        _ => false,
    }
}

pub fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => {
            // SQLite result codes, extended codes included
            db_err.code().is_some_and(|code| {
                code == "5" || // SQLITE_BUSY
                code == "6" || // SQLITE_LOCKED
                code == "261" || // SQLITE_BUSY_RECOVERY
                code == "262" || // SQLITE_LOCKED_SHAREDCACHE
                code == "517" // SQLITE_BUSY_SNAPSHOT
            })
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_memory_pool_has_schema() {
        let pool = memory_pool().await.unwrap();
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM devices")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_retry_gives_up_on_permanent_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_transient("test op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Validation("bad".to_string())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pool_timeout_is_transient() {
        assert!(is_transient_error(&sqlx::Error::PoolTimedOut));
        assert!(!is_transient_error(&sqlx::Error::RowNotFound));
        assert!(!is_retryable(&Error::Validation("x".to_string())));
    }
}
