use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Connection;
use std::str::FromStr;
use std::time::Duration;

use crate::config::DbConfig;
use crate::error::{Error, Result};

/// Open the connection pool described by `config`.
///
/// The pool holds at most `pool_size` connections; borrowers wait up to
/// `acquire_timeout_secs` before failing with [`Error::ResourceTimeout`].
/// Connections are pinged on release and dropped instead of pooled when they
/// no longer respond, so the pool refills with fresh ones.
pub async fn connect(config: &DbConfig) -> Result<SqlitePool> {
    let db_path = &config.path;

    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(config.acquire_timeout_secs));

    let pool = SqlitePoolOptions::new()
        .max_connections(config.pool_size)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .test_before_acquire(true)
        .after_release(|conn, _meta| {
            Box::pin(async move { Ok(keep_after_release(conn.ping().await)) })
        })
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Whether a released connection goes back into the pool, given its ping.
fn keep_after_release(ping: std::result::Result<(), sqlx::Error>) -> bool {
    match ping {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "discarding unhealthy database connection");
            false
        }
    }
}
