use sqlx::SqlitePool;

use crate::error::Result;

/// Create the index schema. Idempotent.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Create chunks table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            file_path TEXT NOT NULL,
            start_line INTEGER NOT NULL,
            end_line INTEGER NOT NULL,
            content TEXT NOT NULL,
            token_count INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create metadata table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS metadata (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            file_path TEXT NOT NULL UNIQUE,
            file_size INTEGER NOT NULL,
            last_modified INTEGER NOT NULL,
            content_hash TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create FTS5 virtual table over chunks; rowid mirrors chunks.id
    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='chunks_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE chunks_fts USING fts5(
                content,
                file_path
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    // Create indexes
    for statement in [
        "CREATE INDEX IF NOT EXISTS idx_chunks_file_path ON chunks(file_path)",
        "CREATE INDEX IF NOT EXISTS idx_chunks_created_at ON chunks(created_at)",
        "CREATE INDEX IF NOT EXISTS idx_metadata_file_path ON metadata(file_path)",
        "CREATE INDEX IF NOT EXISTS idx_metadata_created_at ON metadata(created_at)",
    ] {
        sqlx::query(statement).execute(pool).await?;
    }

    Ok(())
}
