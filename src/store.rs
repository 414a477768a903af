//! SQLite-backed chunk store.
//!
//! [`SqliteStore`] owns the connection pool and is the only component that
//! touches the `chunks`, `metadata`, and `chunks_fts` tables. Every chunk row
//! is written together with its full-text entry in one transaction, so the
//! two never drift apart.
//!
//! # Operations
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`insert_chunk`](SqliteStore::insert_chunk) | Insert one chunk + FTS entry |
//! | [`batch_insert_chunks`](SqliteStore::batch_insert_chunks) | Insert many chunks, committing every 1000 rows |
//! | [`upsert_metadata`](SqliteStore::upsert_metadata) | Insert or update a file's fingerprint |
//! | [`substring_search`](SqliteStore::substring_search) | `LIKE` scan over chunk content |
//! | [`full_text_search`](SqliteStore::full_text_search) | FTS5 `MATCH` query |
//! | [`delete_by_file`](SqliteStore::delete_by_file) | Drop a file's chunks and FTS entries |
//! | [`vacuum`](SqliteStore::vacuum) / [`analyze`](SqliteStore::analyze) | Maintenance |
//! | [`statistics`](SqliteStore::statistics) | Counts and sizes for `mem stats` |

use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::path::{Path, PathBuf};

use crate::config::DbConfig;
use crate::db;
use crate::error::Result;
use crate::migrate;
use crate::models::{Chunk, FileMetadata, StoredChunk};

/// Rows committed per transaction by [`SqliteStore::batch_insert_chunks`].
pub const BATCH_SIZE: usize = 1000;

/// Aggregate numbers about the index.
#[derive(Debug, Clone, Default)]
pub struct StoreStatistics {
    pub total_files: i64,
    pub total_chunks: i64,
    pub total_tokens: i64,
    pub total_bytes: i64,
    pub oldest_chunk: Option<i64>,
    pub newest_chunk: Option<i64>,
    pub db_size_bytes: u64,
    pub largest_files: Vec<FileChunkCount>,
}

#[derive(Debug, Clone)]
pub struct FileChunkCount {
    pub file_path: String,
    pub chunk_count: i64,
}

pub struct SqliteStore {
    pool: SqlitePool,
    db_path: PathBuf,
}

impl SqliteStore {
    /// Connect to the database and make sure the schema exists.
    pub async fn open(config: &DbConfig) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::run_migrations(&pool).await?;
        Ok(Self {
            pool,
            db_path: config.path.clone(),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Insert a single chunk and its full-text entry atomically.
    pub async fn insert_chunk(&self, chunk: &Chunk) -> Result<i64> {
        let mut tx = self.pool.begin().await?;
        let id = insert_chunk_tx(&mut tx, chunk).await?;
        tx.commit().await?;
        Ok(id)
    }

    /// Insert chunks in transactions of [`BATCH_SIZE`] rows.
    ///
    /// A failure rolls back only the batch in flight; batches committed
    /// before it stay in place. Returns the number of rows inserted.
    pub async fn batch_insert_chunks(&self, chunks: &[Chunk]) -> Result<usize> {
        let mut inserted = 0usize;

        for batch in chunks.chunks(BATCH_SIZE) {
            let mut tx = self.pool.begin().await?;
            for chunk in batch {
                // Dropping `tx` on error rolls the batch back.
                insert_chunk_tx(&mut tx, chunk).await?;
            }
            tx.commit().await?;
            inserted += batch.len();
        }

        Ok(inserted)
    }

    pub async fn upsert_metadata(&self, meta: &FileMetadata) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO metadata (file_path, file_size, last_modified, content_hash, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(file_path) DO UPDATE SET
                file_size = excluded.file_size,
                last_modified = excluded.last_modified,
                content_hash = excluded.content_hash,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&meta.file_path)
        .bind(meta.size_bytes)
        .bind(meta.last_modified)
        .bind(&meta.content_hash)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_metadata(&self, file_path: &str) -> Result<Option<FileMetadata>> {
        let row = sqlx::query(
            "SELECT file_path, file_size, last_modified, content_hash FROM metadata WHERE file_path = ?",
        )
        .bind(file_path)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| FileMetadata {
            file_path: r.get("file_path"),
            size_bytes: r.get("file_size"),
            last_modified: r.get("last_modified"),
            content_hash: r.get("content_hash"),
        }))
    }

    /// All file paths with a metadata row, sorted.
    pub async fn list_files(&self) -> Result<Vec<String>> {
        let files = sqlx::query_scalar("SELECT file_path FROM metadata ORDER BY file_path")
            .fetch_all(&self.pool)
            .await?;
        Ok(files)
    }

    pub async fn chunks_for_file(&self, file_path: &str) -> Result<Vec<StoredChunk>> {
        let rows = sqlx::query(
            r#"
            SELECT id, file_path, start_line, end_line, content, token_count, created_at
            FROM chunks
            WHERE file_path = ?
            ORDER BY start_line, id
            "#,
        )
        .bind(file_path)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_chunk).collect())
    }

    /// Case-insensitive `LIKE` scan, newest chunks first.
    pub async fn substring_search(&self, keyword: &str, limit: i64) -> Result<Vec<StoredChunk>> {
        let pattern = format!("%{}%", escape_like(keyword));
        let rows = sqlx::query(
            r#"
            SELECT id, file_path, start_line, end_line, content, token_count, created_at
            FROM chunks
            WHERE content LIKE ? ESCAPE '\'
            ORDER BY created_at DESC, id ASC
            LIMIT ?
            "#,
        )
        .bind(pattern)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_chunk).collect())
    }

    /// FTS5 query over chunk content, best BM25 rank first.
    ///
    /// The keyword is split into terms and each term is quoted, so user text
    /// is always matched literally rather than parsed as FTS syntax.
    pub async fn full_text_search(&self, keyword: &str, limit: i64) -> Result<Vec<StoredChunk>> {
        let query = fts_query(keyword);
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT c.id, c.file_path, c.start_line, c.end_line, c.content, c.token_count, c.created_at
            FROM (
                SELECT rowid, rank FROM chunks_fts
                WHERE chunks_fts MATCH ?
                ORDER BY rank
                LIMIT ?
            ) AS hits
            JOIN chunks c ON c.id = hits.rowid
            ORDER BY hits.rank, c.id
            "#,
        )
        .bind(query)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_chunk).collect())
    }

    /// Delete a file's chunks and full-text entries. Metadata is kept.
    pub async fn delete_by_file(&self, file_path: &str) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunks_fts WHERE rowid IN (SELECT id FROM chunks WHERE file_path = ?)")
            .bind(file_path)
            .execute(&mut *tx)
            .await?;

        let deleted = sqlx::query("DELETE FROM chunks WHERE file_path = ?")
            .bind(file_path)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok(deleted)
    }

    /// Forget a file entirely: chunks, full-text entries and metadata.
    pub async fn remove_file(&self, file_path: &str) -> Result<u64> {
        let deleted = self.delete_by_file(file_path).await?;
        sqlx::query("DELETE FROM metadata WHERE file_path = ?")
            .bind(file_path)
            .execute(&self.pool)
            .await?;
        Ok(deleted)
    }

    pub async fn vacuum(&self) -> Result<()> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        Ok(())
    }

    /// Refresh planner statistics and merge FTS segments.
    pub async fn analyze(&self) -> Result<()> {
        sqlx::query("ANALYZE").execute(&self.pool).await?;
        sqlx::query("INSERT INTO chunks_fts(chunks_fts) VALUES('optimize')")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn statistics(&self) -> Result<StoreStatistics> {
        let total_files: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM metadata")
            .fetch_one(&self.pool)
            .await?;

        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS chunk_count,
                   COALESCE(SUM(token_count), 0) AS tokens,
                   COALESCE(SUM(LENGTH(content)), 0) AS bytes,
                   MIN(created_at) AS oldest,
                   MAX(created_at) AS newest
            FROM chunks
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let largest_rows = sqlx::query(
            r#"
            SELECT file_path, COUNT(*) AS chunk_count
            FROM chunks
            GROUP BY file_path
            ORDER BY chunk_count DESC, file_path ASC
            LIMIT 10
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let db_size_bytes = std::fs::metadata(&self.db_path)
            .map(|m| m.len())
            .unwrap_or(0);

        Ok(StoreStatistics {
            total_files,
            total_chunks: row.get("chunk_count"),
            total_tokens: row.get("tokens"),
            total_bytes: row.get("bytes"),
            oldest_chunk: row.get("oldest"),
            newest_chunk: row.get("newest"),
            db_size_bytes,
            largest_files: largest_rows
                .iter()
                .map(|r| FileChunkCount {
                    file_path: r.get("file_path"),
                    chunk_count: r.get("chunk_count"),
                })
                .collect(),
        })
    }

    /// Close the pool, waiting for checked-out connections to come back.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

async fn insert_chunk_tx(tx: &mut Transaction<'_, Sqlite>, chunk: &Chunk) -> Result<i64> {
    let id = sqlx::query(
        r#"
        INSERT INTO chunks (file_path, start_line, end_line, content, token_count, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&chunk.file_path)
    .bind(chunk.start_line as i64)
    .bind(chunk.end_line as i64)
    .bind(&chunk.content)
    .bind(chunk.token_count as i64)
    .bind(chunk.created_at)
    .execute(&mut **tx)
    .await?
    .last_insert_rowid();

    sqlx::query("INSERT INTO chunks_fts (rowid, content, file_path) VALUES (?, ?, ?)")
        .bind(id)
        .bind(&chunk.content)
        .bind(&chunk.file_path)
        .execute(&mut **tx)
        .await?;

    Ok(id)
}

fn row_to_chunk(row: &sqlx::sqlite::SqliteRow) -> StoredChunk {
    StoredChunk {
        id: row.get("id"),
        file_path: row.get("file_path"),
        start_line: row.get("start_line"),
        end_line: row.get("end_line"),
        content: row.get("content"),
        token_count: row.get("token_count"),
        created_at: row.get("created_at"),
    }
}

/// Quote every whitespace-separated term for FTS5 (implicit AND).
fn fts_query(keyword: &str) -> String {
    keyword
        .split_whitespace()
        .map(|term| format!("\"{}\"", term.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}

fn escape_like(keyword: &str) -> String {
    let mut out = String::with_capacity(keyword.len());
    for c in keyword.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fts_query_quotes_terms() {
        assert_eq!(fts_query("invoice march"), "\"invoice\" \"march\"");
        assert_eq!(fts_query("  "), "");
        assert_eq!(fts_query("say \"hi\""), "\"say\" \"\"\"hi\"\"\"");
    }

    #[test]
    fn test_fts_query_neutralizes_operators() {
        assert_eq!(fts_query("NOT a-b"), "\"NOT\" \"a-b\"");
    }

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("100%_done\\"), "100\\%\\_done\\\\");
        assert_eq!(escape_like("plain"), "plain");
    }
}
