//! File change detection.
//!
//! A file is re-chunked only when its content actually changed. The cheap
//! `(size, mtime)` pair is compared first; the SHA-256 digest over the full
//! bytes is computed only when that pair differs from the stored row.

use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::UNIX_EPOCH;

use crate::error::{Error, Result};
use crate::models::FileMetadata;
use crate::store::SqliteStore;

/// Lowercase hex SHA-256 of `bytes`.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Result of comparing a file on disk with its stored fingerprint.
#[derive(Debug)]
pub enum ChangeStatus {
    /// Size and mtime match the stored row.
    Unchanged,
    /// Size or mtime moved but the bytes hash the same; metadata was refreshed.
    Touched,
    /// New or modified content. Metadata has already been upserted.
    Changed { content: String, metadata: FileMetadata },
}

pub struct ChangeDetector<'a> {
    store: &'a SqliteStore,
}

impl<'a> ChangeDetector<'a> {
    pub fn new(store: &'a SqliteStore) -> Self {
        Self { store }
    }

    /// Compare `path` (stored under `key`) with its metadata row.
    ///
    /// On [`ChangeStatus::Changed`] the new metadata is written before the
    /// caller re-chunks. Content that is not valid UTF-8 is rejected before
    /// any row is touched.
    pub async fn check(&self, path: &Path, key: &str) -> Result<ChangeStatus> {
        let fs_meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| Error::io(path, e))?;
        let size_bytes = fs_meta.len() as i64;
        let last_modified = fs_meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);

        let stored = self.store.get_metadata(key).await?;
        if let Some(ref existing) = stored {
            if existing.size_bytes == size_bytes && existing.last_modified == last_modified {
                return Ok(ChangeStatus::Unchanged);
            }
        }

        let bytes = tokio::fs::read(path).await.map_err(|e| Error::io(path, e))?;
        let metadata = FileMetadata {
            file_path: key.to_string(),
            size_bytes: bytes.len() as i64,
            last_modified,
            content_hash: content_hash(&bytes),
        };

        if let Some(existing) = stored {
            if existing.content_hash == metadata.content_hash {
                self.store.upsert_metadata(&metadata).await?;
                return Ok(ChangeStatus::Touched);
            }
        }

        let content = String::from_utf8(bytes).map_err(|e| {
            Error::io(
                path,
                std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            )
        })?;

        self.store.upsert_metadata(&metadata).await?;
        Ok(ChangeStatus::Changed { content, metadata })
    }
}
