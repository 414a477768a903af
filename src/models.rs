//! Core data models used throughout the memory engine.
//!
//! These types represent the chunks, file metadata, and search results that
//! flow through the indexing and retrieval pipeline.

use serde::Serialize;

/// A line-bounded slice of a source file, as produced by the chunker.
///
/// Line numbers are 1-based and inclusive. A chunk is never edited after it
/// is stored; re-indexing a file replaces all of its chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub file_path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub content: String,
    pub token_count: usize,
    pub created_at: i64,
}

/// A chunk as read back from the store, with its row id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredChunk {
    pub id: i64,
    pub file_path: String,
    pub start_line: i64,
    pub end_line: i64,
    pub content: String,
    pub token_count: i64,
    pub created_at: i64,
}

/// Per-file fingerprint row used for change detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    pub file_path: String,
    pub size_bytes: i64,
    /// Modification time in milliseconds since the Unix epoch.
    pub last_modified: i64,
    pub content_hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultType {
    Chunk,
    LogFile,
}

/// A search hit returned from the hybrid query engine. Never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub file_path: String,
    pub start_line: Option<i64>,
    pub end_line: Option<i64>,
    pub content: String,
    pub score: f64,
    pub result_type: ResultType,
}

impl SearchResult {
    pub fn from_chunk(chunk: StoredChunk, score: f64) -> Self {
        Self {
            file_path: chunk.file_path,
            start_line: Some(chunk.start_line),
            end_line: Some(chunk.end_line),
            content: chunk.content,
            score,
            result_type: ResultType::Chunk,
        }
    }
}
