//! Hybrid keyword retrieval over indexed chunks and conversation logs.
//!
//! Two channels feed one ranked list:
//!
//! | Channel | Source | Score |
//! |---------|--------|-------|
//! | Chunk | FTS5 match via the query cache, substring scan as fallback | `retrieval.chunk_score` (0.8) |
//! | Log | Case-insensitive scan of `<logs_dir>/*.md` | `retrieval.log_score` (0.6) |
//!
//! Results below `min_score` are dropped, the rest are stably sorted by
//! score (chunk results keep their rank order ahead of equal-score logs)
//! and truncated to `max_results`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::cache::QueryCache;
use crate::config::RetrievalConfig;
use crate::error::{Error, Result};
use crate::models::{ResultType, SearchResult, StoredChunk};
use crate::store::SqliteStore;

pub struct SearchEngine {
    store: Arc<SqliteStore>,
    cache: Arc<QueryCache>,
    logs_dir: PathBuf,
    retrieval: RetrievalConfig,
}

impl SearchEngine {
    pub fn new(
        store: Arc<SqliteStore>,
        cache: Arc<QueryCache>,
        logs_dir: PathBuf,
        retrieval: RetrievalConfig,
    ) -> Self {
        Self {
            store,
            cache,
            logs_dir,
            retrieval,
        }
    }

    /// Run a hybrid search. A blank query returns no results.
    pub async fn search(
        &self,
        query: &str,
        max_results: usize,
        min_score: f64,
    ) -> Result<Vec<SearchResult>> {
        let query = query.trim();
        if query.is_empty() || max_results == 0 {
            return Ok(Vec::new());
        }

        let candidates = max_results.saturating_mul(2);
        let mut results: Vec<SearchResult> = self
            .chunk_matches(query, candidates)
            .await?
            .into_iter()
            .map(|c| SearchResult::from_chunk(c, self.retrieval.chunk_score))
            .collect();

        results.extend(self.log_matches(query).await);

        results.retain(|r| r.score >= min_score);
        // Vec::sort_by is stable, so equal scores keep channel order.
        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        results.truncate(max_results);

        debug!(query, results = results.len(), "search complete");
        Ok(results)
    }

    async fn chunk_matches(&self, query: &str, limit: usize) -> Result<Vec<StoredChunk>> {
        if let Some(hit) = self.cache.get(query, limit) {
            return Ok(hit);
        }

        let generation = self.cache.generation();
        match self.store.full_text_search(query, limit as i64).await {
            Ok(chunks) => {
                self.cache.put(query, generation, chunks.clone());
                Ok(chunks)
            }
            Err(Error::ResourceTimeout) => Err(Error::ResourceTimeout),
            Err(e) => {
                warn!(error = %e, "full-text search failed, falling back to substring search");
                self.store.substring_search(query, limit as i64).await
            }
        }
    }

    async fn log_matches(&self, query: &str) -> Vec<SearchResult> {
        if !self.logs_dir.is_dir() {
            return Vec::new();
        }

        let needle = query.to_lowercase();
        let mut files: Vec<PathBuf> = WalkDir::new(&self.logs_dir)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(error = %e, "failed to read log directory entry");
                    None
                }
            })
            .filter(|e| e.file_type().is_file() && is_markdown(e.path()))
            .map(|e| e.into_path())
            .collect();
        // Newest dated logs first.
        files.sort_by(|a, b| b.cmp(a));

        let mut results = Vec::new();
        for path in files {
            let content = match tokio::fs::read_to_string(&path).await {
                Ok(content) => content,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable log file");
                    continue;
                }
            };

            if let Some(excerpt) =
                matching_excerpt(&content, &needle, self.retrieval.log_excerpt_lines)
            {
                results.push(SearchResult {
                    file_path: path.to_string_lossy().to_string(),
                    start_line: None,
                    end_line: None,
                    content: excerpt,
                    score: self.retrieval.log_score,
                    result_type: ResultType::LogFile,
                });
            }
        }
        results
    }
}

fn is_markdown(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("md"))
        .unwrap_or(false)
}

/// Up to `max_lines` lines of `content` containing `needle` (already
/// lowercased), or `None` when nothing matches.
fn matching_excerpt(content: &str, needle: &str, max_lines: usize) -> Option<String> {
    let lines: Vec<&str> = content
        .lines()
        .filter(|line| line.to_lowercase().contains(needle))
        .take(max_lines.max(1))
        .collect();
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}
