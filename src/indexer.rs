//! Indexing pipeline: file → change detection → chunking → storage.
//!
//! [`Indexer`] is shared (behind an `Arc`) by full scans, the filesystem
//! watcher's worker pool, and the update protocol's post-write hook. Indexing
//! of one file is serialized by a per-path async lock; different files are
//! indexed concurrently.
//!
//! Files are keyed by their path relative to the memory root (`/`-separated),
//! so the index survives the root being moved.

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::cache::QueryCache;
use crate::chunk::chunk_text;
use crate::config::{ChunkingConfig, MemoryConfig};
use crate::error::{Error, Result};
use crate::fingerprint::{ChangeDetector, ChangeStatus};
use crate::store::SqliteStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexOutcome {
    /// Content changed; old chunks were replaced.
    Indexed { chunks: usize },
    /// Fingerprint matched; nothing written.
    Unchanged,
    /// Path is not a tracked memory file.
    Ignored,
    /// File is gone; its chunks and metadata were dropped.
    Removed { chunks: u64 },
}

/// Summary of a full scan.
#[derive(Debug, Default, Clone)]
pub struct IndexReport {
    pub files_seen: usize,
    pub files_indexed: usize,
    pub files_unchanged: usize,
    pub files_removed: usize,
    pub chunks_written: usize,
    pub errors: usize,
}

pub struct Indexer {
    store: Arc<SqliteStore>,
    cache: Arc<QueryCache>,
    chunking: ChunkingConfig,
    root: PathBuf,
    archive: PathBuf,
    include: GlobSet,
    exclude: GlobSet,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Indexer {
    pub fn new(
        store: Arc<SqliteStore>,
        cache: Arc<QueryCache>,
        memory: &MemoryConfig,
        chunking: &ChunkingConfig,
    ) -> Result<Self> {
        let root = canonical_or_self(&memory.root);
        let archive = canonical_or_self(&memory.archive_path());

        let mut default_excludes = vec!["**/.git/**".to_string(), "**/.*".to_string()];
        default_excludes.extend(memory.exclude_globs.clone());

        Ok(Self {
            store,
            cache,
            chunking: chunking.clone(),
            root,
            archive,
            include: build_globset(&memory.include_globs)?,
            exclude: build_globset(&default_excludes)?,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directories the watcher must observe: the root, plus the archive tree
    /// when it lives outside the root.
    pub fn watch_roots(&self) -> Vec<PathBuf> {
        let mut roots = vec![self.root.clone()];
        if !self.archive.starts_with(&self.root) && self.archive.is_dir() {
            roots.push(self.archive.clone());
        }
        roots
    }

    /// Index key for a path: root-relative with `/` separators, or the full
    /// path for files outside the root.
    ///
    /// The parent directory is canonicalized first, so `./`, `..` and a
    /// symlinked root all resolve to the same key. The file name itself is
    /// kept, which also works for files that were already deleted.
    pub fn key_for(&self, path: &Path) -> String {
        let path = normalize(path);
        match path.strip_prefix(&self.root) {
            Ok(rel) => rel
                .components()
                .filter_map(|c| match c {
                    Component::Normal(s) => Some(s.to_string_lossy().to_string()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("/"),
            Err(_) => path.to_string_lossy().to_string(),
        }
    }

    /// Whether `path` is a markdown file selected by the include/exclude globs.
    pub fn is_tracked(&self, path: &Path) -> bool {
        let is_markdown = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("md"))
            .unwrap_or(false);
        if !is_markdown {
            return false;
        }
        let key = self.key_for(path);
        self.include.is_match(&key) && !self.exclude.is_match(&key)
    }

    /// Bring the index for one file up to date.
    pub async fn index_file(&self, path: &Path) -> Result<IndexOutcome> {
        if !self.is_tracked(path) {
            return Ok(IndexOutcome::Ignored);
        }

        let key = self.key_for(path);
        let lock = self.lock_for(&key);
        let outcome = {
            let _guard = lock.lock().await;
            self.index_locked(path, &key).await
        };
        drop(lock);
        self.release_lock(&key);
        outcome
    }

    /// Drop a deleted file from the index.
    pub async fn remove_file(&self, path: &Path) -> Result<IndexOutcome> {
        if !self.is_tracked(path) {
            return Ok(IndexOutcome::Ignored);
        }

        let key = self.key_for(path);
        let lock = self.lock_for(&key);
        let outcome = {
            let _guard = lock.lock().await;
            if path.exists() {
                // Recreated before the event was handled.
                self.index_locked(path, &key).await
            } else {
                self.remove_key(&key).await
            }
        };
        drop(lock);
        self.release_lock(&key);
        outcome
    }

    /// Scan the memory root (and archive), index every tracked file, and drop
    /// index entries for files that no longer exist.
    ///
    /// A failure on one file is logged and counted; the scan continues.
    pub async fn index_all(&self) -> Result<IndexReport> {
        let mut report = IndexReport::default();
        let paths = self.scan();
        report.files_seen = paths.len();

        let mut discovered: HashSet<String> = HashSet::with_capacity(paths.len());
        for path in &paths {
            discovered.insert(self.key_for(path));
            match self.index_file(path).await {
                Ok(IndexOutcome::Indexed { chunks }) => {
                    report.files_indexed += 1;
                    report.chunks_written += chunks;
                }
                Ok(IndexOutcome::Unchanged) => report.files_unchanged += 1,
                Ok(_) => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to index file");
                    report.errors += 1;
                }
            }
        }

        for key in self.store.list_files().await? {
            if discovered.contains(&key) {
                continue;
            }
            debug!(file = %key, "removing stale file from index");
            match self.remove_key(&key).await {
                Ok(_) => report.files_removed += 1,
                Err(e) => {
                    warn!(file = %key, error = %e, "failed to remove stale file");
                    report.errors += 1;
                }
            }
        }

        info!(
            seen = report.files_seen,
            indexed = report.files_indexed,
            unchanged = report.files_unchanged,
            removed = report.files_removed,
            chunks = report.chunks_written,
            errors = report.errors,
            "index scan complete"
        );

        Ok(report)
    }

    async fn index_locked(&self, path: &Path, key: &str) -> Result<IndexOutcome> {
        if !path.exists() {
            return self.remove_key(key).await;
        }

        match self.reindex(path, key).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                // Forget the file so stale chunks stop matching and the next
                // scan retries it from scratch.
                if let Err(cleanup) = self.store.remove_file(key).await {
                    warn!(file = %key, error = %cleanup, "failed to reset file after index error");
                }
                self.cache.invalidate();
                Err(e)
            }
        }
    }

    async fn reindex(&self, path: &Path, key: &str) -> Result<IndexOutcome> {
        let status = ChangeDetector::new(&self.store).check(path, key).await?;
        let content = match status {
            ChangeStatus::Unchanged | ChangeStatus::Touched => return Ok(IndexOutcome::Unchanged),
            ChangeStatus::Changed { content, .. } => content,
        };

        let chunks = chunk_text(key, &content, &self.chunking);
        let written = self.replace_chunks(key, &chunks).await?;

        self.cache.invalidate();
        info!(file = %key, chunks = written, "indexed file");
        Ok(IndexOutcome::Indexed { chunks: written })
    }

    async fn replace_chunks(&self, key: &str, chunks: &[crate::models::Chunk]) -> Result<usize> {
        self.store.delete_by_file(key).await?;
        self.store.batch_insert_chunks(chunks).await
    }

    async fn remove_key(&self, key: &str) -> Result<IndexOutcome> {
        let chunks = self.store.remove_file(key).await?;
        self.cache.invalidate();
        info!(file = %key, chunks, "removed file from index");
        Ok(IndexOutcome::Removed { chunks })
    }

    fn scan(&self) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        for root in self.watch_roots() {
            if !root.exists() {
                debug!(root = %root.display(), "memory directory does not exist, skipping");
                continue;
            }
            for entry in WalkDir::new(&root).follow_links(false) {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!(error = %e, "failed to read directory entry");
                        continue;
                    }
                };
                if entry.file_type().is_file() && self.is_tracked(entry.path()) {
                    paths.push(entry.into_path());
                }
            }
        }

        // Sort for deterministic ordering
        paths.sort();
        paths
    }

    fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        locks.entry(key.to_string()).or_default().clone()
    }

    fn release_lock(&self, key: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(lock) = locks.get(key) {
            if Arc::strong_count(lock) == 1 {
                locks.remove(key);
            }
        }
    }
}

fn canonical_or_self(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

fn normalize(path: &Path) -> PathBuf {
    let Some(name) = path.file_name() else {
        return canonical_or_self(path);
    };
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    match std::fs::canonicalize(parent) {
        Ok(dir) => dir.join(name),
        Err(_) => path.to_path_buf(),
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| Error::Config(format!("invalid glob '{}': {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| Error::Config(format!("invalid glob set: {}", e)))
}
