//! The memory engine: one owner for every long-lived component.
//!
//! [`MemoryEngine::open`] builds the store, cache, indexer, search engine,
//! updater and collaborator once; callers borrow the engine rather than
//! reaching for globals. [`MemoryEngine::shutdown`] stops the watcher (if
//! one is running) and drains its workers before the connection pool is
//! closed.

use std::sync::Arc;
use tracing::info;

use crate::cache::{CacheStats, QueryCache};
use crate::collaborator::{create_collaborator, Collaborator};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::history::{CollaboratorSummarizer, ConversationBuffer, ConversationLog, HistoryCompressor};
use crate::indexer::{IndexOutcome, IndexReport, Indexer};
use crate::models::SearchResult;
use crate::search::SearchEngine;
use crate::store::{SqliteStore, StoreStatistics};
use crate::update::{MemoryUpdater, UpdateDecision, UpdateOutcome};
use crate::watcher::WatchService;
use crate::writer::{MemoryWriter, RememberOutcome};

pub struct MemoryEngine {
    config: Config,
    store: Arc<SqliteStore>,
    cache: Arc<QueryCache>,
    indexer: Arc<Indexer>,
    search: SearchEngine,
    updater: Arc<MemoryUpdater>,
    collaborator: Arc<dyn Collaborator>,
}

impl MemoryEngine {
    pub async fn open(config: Config) -> Result<Self> {
        let root = &config.memory.root;
        tokio::fs::create_dir_all(root)
            .await
            .map_err(|e| Error::io(root, e))?;

        let collaborator: Arc<dyn Collaborator> =
            Arc::from(create_collaborator(&config.collaborator)?);

        let store = Arc::new(SqliteStore::open(&config.db).await?);
        let cache = Arc::new(QueryCache::new(config.cache.capacity));
        let indexer = Arc::new(Indexer::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            &config.memory,
            &config.chunking,
        )?);
        let search = SearchEngine::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            config.memory.logs_path(),
            config.retrieval.clone(),
        );
        let updater = Arc::new(MemoryUpdater::new(Arc::clone(&indexer)));

        info!(
            root = %indexer.root().display(),
            db = %config.db.path.display(),
            collaborator = collaborator.name(),
            "memory engine ready"
        );

        Ok(Self {
            config,
            store,
            cache,
            indexer,
            search,
            updater,
            collaborator,
        })
    }

    /// Replace the configured collaborator.
    pub fn with_collaborator(mut self, collaborator: Arc<dyn Collaborator>) -> Self {
        self.collaborator = collaborator;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub fn indexer(&self) -> &Arc<Indexer> {
        &self.indexer
    }

    pub async fn index_all(&self) -> Result<IndexReport> {
        self.indexer.index_all().await
    }

    pub async fn index_file(&self, path: &std::path::Path) -> Result<IndexOutcome> {
        self.indexer.index_file(path).await
    }

    pub async fn search(
        &self,
        query: &str,
        max_results: usize,
        min_score: f64,
    ) -> Result<Vec<SearchResult>> {
        self.search.search(query, max_results, min_score).await
    }

    /// Start the filesystem watcher and its worker pool.
    pub fn watch(&self) -> Result<WatchService> {
        WatchService::start(Arc::clone(&self.indexer), &self.config.watcher)
    }

    pub async fn apply(
        &self,
        target: &str,
        decision: UpdateDecision,
        raw_content: &str,
    ) -> Result<UpdateOutcome> {
        self.updater.apply(target, decision, raw_content).await
    }

    pub async fn remember(&self, content: &str) -> Result<RememberOutcome> {
        MemoryWriter::new(
            Arc::clone(&self.collaborator),
            Arc::clone(&self.updater),
            self.config.memory.targets.clone(),
            self.config.memory.fallback_target.clone(),
        )
        .remember(content)
        .await
    }

    /// A fresh conversation whose turns are logged under the logs directory.
    pub fn conversation(&self) -> ConversationBuffer {
        ConversationBuffer::new(Some(ConversationLog::new(self.config.memory.logs_path())))
    }

    pub fn compressor(&self) -> HistoryCompressor {
        HistoryCompressor::new(
            self.config.history.clone(),
            Arc::new(CollaboratorSummarizer::new(Arc::clone(&self.collaborator))),
        )
    }

    pub async fn statistics(&self) -> Result<(StoreStatistics, CacheStats)> {
        Ok((self.store.statistics().await?, self.cache.stats()))
    }

    /// `VACUUM`, then `ANALYZE` and FTS segment merge.
    pub async fn maintain(&self) -> Result<()> {
        self.store.vacuum().await?;
        self.store.analyze().await?;
        info!("database maintenance complete");
        Ok(())
    }

    /// Drain the watcher (if any), then close the connection pool.
    pub async fn shutdown(self, watch: Option<WatchService>) {
        if let Some(watch) = watch {
            watch.shutdown().await;
        }
        self.store.close().await;
        info!("memory engine stopped");
    }
}
