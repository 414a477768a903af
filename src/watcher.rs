//! Filesystem watcher and indexing worker pool.
//!
//! ```text
//! notify thread ──▶ bounded queue ──▶ worker 1..N ──▶ Indexer
//! ```
//!
//! `notify` delivers events on its own thread; they are classified into
//! [`FileEvent`]s and pushed onto one `async_channel` queue that a fixed
//! number of tokio tasks drain. Shutdown stops the watcher, closes the queue,
//! lets the workers finish what is already queued, and aborts anything still
//! running after the timeout.

use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::WatcherConfig;
use crate::error::Result;
use crate::indexer::{IndexOutcome, Indexer};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEvent {
    Upsert(PathBuf),
    Remove(PathBuf),
}

impl FileEvent {
    pub fn path(&self) -> &Path {
        match self {
            Self::Upsert(p) | Self::Remove(p) => p,
        }
    }
}

/// Map a raw notify event onto markdown file events.
pub fn classify(event: &Event) -> Vec<FileEvent> {
    let markdown = event.paths.iter().filter(|p| {
        p.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("md"))
            .unwrap_or(false)
    });

    match event.kind {
        EventKind::Create(_) => markdown.cloned().map(FileEvent::Upsert).collect(),
        EventKind::Modify(ModifyKind::Name(_)) => markdown
            .map(|p| {
                if p.exists() {
                    FileEvent::Upsert(p.clone())
                } else {
                    FileEvent::Remove(p.clone())
                }
            })
            .collect(),
        EventKind::Modify(_) => markdown.cloned().map(FileEvent::Upsert).collect(),
        EventKind::Remove(_) => markdown.cloned().map(FileEvent::Remove).collect(),
        _ => Vec::new(),
    }
}

/// Counters shared by the worker tasks.
#[derive(Debug, Default)]
pub struct WatchStats {
    pub processed: AtomicU64,
    pub failed: AtomicU64,
}

pub struct WatchService {
    watcher: Option<RecommendedWatcher>,
    queue: async_channel::Sender<FileEvent>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    stats: Arc<WatchStats>,
    shutdown_timeout: Duration,
}

impl WatchService {
    /// Start watching the indexer's roots with `config.workers` workers.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(indexer: Arc<Indexer>, config: &WatcherConfig) -> Result<Self> {
        let (tx, rx) = async_channel::bounded::<FileEvent>(config.queue_capacity.max(1));

        let producer = tx.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    for file_event in classify(&event) {
                        // Runs on the notify thread, so blocking here is fine.
                        if producer.send_blocking(file_event).is_err() {
                            break;
                        }
                    }
                }
                Err(e) => warn!(error = %e, "filesystem watch error"),
            },
            notify::Config::default(),
        )?;

        for root in indexer.watch_roots() {
            watcher.watch(&root, RecursiveMode::Recursive)?;
            info!(root = %root.display(), "watching memory directory");
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(WatchStats::default());
        let workers = (0..config.workers.max(1))
            .map(|id| {
                let rx = rx.clone();
                let indexer = Arc::clone(&indexer);
                let shutdown = Arc::clone(&shutdown);
                let stats = Arc::clone(&stats);
                tokio::spawn(async move {
                    while let Ok(event) = rx.recv().await {
                        if shutdown.load(Ordering::Relaxed) {
                            break;
                        }
                        handle_event(&indexer, &stats, event).await;
                    }
                    debug!(worker = id, "index worker stopped");
                })
            })
            .collect();

        Ok(Self {
            watcher: Some(watcher),
            queue: tx,
            workers,
            shutdown,
            stats,
            shutdown_timeout: Duration::from_secs(config.shutdown_timeout_secs),
        })
    }

    /// Queue an event as if the watcher had produced it.
    #[cfg(test)]
    async fn submit(&self, event: FileEvent) -> bool {
        self.queue.send(event).await.is_ok()
    }

    /// Events waiting in the queue.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn stats(&self) -> &WatchStats {
        &self.stats
    }

    /// Stop watching and drain the queue.
    ///
    /// Returns once every worker has exited, or after the shutdown timeout,
    /// at which point the remaining workers are told to stop and aborted.
    pub async fn shutdown(mut self) {
        drop(self.watcher.take());
        self.queue.close();
        info!(queued = self.pending(), "stopping watcher, draining queue");

        let deadline = tokio::time::Instant::now() + self.shutdown_timeout;
        let mut timed_out = false;
        for handle in self.workers.iter_mut() {
            if timed_out {
                handle.abort();
                continue;
            }
            if tokio::time::timeout_at(deadline, &mut *handle).await.is_err() {
                warn!("index workers did not drain before the shutdown timeout");
                self.shutdown.store(true, Ordering::Relaxed);
                handle.abort();
                timed_out = true;
            }
        }

        info!(
            processed = self.stats.processed.load(Ordering::Relaxed),
            failed = self.stats.failed.load(Ordering::Relaxed),
            "watcher stopped"
        );
    }
}

async fn handle_event(indexer: &Indexer, stats: &WatchStats, event: FileEvent) {
    let result = match &event {
        FileEvent::Upsert(path) => indexer.index_file(path).await,
        FileEvent::Remove(path) => indexer.remove_file(path).await,
    };

    match result {
        Ok(IndexOutcome::Ignored) => {}
        Ok(outcome) => {
            stats.processed.fetch_add(1, Ordering::Relaxed);
            debug!(path = %event.path().display(), ?outcome, "handled file event");
        }
        Err(e) => {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            if e.is_recoverable() {
                warn!(path = %event.path().display(), error = %e, "failed to index file, retrying on next change");
            } else {
                error!(path = %event.path().display(), error = %e, "failed to index file");
            }
        }
    }
}
