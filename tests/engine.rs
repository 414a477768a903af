use async_trait::async_trait;
use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use memory_harness::collaborator::{Collaborator, ResponseFormat};
use memory_harness::config::{parse_config, Config};
use memory_harness::engine::MemoryEngine;
use memory_harness::error::{Error, Result};
use memory_harness::indexer::IndexOutcome;
use memory_harness::models::{Chunk, ResultType};
use memory_harness::store::SqliteStore;
use memory_harness::update::{UpdateDecision, UpdateOutcome, UpdateScope};
use memory_harness::writer::RememberOutcome;

fn test_config(tmp: &TempDir, extra: &str) -> Config {
    let root = tmp.path();
    let text = format!(
        r#"[db]
path = "{root}/data/mem.sqlite"
{extra}

[memory]
root = "{root}/memory"

[watcher]
workers = 2
shutdown_timeout_secs = 5
"#,
        root = root.display(),
        extra = extra
    );
    parse_config(&text).unwrap()
}

async fn open_engine(tmp: &TempDir) -> MemoryEngine {
    MemoryEngine::open(test_config(tmp, "")).await.unwrap()
}

fn write(root: &Path, rel: &str, content: &str) -> std::path::PathBuf {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, content).unwrap();
    path
}

/// Replays canned replies in order; fails once they run out.
struct ScriptedCollaborator {
    replies: Mutex<VecDeque<String>>,
}

impl ScriptedCollaborator {
    fn new(replies: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.iter().map(|s| s.to_string()).collect()),
        })
    }
}

#[async_trait]
impl Collaborator for ScriptedCollaborator {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, _prompt: &str, _format: ResponseFormat) -> Result<String> {
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Error::Collaborator("script exhausted".into()))
    }
}

#[tokio::test]
async fn test_indexing_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(&tmp).await;
    let root = engine.indexer().root().to_path_buf();
    let path = write(&root, "FACTS.md", "# Facts\n\nLikes green tea.\n");

    let first = engine.index_file(&path).await.unwrap();
    assert!(matches!(first, IndexOutcome::Indexed { chunks: 1 }));
    let second = engine.index_file(&path).await.unwrap();
    assert_eq!(second, IndexOutcome::Unchanged);

    assert_eq!(engine.store().chunks_for_file("FACTS.md").await.unwrap().len(), 1);
    engine.shutdown(None).await;
}

#[tokio::test]
async fn test_reindex_on_change_invalidates_cache() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(&tmp).await;
    let root = engine.indexer().root().to_path_buf();
    let path = write(&root, "NOTES.md", "alpha project kickoff\n");
    engine.index_all().await.unwrap();

    assert_eq!(engine.search("alpha", 5, 0.0).await.unwrap().len(), 1);

    fs::write(&path, "beta project kickoff, rescheduled\n").unwrap();
    let outcome = engine.index_file(&path).await.unwrap();
    assert!(matches!(outcome, IndexOutcome::Indexed { .. }));

    assert!(engine.search("alpha", 5, 0.0).await.unwrap().is_empty());
    let hits = engine.search("beta", 5, 0.0).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].file_path, "NOTES.md");
    engine.shutdown(None).await;
}

#[tokio::test]
async fn test_removed_file_leaves_index() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(&tmp).await;
    let root = engine.indexer().root().to_path_buf();
    let path = write(&root, "archive/old.md", "stale entry\n");
    engine.index_all().await.unwrap();
    assert_eq!(engine.store().list_files().await.unwrap(), vec!["archive/old.md"]);

    fs::remove_file(&path).unwrap();
    let outcome = engine.indexer().remove_file(&path).await.unwrap();
    assert_eq!(outcome, IndexOutcome::Removed { chunks: 1 });
    assert!(engine.store().list_files().await.unwrap().is_empty());
    assert!(engine.search("stale", 5, 0.0).await.unwrap().is_empty());
    engine.shutdown(None).await;
}

#[tokio::test]
async fn test_repeat_query_served_from_cache() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(&tmp).await;
    let root = engine.indexer().root().to_path_buf();
    write(&root, "NOTES.md", "dentist appointment on friday\n");
    engine.index_all().await.unwrap();

    let first = engine.search("dentist", 5, 0.0).await.unwrap();
    assert_eq!(first.len(), 1);

    // With the chunk tables gone, only the cache can still answer.
    sqlx::query("DROP TABLE chunks_fts")
        .execute(engine.store().pool())
        .await
        .unwrap();
    sqlx::query("DELETE FROM chunks")
        .execute(engine.store().pool())
        .await
        .unwrap();

    let second = engine.search("dentist", 5, 0.0).await.unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].content, first[0].content);

    let (_, cache) = engine.statistics().await.unwrap();
    assert_eq!(cache.hits, 1);
    assert_eq!(cache.misses, 1);
    engine.shutdown(None).await;
}

#[tokio::test]
async fn test_full_text_failure_falls_back_to_substring() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(&tmp).await;
    let root = engine.indexer().root().to_path_buf();
    write(&root, "NOTES.md", "Renew the passport in June\n");
    engine.index_all().await.unwrap();

    sqlx::query("DROP TABLE chunks_fts")
        .execute(engine.store().pool())
        .await
        .unwrap();

    let results = engine.search("passport", 5, 0.0).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].result_type, ResultType::Chunk);
    assert!(results[0].content.contains("passport"));
    engine.shutdown(None).await;
}

#[tokio::test]
async fn test_log_only_matches_filtered_by_min_score() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(&tmp).await;
    let root = engine.indexer().root().to_path_buf();
    write(&root, "NOTES.md", "nothing relevant here\n");
    write(
        &root,
        "logs/2024-05-01.md",
        "## 09:00:00 user\n\nForward the Invoice to Ana\n\n",
    );
    engine.index_all().await.unwrap();

    assert!(engine.search("invoice", 5, 0.7).await.unwrap().is_empty());

    let results = engine.search("invoice", 5, 0.0).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].result_type, ResultType::LogFile);
    assert!((results[0].score - 0.6).abs() < 1e-9);
    assert_eq!(results[0].content, "Forward the Invoice to Ana");
    engine.shutdown(None).await;
}

#[tokio::test]
async fn test_chunks_rank_ahead_of_logs() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(&tmp).await;
    let root = engine.indexer().root().to_path_buf();
    write(&root, "FACTS.md", "Allergic to peanuts\n");
    write(&root, "logs/2024-05-02.md", "asked about peanuts again\n");
    engine.index_all().await.unwrap();

    let results = engine.search("peanuts", 5, 0.0).await.unwrap();
    let kinds: Vec<ResultType> = results.iter().map(|r| r.result_type).collect();
    assert_eq!(kinds, vec![ResultType::Chunk, ResultType::LogFile]);

    let capped = engine.search("peanuts", 1, 0.0).await.unwrap();
    assert_eq!(capped.len(), 1);
    assert_eq!(capped[0].result_type, ResultType::Chunk);
    engine.shutdown(None).await;
}

#[tokio::test]
async fn test_batch_insert_over_batch_size_commits_all() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp, "");
    let store = SqliteStore::open(&config.db).await.unwrap();

    let chunks: Vec<Chunk> = (1..=2500)
        .map(|i| Chunk {
            file_path: "bulk.md".into(),
            start_line: i,
            end_line: i,
            content: format!("bulk line {}", i),
            token_count: 3,
            created_at: 0,
        })
        .collect();

    assert_eq!(store.batch_insert_chunks(&chunks).await.unwrap(), 2500);
    let stats = store.statistics().await.unwrap();
    assert_eq!(stats.total_chunks, 2500);
    assert_eq!(store.full_text_search("bulk", 3000).await.unwrap().len(), 2500);
    store.close().await;
}

#[tokio::test]
async fn test_pool_exhaustion_surfaces_resource_timeout() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp, "pool_size = 1\nacquire_timeout_secs = 1");
    let store = SqliteStore::open(&config.db).await.unwrap();

    let held = store.pool().acquire().await.unwrap();
    let err = store.list_files().await.unwrap_err();
    assert!(matches!(err, Error::ResourceTimeout), "got {:?}", err);
    assert!(err.is_recoverable());

    drop(held);
    assert!(store.list_files().await.unwrap().is_empty());
    store.close().await;
}

#[tokio::test]
async fn test_line_update_scenario_reindexes() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(&tmp).await;
    let root = engine.indexer().root().to_path_buf();
    let original: String = (1..=10).map(|i| format!("note {}\n", i)).collect();
    let path = write(&root, "NOTES.md", &original);
    engine.index_all().await.unwrap();

    let decision: UpdateDecision = serde_json::from_str(
        r#"{"needsUpdate": true, "updateScope": "line-based", "reason": "edit",
            "lineUpdates": [
                {"lineNumber": 5, "content": "X", "operation": "update"},
                {"lineNumber": 3, "content": "Y", "operation": "add"}
            ]}"#,
    )
    .unwrap();

    let outcome = engine.apply("NOTES", decision, "").await.unwrap();
    assert!(matches!(
        outcome,
        UpdateOutcome::Applied {
            lines: 11,
            reindexed: true,
            ..
        }
    ));

    let text = fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 11);
    assert_eq!(lines[2], "Y");
    assert_eq!(lines[3], "note 3");
    assert_eq!(lines[5], "X");
    assert!(text.ends_with('\n'));

    let chunks = engine.store().chunks_for_file("NOTES.md").await.unwrap();
    assert!(chunks.iter().any(|c| c.content.contains("\nY\n")));
    engine.shutdown(None).await;
}

#[tokio::test]
async fn test_whole_file_and_confirmation_paths() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(&tmp).await;
    let root = engine.indexer().root().to_path_buf();
    let path = write(&root, "PERSONA.md", "Formal tone\n");

    let confirm = UpdateDecision {
        needs_update: true,
        update_scope: UpdateScope::NeedsConfirmation,
        updated_content: Some("Casual tone".into()),
        reason: "contradicts persona".into(),
        ..Default::default()
    };
    let outcome = engine.apply("PERSONA", confirm, "").await.unwrap();
    assert!(matches!(outcome, UpdateOutcome::AwaitingConfirmation(_)));
    assert_eq!(fs::read_to_string(&path).unwrap(), "Formal tone\n");

    let empty_body = UpdateDecision {
        needs_update: true,
        update_scope: UpdateScope::WholeFile,
        updated_content: Some(String::new()),
        ..Default::default()
    };
    engine
        .apply("PERSONA", empty_body, "Casual tone\nShort answers")
        .await
        .unwrap();
    assert_eq!(
        fs::read_to_string(&path).unwrap(),
        "Casual tone\nShort answers\n"
    );
    engine.shutdown(None).await;
}

#[tokio::test]
async fn test_malformed_collaborator_output_appends_to_fallback() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(&tmp)
        .await
        .with_collaborator(ScriptedCollaborator::new(&["sure! I'll remember that"]));
    let root = engine.indexer().root().to_path_buf();
    write(&root, "NOTES.md", "existing note\n");

    let outcome = engine.remember("Parking spot is B12").await.unwrap();
    match outcome {
        RememberOutcome::Appended { target, .. } => assert_eq!(target, "NOTES"),
        other => panic!("expected fallback append, got {:?}", other),
    }
    assert_eq!(
        fs::read_to_string(root.join("NOTES.md")).unwrap(),
        "existing note\nParking spot is B12\n"
    );
    engine.shutdown(None).await;
}

#[tokio::test]
async fn test_remember_applies_collaborator_decision() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(&tmp).await.with_collaborator(ScriptedCollaborator::new(&[
        r#"{"targetFile": "facts.md", "extractedContent": "Sister's birthday: 3 May", "shouldUpdate": true, "reason": "date"}"#,
        r#"```json
{"needsUpdate": true, "updateScope": "line-based", "reason": "new fact",
 "lineUpdates": [{"lineNumber": 1, "content": "Sister's birthday: 3 May", "operation": "add"}]}
```"#,
    ]));
    let root = engine.indexer().root().to_path_buf();

    let outcome = engine.remember("btw my sister's birthday is May 3rd").await.unwrap();
    match outcome {
        RememberOutcome::Updated { target, outcome } => {
            assert_eq!(target, "FACTS");
            assert!(matches!(outcome, UpdateOutcome::Applied { lines: 1, .. }));
        }
        other => panic!("expected update, got {:?}", other),
    }
    assert_eq!(
        fs::read_to_string(root.join("FACTS.md")).unwrap(),
        "Sister's birthday: 3 May\n"
    );
    assert_eq!(engine.search("birthday", 5, 0.0).await.unwrap().len(), 1);
    engine.shutdown(None).await;
}

#[tokio::test]
async fn test_remember_skips_when_not_memory_worthy() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(&tmp).await.with_collaborator(ScriptedCollaborator::new(&[
        r#"{"targetFile": "NOTES", "extractedContent": "", "shouldUpdate": false, "reason": "small talk"}"#,
    ]));

    let outcome = engine.remember("nice weather today").await.unwrap();
    assert_eq!(
        outcome,
        RememberOutcome::NotMemoryWorthy {
            reason: "small talk".into()
        }
    );
    assert!(!engine.indexer().root().join("NOTES.md").exists());
    engine.shutdown(None).await;
}

#[tokio::test]
async fn test_conversation_logs_are_searchable() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(&tmp).await;

    let mut conversation = engine.conversation();
    conversation
        .push(memory_harness::history::Role::User, "Book the ferry to Madeira")
        .await
        .unwrap();

    let results = engine.search("madeira", 5, 0.0).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].result_type, ResultType::LogFile);
    engine.shutdown(None).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_watcher_indexes_new_files() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(&tmp).await;
    let root = engine.indexer().root().to_path_buf();
    let watch = engine.watch().unwrap();

    write(&root, "PREFERENCES.md", "Prefers aisle seats\n");

    let mut indexed = false;
    for _ in 0..100 {
        if !engine
            .store()
            .chunks_for_file("PREFERENCES.md")
            .await
            .unwrap()
            .is_empty()
        {
            indexed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(indexed, "watcher never indexed the new file");

    engine.shutdown(Some(watch)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_watcher_drops_deleted_files() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(&tmp).await;
    let root = engine.indexer().root().to_path_buf();
    let path = write(&root, "PERSONA.md", "Speaks Portuguese\n");
    engine.index_all().await.unwrap();
    let watch = engine.watch().unwrap();

    fs::remove_file(&path).unwrap();

    let mut removed = false;
    for _ in 0..100 {
        if engine.store().get_metadata("PERSONA.md").await.unwrap().is_none() {
            removed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(removed, "watcher never dropped the deleted file");
    assert!(engine.store().chunks_for_file("PERSONA.md").await.unwrap().is_empty());
    assert!(engine.search("Portuguese", 5, 0.0).await.unwrap().is_empty());

    engine.shutdown(Some(watch)).await;
}

#[tokio::test]
async fn test_undecodable_rewrite_drops_stale_chunks() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(&tmp).await;
    let root = engine.indexer().root().to_path_buf();
    let path = write(&root, "FACTS.md", "old secret fact\n");
    assert!(matches!(
        engine.index_file(&path).await.unwrap(),
        IndexOutcome::Indexed { .. }
    ));
    assert_eq!(engine.search("secret", 5, 0.0).await.unwrap().len(), 1);

    fs::write(&path, b"new \xff\xfe").unwrap();
    assert!(matches!(engine.index_file(&path).await, Err(Error::Io { .. })));

    // Still rejected on the next pass, never reported as unchanged.
    assert!(engine.index_file(&path).await.is_err());
    assert!(engine.store().get_metadata("FACTS.md").await.unwrap().is_none());
    assert!(engine.search("secret", 5, 0.0).await.unwrap().is_empty());
    engine.shutdown(None).await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_paths_through_symlinked_root_share_keys() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(&tmp).await;
    let root = engine.indexer().root().to_path_buf();
    write(&root, "FACTS.md", "Owns a bicycle\n");
    write(&root, "logs/2024-05-01.md", "## 10:00:00 user\n\nbicycle chat\n");

    let link = tmp.path().join("memory-link");
    std::os::unix::fs::symlink(&root, &link).unwrap();

    let outcome = engine.index_file(&link.join("FACTS.md")).await.unwrap();
    assert!(matches!(outcome, IndexOutcome::Indexed { chunks: 1 }));
    let dotted = root.join("logs").join("..").join("logs").join("2024-05-01.md");
    assert_eq!(engine.index_file(&dotted).await.unwrap(), IndexOutcome::Ignored);
    assert_eq!(
        engine.index_file(&link.join("logs/2024-05-01.md")).await.unwrap(),
        IndexOutcome::Ignored
    );

    assert_eq!(engine.store().list_files().await.unwrap(), vec!["FACTS.md".to_string()]);
    assert_eq!(
        engine.index_file(&root.join("FACTS.md")).await.unwrap(),
        IndexOutcome::Unchanged
    );
    engine.shutdown(None).await;
}

#[tokio::test]
async fn test_released_connections_are_kept_when_healthy() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp, "pool_size = 2");
    let store = SqliteStore::open(&config.db).await.unwrap();

    let first = store.pool().acquire().await.unwrap();
    let second = store.pool().acquire().await.unwrap();
    drop(first);
    drop(second);
    // Release runs the ping in the background.
    for _ in 0..50 {
        if store.pool().num_idle() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(store.pool().num_idle(), 2);
    assert_eq!(store.pool().size(), 2);
    store.close().await;
}

#[tokio::test]
async fn test_store_single_insert_metadata_and_delete() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp, "");
    let store = SqliteStore::open(&config.db).await.unwrap();

    let chunk = Chunk {
        file_path: "FACTS.md".into(),
        start_line: 1,
        end_line: 2,
        content: "Lives in Lisbon\nWorks remotely".into(),
        token_count: 7,
        created_at: 1_700_000_000,
    };
    let id = store.insert_chunk(&chunk).await.unwrap();
    assert!(id > 0);

    let hits = store.substring_search("LISBON", 10).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, id);
    assert_eq!(store.substring_search("100%", 10).await.unwrap().len(), 0);

    let meta = memory_harness::models::FileMetadata {
        file_path: "FACTS.md".into(),
        size_bytes: 31,
        last_modified: 1_700_000_000_000,
        content_hash: memory_harness::fingerprint::content_hash(b"x"),
    };
    store.upsert_metadata(&meta).await.unwrap();
    let updated = memory_harness::models::FileMetadata {
        size_bytes: 40,
        ..meta.clone()
    };
    store.upsert_metadata(&updated).await.unwrap();
    assert_eq!(store.get_metadata("FACTS.md").await.unwrap(), Some(updated));

    assert_eq!(store.delete_by_file("FACTS.md").await.unwrap(), 1);
    assert!(store.full_text_search("Lisbon", 10).await.unwrap().is_empty());
    // Metadata survives delete_by_file; remove_file drops it.
    assert!(store.get_metadata("FACTS.md").await.unwrap().is_some());
    store.remove_file("FACTS.md").await.unwrap();
    assert!(store.get_metadata("FACTS.md").await.unwrap().is_none());

    store.vacuum().await.unwrap();
    store.analyze().await.unwrap();
    store.close().await;
}
