//! Index statistics and health overview.
//!
//! Summarizes what is indexed: file and chunk counts, token and byte totals,
//! chunk age range, the files with the most chunks, and query cache
//! counters. Used by `mem stats`.

use crate::cache::CacheStats;
use crate::store::StoreStatistics;
use std::path::Path;

/// Render the statistics block printed by `mem stats`.
pub fn render_stats(db_path: &Path, store: &StoreStatistics, cache: &CacheStats) -> String {
    let mut out = String::new();
    let mut line = |s: String| {
        out.push_str(&s);
        out.push('\n');
    };

    line("Memory Harness — Index Stats".to_string());
    line("============================".to_string());
    line(String::new());
    line(format!("  Database:    {}", db_path.display()));
    line(format!("  Size:        {}", format_bytes(store.db_size_bytes)));
    line(String::new());
    line(format!("  Files:       {}", store.total_files));
    line(format!("  Chunks:      {}", store.total_chunks));
    line(format!("  Tokens:      ~{}", store.total_tokens));
    line(format!(
        "  Content:     {}",
        format_bytes(store.total_bytes.max(0) as u64)
    ));
    if let (Some(oldest), Some(newest)) = (store.oldest_chunk, store.newest_chunk) {
        line(format!("  Oldest:      {}", format_ts_relative(oldest)));
        line(format!("  Newest:      {}", format_ts_relative(newest)));
    }

    let lookups = cache.hits + cache.misses;
    line(String::new());
    line(format!(
        "  Cache:       {} / {} entries, {} hits, {} misses ({}% hit rate), {} evicted",
        cache.entries,
        cache.capacity,
        cache.hits,
        cache.misses,
        if lookups > 0 {
            (cache.hits * 100) / lookups
        } else {
            0
        },
        cache.evictions
    ));

    if !store.largest_files.is_empty() {
        line(String::new());
        line("  Largest files:".to_string());
        line(format!("  {:<48} {:>8}", "FILE", "CHUNKS"));
        line(format!("  {}", "-".repeat(57)));
        for f in &store.largest_files {
            line(format!("  {:<48} {:>8}", f.file_path, f.chunk_count));
        }
    }

    out
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
