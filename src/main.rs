//! # Memory Harness CLI (`mem`)
//!
//! The `mem` binary drives the memory engine: it initializes the database,
//! indexes or watches the memory directory, searches it, and applies memory
//! updates.
//!
//! ## Usage
//!
//! ```bash
//! mem --config ./config/mem.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `mem init` | Create the database, run migrations, create the memory root |
//! | `mem index` | Index every memory file and drop deleted ones |
//! | `mem watch` | Index, then keep the index current until Ctrl-C |
//! | `mem search "<query>"` | Hybrid search over chunks and conversation logs |
//! | `mem stats` | Index and cache statistics |
//! | `mem maintain` | VACUUM, ANALYZE and FTS optimize |
//! | `mem apply <TARGET> --decision <file>` | Apply an update decision to a memory file |
//! | `mem remember "<text>"` | Let the collaborator file new information |
//!
//! Results go to stdout; logs go to stderr (`RUST_LOG` overrides the
//! default `memory_harness=info` filter).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Read;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use memory_harness::collaborator::decode_json;
use memory_harness::config;
use memory_harness::engine::MemoryEngine;
use memory_harness::models::ResultType;
use memory_harness::stats::render_stats;
use memory_harness::update::{UpdateDecision, UpdateOutcome};
use memory_harness::writer::RememberOutcome;

/// Memory Harness CLI: index, search, and update an assistant's markdown
/// memory.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/mem.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "mem",
    about = "Memory Harness — index, search, and safely update markdown memory files",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/mem.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema and the memory directory.
    ///
    /// Idempotent: running it again is safe.
    Init,

    /// Index every tracked memory file.
    ///
    /// Unchanged files are skipped by fingerprint; files that no longer exist
    /// are removed from the index.
    Index,

    /// Index, then watch the memory directory until interrupted.
    Watch,

    /// Search indexed chunks and conversation logs.
    Search {
        /// The search query string.
        query: String,

        /// Maximum number of results to return.
        #[arg(long)]
        limit: Option<usize>,

        /// Drop results scoring below this value (0.0 to 1.0).
        #[arg(long)]
        min_score: Option<f64>,

        /// Print results as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show index and cache statistics.
    Stats,

    /// Compact the database and refresh planner and FTS statistics.
    Maintain,

    /// Apply an update decision (JSON) to a memory file.
    Apply {
        /// Memory file name, e.g. `FACTS` or `NOTES.md`.
        target: String,

        /// File holding the decision object; `-` reads stdin.
        #[arg(long)]
        decision: PathBuf,

        /// Raw content used when a whole-file decision has an empty body.
        #[arg(long, default_value = "")]
        raw: String,
    },

    /// Ask the collaborator to file new information into memory.
    Remember {
        /// Free-form text to remember.
        content: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("memory_harness=info,mem=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    let engine = MemoryEngine::open(cfg)
        .await
        .context("Failed to open memory engine")?;

    let result = run(&engine, cli.command).await;
    engine.shutdown(None).await;
    result
}

async fn run(engine: &MemoryEngine, command: Commands) -> Result<()> {
    match command {
        Commands::Init => {
            println!("Database initialized successfully.");
            println!("  Database:    {}", engine.config().db.path.display());
            println!("  Memory root: {}", engine.indexer().root().display());
        }
        Commands::Index => {
            let report = engine.index_all().await?;
            println!("Index complete.");
            println!("  Files seen:      {}", report.files_seen);
            println!("  Indexed:         {}", report.files_indexed);
            println!("  Unchanged:       {}", report.files_unchanged);
            println!("  Removed:         {}", report.files_removed);
            println!("  Chunks written:  {}", report.chunks_written);
            if report.errors > 0 {
                println!("  Errors:          {}", report.errors);
            }
        }
        Commands::Watch => {
            engine.index_all().await?;
            let watch = engine.watch()?;
            println!(
                "Watching {} (Ctrl-C to stop)",
                engine.indexer().root().display()
            );
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
            let processed = watch
                .stats()
                .processed
                .load(std::sync::atomic::Ordering::Relaxed);
            println!("Stopping... ({} file events handled)", processed);
            watch.shutdown().await;
        }
        Commands::Search {
            query,
            limit,
            min_score,
            json,
        } => {
            let retrieval = &engine.config().retrieval;
            let results = engine
                .search(
                    &query,
                    limit.unwrap_or(retrieval.max_results),
                    min_score.unwrap_or(retrieval.min_score),
                )
                .await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else if results.is_empty() {
                println!("No results.");
            } else {
                for (i, r) in results.iter().enumerate() {
                    let location = match (r.result_type, r.start_line, r.end_line) {
                        (ResultType::Chunk, Some(s), Some(e)) => {
                            format!("{}:{}-{}", r.file_path, s, e)
                        }
                        _ => format!("{} (log)", r.file_path),
                    };
                    println!("{}. [{:.2}] {}", i + 1, r.score, location);
                    for line in r.content.lines().take(3) {
                        println!("    {}", line);
                    }
                    println!();
                }
            }
        }
        Commands::Stats => {
            let (store, cache) = engine.statistics().await?;
            print!("{}", render_stats(&engine.config().db.path, &store, &cache));
        }
        Commands::Maintain => {
            engine.maintain().await?;
            println!("Maintenance complete.");
        }
        Commands::Apply {
            target,
            decision,
            raw,
        } => {
            let text = if decision.as_os_str() == "-" {
                let mut buf = String::new();
                std::io::stdin()
                    .read_to_string(&mut buf)
                    .context("Failed to read decision from stdin")?;
                buf
            } else {
                std::fs::read_to_string(&decision)
                    .with_context(|| format!("Failed to read decision file: {}", decision.display()))?
            };
            let decision: UpdateDecision =
                decode_json(&text).context("Failed to decode update decision")?;
            let outcome = engine.apply(&target, decision, &raw).await?;
            print_update(&outcome);
        }
        Commands::Remember { content } => match engine.remember(&content).await? {
            RememberOutcome::NotMemoryWorthy { reason } => {
                println!("Not stored: {}", reason);
            }
            RememberOutcome::Updated { target, outcome } => {
                println!("Target: {}", target);
                print_update(&outcome);
            }
            RememberOutcome::Appended {
                target,
                outcome,
                cause,
            } => {
                println!("Appended to {} ({})", target, cause);
                print_update(&outcome);
            }
        },
    }

    Ok(())
}

fn print_update(outcome: &UpdateOutcome) {
    match outcome {
        UpdateOutcome::Skipped { reason } => println!("No update: {}", reason),
        UpdateOutcome::AwaitingConfirmation(decision) => {
            println!("Awaiting confirmation: {}", decision.reason);
            if let Ok(json) = serde_json::to_string_pretty(decision) {
                println!("{}", json);
            }
        }
        UpdateOutcome::Applied {
            path,
            lines,
            reindexed,
        } => {
            println!("Updated {} ({} lines)", path.display(), lines);
            if !reindexed {
                println!("  Warning: re-index failed; run `mem index` to catch up.");
            }
        }
    }
}
