//! # Memory Harness
//!
//! The memory engine of a personal assistant: it indexes markdown memory
//! files and conversation logs into SQLite, serves hybrid keyword search over
//! them, and applies externally decided edits back into long-term memory
//! files without corrupting them.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐   ┌──────────────────┐   ┌───────────┐
//! │ memory/*.md   │──▶│ Watcher/Indexer  │──▶│  SQLite   │
//! │ archive/ logs/│   │ detect+chunk     │   │ FTS5+meta │
//! └──────▲────────┘   └──────────────────┘   └────┬──────┘
//!        │                                        │
//!        │ atomic write              ┌────────────┤
//!        │                           ▼            ▼
//! ┌──────┴────────┐            ┌──────────┐  ┌──────────┐
//! │ Update        │◀───────────│  Writer  │  │  Search  │
//! │ protocol      │  decision  │ (LLM)    │  │ + cache  │
//! └───────────────┘            └──────────┘  └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! mem init                       # create database and memory root
//! mem index                      # index every memory file
//! mem watch                      # keep the index current until Ctrl-C
//! mem search "invoice"
//! mem remember "My sister's birthday is 3 May"
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy |
//! | [`models`] | Core data types |
//! | [`chunk`] | Line-addressed text chunking |
//! | [`fingerprint`] | File change detection |
//! | [`db`] | Connection pool |
//! | [`migrate`] | Schema migrations |
//! | [`store`] | Chunk, metadata and FTS storage |
//! | [`indexer`] | Scan and per-file indexing |
//! | [`watcher`] | Filesystem watcher and worker pool |
//! | [`cache`] | LRU query cache |
//! | [`search`] | Hybrid chunk + log search |
//! | [`update`] | Line-based and whole-file memory updates |
//! | [`collaborator`] | Language-model boundary |
//! | [`writer`] | Memory-worthiness analysis and update driving |
//! | [`history`] | Conversation buffer, logs and compression |
//! | [`engine`] | Owner of all of the above |
//! | [`stats`] | Statistics rendering |

pub mod cache;
pub mod chunk;
pub mod collaborator;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod history;
pub mod indexer;
pub mod migrate;
pub mod models;
pub mod search;
pub mod stats;
pub mod store;
pub mod update;
pub mod watcher;
pub mod writer;
