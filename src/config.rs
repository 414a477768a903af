use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub collaborator: CollaboratorConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

fn default_pool_size() -> u32 {
    5
}
fn default_acquire_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct MemoryConfig {
    #[serde(default = "default_root")]
    pub root: PathBuf,
    /// Archive tree; relative paths are resolved against `root`.
    #[serde(default = "default_archive_dir")]
    pub archive_dir: PathBuf,
    /// Dated conversation logs; relative paths are resolved against `root`.
    #[serde(default = "default_logs_dir")]
    pub logs_dir: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default = "default_exclude_globs")]
    pub exclude_globs: Vec<String>,
    /// Memory file that receives content when the collaborator's answer is unusable.
    #[serde(default = "default_fallback_target")]
    pub fallback_target: String,
    /// Memory files the analysis step may choose from.
    #[serde(default = "default_targets")]
    pub targets: Vec<String>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            archive_dir: default_archive_dir(),
            logs_dir: default_logs_dir(),
            include_globs: default_include_globs(),
            exclude_globs: default_exclude_globs(),
            fallback_target: default_fallback_target(),
            targets: default_targets(),
        }
    }
}

impl MemoryConfig {
    pub fn archive_path(&self) -> PathBuf {
        self.root.join(&self.archive_dir)
    }

    pub fn logs_path(&self) -> PathBuf {
        self.root.join(&self.logs_dir)
    }
}

fn default_root() -> PathBuf {
    PathBuf::from("./memory")
}
fn default_archive_dir() -> PathBuf {
    PathBuf::from("archive")
}
fn default_logs_dir() -> PathBuf {
    PathBuf::from("logs")
}
fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string()]
}
fn default_exclude_globs() -> Vec<String> {
    vec!["logs/**".to_string()]
}
fn default_fallback_target() -> String {
    "NOTES".to_string()
}
fn default_targets() -> Vec<String> {
    ["FACTS", "PREFERENCES", "PERSONA", "NOTES"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_overlap_lines")]
    pub overlap_lines: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
            overlap_lines: default_overlap_lines(),
        }
    }
}

fn default_max_chars() -> usize {
    1600
}
fn default_overlap_lines() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
        }
    }
}

fn default_cache_capacity() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_chunk_score")]
    pub chunk_score: f64,
    #[serde(default = "default_log_score")]
    pub log_score: f64,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default)]
    pub min_score: f64,
    /// Matching lines kept per log file result.
    #[serde(default = "default_log_excerpt_lines")]
    pub log_excerpt_lines: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            chunk_score: default_chunk_score(),
            log_score: default_log_score(),
            max_results: default_max_results(),
            min_score: 0.0,
            log_excerpt_lines: default_log_excerpt_lines(),
        }
    }
}

fn default_chunk_score() -> f64 {
    0.8
}
fn default_log_score() -> f64 {
    0.6
}
fn default_max_results() -> usize {
    10
}
fn default_log_excerpt_lines() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatcherConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

fn default_workers() -> usize {
    4
}
fn default_queue_capacity() -> usize {
    1024
}
fn default_shutdown_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct HistoryConfig {
    #[serde(default = "default_token_threshold")]
    pub token_threshold: usize,
    #[serde(default = "default_trigger_ratio")]
    pub trigger_ratio: f64,
    #[serde(default = "default_window_turns")]
    pub window_turns: usize,
    #[serde(default = "default_fallback_tokens_per_char")]
    pub fallback_tokens_per_char: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            token_threshold: default_token_threshold(),
            trigger_ratio: default_trigger_ratio(),
            window_turns: default_window_turns(),
            fallback_tokens_per_char: default_fallback_tokens_per_char(),
        }
    }
}

fn default_token_threshold() -> usize {
    184_000
}
fn default_trigger_ratio() -> f64 {
    0.8
}
fn default_window_turns() -> usize {
    40
}
fn default_fallback_tokens_per_char() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct CollaboratorConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for CollaboratorConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            endpoint: default_endpoint(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_endpoint() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    60
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.db.pool_size == 0 {
        anyhow::bail!("db.pool_size must be > 0");
    }

    if config.chunking.max_chars == 0 {
        anyhow::bail!("chunking.max_chars must be > 0");
    }

    if config.cache.capacity < 2 {
        anyhow::bail!("cache.capacity must be >= 2");
    }

    for (name, score) in [
        ("retrieval.chunk_score", config.retrieval.chunk_score),
        ("retrieval.log_score", config.retrieval.log_score),
        ("retrieval.min_score", config.retrieval.min_score),
    ] {
        if !(0.0..=1.0).contains(&score) {
            anyhow::bail!("{} must be in [0.0, 1.0]", name);
        }
    }

    if config.watcher.workers == 0 {
        anyhow::bail!("watcher.workers must be > 0");
    }

    if !(0.0..=1.0).contains(&config.history.trigger_ratio) || config.history.trigger_ratio == 0.0
    {
        anyhow::bail!("history.trigger_ratio must be in (0.0, 1.0]");
    }

    if config.history.window_turns == 0 {
        anyhow::bail!("history.window_turns must be > 0");
    }

    match config.collaborator.provider.as_str() {
        "disabled" => {}
        "openai" => {
            if config.collaborator.model.is_none() {
                anyhow::bail!("collaborator.model must be specified when provider is 'openai'");
            }
        }
        other => anyhow::bail!(
            "Unknown collaborator provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    Ok(config)
}
