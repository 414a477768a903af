//! Update protocol for long-term memory files.
//!
//! An externally produced [`UpdateDecision`] is turned into an [`UpdatePlan`]
//! and applied to `<root>/<NAME>.md`:
//!
//! ```text
//! decision ──▶ NoUpdateNeeded
//!          ├─▶ AwaitingConfirmation      (nothing written)
//!          ├─▶ WholeFileReplace  ─┐
//!          └─▶ LineBasedPatch    ─┴─▶ atomic write ──▶ re-index
//! ```
//!
//! Line directives are applied in order, each against the document produced
//! by the previous one. Out-of-range positions append instead of failing.
//!
//! Writes go through a temp file in the target's directory followed by a
//! rename, so readers never see a half-written file. There is no optimistic
//! concurrency check: two concurrent updates to one file race and the later
//! writer wins.

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::indexer::{IndexOutcome, Indexer};

/// Decision object returned by the collaborator (camelCase JSON).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDecision {
    #[serde(default)]
    pub needs_update: bool,
    #[serde(default)]
    pub update_scope: UpdateScope,
    #[serde(default)]
    pub updated_content: Option<String>,
    /// Raw directives; each one is validated on its own so a single bad
    /// entry does not reject the whole decision.
    #[serde(default)]
    pub line_updates: Vec<serde_json::Value>,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateScope {
    WholeFile,
    LineBased,
    #[default]
    None,
    NeedsConfirmation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectiveOp {
    Update,
    Add,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineDirective {
    /// 1-based target line.
    pub line_number: usize,
    pub content: String,
    pub op: DirectiveOp,
}

impl LineDirective {
    /// Validate one `{lineNumber, content, operation}` entry.
    ///
    /// Negative line numbers are kept as out of range (stored as 0) and end
    /// up appended.
    pub fn parse(value: &serde_json::Value) -> Result<Self> {
        let raw_line = value.get("lineNumber");
        let line_number = match (
            raw_line.and_then(|v| v.as_u64()),
            raw_line.and_then(|v| v.as_i64()),
        ) {
            (Some(n), _) => usize::try_from(n).unwrap_or(usize::MAX),
            (None, Some(_)) => 0,
            (None, None) => {
                return Err(Error::Decode("directive missing integer lineNumber".into()))
            }
        };
        let content = value
            .get("content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Decode("directive missing string content".into()))?;
        let op = match value.get("operation").and_then(|v| v.as_str()) {
            Some("update") => DirectiveOp::Update,
            Some("add") => DirectiveOp::Add,
            Some(other) => {
                return Err(Error::Decode(format!("unknown directive operation '{}'", other)))
            }
            None => return Err(Error::Decode("directive missing operation".into())),
        };

        Ok(Self {
            line_number,
            content: content.to_string(),
            op,
        })
    }
}

/// Immutable line sequence. [`apply`](LineDocument::apply) returns a new
/// document and leaves `self` untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineDocument {
    lines: Vec<String>,
}

impl LineDocument {
    pub fn parse(text: &str) -> Self {
        Self {
            lines: text.lines().map(str::to_string).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// 1-based line access.
    pub fn line(&self, number: usize) -> Option<&str> {
        number
            .checked_sub(1)
            .and_then(|i| self.lines.get(i))
            .map(String::as_str)
    }

    pub fn apply(&self, directive: &LineDirective) -> Self {
        let mut lines = self.lines.clone();
        let in_range = (1..=lines.len()).contains(&directive.line_number);
        match (directive.op, in_range) {
            (DirectiveOp::Update, true) => lines[directive.line_number - 1] = directive.content.clone(),
            (DirectiveOp::Add, true) => lines.insert(directive.line_number - 1, directive.content.clone()),
            (_, false) => lines.push(directive.content.clone()),
        }
        Self { lines }
    }

    /// Append every line of `text` after the last line.
    pub fn append_text(&self, text: &str) -> Self {
        let mut lines = self.lines.clone();
        lines.extend(text.lines().map(str::to_string));
        Self { lines }
    }

    pub fn apply_all(&self, directives: &[LineDirective]) -> Self {
        directives
            .iter()
            .fold(self.clone(), |doc, directive| doc.apply(directive))
    }

    /// `"N: line"` listing handed to the collaborator.
    pub fn numbered(&self) -> String {
        self.lines
            .iter()
            .enumerate()
            .map(|(i, line)| format!("{}: {}\n", i + 1, line))
            .collect()
    }
}

impl std::fmt::Display for LineDocument {
    /// Every line, newline-terminated.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for line in &self.lines {
            writeln!(f, "{}", line)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdatePlan {
    NoUpdateNeeded { reason: String },
    AwaitingConfirmation(UpdateDecision),
    WholeFileReplace { body: String },
    LineBasedPatch { directives: Vec<LineDirective> },
}

impl UpdatePlan {
    /// Build a plan from a decision. `raw_content` is the unprocessed text the
    /// update was derived from; it replaces an empty whole-file body.
    pub fn from_decision(decision: UpdateDecision, raw_content: &str) -> Self {
        if !decision.needs_update {
            return Self::NoUpdateNeeded {
                reason: decision.reason,
            };
        }

        match decision.update_scope {
            UpdateScope::None => Self::NoUpdateNeeded {
                reason: decision.reason,
            },
            UpdateScope::NeedsConfirmation => Self::AwaitingConfirmation(decision),
            UpdateScope::WholeFile => {
                let body = decision
                    .updated_content
                    .filter(|b| !b.trim().is_empty())
                    .unwrap_or_else(|| raw_content.to_string());
                if body.trim().is_empty() {
                    Self::NoUpdateNeeded {
                        reason: "empty replacement body".into(),
                    }
                } else {
                    Self::WholeFileReplace { body }
                }
            }
            UpdateScope::LineBased => {
                let directives: Vec<LineDirective> = decision
                    .line_updates
                    .iter()
                    .filter_map(|raw| match LineDirective::parse(raw) {
                        Ok(d) => Some(d),
                        Err(e) => {
                            warn!(error = %e, directive = %raw, "skipping malformed line directive");
                            None
                        }
                    })
                    .collect();
                if directives.is_empty() {
                    Self::NoUpdateNeeded {
                        reason: "no valid line directives".into(),
                    }
                } else {
                    Self::LineBasedPatch { directives }
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    Skipped { reason: String },
    /// Returned to the caller untouched; nothing was written.
    AwaitingConfirmation(UpdateDecision),
    Applied {
        path: PathBuf,
        lines: usize,
        /// False when the write succeeded but re-indexing failed.
        reindexed: bool,
    },
}

/// Resolve a memory name (`FACTS`, `notes.md`) to `<root>/<NAME>.md`.
pub fn resolve_target(root: &Path, name: &str) -> Result<PathBuf> {
    let name = name.trim();
    let stem = name
        .strip_suffix(".md")
        .or_else(|| name.strip_suffix(".MD"))
        .unwrap_or(name);

    if stem.is_empty()
        || stem.contains('/')
        || stem.contains('\\')
        || stem.contains("..")
        || stem.starts_with('.')
    {
        return Err(Error::InvalidTarget(name.to_string()));
    }

    Ok(root.join(format!("{}.md", stem)))
}

pub struct MemoryUpdater {
    root: PathBuf,
    indexer: Arc<Indexer>,
}

impl MemoryUpdater {
    pub fn new(indexer: Arc<Indexer>) -> Self {
        Self {
            root: indexer.root().to_path_buf(),
            indexer,
        }
    }

    pub fn resolve(&self, name: &str) -> Result<PathBuf> {
        resolve_target(&self.root, name)
    }

    /// Current contents of a memory file; a missing file reads as empty.
    pub async fn read(&self, name: &str) -> Result<LineDocument> {
        let path = self.resolve(name)?;
        read_document(&path).await
    }

    pub async fn apply(
        &self,
        target: &str,
        decision: UpdateDecision,
        raw_content: &str,
    ) -> Result<UpdateOutcome> {
        let path = self.resolve(target)?;

        let document = match UpdatePlan::from_decision(decision, raw_content) {
            UpdatePlan::NoUpdateNeeded { reason } => {
                info!(memory = %target, %reason, "no memory update needed");
                return Ok(UpdateOutcome::Skipped { reason });
            }
            UpdatePlan::AwaitingConfirmation(decision) => {
                info!(memory = %target, reason = %decision.reason, "memory update awaiting confirmation");
                return Ok(UpdateOutcome::AwaitingConfirmation(decision));
            }
            UpdatePlan::WholeFileReplace { body } => LineDocument::parse(&body),
            UpdatePlan::LineBasedPatch { directives } => {
                read_document(&path).await?.apply_all(&directives)
            }
        };

        self.commit(path, document).await
    }

    /// Append `content` as a trailing block. Used as the conservative default
    /// when no usable decision is available.
    pub async fn append(&self, target: &str, content: &str) -> Result<UpdateOutcome> {
        let path = self.resolve(target)?;
        if content.trim().is_empty() {
            return Ok(UpdateOutcome::Skipped {
                reason: "nothing to append".into(),
            });
        }
        let document = read_document(&path).await?.append_text(content);
        self.commit(path, document).await
    }

    async fn commit(&self, path: PathBuf, document: LineDocument) -> Result<UpdateOutcome> {
        write_atomic(&path, document.to_string()).await?;
        info!(path = %path.display(), lines = document.len(), "memory file updated");

        let reindexed = match self.indexer.index_file(&path).await {
            Ok(IndexOutcome::Indexed { .. } | IndexOutcome::Unchanged) => true,
            Ok(_) => false,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "re-index after update failed");
                false
            }
        };

        Ok(UpdateOutcome::Applied {
            path,
            lines: document.len(),
            reindexed,
        })
    }
}

async fn read_document(path: &Path) -> Result<LineDocument> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(LineDocument::parse(&text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(LineDocument::default()),
        Err(e) => Err(Error::io(path, e)),
    }
}

/// Write via a sibling temp file and rename over `path`.
async fn write_atomic(path: &Path, contents: String) -> Result<()> {
    let path = path.to_path_buf();
    let task_path = path.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let dir = task_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| Error::io(&dir, e))?;
        tmp.write_all(contents.as_bytes())
            .map_err(|e| Error::io(tmp.path(), e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| Error::io(tmp.path(), e))?;
        tmp.persist(&task_path)
            .map_err(|e| Error::io(&task_path, e.error))?;
        Ok(())
    })
    .await
    .map_err(|e| Error::io(&path, std::io::Error::other(e)))?
}
