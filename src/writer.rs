//! Memory writer: decides where new information goes and applies it.
//!
//! `remember(content)` runs two collaborator rounds:
//!
//! 1. **Analysis**: is `content` worth remembering, and in which memory file?
//!    Expects `{targetFile, extractedContent, shouldUpdate, reason}`.
//! 2. **Decision**: given the numbered current file and the extracted
//!    content, how should the file change? Expects an [`UpdateDecision`].
//!
//! If either round fails or returns something that does not decode, the raw
//! content is appended to the fallback target instead. Nothing is lost.

use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::collaborator::{decode_json, Collaborator, ResponseFormat};
use crate::error::{Error, Result};
use crate::update::{MemoryUpdater, UpdateDecision, UpdateOutcome};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryAnalysis {
    pub target_file: String,
    pub extracted_content: String,
    pub should_update: bool,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RememberOutcome {
    /// The collaborator judged the content not worth keeping.
    NotMemoryWorthy { reason: String },
    Updated { target: String, outcome: UpdateOutcome },
    /// Conservative default: raw content appended to the fallback target.
    Appended {
        target: String,
        outcome: UpdateOutcome,
        cause: String,
    },
}

pub struct MemoryWriter {
    collaborator: Arc<dyn Collaborator>,
    updater: Arc<MemoryUpdater>,
    targets: Vec<String>,
    fallback_target: String,
}

impl MemoryWriter {
    pub fn new(
        collaborator: Arc<dyn Collaborator>,
        updater: Arc<MemoryUpdater>,
        targets: Vec<String>,
        fallback_target: String,
    ) -> Self {
        Self {
            collaborator,
            updater,
            targets,
            fallback_target,
        }
    }

    pub async fn remember(&self, content: &str) -> Result<RememberOutcome> {
        let content = content.trim();
        if content.is_empty() {
            return Ok(RememberOutcome::NotMemoryWorthy {
                reason: "empty content".into(),
            });
        }

        match self.decide(content).await {
            Ok(Decided::Skip(reason)) => {
                info!(%reason, "content not memory-worthy");
                Ok(RememberOutcome::NotMemoryWorthy { reason })
            }
            Ok(Decided::Apply {
                target,
                decision,
                extracted,
            }) => {
                let outcome = self.updater.apply(&target, decision, &extracted).await?;
                Ok(RememberOutcome::Updated { target, outcome })
            }
            Err(e) => {
                warn!(error = %e, target = %self.fallback_target, "collaborator unusable, appending raw content");
                let outcome = self.updater.append(&self.fallback_target, content).await?;
                Ok(RememberOutcome::Appended {
                    target: self.fallback_target.clone(),
                    outcome,
                    cause: e.to_string(),
                })
            }
        }
    }

    async fn decide(&self, content: &str) -> Result<Decided> {
        let reply = self
            .collaborator
            .complete(&analysis_prompt(content, &self.targets), ResponseFormat::Json)
            .await?;
        let analysis: MemoryAnalysis = decode_json(&reply)?;
        if !analysis.should_update {
            return Ok(Decided::Skip(analysis.reason));
        }

        let target = self.known_target(&analysis.target_file)?;
        let current = self.updater.read(&target).await?;

        let reply = self
            .collaborator
            .complete(
                &decision_prompt(&target, &current.numbered(), &analysis.extracted_content),
                ResponseFormat::Json,
            )
            .await?;
        let decision: UpdateDecision = decode_json(&reply)?;

        Ok(Decided::Apply {
            target,
            decision,
            extracted: analysis.extracted_content,
        })
    }

    /// Match the collaborator's choice against the configured targets,
    /// ignoring case and a trailing `.md`.
    fn known_target(&self, name: &str) -> Result<String> {
        let name = name.trim();
        let stem = name.strip_suffix(".md").unwrap_or(name);
        self.targets
            .iter()
            .find(|t| t.eq_ignore_ascii_case(stem))
            .cloned()
            .ok_or_else(|| Error::InvalidTarget(name.to_string()))
    }
}

enum Decided {
    Skip(String),
    Apply {
        target: String,
        decision: UpdateDecision,
        extracted: String,
    },
}

fn analysis_prompt(content: &str, targets: &[String]) -> String {
    format!(
        "Decide whether the following information should be stored in long-term memory.\n\
         Available memory files: {}.\n\
         Reply with a JSON object: {{\"targetFile\": string, \"extractedContent\": string, \
         \"shouldUpdate\": boolean, \"reason\": string}}.\n\n\
         Information:\n{}",
        targets.join(", "),
        content
    )
}

fn decision_prompt(target: &str, numbered: &str, extracted: &str) -> String {
    format!(
        "Memory file {} currently reads (line numbers on the left):\n{}\n\
         New information:\n{}\n\n\
         Reply with a JSON object: {{\"needsUpdate\": boolean, \
         \"updateScope\": \"whole-file\" | \"line-based\" | \"none\" | \"needs-confirmation\", \
         \"updatedContent\": string, \
         \"lineUpdates\": [{{\"lineNumber\": number, \"content\": string, \"operation\": \"update\" | \"add\"}}], \
         \"reason\": string}}.\n\
         Line updates are applied in order; account for earlier inserts when numbering later ones.",
        target,
        if numbered.is_empty() { "(empty)\n" } else { numbered },
        extracted
    )
}
