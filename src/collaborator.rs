//! Language-model collaborator boundary.
//!
//! The engine never decides *what* is worth remembering or *how* a memory
//! file should change; it asks a [`Collaborator`] and consumes the text it
//! returns. Two implementations ship:
//!
//! - **[`DisabledCollaborator`]**: always fails, so every caller takes its
//!   conservative default path.
//! - **[`OpenAiCollaborator`]**: OpenAI-compatible chat completions over
//!   `reqwest`, with retry and exponential backoff.
//!
//! # Retry Strategy
//!
//! - HTTP 429 and 5xx → retry
//! - Other 4xx → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, ... capped at 32s

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::CollaboratorConfig;
use crate::error::{Error, Result};

/// Hint about the shape of the expected response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFormat {
    Text,
    Json,
}

#[async_trait]
pub trait Collaborator: Send + Sync {
    /// Provider name for logs and `mem stats`.
    fn name(&self) -> &str;

    async fn complete(&self, prompt: &str, format: ResponseFormat) -> Result<String>;
}

pub struct DisabledCollaborator;

#[async_trait]
impl Collaborator for DisabledCollaborator {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn complete(&self, _prompt: &str, _format: ResponseFormat) -> Result<String> {
        Err(Error::Collaborator(
            "collaborator disabled; set [collaborator] provider in config".into(),
        ))
    }
}

pub struct OpenAiCollaborator {
    client: reqwest::Client,
    api_key: String,
    model: String,
    endpoint: String,
    max_retries: u32,
}

impl OpenAiCollaborator {
    /// Requires `collaborator.model` and the `OPENAI_API_KEY` environment
    /// variable.
    pub fn new(config: &CollaboratorConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| Error::Config("collaborator.model required for openai provider".into()))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| Error::Config("OPENAI_API_KEY environment variable not set".into()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Collaborator(e.to_string()))?;

        Ok(Self {
            client,
            api_key,
            model,
            endpoint: config.endpoint.clone(),
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl Collaborator for OpenAiCollaborator {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str, format: ResponseFormat) -> Result<String> {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
        });
        if format == ResponseFormat::Json {
            body["response_format"] = serde_json::json!({ "type": "json_object" });
        }

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                debug!(attempt, delay_secs = delay.as_secs(), "retrying collaborator request");
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(&self.endpoint)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response
                            .json()
                            .await
                            .map_err(|e| Error::Decode(e.to_string()))?;
                        return parse_chat_response(&json);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        warn!(%status, attempt, "collaborator request failed, will retry");
                        last_err = Some(Error::Collaborator(format!("API error {}: {}", status, body_text)));
                        continue;
                    }

                    return Err(Error::Collaborator(format!("API error {}: {}", status, body_text)));
                }
                Err(e) => {
                    warn!(error = %e, attempt, "collaborator request failed, will retry");
                    last_err = Some(Error::Collaborator(e.to_string()));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| Error::Collaborator("request failed after retries".into())))
    }
}

/// Pull `choices[0].message.content` out of a chat completions response.
fn parse_chat_response(json: &serde_json::Value) -> Result<String> {
    json.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| Error::Decode("chat response missing choices[0].message.content".into()))
}

/// Instantiate the collaborator named by `config.provider`.
///
/// | Config Value | Collaborator |
/// |-------------|--------------|
/// | `"disabled"` | [`DisabledCollaborator`] |
/// | `"openai"` | [`OpenAiCollaborator`] |
pub fn create_collaborator(config: &CollaboratorConfig) -> Result<Box<dyn Collaborator>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledCollaborator)),
        "openai" => Ok(Box::new(OpenAiCollaborator::new(config)?)),
        other => Err(Error::Config(format!("unknown collaborator provider: {}", other))),
    }
}

/// The JSON object embedded in a model reply: everything from the first `{`
/// to the last `}`. Tolerates code fences and surrounding prose.
pub fn extract_json(text: &str) -> Result<&str> {
    let start = text.find('{');
    let end = text.rfind('}');
    match (start, end) {
        (Some(s), Some(e)) if s < e => Ok(&text[s..=e]),
        _ => Err(Error::Decode("no JSON object in collaborator response".into())),
    }
}

/// Decode the JSON object embedded in `text` into `T`.
pub fn decode_json<T: serde::de::DeserializeOwned>(text: &str) -> Result<T> {
    Ok(serde_json::from_str(extract_json(text)?)?)
}
