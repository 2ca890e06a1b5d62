//! Chat-completion transport.

use std::time::Duration;

use async_trait::async_trait;
use bdbot_core::{Interrupted, RunContext};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("llm request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("llm returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("llm response had no choices")]
    NoChoices,
    #[error("llm call interrupted: {0}")]
    Interrupted(#[from] Interrupted),
}

/// Role-tagged messages in, one textual completion out.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(
        &self,
        ctx: &RunContext,
        messages: &[ChatMessage],
    ) -> Result<String, TransportError>;
}

#[derive(Debug, Clone)]
pub struct LlmSettings {
    /// Base URL up to, not including, `/chat/completions`.
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout: Duration,
}

/// Client for any endpoint speaking the OpenAI chat-completions dialect.
#[derive(Debug, Clone)]
pub struct OpenAiCompatClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiCompatClient {
    pub fn new(settings: LlmSettings) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()?;
        // Example configs ship the literal placeholder key.
        let api_key = settings
            .api_key
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty() && k != "sk-...");
        Ok(Self {
            client,
            endpoint: completions_endpoint(&settings.base_url),
            api_key,
            model: settings.model,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn send(&self, messages: &[ChatMessage]) -> Result<String, TransportError> {
        let mut request = self.client.post(&self.endpoint).json(&CompletionRequest {
            model: &self.model,
            messages,
            stream: false,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body: body.chars().take(512).collect(),
            });
        }

        let parsed: CompletionResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content.unwrap_or_default())
            .ok_or(TransportError::NoChoices)
    }
}

#[async_trait]
impl CompletionClient for OpenAiCompatClient {
    async fn complete(
        &self,
        ctx: &RunContext,
        messages: &[ChatMessage],
    ) -> Result<String, TransportError> {
        debug!(run_id = %ctx.run_id(), endpoint = %self.endpoint, model = %self.model, "llm completion");
        ctx.run(self.send(messages)).await?
    }
}

fn completions_endpoint(base_url: &str) -> String {
    let base = base_url.trim().trim_end_matches('/');
    if base.ends_with("/chat/completions") {
        base.to_string()
    } else {
        format!("{base}/chat/completions")
    }
}
