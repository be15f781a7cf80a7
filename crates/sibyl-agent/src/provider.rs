use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::stream::{StreamEvent, TokenUsage};

/// A single message in the conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Request to an LLM provider.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub system: String,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
    pub stream: bool,
}

/// Response from an LLM provider (non-streaming).
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub model: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub stop_reason: String,
}

/// Common interface for all LLM providers.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name for logging and error messages.
    fn name(&self) -> &str;

    /// Send a non-streaming chat request, wait for full response.
    async fn send(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError>;

    /// Stream response events through a channel.
    /// Default: falls back to non-streaming send, emits one Delta then
    /// Finished.
    async fn send_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let resp = self.send(req).await?;
        let _ = tx.send(StreamEvent::Delta(resp.content)).await;
        let _ = tx
            .send(StreamEvent::Finished {
                model: resp.model,
                usage: TokenUsage {
                    input: resp.tokens_in,
                    output: resp.tokens_out,
                },
                stop_reason: resp.stop_reason,
            })
            .await;
        Ok(())
    }
}

/// Shared HTTP status handling for both provider clients: success passes
/// through, 429 keeps the Retry-After hint, everything else becomes an Api
/// error with the body text.
pub(crate) async fn fail_for_status(
    resp: reqwest::Response,
) -> Result<reqwest::Response, ProviderError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status.as_u16() == 429 {
        let retry_after_ms = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(|secs| secs * 1000)
            .unwrap_or(5_000);
        return Err(ProviderError::RateLimited { retry_after_ms });
    }
    let message = resp.text().await.unwrap_or_default();
    Err(ProviderError::Api {
        status: status.as_u16(),
        message,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("Timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("operation cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Whether an internal retry with backoff could help.
    pub fn retryable(&self) -> bool {
        match self {
            ProviderError::RateLimited { .. } | ProviderError::Unavailable(_) => true,
            ProviderError::Api { status, .. } => *status >= 500,
            ProviderError::Http(_) | ProviderError::Timeout { .. } => true,
            _ => false,
        }
    }
}

impl From<ProviderError> for sibyl_core::SibylError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::Timeout { ms } => sibyl_core::SibylError::Timeout { ms },
            other => sibyl_core::SibylError::UpstreamUnavailable {
                service: "llm".into(),
                reason: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(ProviderError::RateLimited { retry_after_ms: 100 }.retryable());
        assert!(ProviderError::Api { status: 503, message: String::new() }.retryable());
        assert!(!ProviderError::Api { status: 400, message: String::new() }.retryable());
        assert!(!ProviderError::Cancelled.retryable());
    }
}
