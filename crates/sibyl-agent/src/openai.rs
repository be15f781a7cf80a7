//! OpenAI-compatible chat completions client — the generation fallback,
//! pairing with the embeddings endpoint in `sibyl-vector`.

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::provider::{fail_for_status, ChatRequest, ChatResponse, LlmProvider, ProviderError};
use crate::sse::SseDecoder;
use crate::stream::{StreamEvent, TokenUsage};

pub struct OpenAiProvider {
    http: reqwest::Client,
    api_key: String,
    completions_url: String,
}

impl OpenAiProvider {
    /// `base_url` without a trailing slash; defaults to api.openai.com.
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        let base = base_url.unwrap_or_else(|| "https://api.openai.com".to_string());
        Self {
            http: reqwest::Client::new(),
            api_key,
            completions_url: format!("{}/v1/chat/completions", base.trim_end_matches('/')),
        }
    }

    async fn call(
        &self,
        req: &ChatRequest,
        stream: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        // This API has no system slot; the system prompt rides as the first
        // message.
        let mut turns = Vec::with_capacity(req.messages.len() + 1);
        if !req.system.is_empty() {
            turns.push(serde_json::json!({ "role": "system", "content": req.system }));
        }
        turns.extend(
            req.messages
                .iter()
                .map(|m| serde_json::json!({ "role": m.role, "content": m.content })),
        );

        let resp = self
            .http
            .post(&self.completions_url)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "model": req.model,
                "max_tokens": req.max_tokens,
                "messages": turns,
                "stream": stream,
            }))
            .send()
            .await?;
        fail_for_status(resp).await
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn send(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        debug!(model = %req.model, "openai request");
        let completion: ChatCompletion = self
            .call(req, false)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        let usage = completion.usage.unwrap_or_default();
        let content = completion
            .choices
            .into_iter()
            .find_map(|choice| choice.message)
            .map(|m| m.content)
            .unwrap_or_default();

        Ok(ChatResponse {
            content,
            model: completion.model,
            tokens_in: usage.prompt_tokens,
            tokens_out: usage.completion_tokens,
            stop_reason: String::new(),
        })
    }

    async fn send_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        use futures_util::StreamExt;

        debug!(model = %req.model, "openai streaming request");
        let resp = self.call(req, true).await?;

        let mut decoder = SseDecoder::new();
        let mut model = req.model.clone();
        let mut stop_reason = String::new();
        let mut body = resp.bytes_stream();

        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    let _ = tx.send(StreamEvent::Failed(e.to_string())).await;
                    return Ok(());
                }
            };
            for frame in decoder.feed(&chunk) {
                if frame.data == "[DONE]" {
                    continue;
                }
                let Ok(piece) = serde_json::from_str::<CompletionChunk>(&frame.data) else {
                    continue;
                };
                if let Some(m) = piece.model {
                    model = m;
                }
                for choice in piece.choices {
                    if let Some(reason) = choice.finish_reason {
                        stop_reason = reason;
                    }
                    if let Some(text) = choice.delta.and_then(|d| d.content) {
                        if tx.send(StreamEvent::Delta(text)).await.is_err() {
                            return Ok(()); // receiver gone, stop reading
                        }
                    }
                }
            }
        }

        // The streaming variant doesn't report usage.
        let _ = tx
            .send(StreamEvent::Finished {
                model,
                usage: TokenUsage::default(),
                stop_reason,
            })
            .await;
        Ok(())
    }
}

// Wire shapes, deserialization only.

#[derive(Deserialize)]
struct ChatCompletion {
    model: String,
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    usage: Option<TokenTally>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: Option<ReplyText>,
}

#[derive(Deserialize)]
struct ReplyText {
    content: String,
}

#[derive(Deserialize, Default, Clone, Copy)]
struct TokenTally {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Deserialize)]
struct CompletionChunk {
    model: Option<String>,
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    delta: Option<ChunkDelta>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChunkDelta {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_takes_first_choice_with_a_message() {
        let completion: ChatCompletion = serde_json::from_str(
            r#"{"model":"gpt-x",
                "choices":[{"message":null},{"message":{"content":"hello"}}],
                "usage":{"prompt_tokens":7,"completion_tokens":3}}"#,
        )
        .unwrap();
        let content = completion
            .choices
            .into_iter()
            .find_map(|c| c.message)
            .map(|m| m.content);
        assert_eq!(content.as_deref(), Some("hello"));
    }

    #[test]
    fn chunk_carries_delta_text_and_finish_reason() {
        let piece: CompletionChunk = serde_json::from_str(
            r#"{"model":"gpt-x","choices":[{"delta":{"content":"hi"},"finish_reason":"stop"}]}"#,
        )
        .unwrap();
        let choice = piece.choices.into_iter().next().unwrap();
        assert_eq!(choice.finish_reason.as_deref(), Some("stop"));
        assert_eq!(choice.delta.unwrap().content.as_deref(), Some("hi"));
    }
}
