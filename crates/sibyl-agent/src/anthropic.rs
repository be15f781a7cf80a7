//! Anthropic Messages API client. Streaming and non-streaming sends share
//! one request path; the SSE frames go through the common decoder and a
//! small tally that tracks model, usage and stop reason across the stream.

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::provider::{fail_for_status, ChatRequest, ChatResponse, LlmProvider, ProviderError};
use crate::sse::SseDecoder;
use crate::stream::{StreamEvent, TokenUsage};

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    http: reqwest::Client,
    api_key: String,
    messages_url: String,
}

impl AnthropicProvider {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        let base = base_url.unwrap_or_else(|| "https://api.anthropic.com".to_string());
        Self {
            http: reqwest::Client::new(),
            api_key,
            messages_url: format!("{}/v1/messages", base.trim_end_matches('/')),
        }
    }

    async fn call(
        &self,
        req: &ChatRequest,
        stream: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let turns: Vec<serde_json::Value> = req
            .messages
            .iter()
            .map(|m| serde_json::json!({ "role": m.role, "content": m.content }))
            .collect();
        let resp = self
            .http
            .post(&self.messages_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&serde_json::json!({
                "model": req.model,
                "max_tokens": req.max_tokens,
                "system": req.system,
                "messages": turns,
                "stream": stream,
            }))
            .send()
            .await?;
        fail_for_status(resp).await
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn send(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        debug!(model = %req.model, "anthropic request");
        let reply: MessagesReply = self
            .call(req, false)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        Ok(reply.into_response())
    }

    async fn send_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        use futures_util::StreamExt;

        debug!(model = %req.model, "anthropic streaming request");
        let resp = self.call(req, true).await?;

        let mut decoder = SseDecoder::new();
        let mut tally = StreamTally::default();
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
                match tally.absorb(frame.event.as_deref().unwrap_or(""), &frame.data) {
                    Absorbed::Text(text) => {
                        if tx.send(StreamEvent::Delta(text)).await.is_err() {
                            return Ok(()); // receiver gone, stop reading
                        }
                    }
                    Absorbed::Fault(message) => {
                        warn!(%message, "anthropic stream fault");
                        let _ = tx.send(StreamEvent::Failed(message)).await;
                        return Ok(());
                    }
                    Absorbed::Nothing => {}
                }
            }
        }

        let _ = tx.send(tally.finish()).await;
        Ok(())
    }
}

/// What one absorbed SSE frame contributed.
enum Absorbed {
    Text(String),
    Fault(String),
    Nothing,
}

/// Stream bookkeeping: the model arrives in the head frame, output usage
/// and stop reason in the tail, text in between.
#[derive(Default)]
struct StreamTally {
    model: String,
    usage: TokenUsage,
    stop_reason: String,
}

impl StreamTally {
    fn absorb(&mut self, event: &str, data: &str) -> Absorbed {
        match event {
            "message_start" => {
                if let Ok(head) = serde_json::from_str::<StreamHead>(data) {
                    self.model = head.message.model;
                    self.usage.input = head.message.usage.input_tokens;
                }
                Absorbed::Nothing
            }
            "content_block_delta" => match serde_json::from_str::<TextDeltaFrame>(data) {
                Ok(frame) if frame.delta.kind == "text_delta" => {
                    Absorbed::Text(frame.delta.text.unwrap_or_default())
                }
                _ => Absorbed::Nothing,
            },
            "message_delta" => {
                if let Ok(tail) = serde_json::from_str::<StreamTail>(data) {
                    self.usage.output = tail.usage.output_tokens;
                    if let Some(reason) = tail.delta.stop_reason {
                        self.stop_reason = reason;
                    }
                }
                Absorbed::Nothing
            }
            "error" => Absorbed::Fault(data.to_string()),
            // message_stop, content_block_start/stop, ping
            _ => Absorbed::Nothing,
        }
    }

    fn finish(self) -> StreamEvent {
        StreamEvent::Finished {
            model: self.model,
            usage: self.usage,
            stop_reason: self.stop_reason,
        }
    }
}

// Wire shapes, deserialization only.

#[derive(Deserialize)]
struct MessagesReply {
    model: String,
    content: Vec<ReplyBlock>,
    stop_reason: Option<String>,
    usage: TokenCounts,
}

impl MessagesReply {
    fn into_response(self) -> ChatResponse {
        let content: String = self
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .map(|block| block.text.as_str())
            .collect();
        ChatResponse {
            content,
            model: self.model,
            tokens_in: self.usage.input_tokens,
            tokens_out: self.usage.output_tokens,
            stop_reason: self.stop_reason.unwrap_or_default(),
        }
    }
}

#[derive(Deserialize)]
struct ReplyBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct TokenCounts {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Deserialize)]
struct StreamHead {
    message: StreamHeadMessage,
}

#[derive(Deserialize)]
struct StreamHeadMessage {
    model: String,
    usage: InputCount,
}

#[derive(Deserialize)]
struct InputCount {
    input_tokens: u32,
}

#[derive(Deserialize)]
struct TextDeltaFrame {
    delta: TextDelta,
}

#[derive(Deserialize)]
struct TextDelta {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

#[derive(Deserialize)]
struct StreamTail {
    delta: StopInfo,
    usage: OutputCount,
}

#[derive(Deserialize)]
struct StopInfo {
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct OutputCount {
    output_tokens: u32,
}
