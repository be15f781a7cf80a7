//! Streaming responder: one producer task per request, events pulled by the
//! transport. Whatever happens — completion, client disconnect, provider
//! failure, timeout — the turn's text (possibly partial, flagged truncated)
//! is persisted so history never loses a reply.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use sibyl_conversations::{ConversationStore, SenderKind};
use sibyl_orchestrator::{DecisionOutcome, RoutedTurn};

use crate::compose::ComposedContext;
use crate::prompt;
use crate::provider::{ChatRequest, LlmProvider};
use crate::stream::StreamEvent;

/// Channel depth between producer and transport. The transport may buffer,
/// the producer never holds more than this.
const CHANNEL_DEPTH: usize = 64;
const MAX_RESPONSE_TOKENS: u32 = 1_024;

/// Wire events for the chat stream. Concatenating all `token` texts yields
/// the full response; `system` carries non-generated payloads (clarify
/// offers, refusals); the final frame is always `complete` or `error`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatStreamEvent {
    Start {
        model: String,
        decision_path: String,
    },
    Token {
        text: String,
    },
    System {
        text: String,
    },
    Complete {
        message_id: Option<String>,
        tokens_used: u32,
    },
    Error {
        kind: String,
        retryable: bool,
    },
}

pub struct Responder {
    provider: Arc<dyn LlmProvider>,
    conversations: Arc<ConversationStore>,
    model: String,
    first_token_timeout: Duration,
    total_timeout: Duration,
}

impl Responder {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        conversations: Arc<ConversationStore>,
        model: String,
        first_token_timeout: Duration,
        total_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            conversations,
            model,
            first_token_timeout,
            total_timeout,
        }
    }

    /// Drive one routed turn to a stream of events. For paths resolved by
    /// the engine (C/D/F) this replays the already persisted reply; for A/B
    /// it generates, streams, and persists at the end.
    ///
    /// Cancelling `cancel` stops generation cooperatively: the partial text
    /// is persisted with the truncation flag and the stream still closes
    /// with a `complete` frame.
    pub fn stream_turn(
        self: &Arc<Self>,
        turn: RoutedTurn,
        context: Option<ComposedContext>,
        owner_profile_id: String,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<ChatStreamEvent> {
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        let responder = self.clone();
        tokio::spawn(async move {
            responder.run(turn, context, owner_profile_id, cancel, tx).await;
        });
        rx
    }

    async fn run(
        &self,
        turn: RoutedTurn,
        context: Option<ComposedContext>,
        owner_profile_id: String,
        cancel: CancellationToken,
        tx: mpsc::Sender<ChatStreamEvent>,
    ) {
        let path = turn.decision.path.to_string();
        let _ = tx
            .send(ChatStreamEvent::Start {
                model: self.model.clone(),
                decision_path: path,
            })
            .await;

        match &turn.outcome {
            DecisionOutcome::Reuse { .. } => {
                // The canonical answer was persisted in the turn transaction;
                // replay it as the response body.
                if let Some(reply) = &turn.reply {
                    let _ = tx
                        .send(ChatStreamEvent::Token {
                            text: reply.content.clone(),
                        })
                        .await;
                    let _ = tx
                        .send(ChatStreamEvent::Complete {
                            message_id: Some(reply.id.clone()),
                            tokens_used: 0,
                        })
                        .await;
                }
            }
            DecisionOutcome::Offer { .. } | DecisionOutcome::Refuse { .. } => {
                if let Some(reply) = &turn.reply {
                    let _ = tx
                        .send(ChatStreamEvent::System {
                            text: reply.content.clone(),
                        })
                        .await;
                    let _ = tx
                        .send(ChatStreamEvent::Complete {
                            message_id: Some(reply.id.clone()),
                            tokens_used: 0,
                        })
                        .await;
                }
            }
            DecisionOutcome::Enqueue => {
                let _ = tx
                    .send(ChatStreamEvent::Complete {
                        message_id: None,
                        tokens_used: 0,
                    })
                    .await;
            }
            DecisionOutcome::Answer | DecisionOutcome::Clarify => {
                let clarify = matches!(turn.outcome, DecisionOutcome::Clarify);
                let context = context.unwrap_or_else(|| ComposedContext {
                    system: String::new(),
                    messages: vec![crate::provider::Message::user(
                        turn.user_message.content.clone(),
                    )],
                    rag: Vec::new(),
                });
                self.generate(&turn, context, clarify, &owner_profile_id, cancel, tx)
                    .await;
            }
        }
    }

    async fn generate(
        &self,
        turn: &RoutedTurn,
        mut context: ComposedContext,
        clarify: bool,
        owner_profile_id: &str,
        cancel: CancellationToken,
        tx: mpsc::Sender<ChatStreamEvent>,
    ) {
        if clarify {
            context.system.push_str("\n\n");
            context.system.push_str(prompt::clarify_instruction());
        }

        let request = ChatRequest {
            model: self.model.clone(),
            system: context.system,
            messages: context.messages,
            max_tokens: MAX_RESPONSE_TOKENS,
            stream: true,
        };

        let (ptx, mut prx) = mpsc::channel::<StreamEvent>(CHANNEL_DEPTH);
        let provider = self.provider.clone();
        tokio::spawn(async move {
            if let Err(e) = provider.send_stream(&request, ptx.clone()).await {
                let _ = ptx.send(StreamEvent::Failed(e.to_string())).await;
            }
        });

        let deadline = tokio::time::Instant::now() + self.total_timeout;
        let mut full_text = String::new();
        let mut tokens_used: u32 = 0;
        let mut client_gone = false;
        let mut truncated = false;
        let mut error: Option<(String, bool)> = None;
        let mut first = true;

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let step_timeout = if first {
                self.first_token_timeout.min(remaining)
            } else {
                remaining
            };
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("generation cancelled by request");
                    truncated = true;
                    break;
                }
                received = tokio::time::timeout(step_timeout, prx.recv()) => match received {
                    Ok(Some(event)) => event,
                    Ok(None) => break, // producer finished without a Finished frame
                    Err(_) => {
                        warn!(first_token = first, "generation timed out");
                        truncated = true;
                        error = Some(("timeout".into(), true));
                        break;
                    }
                },
            };
            first = false;
            match event {
                StreamEvent::Delta(text) => {
                    full_text.push_str(&text);
                    if !client_gone
                        && tx.send(ChatStreamEvent::Token { text }).await.is_err()
                    {
                        // Client disconnected — stop generating, keep what we
                        // have for history.
                        debug!("client disconnected mid-stream");
                        client_gone = true;
                        truncated = true;
                        break;
                    }
                }
                StreamEvent::Finished { usage, .. } => {
                    tokens_used = usage.output;
                    break;
                }
                StreamEvent::Failed(message) => {
                    warn!(%message, "provider error mid-stream");
                    truncated = !full_text.is_empty();
                    error = Some(("upstream_unavailable".into(), true));
                    break;
                }
            }
        }
        drop(prx); // unblocks the provider task if it is still sending

        // Persist whatever we have — partials are flagged, empty failures
        // are not written.
        let message_id = if !full_text.is_empty() {
            match self.conversations.append_agent_message(
                &turn.decision.conversation_id,
                owner_profile_id,
                SenderKind::Agent,
                Some(&turn.decision.agent_id),
                &full_text,
                truncated,
            ) {
                Ok(message) => Some(message.id),
                Err(e) => {
                    warn!(error = %e, "failed to persist streamed reply");
                    None
                }
            }
        } else {
            None
        };

        if client_gone {
            return;
        }
        match error {
            Some((kind, retryable)) => {
                let _ = tx.send(ChatStreamEvent::Error { kind, retryable }).await;
            }
            None => {
                let _ = tx
                    .send(ChatStreamEvent::Complete {
                        message_id,
                        tokens_used,
                    })
                    .await;
            }
        }
    }
}
