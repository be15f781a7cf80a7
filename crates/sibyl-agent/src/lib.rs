//! LLM provider stack and the response pipeline.
//!
//! Providers expose one seam (`LlmProvider`) with non-streaming and
//! streaming sends; the pipeline composes the budgeted prompt, drives the
//! streaming responder, and runs the fire-and-forget post-turn jobs
//! (memory extraction, quality scoring, summarization).

pub mod anthropic;
pub mod compose;
pub mod extractor;
pub mod openai;
pub mod prompt;
pub mod provider;
pub mod quality;
pub mod rerank;
pub mod responder;
pub mod sse;
pub mod stream;
pub mod summarize;

pub use compose::{ComposeInputs, ComposedContext, ContextComposer};
pub use extractor::MemoryExtractor;
pub use provider::{ChatRequest, ChatResponse, LlmProvider, Message, ProviderError, Role};
pub use quality::IntelligenceLogger;
pub use rerank::CrossEncoderReranker;
pub use responder::{ChatStreamEvent, Responder};
pub use stream::{StreamEvent, TokenUsage};
pub use summarize::Summarizer;
