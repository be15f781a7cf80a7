//! Document ingestion and layered knowledge retrieval.
//!
//! Documents are split into overlapping sentence-aligned chunks, embedded,
//! and indexed in the shared vector store. Retrieval is layer-gated by the
//! caller's relationship to the agent owner, widened to a candidate set,
//! reranked, and trimmed to the final k.

pub mod chunker;
pub mod error;
pub mod rerank;
pub mod retrieval;
pub mod store;

pub use error::KnowledgeError;
pub use rerank::{LexicalReranker, Reranker};
pub use retrieval::{allowed_layers, RetrievedChunk, Retriever, K_CANDIDATE, K_FINAL};
pub use store::{Document, DocumentChunk, KnowledgeStore};
