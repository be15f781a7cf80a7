//! Long-term agent memory.
//!
//! Memories are typed, embedded facts distilled from conversation turns.
//! The store enforces the admission rules (confidence floor, near-duplicate
//! rejection, once-per-source idempotence); the LLM extraction prompt lives
//! with the provider stack and hands parsed candidates to [`MemoryStore`].

pub mod error;
pub mod store;
pub mod types;

pub use error::MemoryError;
pub use store::MemoryStore;
pub use types::{AgentMemory, ExtractedMemory, MemoryKind};
