//! Embedding production and vector persistence.
//!
//! One fixed-dimension vector space per deployment. All vectors are
//! L2-normalized on the way in, so cosine distance is `1 - dot`. The store
//! keeps every embedded object (chunks, memories, canonical answers) in a
//! single table, scoped by owner and typed by kind; domain crates keep their
//! own rows and join by id.

pub mod embedder;
pub mod error;
pub mod math;
pub mod store;

pub use embedder::{Embedder, HttpEmbedder, LocalHashEmbedder};
pub use error::VectorError;
pub use store::{SearchFilter, VectorHit, VectorKind, VectorStore};
