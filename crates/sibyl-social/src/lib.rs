//! Profiles, agents, follow edges, per-agent orchestrator configuration and
//! autoposted content. The pure CRUD half of the platform — everything the
//! orchestrator consults about identity and access lives here.

pub mod db;
pub mod error;
pub mod store;
pub mod types;

pub use error::SocialError;
pub use store::SocialStore;
pub use types::{Agent, OrchestratorConfig, Post, Profile};
