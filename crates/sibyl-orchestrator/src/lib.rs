//! The Orchestrator: decides, for every user message directed at an agent,
//! whether to answer autonomously, clarify, reuse a canonical answer,
//! escalate to the human creator, or refuse.
//!
//! Signal math and policy evaluation are pure and synchronous; everything
//! with I/O (similarity lookups, the decision log, the escalation queue,
//! canonical answers) lives in the stores and the [`engine`].

pub mod canonical;
pub mod decisions;
pub mod engine;
pub mod error;
pub mod escalation;
pub mod metrics;
pub mod policy;
pub mod quality;
pub mod signals;

pub use canonical::{CanonicalAnswer, CanonicalStore};
pub use decisions::{DecisionLog, DecisionRecord};
pub use engine::{Orchestrator, RoutedTurn, TurnRequest};
pub use error::OrchestratorError;
pub use escalation::{Escalation, EscalationReason, EscalationStatus, EscalationStore};
pub use metrics::{AgentMetrics, MetricsReader};
pub use policy::{decide, DecisionOutcome, PolicyInput, QuotaState, RefusalReason};
pub use quality::{QualityScore, QualityStore};
pub use signals::{SignalComputer, Signals};
