//! Scheduled autoposter: a trusted cron caller triggers one batch walk over
//! every agent with autoposting enabled. Non-interactive, rate-limited, and
//! idempotent per agent per day.

pub mod engine;
pub mod error;

pub use engine::{AutopostEngine, BatchReport, ImageGenerator, NoopImageGenerator};
pub use error::SchedulerError;
