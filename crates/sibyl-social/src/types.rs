use serde::{Deserialize, Serialize};

use sibyl_core::types::UserTier;

use crate::error::{Result, SocialError};

/// Handles nobody can register.
pub const RESERVED_HANDLES: &[&str] = &[
    "admin", "root", "sibyl", "api", "support", "system", "help", "about", "staff", "official",
    "moderator",
];

/// Maximum persona length in characters.
pub const MAX_PERSONA_CHARS: usize = 40_000;

/// Validate a handle: `^[a-z0-9_]{3,20}$` and not reserved.
pub fn validate_handle(handle: &str) -> Result<()> {
    let len = handle.chars().count();
    if !(3..=20).contains(&len) {
        return Err(SocialError::Validation(format!(
            "handle must be 3-20 characters, got {len}"
        )));
    }
    if !handle
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(SocialError::Validation(
            "handle may only contain a-z, 0-9 and underscore".into(),
        ));
    }
    if RESERVED_HANDLES.contains(&handle) {
        return Err(SocialError::Validation(format!("handle '{handle}' is reserved")));
    }
    Ok(())
}

/// One real user.
#[derive(Debug, Clone, Serialize)]
pub struct Profile {
    pub id: String,
    pub handle: String,
    pub display_name: String,
    pub bio: String,
    pub avatar_url: Option<String>,
    /// Admin-listed owners may own any number of agents.
    pub is_admin: bool,
    pub created_at: String,
}

/// An AI persona owned by a profile.
#[derive(Debug, Clone, Serialize)]
pub struct Agent {
    pub id: String,
    pub owner_profile_id: String,
    pub handle: String,
    pub display_name: String,
    pub persona: String,
    pub auto_post_enabled: bool,
    pub last_auto_post_at: Option<String>,
    pub created_at: String,
}

/// Per-agent orchestrator tuning, owner-mutable only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_max_escalations_per_day")]
    pub max_escalations_per_day: u32,
    #[serde(default = "default_max_escalations_per_week")]
    pub max_escalations_per_week: u32,
    #[serde(default = "default_true")]
    pub escalation_enabled: bool,
    #[serde(default = "default_confidence_threshold")]
    pub auto_answer_confidence_threshold: f32,
    #[serde(default = "default_true")]
    pub clarification_enabled: bool,
    /// Case-insensitive keywords matched on word boundaries.
    #[serde(default)]
    pub blocked_topics: Vec<String>,
    /// Strict membership check — no tier hierarchy.
    #[serde(default = "default_allowed_tiers")]
    pub allowed_user_tiers: Vec<UserTier>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_escalations_per_day: default_max_escalations_per_day(),
            max_escalations_per_week: default_max_escalations_per_week(),
            escalation_enabled: true,
            auto_answer_confidence_threshold: default_confidence_threshold(),
            clarification_enabled: true,
            blocked_topics: Vec::new(),
            allowed_user_tiers: default_allowed_tiers(),
        }
    }
}

fn default_max_escalations_per_day() -> u32 {
    10
}
fn default_max_escalations_per_week() -> u32 {
    50
}
fn default_confidence_threshold() -> f32 {
    0.75
}
fn default_true() -> bool {
    true
}
fn default_allowed_tiers() -> Vec<UserTier> {
    vec![UserTier::Free, UserTier::Follower, UserTier::Paid]
}

/// An autoposted piece of content.
#[derive(Debug, Clone, Serialize)]
pub struct Post {
    pub id: String,
    pub agent_id: String,
    pub content: String,
    pub image_prompt: Option<String>,
    pub image_url: Option<String>,
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn good_handles_pass() {
        for h in ["abc", "a_b_c", "user123", "x".repeat(20).as_str()] {
            assert!(validate_handle(h).is_ok(), "{h} should be valid");
        }
    }

    #[test]
    fn bad_handles_fail() {
        for h in ["ab", &"x".repeat(21), "Upper", "with-dash", "with space", "admin", "sibyl"] {
            assert!(validate_handle(h).is_err(), "{h} should be invalid");
        }
    }

    #[test]
    fn config_defaults() {
        let cfg = OrchestratorConfig::default();
        assert_eq!(cfg.max_escalations_per_day, 10);
        assert_eq!(cfg.max_escalations_per_week, 50);
        assert!(cfg.escalation_enabled);
        assert!((cfg.auto_answer_confidence_threshold - 0.75).abs() < f32::EPSILON);
        assert!(cfg.clarification_enabled);
        assert_eq!(cfg.allowed_user_tiers.len(), 3);
    }
}
