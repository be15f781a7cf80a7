//! The decision core: a pure function from signals, config, quota state and
//! the message itself to exactly one of the six paths. Evaluation order is
//! fixed; the first rule that fires wins. No I/O happens here.

use serde::Serialize;

use sibyl_core::types::{word_tokens, DecisionPath, UserTier};
use sibyl_social::OrchestratorConfig;

use crate::escalation::EscalationReason;
use crate::signals::Signals;

/// Cosine floor for serving a canonical answer verbatim.
pub const CANONICAL_REUSE_THRESHOLD: f32 = 0.85;
/// Signals at or above these suggest the creator should see the message.
pub const NOVELTY_ESCALATION_THRESHOLD: f32 = 0.7;
pub const COMPLEXITY_ESCALATION_THRESHOLD: f32 = 0.6;
/// Messages at or under this many tokens qualify for clarification.
pub const CLARIFY_MAX_TOKENS: usize = 8;
pub const CLARIFY_MAX_COMPLEXITY: f32 = 0.4;

/// Why path F fired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum RefusalReason {
    /// Caller's tier is not in the agent's allowed set.
    TierNotAllowed,
    /// Escalation is disabled and the message needs the creator.
    EscalationDisabled,
    /// The message matched a blocked topic keyword.
    BlockedTopic(String),
}

/// The policy verdict with its path-specific payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum DecisionOutcome {
    /// Path A: generate an answer, grounded in retrieval.
    Answer,
    /// Path B: ask 1–2 clarifying questions instead of answering.
    Clarify,
    /// Path C: serve a stored canonical answer verbatim.
    Reuse { canonical_id: String },
    /// Path D: offer to escalate to the creator; awaits user accept.
    Offer { reason: EscalationReason },
    /// Path E: the user accepted a standing offer — enqueue for the creator.
    Enqueue,
    /// Path F: politely refuse.
    Refuse { reason: RefusalReason },
}

impl DecisionOutcome {
    pub fn path(&self) -> DecisionPath {
        match self {
            DecisionOutcome::Answer => DecisionPath::A,
            DecisionOutcome::Clarify => DecisionPath::B,
            DecisionOutcome::Reuse { .. } => DecisionPath::C,
            DecisionOutcome::Offer { .. } => DecisionPath::D,
            DecisionOutcome::Enqueue => DecisionPath::E,
            DecisionOutcome::Refuse { .. } => DecisionPath::F,
        }
    }
}

/// Escalation counts inside the rolling windows, excluding declined.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuotaState {
    pub day_count: u32,
    pub week_count: u32,
}

impl QuotaState {
    pub fn exhausted(&self, config: &OrchestratorConfig) -> bool {
        self.day_count >= config.max_escalations_per_day
            || self.week_count >= config.max_escalations_per_week
    }
}

/// Everything the policy looks at. Assembled by the engine; constructible
/// by hand in tests.
#[derive(Debug, Clone)]
pub struct PolicyInput<'a> {
    pub signals: Signals,
    pub config: &'a OrchestratorConfig,
    pub quota: QuotaState,
    pub caller_tier: UserTier,
    pub message: &'a str,
    /// Best canonical match in the caller's allowed layers, with similarity.
    pub canonical_match: Option<(&'a str, f32)>,
    /// True only on the explicit accept call (rule 7).
    pub accepted_offer: bool,
}

/// Evaluate the decision table. First rule that fires wins.
pub fn decide(input: &PolicyInput<'_>) -> DecisionOutcome {
    let signals = input.signals;
    let suggests_escalation = signals.novelty >= NOVELTY_ESCALATION_THRESHOLD
        || signals.complexity >= COMPLEXITY_ESCALATION_THRESHOLD;

    // Rule 1: tier gate, or escalation-worthy message with escalation off.
    if !input.config.allowed_user_tiers.contains(&input.caller_tier) {
        return DecisionOutcome::Refuse {
            reason: RefusalReason::TierNotAllowed,
        };
    }
    if !input.config.escalation_enabled && suggests_escalation {
        return DecisionOutcome::Refuse {
            reason: RefusalReason::EscalationDisabled,
        };
    }

    // Rule 2: blocked topics.
    if let Some(keyword) = matched_blocked_topic(input.message, &input.config.blocked_topics) {
        return DecisionOutcome::Refuse {
            reason: RefusalReason::BlockedTopic(keyword),
        };
    }

    // Rule 3: canonical reuse.
    if let Some((canonical_id, similarity)) = input.canonical_match {
        if similarity >= CANONICAL_REUSE_THRESHOLD {
            return DecisionOutcome::Reuse {
                canonical_id: canonical_id.to_string(),
            };
        }
    }

    // Rule 4: confident autonomous answer.
    if signals.confidence >= input.config.auto_answer_confidence_threshold
        && signals.complexity <= COMPLEXITY_ESCALATION_THRESHOLD
    {
        return DecisionOutcome::Answer;
    }

    // Rule 5: too terse to act on — clarify.
    if input.config.clarification_enabled
        && word_tokens(input.message).len() <= CLARIFY_MAX_TOKENS
        && signals.complexity <= CLARIFY_MAX_COMPLEXITY
    {
        return DecisionOutcome::Clarify;
    }

    // Rule 6: offer escalation while quota remains.
    if suggests_escalation && !input.quota.exhausted(input.config) {
        let novel = signals.novelty >= NOVELTY_ESCALATION_THRESHOLD;
        let complex = signals.complexity >= COMPLEXITY_ESCALATION_THRESHOLD;
        let reason = match (novel, complex) {
            (true, true) => EscalationReason::Strategic,
            (true, false) => EscalationReason::Novel,
            _ => EscalationReason::Complex,
        };
        return DecisionOutcome::Offer { reason };
    }

    // Rule 7: explicit accept of a standing offer.
    if input.accepted_offer {
        return DecisionOutcome::Enqueue;
    }

    // Rule 8: best-effort grounded answer.
    DecisionOutcome::Answer
}

/// Case-insensitive keyword match on word boundaries. Returns the first
/// keyword that matched.
pub fn matched_blocked_topic(message: &str, blocked: &[String]) -> Option<String> {
    if blocked.is_empty() {
        return None;
    }
    let haystack = message.to_lowercase();
    for keyword in blocked {
        let needle = keyword.trim().to_lowercase();
        if needle.is_empty() {
            continue;
        }
        let mut from = 0;
        while let Some(pos) = haystack[from..].find(&needle) {
            let start = from + pos;
            let end = start + needle.len();
            let before_ok = start == 0
                || !haystack[..start]
                    .chars()
                    .next_back()
                    .is_some_and(|c| c.is_alphanumeric());
            let after_ok = end == haystack.len()
                || !haystack[end..]
                    .chars()
                    .next()
                    .is_some_and(|c| c.is_alphanumeric());
            if before_ok && after_ok {
                return Some(keyword.clone());
            }
            from = end;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signals(similarity: f32, complexity: f32, confidence: f32) -> Signals {
        Signals {
            similarity,
            novelty: 1.0 - similarity,
            complexity,
            confidence,
        }
    }

    fn input<'a>(
        config: &'a OrchestratorConfig,
        s: Signals,
        message: &'a str,
    ) -> PolicyInput<'a> {
        PolicyInput {
            signals: s,
            config,
            quota: QuotaState::default(),
            caller_tier: UserTier::Follower,
            message,
            canonical_match: None,
            accepted_offer: false,
        }
    }

    #[test]
    fn tier_gate_fires_first() {
        let mut config = OrchestratorConfig::default();
        config.allowed_user_tiers = vec![UserTier::Paid];
        let mut i = input(&config, signals(0.9, 0.1, 0.95), "hello");
        // Even a perfect canonical match can't outrank the tier gate.
        i.canonical_match = Some(("can-1", 0.99));
        assert_eq!(
            decide(&i),
            DecisionOutcome::Refuse {
                reason: RefusalReason::TierNotAllowed
            }
        );
    }

    #[test]
    fn escalation_disabled_refuses_escalation_worthy_messages() {
        let mut config = OrchestratorConfig::default();
        config.escalation_enabled = false;
        let i = input(&config, signals(0.1, 0.8, 0.2), "a long novel strategic ask");
        assert_eq!(
            decide(&i),
            DecisionOutcome::Refuse {
                reason: RefusalReason::EscalationDisabled
            }
        );
    }

    #[test]
    fn escalation_disabled_still_answers_easy_messages() {
        let mut config = OrchestratorConfig::default();
        config.escalation_enabled = false;
        let i = input(&config, signals(0.8, 0.2, 0.9), "when do you open in paris on sunday");
        assert_eq!(decide(&i), DecisionOutcome::Answer);
    }

    #[test]
    fn blocked_topic_refuses_before_reuse() {
        let mut config = OrchestratorConfig::default();
        config.blocked_topics = vec!["crypto".into()];
        let mut i = input(&config, signals(0.9, 0.2, 0.9), "Tell me about crypto");
        i.canonical_match = Some(("can-1", 0.99));
        assert_eq!(
            decide(&i),
            DecisionOutcome::Refuse {
                reason: RefusalReason::BlockedTopic("crypto".into())
            }
        );
    }

    #[test]
    fn canonical_reuse_at_threshold() {
        let config = OrchestratorConfig::default();
        let mut i = input(&config, signals(0.85, 0.2, 0.8), "what's your refund policy?");
        i.canonical_match = Some(("can-1", 0.85));
        assert_eq!(
            decide(&i),
            DecisionOutcome::Reuse {
                canonical_id: "can-1".into()
            }
        );
    }

    #[test]
    fn near_miss_canonical_falls_through_to_answer() {
        let config = OrchestratorConfig::default();
        let mut i = input(&config, signals(0.80, 0.3, 0.82), "when do you open on sunday in paris?");
        i.canonical_match = Some(("can-1", 0.80));
        assert_eq!(decide(&i), DecisionOutcome::Answer);
    }

    #[test]
    fn confident_simple_message_answers() {
        let config = OrchestratorConfig::default();
        let i = input(&config, signals(0.78, 0.3, 0.82), "when do you open on sunday in paris?");
        assert_eq!(decide(&i), DecisionOutcome::Answer);
    }

    #[test]
    fn short_vague_message_clarifies() {
        let config = OrchestratorConfig::default();
        let i = input(&config, signals(0.2, 0.1, 0.4), "help?");
        assert_eq!(decide(&i), DecisionOutcome::Clarify);
    }

    #[test]
    fn clarification_disabled_skips_rule_5() {
        let mut config = OrchestratorConfig::default();
        config.clarification_enabled = false;
        let i = input(&config, signals(0.5, 0.1, 0.4), "help?");
        // Low novelty, low complexity → falls to rule 8.
        assert_eq!(decide(&i), DecisionOutcome::Answer);
    }

    #[test]
    fn novel_complex_message_offers_escalation() {
        let config = OrchestratorConfig::default();
        let msg = "would you consider licensing the back catalog internationally?";
        let i = input(&config, signals(0.1, 0.8, 0.2), msg);
        assert_eq!(
            decide(&i),
            DecisionOutcome::Offer {
                reason: EscalationReason::Strategic
            }
        );
    }

    #[test]
    fn novel_but_simple_offer_reason_is_novel() {
        let config = OrchestratorConfig::default();
        let i = input(&config, signals(0.1, 0.5, 0.3), "what about the thing from the festival");
        assert_eq!(
            decide(&i),
            DecisionOutcome::Offer {
                reason: EscalationReason::Novel
            }
        );
    }

    #[test]
    fn exhausted_quota_degrades_to_answer() {
        let config = OrchestratorConfig::default();
        let mut i = input(&config, signals(0.1, 0.8, 0.2), "novel and complex question here today");
        i.quota = QuotaState {
            day_count: config.max_escalations_per_day,
            week_count: 0,
        };
        assert_eq!(decide(&i), DecisionOutcome::Answer);
    }

    #[test]
    fn zero_day_quota_never_offers() {
        let mut config = OrchestratorConfig::default();
        config.max_escalations_per_day = 0;
        let i = input(&config, signals(0.1, 0.8, 0.2), "novel complex message");
        assert_eq!(decide(&i), DecisionOutcome::Answer);
    }

    #[test]
    fn explicit_accept_enqueues() {
        let config = OrchestratorConfig::default();
        let mut i = input(&config, signals(0.5, 0.5, 0.5), "yes please ask them");
        i.accepted_offer = true;
        // Signals that fire no earlier rule reach rule 7.
        assert_eq!(decide(&i), DecisionOutcome::Enqueue);
    }

    #[test]
    fn blocked_topic_word_boundaries() {
        let blocked = vec!["crypto".to_string()];
        assert!(matched_blocked_topic("tell me about crypto", &blocked).is_some());
        assert!(matched_blocked_topic("CRYPTO news?", &blocked).is_some());
        assert!(matched_blocked_topic("crypto-currency", &blocked).is_some());
        assert!(matched_blocked_topic("cryptography is fine", &blocked).is_none());
        assert!(matched_blocked_topic("no match here", &blocked).is_none());
    }

    #[test]
    fn blocked_topic_multi_word() {
        let blocked = vec!["insider trading".to_string()];
        assert!(matched_blocked_topic("thoughts on Insider Trading?", &blocked).is_some());
        assert!(matched_blocked_topic("outsider trading", &blocked).is_none());
    }
}
