use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use serde::Serialize;
use tracing::{info, warn};

use sibyl_conversations::{
    store::insert_message_tx, ConversationStore, DirectMessage, SenderKind,
};
use sibyl_core::types::{allowed_layers, DecisionPath, UserTier};
use sibyl_social::OrchestratorConfig;

use crate::canonical::{self, CanonicalAnswer, CanonicalStore};
use crate::decisions::{self, DecisionRecord};
use crate::error::Result;
use crate::escalation::{self, Escalation, EscalationStore};
use crate::policy::{decide, DecisionOutcome, PolicyInput, QuotaState, RefusalReason};
use crate::signals::{ComputedSignals, SignalComputer, Signals};

/// Everything the engine needs to route one inbound message.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub conversation_id: String,
    pub user_profile_id: String,
    pub agent_id: String,
    pub agent_owner_profile_id: String,
    pub agent_handle: String,
    pub caller_tier: UserTier,
    pub message: String,
}

/// The routed turn: the logged decision, the persisted inbound message, and
/// — for paths resolved without generation — the persisted reply.
#[derive(Debug, Clone, Serialize)]
pub struct RoutedTurn {
    pub decision: DecisionRecord,
    pub outcome: DecisionOutcome,
    pub user_message: DirectMessage,
    /// Present for paths C, D and F; A and B stream their reply afterwards.
    pub reply: Option<DirectMessage>,
    /// Present for path D.
    pub escalation: Option<Escalation>,
}

/// Orchestrator routing engine.
///
/// The user message, the decision row and any immediate side effect
/// (canonical reuse increment, escalation offer, refusal message) commit in
/// one transaction on the shared chat connection. Generated answers (paths
/// A/B) are persisted later by the streaming responder — strictly after the
/// decision row, which this engine has already committed.
pub struct Orchestrator {
    chat_conn: Arc<Mutex<Connection>>,
    signals: SignalComputer,
    conversations: Arc<ConversationStore>,
    escalations: Arc<EscalationStore>,
    canonical: Arc<CanonicalStore>,
}

impl Orchestrator {
    pub fn new(
        chat_conn: Arc<Mutex<Connection>>,
        signals: SignalComputer,
        conversations: Arc<ConversationStore>,
        escalations: Arc<EscalationStore>,
        canonical: Arc<CanonicalStore>,
    ) -> Self {
        Self {
            chat_conn,
            signals,
            conversations,
            escalations,
            canonical,
        }
    }

    /// Route one inbound user message. Computes signals, evaluates the
    /// policy, and commits the turn transaction.
    pub async fn route_turn(&self, request: &TurnRequest, config: &OrchestratorConfig) -> Result<RoutedTurn> {
        let is_owner = request.user_profile_id == request.agent_owner_profile_id;
        let allowed = allowed_layers(is_owner, request.caller_tier);

        // Signals need retrieval; skip it when a pure precheck already
        // refuses (blocked topics never reach the index).
        let precheck = prechecked_refusal(request, config);
        let computed = match &precheck {
            Some(_) => ComputedSignals {
                signals: refusal_signals(&request.message),
                canonical_match: None,
            },
            None => {
                self.signals
                    .compute(&request.agent_id, &request.message, &allowed)
                    .await?
            }
        };

        let quota = self.quota_state(&request.agent_id)?;
        let canonical_match = computed
            .canonical_match
            .as_ref()
            .map(|m| (m.canonical_id.as_str(), m.similarity));

        let outcome = match precheck {
            Some(reason) => DecisionOutcome::Refuse { reason },
            None => decide(&PolicyInput {
                signals: computed.signals,
                config,
                quota,
                caller_tier: request.caller_tier,
                message: &request.message,
                canonical_match,
                accepted_offer: false,
            }),
        };

        let turn = self.commit_turn(request, &outcome, computed.signals)?;
        info!(
            agent_id = %request.agent_id,
            path = %turn.decision.path,
            confidence = computed.signals.confidence,
            novelty = computed.signals.novelty,
            "turn routed"
        );
        Ok(turn)
    }

    /// Rule 7: the user explicitly accepts a standing offer. Transitions the
    /// escalation and logs a path-E decision keyed to the accept action so
    /// repeated accepts stay idempotent.
    pub fn accept_offer(&self, escalation_id: &str, user_profile_id: &str) -> Result<Escalation> {
        let escalation = self.escalations.accept(escalation_id, user_profile_id)?;

        let accept_key = format!("accept:{}", escalation.id);
        let mut conn = self.chat_conn.lock().unwrap();
        let tx = conn.transaction()?;
        let already: i64 = tx.query_row(
            "SELECT COUNT(*) FROM orchestrator_decisions WHERE user_message_id = ?1",
            [&accept_key],
            |row| row.get(0),
        )?;
        if already == 0 {
            decisions::insert_tx(
                &tx,
                &escalation.conversation_id,
                user_profile_id,
                &escalation.agent_id,
                &accept_key,
                &escalation.original_message,
                DecisionPath::E,
                enqueue_signals(),
                None,
            )?;
        }
        tx.commit()?;
        Ok(escalation)
    }

    /// Creator answers an accepted escalation. The state transition and the
    /// canonical-answer creation commit in one transaction; the question
    /// embedding is indexed after commit (lookup degrades gracefully if
    /// indexing fails), and the creator's words land in the conversation as
    /// the agent's reply.
    pub async fn answer_escalation(
        &self,
        escalation_id: &str,
        owner_profile_id: &str,
        creator_answer: &str,
        answer_layer: sibyl_core::types::Layer,
    ) -> Result<(Escalation, CanonicalAnswer)> {
        let (escalation, canonical_answer) = {
            let mut conn = self.chat_conn.lock().unwrap();
            let tx = conn.transaction()?;
            let escalation =
                EscalationStore::answer_tx(&tx, escalation_id, creator_answer, answer_layer)?;
            let canonical_answer = canonical::create_tx(
                &tx,
                &escalation.agent_id,
                Some(&escalation.id),
                &escalation.original_message,
                creator_answer,
                answer_layer,
            )?;
            tx.commit()?;
            (escalation, canonical_answer)
        };

        if let Err(e) = self.canonical.index_question(&canonical_answer).await {
            warn!(canonical_id = %canonical_answer.id, error = %e, "canonical indexing failed");
        }
        if let Err(e) = self.conversations.append_agent_message(
            &escalation.conversation_id,
            owner_profile_id,
            SenderKind::Agent,
            Some(&escalation.agent_id),
            creator_answer,
            false,
        ) {
            warn!(escalation_id = %escalation.id, error = %e, "answer delivery failed");
        }
        info!(escalation_id = %escalation.id, canonical_id = %canonical_answer.id, "escalation answered");
        Ok((escalation, canonical_answer))
    }

    /// Expire overdue escalations and drop a system message into each
    /// affected conversation so the asking user learns the outcome.
    pub fn sweep_expired(&self, now: chrono::DateTime<chrono::Utc>) -> Result<usize> {
        let expired = self.escalations.expire_overdue(now)?;
        let count = expired.len();
        for escalation in expired {
            let note = format!(
                "Your escalated question (\"{}\") expired without a creator answer.",
                preview(&escalation.original_message)
            );
            if let Err(e) = self.conversations.append_agent_message(
                &escalation.conversation_id,
                &escalation.user_id,
                SenderKind::System,
                Some(&escalation.agent_id),
                &note,
                false,
            ) {
                warn!(escalation_id = %escalation.id, error = %e, "expiry notice failed");
            }
        }
        Ok(count)
    }

    fn quota_state(&self, agent_id: &str) -> Result<QuotaState> {
        let now = chrono::Utc::now();
        let day = self
            .escalations
            .count_in_window(agent_id, now - chrono::Duration::days(1))?;
        let week = self
            .escalations
            .count_in_window(agent_id, now - chrono::Duration::weeks(1))?;
        Ok(QuotaState {
            day_count: day,
            week_count: week,
        })
    }

    /// The turn transaction: user message + decision row + path side effect.
    fn commit_turn(
        &self,
        request: &TurnRequest,
        outcome: &DecisionOutcome,
        signals: Signals,
    ) -> Result<RoutedTurn> {
        let mut conn = self.chat_conn.lock().unwrap();
        let tx = conn.transaction()?;

        let user_message = insert_message_tx(
            &tx,
            &request.conversation_id,
            &request.user_profile_id,
            SenderKind::User,
            None,
            &request.message,
            false,
        )?;

        let similar_canonical = match outcome {
            DecisionOutcome::Reuse { canonical_id } => Some(canonical_id.as_str()),
            _ => None,
        };
        let decision = decisions::insert_tx(
            &tx,
            &request.conversation_id,
            &request.user_profile_id,
            &request.agent_id,
            &user_message.id,
            &request.message,
            outcome.path(),
            signals,
            similar_canonical,
        )?;

        let mut reply = None;
        let mut escalation = None;
        match outcome {
            DecisionOutcome::Reuse { canonical_id } => {
                let canonical = canonical::record_use_tx(&tx, canonical_id)?;
                reply = Some(insert_message_tx(
                    &tx,
                    &request.conversation_id,
                    &request.agent_owner_profile_id,
                    SenderKind::Agent,
                    Some(&request.agent_id),
                    &canonical.answer_content,
                    false,
                )?);
            }
            DecisionOutcome::Offer { reason } => {
                let offered = escalation::offer_tx(
                    &tx,
                    &request.conversation_id,
                    &request.user_profile_id,
                    &request.agent_id,
                    &request.message,
                    &format!("routed as {reason} by the orchestrator"),
                    *reason,
                )?;
                reply = Some(insert_message_tx(
                    &tx,
                    &request.conversation_id,
                    &request.agent_owner_profile_id,
                    SenderKind::System,
                    Some(&request.agent_id),
                    &offer_text(&request.agent_handle),
                    false,
                )?);
                escalation = Some(offered);
            }
            DecisionOutcome::Refuse { reason } => {
                reply = Some(insert_message_tx(
                    &tx,
                    &request.conversation_id,
                    &request.agent_owner_profile_id,
                    SenderKind::System,
                    Some(&request.agent_id),
                    &refusal_text(reason, &request.agent_handle),
                    false,
                )?);
            }
            DecisionOutcome::Answer | DecisionOutcome::Clarify | DecisionOutcome::Enqueue => {}
        }

        tx.commit()?;
        Ok(RoutedTurn {
            decision,
            outcome: outcome.clone(),
            user_message,
            reply,
            escalation,
        })
    }
}

/// Rules 1a and 2 need no retrieval; evaluate them before touching the
/// index. Rule 1b (escalation disabled × escalation-worthy signals) still
/// runs inside `decide` because it needs signals.
fn prechecked_refusal(
    request: &TurnRequest,
    config: &OrchestratorConfig,
) -> Option<RefusalReason> {
    if !config.allowed_user_tiers.contains(&request.caller_tier) {
        return Some(RefusalReason::TierNotAllowed);
    }
    crate::policy::matched_blocked_topic(&request.message, &config.blocked_topics)
        .map(RefusalReason::BlockedTopic)
}

fn refusal_signals(message: &str) -> Signals {
    Signals {
        similarity: 0.0,
        novelty: 1.0,
        complexity: crate::signals::complexity(message),
        confidence: 0.0,
    }
}

fn enqueue_signals() -> Signals {
    Signals {
        similarity: 0.0,
        novelty: 1.0,
        complexity: 0.0,
        confidence: 0.0,
    }
}

fn offer_text(agent_handle: &str) -> String {
    format!(
        "This looks like something @{agent_handle}'s creator should answer personally. \
         Want me to pass it on? Accept the offer and I'll queue it for them."
    )
}

fn refusal_text(reason: &RefusalReason, agent_handle: &str) -> String {
    match reason {
        RefusalReason::TierNotAllowed => format!(
            "@{agent_handle} isn't available to your account tier right now."
        ),
        RefusalReason::EscalationDisabled => format!(
            "I can't answer that on @{agent_handle}'s behalf, and the creator \
             isn't taking escalated questions at the moment."
        ),
        RefusalReason::BlockedTopic(_) => {
            "That topic isn't available here, sorry.".to_string()
        }
    }
}

fn preview(text: &str) -> String {
    let mut s: String = text.chars().take(60).collect();
    if text.chars().count() > 60 {
        s.push('…');
    }
    s
}
