use std::sync::{Arc, Mutex};

use rusqlite::{Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use sibyl_core::types::Layer;

use crate::error::{OrchestratorError, Result};

/// Pending offers expire after 72 hours.
pub const PENDING_TTL_HOURS: i64 = 72;
/// Accepted escalations expire after 14 days.
pub const ACCEPTED_TTL_DAYS: i64 = 14;

/// Why the orchestrator routed this to the creator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscalationReason {
    Novel,
    Strategic,
    Complex,
}

impl std::fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Novel => write!(f, "novel"),
            Self::Strategic => write!(f, "strategic"),
            Self::Complex => write!(f, "complex"),
        }
    }
}

impl std::str::FromStr for EscalationReason {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "novel" => Ok(Self::Novel),
            "strategic" => Ok(Self::Strategic),
            "complex" => Ok(Self::Complex),
            other => Err(format!("unknown escalation reason: {other}")),
        }
    }
}

/// Escalation lifecycle. Monotonic — no state ever returns to an earlier
/// one, and `answered`/`declined`/`expired` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscalationStatus {
    Pending,
    Accepted,
    Answered,
    Declined,
    Expired,
}

impl std::fmt::Display for EscalationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Accepted => write!(f, "accepted"),
            Self::Answered => write!(f, "answered"),
            Self::Declined => write!(f, "declined"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

impl std::str::FromStr for EscalationStatus {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "accepted" => Ok(Self::Accepted),
            "answered" => Ok(Self::Answered),
            "declined" => Ok(Self::Declined),
            "expired" => Ok(Self::Expired),
            other => Err(format!("unknown escalation status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Escalation {
    pub id: String,
    pub conversation_id: String,
    pub user_id: String,
    pub agent_id: String,
    pub original_message: String,
    pub context_summary: String,
    pub reason: EscalationReason,
    pub status: EscalationStatus,
    pub offered_at: String,
    pub accepted_at: Option<String>,
    pub answered_at: Option<String>,
    pub creator_answer: Option<String>,
    pub answer_layer: Option<Layer>,
}

/// Initialise the escalation queue table. Idempotent.
pub fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS escalation_queue (
            id               TEXT PRIMARY KEY NOT NULL,
            conversation_id  TEXT NOT NULL,
            user_id          TEXT NOT NULL,
            agent_id         TEXT NOT NULL,
            original_message TEXT NOT NULL,
            context_summary  TEXT NOT NULL DEFAULT '',
            reason           TEXT NOT NULL,
            status           TEXT NOT NULL DEFAULT 'pending',
            offered_at       TEXT NOT NULL,
            accepted_at      TEXT,
            answered_at      TEXT,
            creator_answer   TEXT,
            answer_layer     TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_escalations_agent
            ON escalation_queue(agent_id, status, offered_at DESC);
        CREATE INDEX IF NOT EXISTS idx_escalations_user
            ON escalation_queue(user_id, status);",
    )
}

/// Insert a pending escalation inside an open transaction — composed with
/// the decision and message writes of the same turn.
pub fn offer_tx(
    tx: &Transaction<'_>,
    conversation_id: &str,
    user_id: &str,
    agent_id: &str,
    original_message: &str,
    context_summary: &str,
    reason: EscalationReason,
) -> Result<Escalation> {
    let id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    tx.execute(
        "INSERT INTO escalation_queue
         (id, conversation_id, user_id, agent_id, original_message,
          context_summary, reason, status, offered_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8)",
        rusqlite::params![
            id,
            conversation_id,
            user_id,
            agent_id,
            original_message,
            context_summary,
            reason.to_string(),
            now
        ],
    )?;
    debug!(escalation_id = %id, agent_id, %reason, "escalation offered");
    Ok(Escalation {
        id,
        conversation_id: conversation_id.to_string(),
        user_id: user_id.to_string(),
        agent_id: agent_id.to_string(),
        original_message: original_message.to_string(),
        context_summary: context_summary.to_string(),
        reason,
        status: EscalationStatus::Pending,
        offered_at: now,
        accepted_at: None,
        answered_at: None,
        creator_answer: None,
        answer_layer: None,
    })
}

pub struct EscalationStore {
    conn: Arc<Mutex<Connection>>,
}

impl EscalationStore {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Result<Self> {
        {
            let guard = conn.lock().unwrap();
            init_db(&guard)?;
        }
        Ok(Self { conn })
    }

    pub fn get(&self, id: &str) -> Result<Escalation> {
        let conn = self.conn.lock().unwrap();
        get_with_conn(&conn, id)
    }

    /// User accepts a standing offer. Idempotent: accepting an already
    /// accepted escalation succeeds without touching the row. Terminal
    /// states conflict.
    pub fn accept(&self, id: &str, user_id: &str) -> Result<Escalation> {
        let conn = self.conn.lock().unwrap();
        let escalation = get_with_conn(&conn, id)?;
        if escalation.user_id != user_id {
            return Err(OrchestratorError::PermissionDenied(
                "only the asking user can accept an escalation offer".into(),
            ));
        }
        match escalation.status {
            EscalationStatus::Accepted => return Ok(escalation),
            EscalationStatus::Pending => {}
            terminal => {
                return Err(OrchestratorError::Conflict(format!(
                    "escalation {id} is {terminal}"
                )))
            }
        }
        let now = chrono::Utc::now().to_rfc3339();
        let n = conn.execute(
            "UPDATE escalation_queue SET status = 'accepted', accepted_at = ?2
             WHERE id = ?1 AND status = 'pending'",
            rusqlite::params![id, now],
        )?;
        if n == 0 {
            // Raced with another transition; re-read and report.
            let current = get_with_conn(&conn, id)?;
            if current.status == EscalationStatus::Accepted {
                return Ok(current);
            }
            return Err(OrchestratorError::Conflict(format!(
                "escalation {id} is {}",
                current.status
            )));
        }
        info!(escalation_id = %id, "escalation accepted");
        get_with_conn(&conn, id)
    }

    /// Creator answers an accepted escalation. The guarded UPDATE makes
    /// finalization exactly-once: a second answer sees zero affected rows
    /// and reports the conflict.
    ///
    /// Runs inside the caller's transaction so canonical-answer creation
    /// commits atomically with the state transition.
    pub fn answer_tx(
        tx: &Transaction<'_>,
        id: &str,
        creator_answer: &str,
        answer_layer: Layer,
    ) -> Result<Escalation> {
        let now = chrono::Utc::now().to_rfc3339();
        let n = tx.execute(
            "UPDATE escalation_queue
             SET status = 'answered', answered_at = ?2, creator_answer = ?3, answer_layer = ?4
             WHERE id = ?1 AND status = 'accepted'",
            rusqlite::params![id, now, creator_answer, answer_layer.to_string()],
        )?;
        if n == 0 {
            let current = tx
                .query_row(
                    &format!("SELECT {ESCALATION_COLS} FROM escalation_queue WHERE id = ?1"),
                    [id],
                    row_to_escalation,
                )
                .optional()?
                .ok_or_else(|| OrchestratorError::EscalationNotFound { id: id.to_string() })?;
            return Err(OrchestratorError::Conflict(format!(
                "escalation {id} is {}, not accepted",
                current.status
            )));
        }
        info!(escalation_id = %id, "escalation answered");
        tx.query_row(
            &format!("SELECT {ESCALATION_COLS} FROM escalation_queue WHERE id = ?1"),
            [id],
            row_to_escalation,
        )
        .map_err(Into::into)
    }

    /// Creator declines. Valid from pending or accepted; terminal states
    /// conflict (declining a declined escalation is idempotent success).
    pub fn decline(&self, id: &str) -> Result<Escalation> {
        let conn = self.conn.lock().unwrap();
        let escalation = get_with_conn(&conn, id)?;
        match escalation.status {
            EscalationStatus::Declined => return Ok(escalation),
            EscalationStatus::Pending | EscalationStatus::Accepted => {}
            terminal => {
                return Err(OrchestratorError::Conflict(format!(
                    "escalation {id} is {terminal}"
                )))
            }
        }
        conn.execute(
            "UPDATE escalation_queue SET status = 'declined'
             WHERE id = ?1 AND status IN ('pending', 'accepted')",
            [id],
        )?;
        info!(escalation_id = %id, "escalation declined");
        get_with_conn(&conn, id)
    }

    /// Transition overdue items to expired. Returns what changed so callers
    /// can notify the asking users.
    pub fn expire_overdue(&self, now: chrono::DateTime<chrono::Utc>) -> Result<Vec<Escalation>> {
        let pending_cutoff = (now - chrono::Duration::hours(PENDING_TTL_HOURS)).to_rfc3339();
        let accepted_cutoff = (now - chrono::Duration::days(ACCEPTED_TTL_DAYS)).to_rfc3339();

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ESCALATION_COLS} FROM escalation_queue
             WHERE (status = 'pending' AND offered_at < ?1)
                OR (status = 'accepted' AND accepted_at < ?2)"
        ))?;
        let overdue: Vec<Escalation> = stmt
            .query_map(
                rusqlite::params![pending_cutoff, accepted_cutoff],
                row_to_escalation,
            )?
            .filter_map(|r| r.ok())
            .collect();

        conn.execute(
            "UPDATE escalation_queue SET status = 'expired'
             WHERE (status = 'pending' AND offered_at < ?1)
                OR (status = 'accepted' AND accepted_at < ?2)",
            rusqlite::params![pending_cutoff, accepted_cutoff],
        )?;
        if !overdue.is_empty() {
            info!(count = overdue.len(), "escalations expired");
        }
        Ok(overdue
            .into_iter()
            .map(|mut e| {
                e.status = EscalationStatus::Expired;
                e
            })
            .collect())
    }

    /// Creator-facing queue: open items for an agent, oldest first.
    pub fn open_for_agent(&self, agent_id: &str) -> Result<Vec<Escalation>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ESCALATION_COLS} FROM escalation_queue
             WHERE agent_id = ?1 AND status IN ('pending', 'accepted')
             ORDER BY offered_at"
        ))?;
        let rows = stmt.query_map([agent_id], row_to_escalation)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Most recent open offer for a user in a conversation — what an
    /// explicit accept call refers to.
    pub fn latest_pending_for_user(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<Option<Escalation>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {ESCALATION_COLS} FROM escalation_queue
                     WHERE conversation_id = ?1 AND user_id = ?2 AND status = 'pending'
                     ORDER BY offered_at DESC LIMIT 1"
                ),
                rusqlite::params![conversation_id, user_id],
                row_to_escalation,
            )
            .optional()?)
    }

    /// Escalations counted against the creator's quota: everything except
    /// declined, inside the window.
    pub fn count_in_window(
        &self,
        agent_id: &str,
        since: chrono::DateTime<chrono::Utc>,
    ) -> Result<u32> {
        let conn = self.conn.lock().unwrap();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM escalation_queue
             WHERE agent_id = ?1 AND status != 'declined' AND offered_at >= ?2",
            rusqlite::params![agent_id, since.to_rfc3339()],
            |row| row.get(0),
        )?;
        Ok(n as u32)
    }
}

const ESCALATION_COLS: &str = "id, conversation_id, user_id, agent_id, original_message, \
     context_summary, reason, status, offered_at, accepted_at, answered_at, \
     creator_answer, answer_layer";

fn get_with_conn(conn: &Connection, id: &str) -> Result<Escalation> {
    conn.query_row(
        &format!("SELECT {ESCALATION_COLS} FROM escalation_queue WHERE id = ?1"),
        [id],
        row_to_escalation,
    )
    .optional()?
    .ok_or_else(|| OrchestratorError::EscalationNotFound { id: id.to_string() })
}

fn row_to_escalation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Escalation> {
    let reason: String = row.get(6)?;
    let status: String = row.get(7)?;
    let layer: Option<String> = row.get(12)?;
    Ok(Escalation {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        user_id: row.get(2)?,
        agent_id: row.get(3)?,
        original_message: row.get(4)?,
        context_summary: row.get(5)?,
        reason: reason.parse().unwrap_or(EscalationReason::Novel),
        status: status.parse().unwrap_or(EscalationStatus::Pending),
        offered_at: row.get(8)?,
        accepted_at: row.get(9)?,
        answered_at: row.get(10)?,
        creator_answer: row.get(11)?,
        answer_layer: layer.and_then(|s| s.parse().ok()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> EscalationStore {
        let conn = Arc::new(Mutex::new(Connection::open_in_memory().unwrap()));
        EscalationStore::new(conn).unwrap()
    }

    fn offer(store: &EscalationStore, user: &str) -> Escalation {
        let conn = store.conn.clone();
        let mut guard = conn.lock().unwrap();
        let tx = guard.transaction().unwrap();
        let e = offer_tx(
            &tx,
            "conv-1",
            user,
            "agent-1",
            "can you license the catalog?",
            "user asked about licensing",
            EscalationReason::Strategic,
        )
        .unwrap();
        tx.commit().unwrap();
        e
    }

    #[test]
    fn accept_is_idempotent() {
        let store = fixture();
        let e = offer(&store, "user-1");
        let accepted = store.accept(&e.id, "user-1").unwrap();
        assert_eq!(accepted.status, EscalationStatus::Accepted);
        assert!(accepted.accepted_at.is_some());
        // Second accept: no-op success.
        let again = store.accept(&e.id, "user-1").unwrap();
        assert_eq!(again.status, EscalationStatus::Accepted);
        assert_eq!(again.accepted_at, accepted.accepted_at);
    }

    #[test]
    fn only_asking_user_can_accept() {
        let store = fixture();
        let e = offer(&store, "user-1");
        assert!(matches!(
            store.accept(&e.id, "someone-else"),
            Err(OrchestratorError::PermissionDenied(_))
        ));
    }

    #[test]
    fn answer_requires_accepted() {
        let store = fixture();
        let e = offer(&store, "user-1");
        {
            let mut guard = store.conn.lock().unwrap();
            let tx = guard.transaction().unwrap();
            let err = EscalationStore::answer_tx(&tx, &e.id, "7 days", Layer::Public).unwrap_err();
            assert!(matches!(err, OrchestratorError::Conflict(_)));
        }
        store.accept(&e.id, "user-1").unwrap();
        {
            let mut guard = store.conn.lock().unwrap();
            let tx = guard.transaction().unwrap();
            let answered =
                EscalationStore::answer_tx(&tx, &e.id, "7 days refund window", Layer::Public)
                    .unwrap();
            tx.commit().unwrap();
            assert_eq!(answered.status, EscalationStatus::Answered);
            assert_eq!(answered.creator_answer.as_deref(), Some("7 days refund window"));
        }
    }

    #[test]
    fn answer_twice_conflicts() {
        let store = fixture();
        let e = offer(&store, "user-1");
        store.accept(&e.id, "user-1").unwrap();
        {
            let mut guard = store.conn.lock().unwrap();
            let tx = guard.transaction().unwrap();
            EscalationStore::answer_tx(&tx, &e.id, "first", Layer::Public).unwrap();
            tx.commit().unwrap();
        }
        let mut guard = store.conn.lock().unwrap();
        let tx = guard.transaction().unwrap();
        assert!(matches!(
            EscalationStore::answer_tx(&tx, &e.id, "second", Layer::Public),
            Err(OrchestratorError::Conflict(_))
        ));
    }

    #[test]
    fn decline_from_pending_and_accepted() {
        let store = fixture();
        let e1 = offer(&store, "user-1");
        assert_eq!(store.decline(&e1.id).unwrap().status, EscalationStatus::Declined);

        let e2 = offer(&store, "user-1");
        store.accept(&e2.id, "user-1").unwrap();
        assert_eq!(store.decline(&e2.id).unwrap().status, EscalationStatus::Declined);

        // No resurrection: accepting a declined escalation conflicts.
        assert!(matches!(
            store.accept(&e1.id, "user-1"),
            Err(OrchestratorError::Conflict(_))
        ));
    }

    #[test]
    fn expiry_sweep_honours_both_windows() {
        let store = fixture();
        let stale_pending = offer(&store, "user-1");
        let fresh_pending = offer(&store, "user-2");
        let stale_accepted = offer(&store, "user-3");
        store.accept(&stale_accepted.id, "user-3").unwrap();

        // Nothing is overdue right now.
        assert!(store.expire_overdue(chrono::Utc::now()).unwrap().is_empty());

        // 4 days out: the pending offers pass 72h; the accepted one is
        // still inside 14 days.
        let later = chrono::Utc::now() + chrono::Duration::days(4);
        let expired = store.expire_overdue(later).unwrap();
        let ids: Vec<_> = expired.iter().map(|e| e.id.as_str()).collect();
        assert!(ids.contains(&stale_pending.id.as_str()));
        assert!(ids.contains(&fresh_pending.id.as_str()));
        assert!(!ids.contains(&stale_accepted.id.as_str()));

        // 15 days out: the accepted one goes too.
        let much_later = chrono::Utc::now() + chrono::Duration::days(15);
        let expired = store.expire_overdue(much_later).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, stale_accepted.id);
    }

    #[test]
    fn quota_counts_exclude_declined_only() {
        let store = fixture();
        let e1 = offer(&store, "user-1");
        let _e2 = offer(&store, "user-2");
        let e3 = offer(&store, "user-3");
        store.decline(&e1.id).unwrap();
        store.accept(&e3.id, "user-3").unwrap();

        let since = chrono::Utc::now() - chrono::Duration::days(1);
        // pending + accepted count; declined does not.
        assert_eq!(store.count_in_window("agent-1", since).unwrap(), 2);
    }

    #[test]
    fn open_queue_lists_pending_and_accepted() {
        let store = fixture();
        let e1 = offer(&store, "user-1");
        let e2 = offer(&store, "user-2");
        store.accept(&e2.id, "user-2").unwrap();
        let e3 = offer(&store, "user-3");
        store.decline(&e3.id).unwrap();

        let open = store.open_for_agent("agent-1").unwrap();
        let ids: Vec<_> = open.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec![e1.id.as_str(), e2.id.as_str()]);
    }

    #[test]
    fn latest_pending_for_user_scoped_to_conversation() {
        let store = fixture();
        let e = offer(&store, "user-1");
        assert_eq!(
            store
                .latest_pending_for_user("conv-1", "user-1")
                .unwrap()
                .unwrap()
                .id,
            e.id
        );
        assert!(store
            .latest_pending_for_user("conv-other", "user-1")
            .unwrap()
            .is_none());
    }
}
