use std::sync::{Arc, Mutex};

use rusqlite::{Connection, OptionalExtension, Transaction};
use serde::Serialize;
use uuid::Uuid;

use sibyl_core::types::DecisionPath;

use crate::error::Result;
use crate::signals::Signals;

/// One row of the append-only decision log. Written exactly once per user
/// message, before any assistant message for the same turn.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionRecord {
    pub id: String,
    pub conversation_id: String,
    pub user_id: String,
    pub agent_id: String,
    /// The inbound message this decision answered.
    pub user_message_id: String,
    pub message_content: String,
    pub path: DecisionPath,
    pub confidence: f32,
    pub novelty: f32,
    pub complexity: f32,
    pub similar_canonical_id: Option<String>,
    pub created_at: String,
}

/// Initialise the decision log table. Idempotent.
pub fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS orchestrator_decisions (
            id                   TEXT PRIMARY KEY NOT NULL,
            conversation_id      TEXT NOT NULL,
            user_id              TEXT NOT NULL,
            agent_id             TEXT NOT NULL,
            user_message_id      TEXT NOT NULL UNIQUE,
            message_content      TEXT NOT NULL,
            path                 TEXT NOT NULL,
            confidence           REAL NOT NULL,
            novelty              REAL NOT NULL,
            complexity           REAL NOT NULL,
            similar_canonical_id TEXT,
            created_at           TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_decisions_agent
            ON orchestrator_decisions(agent_id, created_at DESC);",
    )
}

/// Append a decision inside an open transaction. The UNIQUE constraint on
/// `user_message_id` enforces the exactly-once invariant at the schema
/// level.
#[allow(clippy::too_many_arguments)]
pub fn insert_tx(
    tx: &Transaction<'_>,
    conversation_id: &str,
    user_id: &str,
    agent_id: &str,
    user_message_id: &str,
    message_content: &str,
    path: DecisionPath,
    signals: Signals,
    similar_canonical_id: Option<&str>,
) -> Result<DecisionRecord> {
    let id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    tx.execute(
        "INSERT INTO orchestrator_decisions
         (id, conversation_id, user_id, agent_id, user_message_id, message_content,
          path, confidence, novelty, complexity, similar_canonical_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        rusqlite::params![
            id,
            conversation_id,
            user_id,
            agent_id,
            user_message_id,
            message_content,
            path.to_string(),
            signals.confidence as f64,
            signals.novelty as f64,
            signals.complexity as f64,
            similar_canonical_id,
            now
        ],
    )?;
    Ok(DecisionRecord {
        id,
        conversation_id: conversation_id.to_string(),
        user_id: user_id.to_string(),
        agent_id: agent_id.to_string(),
        user_message_id: user_message_id.to_string(),
        message_content: message_content.to_string(),
        path,
        confidence: signals.confidence,
        novelty: signals.novelty,
        complexity: signals.complexity,
        similar_canonical_id: similar_canonical_id.map(String::from),
        created_at: now,
    })
}

/// Read access to the decision log.
pub struct DecisionLog {
    conn: Arc<Mutex<Connection>>,
}

impl DecisionLog {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Result<Self> {
        {
            let guard = conn.lock().unwrap();
            init_db(&guard)?;
        }
        Ok(Self { conn })
    }

    pub fn for_user_message(&self, user_message_id: &str) -> Result<Option<DecisionRecord>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {DECISION_COLS} FROM orchestrator_decisions WHERE user_message_id = ?1"
                ),
                [user_message_id],
                row_to_decision,
            )
            .optional()?)
    }

    pub fn recent_for_agent(&self, agent_id: &str, limit: usize) -> Result<Vec<DecisionRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {DECISION_COLS} FROM orchestrator_decisions
             WHERE agent_id = ?1 ORDER BY created_at DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(rusqlite::params![agent_id, limit], row_to_decision)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

const DECISION_COLS: &str = "id, conversation_id, user_id, agent_id, user_message_id, \
     message_content, path, confidence, novelty, complexity, similar_canonical_id, created_at";

fn row_to_decision(row: &rusqlite::Row<'_>) -> rusqlite::Result<DecisionRecord> {
    let path: String = row.get(6)?;
    Ok(DecisionRecord {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        user_id: row.get(2)?,
        agent_id: row.get(3)?,
        user_message_id: row.get(4)?,
        message_content: row.get(5)?,
        path: path.parse().unwrap_or(DecisionPath::A),
        confidence: row.get::<_, f64>(7)? as f32,
        novelty: row.get::<_, f64>(8)? as f32,
        complexity: row.get::<_, f64>(9)? as f32,
        similar_canonical_id: row.get(10)?,
        created_at: row.get(11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signals() -> Signals {
        Signals {
            similarity: 0.8,
            novelty: 0.2,
            complexity: 0.3,
            confidence: 0.82,
        }
    }

    #[test]
    fn one_decision_per_user_message() {
        let conn = Arc::new(Mutex::new(Connection::open_in_memory().unwrap()));
        let log = DecisionLog::new(conn.clone()).unwrap();

        let mut guard = conn.lock().unwrap();
        let tx = guard.transaction().unwrap();
        insert_tx(&tx, "c", "u", "a", "msg-1", "hello", DecisionPath::A, signals(), None).unwrap();
        // Second decision for the same user message violates the schema.
        let dup = insert_tx(&tx, "c", "u", "a", "msg-1", "hello", DecisionPath::B, signals(), None);
        assert!(dup.is_err());
        tx.commit().unwrap();
        drop(guard);

        let found = log.for_user_message("msg-1").unwrap().unwrap();
        assert_eq!(found.path, DecisionPath::A);
        assert!((found.confidence - 0.82).abs() < 1e-6);
    }

    #[test]
    fn recent_is_newest_first() {
        let conn = Arc::new(Mutex::new(Connection::open_in_memory().unwrap()));
        let log = DecisionLog::new(conn.clone()).unwrap();
        {
            let mut guard = conn.lock().unwrap();
            let tx = guard.transaction().unwrap();
            for i in 0..3 {
                insert_tx(
                    &tx,
                    "c",
                    "u",
                    "agent-1",
                    &format!("msg-{i}"),
                    "m",
                    DecisionPath::A,
                    signals(),
                    None,
                )
                .unwrap();
                std::thread::sleep(std::time::Duration::from_millis(3));
            }
            tx.commit().unwrap();
        }
        let recent = log.recent_for_agent("agent-1", 2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].user_message_id, "msg-2");
    }
}
