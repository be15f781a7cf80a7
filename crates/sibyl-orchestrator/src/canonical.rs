use std::sync::{Arc, Mutex};

use rusqlite::{Connection, OptionalExtension, Transaction};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use sibyl_core::types::Layer;
use sibyl_vector::{Embedder, VectorKind, VectorStore};

use crate::error::{OrchestratorError, Result};

/// A creator-authored answer saved for reuse, embedded for semantic lookup.
#[derive(Debug, Clone, Serialize)]
pub struct CanonicalAnswer {
    pub id: String,
    pub agent_id: String,
    /// Set when the answer came out of an escalation; admin seeds have none.
    pub escalation_id: Option<String>,
    pub question_pattern: String,
    pub answer_content: String,
    pub layer: Layer,
    pub reuse_count: u32,
    pub created_at: String,
    pub updated_at: String,
}

/// Initialise the canonical answers table. Idempotent.
pub fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS canonical_answers (
            id               TEXT PRIMARY KEY NOT NULL,
            agent_id         TEXT NOT NULL,
            escalation_id    TEXT UNIQUE,
            question_pattern TEXT NOT NULL,
            answer_content   TEXT NOT NULL,
            layer            TEXT NOT NULL,
            reuse_count      INTEGER NOT NULL DEFAULT 0,
            created_at       TEXT NOT NULL,
            updated_at       TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_canonical_agent
            ON canonical_answers(agent_id, layer);",
    )
}

/// Insert a canonical answer inside an open transaction — paired with the
/// escalation's `answered` transition. The UNIQUE constraint on
/// `escalation_id` backs the exactly-once invariant.
pub fn create_tx(
    tx: &Transaction<'_>,
    agent_id: &str,
    escalation_id: Option<&str>,
    question_pattern: &str,
    answer_content: &str,
    layer: Layer,
) -> Result<CanonicalAnswer> {
    let id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    tx.execute(
        "INSERT INTO canonical_answers
         (id, agent_id, escalation_id, question_pattern, answer_content, layer,
          reuse_count, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?7)",
        rusqlite::params![
            id,
            agent_id,
            escalation_id,
            question_pattern,
            answer_content,
            layer.to_string(),
            now
        ],
    )?;
    Ok(CanonicalAnswer {
        id,
        agent_id: agent_id.to_string(),
        escalation_id: escalation_id.map(String::from),
        question_pattern: question_pattern.to_string(),
        answer_content: answer_content.to_string(),
        layer,
        reuse_count: 0,
        created_at: now.clone(),
        updated_at: now,
    })
}

/// Fetch a canonical answer inside an open transaction.
pub fn get_tx(tx: &Transaction<'_>, id: &str) -> Result<CanonicalAnswer> {
    tx.query_row(
        &format!("SELECT {CANONICAL_COLS} FROM canonical_answers WHERE id = ?1"),
        [id],
        row_to_canonical,
    )
    .optional()?
    .ok_or_else(|| OrchestratorError::CanonicalNotFound { id: id.to_string() })
}

/// Atomic reuse increment inside an open transaction (path C serving).
pub fn record_use_tx(tx: &Transaction<'_>, id: &str) -> Result<CanonicalAnswer> {
    let n = tx.execute(
        "UPDATE canonical_answers
         SET reuse_count = reuse_count + 1, updated_at = ?2
         WHERE id = ?1",
        rusqlite::params![id, chrono::Utc::now().to_rfc3339()],
    )?;
    if n == 0 {
        return Err(OrchestratorError::CanonicalNotFound { id: id.to_string() });
    }
    get_tx(tx, id)
}

pub struct CanonicalStore {
    conn: Arc<Mutex<Connection>>,
    embedder: Arc<dyn Embedder>,
    vectors: Arc<VectorStore>,
}

impl CanonicalStore {
    pub fn new(
        conn: Arc<Mutex<Connection>>,
        embedder: Arc<dyn Embedder>,
        vectors: Arc<VectorStore>,
    ) -> Result<Self> {
        {
            let guard = conn.lock().unwrap();
            init_db(&guard)?;
        }
        Ok(Self {
            conn,
            embedder,
            vectors,
        })
    }

    pub fn get(&self, id: &str) -> Result<CanonicalAnswer> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("SELECT {CANONICAL_COLS} FROM canonical_answers WHERE id = ?1"),
            [id],
            row_to_canonical,
        )
        .optional()?
        .ok_or_else(|| OrchestratorError::CanonicalNotFound { id: id.to_string() })
    }

    pub fn list_for_agent(&self, agent_id: &str) -> Result<Vec<CanonicalAnswer>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CANONICAL_COLS} FROM canonical_answers
             WHERE agent_id = ?1 ORDER BY created_at DESC"
        ))?;
        let rows = stmt.query_map([agent_id], row_to_canonical)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Index the question pattern so path-C lookups can find this answer.
    /// Called after the creating transaction commits; a failure here leaves
    /// the row serveable by id but invisible to similarity search, which the
    /// degradation ladder tolerates.
    pub async fn index_question(&self, canonical: &CanonicalAnswer) -> Result<()> {
        let vector = self.embedder.embed_one(&canonical.question_pattern).await?;
        self.vectors.upsert(
            &canonical.agent_id,
            &canonical.id,
            VectorKind::Canonical,
            Some(canonical.layer),
            &vector,
            &serde_json::json!({ "question_pattern": canonical.question_pattern }),
        )?;
        Ok(())
    }

    /// Direct admin seed: create and index outside any escalation.
    pub async fn seed(
        &self,
        agent_id: &str,
        question_pattern: &str,
        answer_content: &str,
        layer: Layer,
    ) -> Result<CanonicalAnswer> {
        let canonical = {
            let mut conn = self.conn.lock().unwrap();
            let tx = conn.transaction()?;
            let c = create_tx(&tx, agent_id, None, question_pattern, answer_content, layer)?;
            tx.commit()?;
            c
        };
        if let Err(e) = self.index_question(&canonical).await {
            warn!(canonical_id = %canonical.id, error = %e, "seed indexing failed");
        }
        info!(canonical_id = %canonical.id, agent_id, "canonical answer seeded");
        Ok(canonical)
    }

    /// Serve a canonical answer via path C: bump `reuse_count` atomically
    /// (single UPDATE, no read-modify-write) and return the fresh row.
    pub fn record_use(&self, id: &str) -> Result<CanonicalAnswer> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE canonical_answers
             SET reuse_count = reuse_count + 1, updated_at = ?2
             WHERE id = ?1",
            rusqlite::params![id, chrono::Utc::now().to_rfc3339()],
        )?;
        if n == 0 {
            return Err(OrchestratorError::CanonicalNotFound { id: id.to_string() });
        }
        conn.query_row(
            &format!("SELECT {CANONICAL_COLS} FROM canonical_answers WHERE id = ?1"),
            [id],
            row_to_canonical,
        )
        .map_err(Into::into)
    }
}

const CANONICAL_COLS: &str = "id, agent_id, escalation_id, question_pattern, answer_content, \
     layer, reuse_count, created_at, updated_at";

fn row_to_canonical(row: &rusqlite::Row<'_>) -> rusqlite::Result<CanonicalAnswer> {
    let layer: String = row.get(5)?;
    Ok(CanonicalAnswer {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        escalation_id: row.get(2)?,
        question_pattern: row.get(3)?,
        answer_content: row.get(4)?,
        layer: layer.parse().unwrap_or(Layer::Public),
        reuse_count: row.get::<_, i64>(6)? as u32,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sibyl_vector::{LocalHashEmbedder, SearchFilter};

    fn fixture() -> CanonicalStore {
        let conn = Arc::new(Mutex::new(Connection::open_in_memory().unwrap()));
        let embedder: Arc<dyn Embedder> = Arc::new(LocalHashEmbedder::new(128));
        let vectors =
            Arc::new(VectorStore::new(Connection::open_in_memory().unwrap(), 128).unwrap());
        CanonicalStore::new(conn, embedder.clone(), vectors).unwrap()
    }

    #[tokio::test]
    async fn seed_and_lookup() {
        let store = fixture();
        let c = store
            .seed("agent-1", "What is your refund policy?", "7 days, no questions.", Layer::Public)
            .await
            .unwrap();
        assert_eq!(c.reuse_count, 0);
        assert!(c.escalation_id.is_none());

        let query = store
            .embedder
            .embed_one("what's your refund policy?")
            .await
            .unwrap();
        let hits = store
            .vectors
            .search(
                "agent-1",
                &query,
                1,
                &SearchFilter {
                    kind: Some(VectorKind::Canonical),
                    layers: Some(vec![Layer::Public]),
                },
            )
            .unwrap();
        assert_eq!(hits[0].id, c.id);
        assert!(hits[0].similarity() >= 0.85);
    }

    #[tokio::test]
    async fn reuse_count_increments_by_n() {
        let store = fixture();
        let c = store
            .seed("agent-1", "shipping time?", "3-5 days.", Layer::Public)
            .await
            .unwrap();
        for _ in 0..5 {
            store.record_use(&c.id).unwrap();
        }
        assert_eq!(store.get(&c.id).unwrap().reuse_count, 5);
    }

    #[test]
    fn record_use_on_missing_is_not_found() {
        let store = fixture();
        assert!(matches!(
            store.record_use("nope"),
            Err(OrchestratorError::CanonicalNotFound { .. })
        ));
    }

    #[test]
    fn one_canonical_per_escalation() {
        let store = fixture();
        let mut conn = store.conn.lock().unwrap();
        let tx = conn.transaction().unwrap();
        create_tx(&tx, "a", Some("esc-1"), "q", "ans", Layer::Public).unwrap();
        let dup = create_tx(&tx, "a", Some("esc-1"), "q2", "ans2", Layer::Public);
        assert!(dup.is_err());
    }
}
