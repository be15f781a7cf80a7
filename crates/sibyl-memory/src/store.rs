use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use tracing::{debug, info};
use uuid::Uuid;

use sibyl_vector::{Embedder, SearchFilter, VectorKind, VectorStore};

use crate::error::Result;
use crate::types::{AgentMemory, ExtractedMemory, MemoryKind};

/// Candidates below this confidence are dropped at admission.
pub const CONFIDENCE_FLOOR: f64 = 0.6;
/// A candidate this close (cosine) to an existing memory of the same agent
/// and kind is a duplicate.
pub const DEDUP_SIMILARITY: f32 = 0.93;

/// Owns the `agent_memories` table plus the per-message extraction marker
/// that makes recording idempotent.
pub struct MemoryStore {
    conn: Mutex<Connection>,
    embedder: Arc<dyn Embedder>,
    vectors: Arc<VectorStore>,
}

impl MemoryStore {
    pub fn new(
        conn: Connection,
        embedder: Arc<dyn Embedder>,
        vectors: Arc<VectorStore>,
    ) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            embedder,
            vectors,
        })
    }

    /// Admit extracted candidates for one source message. Returns the number
    /// of memories actually inserted.
    ///
    /// Rules, in order: the whole call is a no-op if this source message was
    /// already processed; candidates under the confidence floor are dropped;
    /// candidates within [`DEDUP_SIMILARITY`] of an existing memory of the
    /// same kind are dropped.
    pub async fn record_extraction(
        &self,
        agent_id: &str,
        source_message_id: &str,
        candidates: Vec<ExtractedMemory>,
    ) -> Result<usize> {
        if self.already_extracted(source_message_id)? {
            debug!(source_message_id, "extraction already recorded, skipping");
            return Ok(0);
        }

        let mut inserted = 0usize;
        for candidate in candidates {
            if candidate.confidence < CONFIDENCE_FLOOR {
                debug!(
                    confidence = candidate.confidence,
                    "dropping low-confidence memory candidate"
                );
                continue;
            }

            let vector = self.embedder.embed_one(&candidate.content).await?;

            // Near-duplicate check against existing memories of the same kind.
            let neighbours = self.vectors.search(
                agent_id,
                &vector,
                5,
                &SearchFilter {
                    kind: Some(VectorKind::Memory),
                    layers: None,
                },
            )?;
            let duplicate = neighbours.iter().any(|h| {
                h.similarity() >= DEDUP_SIMILARITY
                    && h.metadata.get("kind").and_then(|v| v.as_str())
                        == Some(&candidate.kind.to_string())
            });
            if duplicate {
                debug!(kind = %candidate.kind, "dropping near-duplicate memory");
                continue;
            }

            let id = Uuid::new_v4().to_string();
            let now = chrono::Utc::now().to_rfc3339();
            {
                let conn = self.conn.lock().unwrap();
                conn.execute(
                    "INSERT INTO agent_memories
                     (id, agent_id, kind, content, confidence, source_message_id, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![
                        id,
                        agent_id,
                        candidate.kind.to_string(),
                        candidate.content,
                        candidate.confidence,
                        source_message_id,
                        now
                    ],
                )?;
            }
            self.vectors.upsert(
                agent_id,
                &id,
                VectorKind::Memory,
                None,
                &vector,
                &serde_json::json!({ "kind": candidate.kind.to_string() }),
            )?;
            inserted += 1;
        }

        self.mark_extracted(agent_id, source_message_id)?;
        if inserted > 0 {
            info!(agent_id, source_message_id, inserted, "memories recorded");
        }
        Ok(inserted)
    }

    /// Top `m` memories by cosine relevance to a query.
    pub async fn relevant(
        &self,
        agent_id: &str,
        query: &str,
        m: usize,
    ) -> Result<Vec<AgentMemory>> {
        let query_vec = self.embedder.embed_one(query).await?;
        let hits = self.vectors.search(
            agent_id,
            &query_vec,
            m,
            &SearchFilter {
                kind: Some(VectorKind::Memory),
                layers: None,
            },
        )?;
        let ids: Vec<String> = hits.into_iter().map(|h| h.id).collect();
        self.by_ids(&ids)
    }

    /// All memories for an agent, newest first. Owner-facing listing.
    pub fn list(&self, agent_id: &str, limit: usize) -> Result<Vec<AgentMemory>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, agent_id, kind, content, confidence, source_message_id, created_at
             FROM agent_memories WHERE agent_id = ?1
             ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![agent_id, limit], row_to_memory)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Remove an agent's memories entirely (agent deletion).
    pub fn purge_agent(&self, agent_id: &str) -> Result<usize> {
        let n = {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "DELETE FROM memory_extractions WHERE agent_id = ?1",
                [agent_id],
            )?;
            conn.execute("DELETE FROM agent_memories WHERE agent_id = ?1", [agent_id])?
        };
        self.vectors.remove_scope(agent_id, Some(VectorKind::Memory))?;
        Ok(n)
    }

    fn by_ids(&self, ids: &[String]) -> Result<Vec<AgentMemory>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, agent_id, kind, content, confidence, source_message_id, created_at
             FROM agent_memories WHERE id = ?1",
        )?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Ok(mem) = stmt.query_row([id], row_to_memory) {
                out.push(mem);
            }
        }
        Ok(out)
    }

    fn already_extracted(&self, source_message_id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM memory_extractions WHERE source_message_id = ?1",
            [source_message_id],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    fn mark_extracted(&self, agent_id: &str, source_message_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO memory_extractions (source_message_id, agent_id, extracted_at)
             VALUES (?1, ?2, ?3)",
            rusqlite::params![source_message_id, agent_id, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

fn row_to_memory(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentMemory> {
    let kind_str: String = row.get(2)?;
    Ok(AgentMemory {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        kind: kind_str.parse().unwrap_or(MemoryKind::Fact),
        content: row.get(3)?,
        confidence: row.get(4)?,
        source_message_id: row.get(5)?,
        created_at: row.get(6)?,
    })
}

/// Initialise memory tables. Safe to call on every startup (idempotent).
fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS agent_memories (
            id                TEXT PRIMARY KEY NOT NULL,
            agent_id          TEXT NOT NULL,
            kind              TEXT NOT NULL,
            content           TEXT NOT NULL,
            confidence        REAL NOT NULL,
            source_message_id TEXT NOT NULL,
            created_at        TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_memories_agent
            ON agent_memories(agent_id, created_at DESC);
        CREATE TABLE IF NOT EXISTS memory_extractions (
            source_message_id TEXT PRIMARY KEY NOT NULL,
            agent_id          TEXT NOT NULL,
            extracted_at      TEXT NOT NULL
        );",
    )
}
