use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use sibyl_core::types::Layer;
use sibyl_vector::{Embedder, VectorKind, VectorStore};

use crate::chunker::chunk_text;
use crate::error::{KnowledgeError, Result};

/// A document as ingested. Immutable once stored; deletion cascades chunks.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: String,
    pub agent_id: String,
    pub layer: Layer,
    pub source: String,
    pub chunk_count: usize,
    pub created_at: String,
}

/// One embedded chunk row. `ordinal` is dense and increasing per document.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentChunk {
    pub id: String,
    pub document_id: String,
    pub ordinal: usize,
    pub content: String,
    pub layer: Layer,
}

/// Owns the `documents` and `document_chunks` tables and drives ingestion.
pub struct KnowledgeStore {
    conn: Mutex<Connection>,
    embedder: Arc<dyn Embedder>,
    vectors: Arc<VectorStore>,
}

impl KnowledgeStore {
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

    /// Split, embed and persist a document.
    ///
    /// Idempotent per (agent, content): re-ingesting identical content
    /// returns the existing document id and chunk count without writing
    /// anything. Individual chunks that fail to embed are logged and
    /// skipped; the document counts as ingested when at least one chunk
    /// made it in.
    pub async fn ingest(
        &self,
        agent_id: &str,
        layer: Layer,
        content: &str,
        source: &str,
    ) -> Result<(String, usize)> {
        let content_hash = hash_content(content);

        if let Some((id, count)) = self.find_by_hash(agent_id, &content_hash)? {
            info!(agent_id, document_id = %id, "document already ingested, skipping");
            return Ok((id, count));
        }

        let pieces = chunk_text(content);
        if pieces.is_empty() {
            return Err(KnowledgeError::NothingIngested {
                doc_source: source.to_string(),
            });
        }

        // Embed the whole batch in one call; on a batch-level failure fall
        // back to chunk-at-a-time so one poisoned chunk can't sink the
        // document.
        let embedded: Vec<(String, Vec<f32>)> = match self.embedder.embed(&pieces).await {
            Ok(vectors) => pieces.into_iter().zip(vectors).collect(),
            Err(batch_err) => {
                warn!(error = %batch_err, "batch embed failed, retrying per chunk");
                let mut ok = Vec::new();
                for piece in pieces {
                    match self.embedder.embed_one(&piece).await {
                        Ok(v) => ok.push((piece, v)),
                        Err(e) => warn!(error = %e, "chunk embed failed, skipping"),
                    }
                }
                ok
            }
        };

        if embedded.is_empty() {
            return Err(KnowledgeError::NothingIngested {
                doc_source: source.to_string(),
            });
        }

        let document_id = Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();
        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO documents (id, agent_id, layer, content, source, content_hash, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    document_id,
                    agent_id,
                    layer.to_string(),
                    content,
                    source,
                    content_hash,
                    now
                ],
            )?;
            for (ordinal, (piece, _)) in embedded.iter().enumerate() {
                conn.execute(
                    "INSERT INTO document_chunks
                     (id, document_id, agent_id, ordinal, content, layer, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![
                        chunk_id(&document_id, ordinal),
                        document_id,
                        agent_id,
                        ordinal,
                        piece,
                        layer.to_string(),
                        now
                    ],
                )?;
            }
        }

        for (ordinal, (_, vector)) in embedded.iter().enumerate() {
            self.vectors.upsert(
                agent_id,
                &chunk_id(&document_id, ordinal),
                VectorKind::Chunk,
                Some(layer),
                vector,
                &serde_json::json!({ "document_id": document_id, "ordinal": ordinal }),
            )?;
        }

        let count = embedded.len();
        info!(agent_id, document_id = %document_id, chunks = count, source, "document ingested");
        Ok((document_id, count))
    }

    /// List an agent's documents, newest first.
    pub fn list_documents(&self, agent_id: &str) -> Result<Vec<Document>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT d.id, d.agent_id, d.layer, d.source, d.created_at,
                    (SELECT COUNT(*) FROM document_chunks c WHERE c.document_id = d.id)
             FROM documents d WHERE d.agent_id = ?1
             ORDER BY d.created_at DESC",
        )?;
        let rows = stmt.query_map([agent_id], |row| {
            Ok(Document {
                id: row.get(0)?,
                agent_id: row.get(1)?,
                layer: row.get::<_, String>(2)?.parse().unwrap_or(Layer::Public),
                source: row.get(3)?,
                created_at: row.get(4)?,
                chunk_count: row.get::<_, i64>(5)? as usize,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Delete a document and its chunks (rows and vectors).
    pub fn delete_document(&self, agent_id: &str, document_id: &str) -> Result<()> {
        let chunk_ids: Vec<String> = {
            let conn = self.conn.lock().unwrap();
            let owner: Option<String> = conn
                .query_row(
                    "SELECT agent_id FROM documents WHERE id = ?1",
                    [document_id],
                    |row| row.get(0),
                )
                .ok();
            match owner {
                None => {
                    return Err(KnowledgeError::DocumentNotFound {
                        id: document_id.to_string(),
                    })
                }
                Some(owner) if owner != agent_id => {
                    return Err(KnowledgeError::DocumentNotFound {
                        id: document_id.to_string(),
                    })
                }
                Some(_) => {}
            }
            let mut stmt =
                conn.prepare("SELECT id FROM document_chunks WHERE document_id = ?1")?;
            let ids = stmt
                .query_map([document_id], |row| row.get::<_, String>(0))?
                .filter_map(|r| r.ok())
                .collect();
            conn.execute(
                "DELETE FROM document_chunks WHERE document_id = ?1",
                [document_id],
            )?;
            conn.execute("DELETE FROM documents WHERE id = ?1", [document_id])?;
            ids
        };
        for id in &chunk_ids {
            self.vectors.remove(id)?;
        }
        info!(agent_id, document_id, chunks = chunk_ids.len(), "document deleted");
        Ok(())
    }

    /// Fetch chunk rows by id, preserving the caller's order.
    pub fn chunks_by_ids(&self, ids: &[String]) -> Result<Vec<DocumentChunk>> {
        let conn = self.conn.lock().unwrap();
        let mut out = Vec::with_capacity(ids.len());
        let mut stmt = conn.prepare(
            "SELECT id, document_id, ordinal, content, layer
             FROM document_chunks WHERE id = ?1",
        )?;
        for id in ids {
            let row = stmt
                .query_row([id], |row| {
                    Ok(DocumentChunk {
                        id: row.get(0)?,
                        document_id: row.get(1)?,
                        ordinal: row.get::<_, i64>(2)? as usize,
                        content: row.get(3)?,
                        layer: row.get::<_, String>(4)?.parse().unwrap_or(Layer::Public),
                    })
                })
                .ok();
            if let Some(chunk) = row {
                out.push(chunk);
            }
        }
        Ok(out)
    }

    fn find_by_hash(&self, agent_id: &str, content_hash: &str) -> Result<Option<(String, usize)>> {
        let conn = self.conn.lock().unwrap();
        let found = conn
            .query_row(
                "SELECT d.id,
                        (SELECT COUNT(*) FROM document_chunks c WHERE c.document_id = d.id)
                 FROM documents d
                 WHERE d.agent_id = ?1 AND d.content_hash = ?2",
                rusqlite::params![agent_id, content_hash],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize)),
            )
            .ok();
        Ok(found)
    }
}

fn chunk_id(document_id: &str, ordinal: usize) -> String {
    format!("{document_id}:{ordinal}")
}

fn hash_content(content: &str) -> String {
    let mut h = Sha256::new();
    h.update(content.as_bytes());
    hex::encode(h.finalize())
}

/// Initialise knowledge tables. Safe to call on every startup (idempotent).
fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS documents (
            id           TEXT PRIMARY KEY NOT NULL,
            agent_id     TEXT NOT NULL,
            layer        TEXT NOT NULL,
            content      TEXT NOT NULL,
            source       TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            created_at   TEXT NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_documents_hash
            ON documents(agent_id, content_hash);
        CREATE TABLE IF NOT EXISTS document_chunks (
            id          TEXT PRIMARY KEY NOT NULL,
            document_id TEXT NOT NULL REFERENCES documents(id),
            agent_id    TEXT NOT NULL,
            ordinal     INTEGER NOT NULL,
            content     TEXT NOT NULL,
            layer       TEXT NOT NULL,
            created_at  TEXT NOT NULL,
            UNIQUE(document_id, ordinal)
        );
        CREATE INDEX IF NOT EXISTS idx_chunks_agent
            ON document_chunks(agent_id);",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use sibyl_vector::LocalHashEmbedder;

    fn fixture() -> KnowledgeStore {
        let embedder: Arc<dyn Embedder> = Arc::new(LocalHashEmbedder::new(64));
        let vectors = Arc::new(
            VectorStore::new(Connection::open_in_memory().unwrap(), 64).unwrap(),
        );
        KnowledgeStore::new(Connection::open_in_memory().unwrap(), embedder, vectors).unwrap()
    }

    #[tokio::test]
    async fn ingest_and_list() {
        let store = fixture();
        let (doc_id, count) = store
            .ingest("agent-1", Layer::Public, "Paris opens at nine. We close on Sundays.", "manual")
            .await
            .unwrap();
        assert_eq!(count, 1);

        let docs = store.list_documents("agent-1").unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, doc_id);
        assert_eq!(docs[0].chunk_count, 1);
        assert_eq!(docs[0].layer, Layer::Public);
    }

    #[tokio::test]
    async fn reingest_is_idempotent() {
        let store = fixture();
        let text = "Same content both times. Word for word.";
        let (id1, n1) = store.ingest("a", Layer::Public, text, "s1").await.unwrap();
        let (id2, n2) = store.ingest("a", Layer::Public, text, "s2").await.unwrap();
        assert_eq!(id1, id2);
        assert_eq!(n1, n2);
        assert_eq!(store.list_documents("a").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn same_content_different_agents_both_ingest() {
        let store = fixture();
        let text = "Shared doctrine text.";
        let (id1, _) = store.ingest("a", Layer::Public, text, "s").await.unwrap();
        let (id2, _) = store.ingest("b", Layer::Public, text, "s").await.unwrap();
        assert_ne!(id1, id2);
    }

    #[tokio::test]
    async fn delete_cascades_chunks() {
        let store = fixture();
        let (doc_id, _) = store
            .ingest("a", Layer::Friends, "To delete. Entirely.", "s")
            .await
            .unwrap();
        store.delete_document("a", &doc_id).unwrap();
        assert!(store.list_documents("a").unwrap().is_empty());
        assert!(store.chunks_by_ids(&[chunk_id(&doc_id, 0)]).unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_requires_owner() {
        let store = fixture();
        let (doc_id, _) = store.ingest("a", Layer::Public, "Mine.", "s").await.unwrap();
        let err = store.delete_document("intruder", &doc_id).unwrap_err();
        assert!(matches!(err, KnowledgeError::DocumentNotFound { .. }));
    }

    #[tokio::test]
    async fn empty_content_is_rejected() {
        let store = fixture();
        let err = store.ingest("a", Layer::Public, "   ", "s").await.unwrap_err();
        assert!(matches!(err, KnowledgeError::NothingIngested { .. }));
    }
}
