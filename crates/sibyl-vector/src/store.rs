use std::str::FromStr;
use std::sync::Mutex;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::debug;

use sibyl_core::types::Layer;

use crate::error::{Result, VectorError};
use crate::math::{cosine_distance, from_blob, to_blob};

/// What kind of object a vector indexes. Search filters compose on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorKind {
    Chunk,
    Memory,
    Canonical,
}

impl std::fmt::Display for VectorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Chunk => write!(f, "chunk"),
            Self::Memory => write!(f, "memory"),
            Self::Canonical => write!(f, "canonical"),
        }
    }
}

impl FromStr for VectorKind {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "chunk" => Ok(Self::Chunk),
            "memory" => Ok(Self::Memory),
            "canonical" => Ok(Self::Canonical),
            other => Err(format!("unknown vector kind: {other}")),
        }
    }
}

/// Composable search restriction. `owner_scope` is always required at the
/// call site — a search can never span agents.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    pub kind: Option<VectorKind>,
    /// When set, only vectors whose layer is in this set match. Vectors
    /// stored without a layer (memories) never match a layer filter.
    pub layers: Option<Vec<Layer>>,
}

/// A single search result, nearest first.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub id: String,
    pub kind: VectorKind,
    pub layer: Option<Layer>,
    pub metadata: serde_json::Value,
    /// Cosine distance in [0, 2]; 0 is identical.
    pub distance: f32,
}

impl VectorHit {
    pub fn similarity(&self) -> f32 {
        (1.0 - self.distance).clamp(0.0, 1.0)
    }
}

/// SQLite-backed vector persistence.
///
/// Vectors are BLOB f32-LE, L2-normalized by the embedder before they get
/// here. Search is an exhaustive cosine scan over the owner scope narrowed
/// by the kind/layer indexes — per-agent corpora are small enough that this
/// stays deterministic and well inside the search budget, and recall is
/// exactly monotonic in `k`.
pub struct VectorStore {
    conn: Mutex<Connection>,
    dim: usize,
}

impl VectorStore {
    pub fn new(conn: Connection, dim: usize) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            dim,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    fn check_dim(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dim {
            return Err(VectorError::DimensionMismatch {
                expected: self.dim,
                got: vector.len(),
            });
        }
        Ok(())
    }

    /// Insert or replace a vector. `id` is the domain object's id — the
    /// owning crate joins back to its own table by it.
    pub fn upsert(
        &self,
        owner_scope: &str,
        id: &str,
        kind: VectorKind,
        layer: Option<Layer>,
        vector: &[f32],
        metadata: &serde_json::Value,
    ) -> Result<()> {
        self.check_dim(vector)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO vectors (id, owner_scope, kind, layer, vector, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                owner_scope = excluded.owner_scope,
                kind = excluded.kind,
                layer = excluded.layer,
                vector = excluded.vector,
                metadata = excluded.metadata",
            rusqlite::params![
                id,
                owner_scope,
                kind.to_string(),
                layer.map(|l| l.to_string()),
                to_blob(vector),
                metadata.to_string(),
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Nearest-neighbour search within one owner scope. Results are sorted by
    /// ascending distance; ties break on id so a fixed snapshot always
    /// returns the same order.
    pub fn search(
        &self,
        owner_scope: &str,
        query: &[f32],
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<VectorHit>> {
        self.check_dim(query)?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut sql = String::from(
            "SELECT id, kind, layer, metadata, vector FROM vectors WHERE owner_scope = ?1",
        );
        if let Some(kind) = filter.kind {
            sql.push_str(&format!(" AND kind = '{kind}'"));
        }
        if let Some(layers) = &filter.layers {
            if layers.is_empty() {
                return Ok(Vec::new());
            }
            let list = layers
                .iter()
                .map(|l| format!("'{l}'"))
                .collect::<Vec<_>>()
                .join(", ");
            sql.push_str(&format!(" AND layer IN ({list})"));
        }

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([owner_scope], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Vec<u8>>(4)?,
            ))
        })?;

        let mut hits: Vec<VectorHit> = Vec::new();
        for row in rows {
            let (id, kind_str, layer_str, metadata_str, blob) = row?;
            let Some(vector) = from_blob(&blob) else {
                debug!(%id, "skipping vector with corrupt blob");
                continue;
            };
            if vector.len() != self.dim {
                debug!(%id, len = vector.len(), "skipping vector with stale dimension");
                continue;
            }
            let Ok(kind) = kind_str.parse::<VectorKind>() else {
                continue;
            };
            let layer = layer_str.and_then(|s| s.parse::<Layer>().ok());
            let metadata =
                serde_json::from_str(&metadata_str).unwrap_or(serde_json::Value::Null);
            hits.push(VectorHit {
                id,
                kind,
                layer,
                metadata,
                distance: cosine_distance(query, &vector),
            });
        }

        hits.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    /// Fetch a stored vector by id.
    pub fn get(&self, id: &str) -> Result<Option<Vec<f32>>> {
        let conn = self.conn.lock().unwrap();
        let blob: Option<Vec<u8>> = conn
            .query_row("SELECT vector FROM vectors WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .ok();
        Ok(blob.and_then(|b| from_blob(&b)))
    }

    /// Remove one vector. Missing ids are a no-op.
    pub fn remove(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM vectors WHERE id = ?1", [id])?;
        Ok(())
    }

    /// Remove every vector in an owner scope, optionally narrowed by kind.
    /// Used when an agent or document is deleted.
    pub fn remove_scope(&self, owner_scope: &str, kind: Option<VectorKind>) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let n = match kind {
            Some(kind) => conn.execute(
                "DELETE FROM vectors WHERE owner_scope = ?1 AND kind = ?2",
                rusqlite::params![owner_scope, kind.to_string()],
            )?,
            None => conn.execute("DELETE FROM vectors WHERE owner_scope = ?1", [owner_scope])?,
        };
        Ok(n)
    }
}

/// Initialise the vectors table. Safe to call on every startup (idempotent).
fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS vectors (
            id          TEXT PRIMARY KEY NOT NULL,
            owner_scope TEXT NOT NULL,
            kind        TEXT NOT NULL,
            layer       TEXT,
            vector      BLOB NOT NULL,
            metadata    TEXT NOT NULL DEFAULT '{}',
            created_at  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_vectors_scope
            ON vectors(owner_scope, kind, layer);",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::{Embedder, LocalHashEmbedder};

    fn store(dim: usize) -> VectorStore {
        VectorStore::new(Connection::open_in_memory().unwrap(), dim).unwrap()
    }

    async fn seed(store: &VectorStore, e: &LocalHashEmbedder, id: &str, text: &str, layer: Layer) {
        let v = e.embed_one(text).await.unwrap();
        store
            .upsert(
                "agent-1",
                id,
                VectorKind::Chunk,
                Some(layer),
                &v,
                &serde_json::json!({"text": text}),
            )
            .unwrap();
    }

    #[tokio::test]
    async fn search_respects_layer_filter() {
        let s = store(128);
        let e = LocalHashEmbedder::new(128);
        seed(&s, &e, "c1", "refund policy details", Layer::Public).await;
        seed(&s, &e, "c2", "refund policy internals", Layer::Intimate).await;

        let q = e.embed_one("refund policy").await.unwrap();
        let hits = s
            .search(
                "agent-1",
                &q,
                10,
                &SearchFilter {
                    kind: Some(VectorKind::Chunk),
                    layers: Some(vec![Layer::Public]),
                },
            )
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "c1");
    }

    #[tokio::test]
    async fn search_scoped_to_owner() {
        let s = store(128);
        let e = LocalHashEmbedder::new(128);
        let v = e.embed_one("hello world").await.unwrap();
        s.upsert("agent-a", "x", VectorKind::Chunk, Some(Layer::Public), &v, &serde_json::json!({}))
            .unwrap();

        let hits = s.search("agent-b", &v, 10, &SearchFilter::default()).unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn recall_monotonic_in_k() {
        let s = store(64);
        let e = LocalHashEmbedder::new(64);
        for i in 0..8 {
            seed(&s, &e, &format!("c{i}"), &format!("topic number {i}"), Layer::Public).await;
        }
        let q = e.embed_one("topic number 3").await.unwrap();
        let top2 = s.search("agent-1", &q, 2, &SearchFilter::default()).unwrap();
        let top5 = s.search("agent-1", &q, 5, &SearchFilter::default()).unwrap();
        let ids2: Vec<_> = top2.iter().map(|h| &h.id).collect();
        let ids5: Vec<_> = top5.iter().map(|h| &h.id).collect();
        assert!(ids2.iter().all(|id| ids5.contains(id)));
    }

    #[test]
    fn dimension_mismatch_is_fatal() {
        let s = store(8);
        let err = s
            .upsert(
                "agent-1",
                "bad",
                VectorKind::Memory,
                None,
                &[1.0, 0.0],
                &serde_json::Value::Null,
            )
            .unwrap_err();
        assert!(matches!(err, VectorError::DimensionMismatch { expected: 8, got: 2 }));
        assert!(!err.retryable());
    }

    #[tokio::test]
    async fn upsert_replaces_in_place() {
        let s = store(64);
        let e = LocalHashEmbedder::new(64);
        let v1 = e.embed_one("first").await.unwrap();
        let v2 = e.embed_one("second").await.unwrap();
        s.upsert("a", "id", VectorKind::Canonical, Some(Layer::Public), &v1, &serde_json::json!({}))
            .unwrap();
        s.upsert("a", "id", VectorKind::Canonical, Some(Layer::Friends), &v2, &serde_json::json!({}))
            .unwrap();
        assert_eq!(s.get("id").unwrap().unwrap(), v2);

        let hits = s.search("a", &v2, 10, &SearchFilter::default()).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].layer, Some(Layer::Friends));
    }

    #[tokio::test]
    async fn remove_scope_by_kind() {
        let s = store(32);
        let e = LocalHashEmbedder::new(32);
        let v = e.embed_one("x").await.unwrap();
        s.upsert("a", "m1", VectorKind::Memory, None, &v, &serde_json::json!({})).unwrap();
        s.upsert("a", "c1", VectorKind::Chunk, Some(Layer::Public), &v, &serde_json::json!({}))
            .unwrap();
        assert_eq!(s.remove_scope("a", Some(VectorKind::Memory)).unwrap(), 1);
        assert!(s.get("c1").unwrap().is_some());
        assert!(s.get("m1").unwrap().is_none());
    }
}
