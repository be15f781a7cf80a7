use std::sync::{Arc, Mutex};

use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Advisory per-turn quality judgment. Produced asynchronously by the judge
/// model; never consulted on the hot path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityScore {
    pub relevance: f32,
    pub engagement: f32,
    pub factual_grounding: f32,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

impl QualityScore {
    /// Clamp every score into [0,1]; judge models drift.
    pub fn clamped(mut self) -> Self {
        self.relevance = self.relevance.clamp(0.0, 1.0);
        self.engagement = self.engagement.clamp(0.0, 1.0);
        self.factual_grounding = self.factual_grounding.clamp(0.0, 1.0);
        self
    }
}

/// Initialise the quality table. Idempotent.
pub fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS conversation_quality (
            message_id        TEXT PRIMARY KEY NOT NULL,
            relevance         REAL NOT NULL,
            engagement        REAL NOT NULL,
            factual_grounding REAL NOT NULL,
            issues            TEXT NOT NULL DEFAULT '[]',
            suggestions       TEXT NOT NULL DEFAULT '[]',
            created_at        TEXT NOT NULL
        );",
    )
}

pub struct QualityStore {
    conn: Arc<Mutex<Connection>>,
}

impl QualityStore {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Result<Self> {
        {
            let guard = conn.lock().unwrap();
            init_db(&guard)?;
        }
        Ok(Self { conn })
    }

    /// Record a judgment. Last write wins — rescoring a message replaces the
    /// earlier row.
    pub fn record(&self, message_id: &str, score: &QualityScore) -> Result<()> {
        let score = score.clone().clamped();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO conversation_quality
             (message_id, relevance, engagement, factual_grounding, issues, suggestions, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(message_id) DO UPDATE SET
                relevance = excluded.relevance,
                engagement = excluded.engagement,
                factual_grounding = excluded.factual_grounding,
                issues = excluded.issues,
                suggestions = excluded.suggestions",
            rusqlite::params![
                message_id,
                score.relevance as f64,
                score.engagement as f64,
                score.factual_grounding as f64,
                serde_json::to_string(&score.issues).unwrap_or_else(|_| "[]".into()),
                serde_json::to_string(&score.suggestions).unwrap_or_else(|_| "[]".into()),
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, message_id: &str) -> Result<Option<QualityScore>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                "SELECT relevance, engagement, factual_grounding, issues, suggestions
                 FROM conversation_quality WHERE message_id = ?1",
                [message_id],
                |row| {
                    Ok(QualityScore {
                        relevance: row.get::<_, f64>(0)? as f32,
                        engagement: row.get::<_, f64>(1)? as f32,
                        factual_grounding: row.get::<_, f64>(2)? as f32,
                        issues: serde_json::from_str(&row.get::<_, String>(3)?)
                            .unwrap_or_default(),
                        suggestions: serde_json::from_str(&row.get::<_, String>(4)?)
                            .unwrap_or_default(),
                    })
                },
            )
            .optional()?)
    }
}
