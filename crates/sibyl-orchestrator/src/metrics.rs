use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use serde::Serialize;

use crate::error::Result;

/// Aggregated decision analytics for one agent over a window. Owner-facing.
#[derive(Debug, Clone, Serialize)]
pub struct AgentMetrics {
    pub agent_id: String,
    pub window_days: u32,
    pub total_decisions: u64,
    /// Decision counts keyed by path letter.
    pub path_counts: HashMap<String, u64>,
    pub avg_confidence: f32,
    pub avg_novelty: f32,
    pub avg_complexity: f32,
    /// Escalation funnel inside the window.
    pub escalations_offered: u64,
    pub escalations_accepted: u64,
    pub escalations_answered: u64,
    pub escalations_declined: u64,
    pub escalations_expired: u64,
    /// Total canonical reuse across the agent's library (all time).
    pub canonical_answers: u64,
    pub canonical_reuses: u64,
}

/// Computes [`AgentMetrics`] from the decision log, escalation queue and
/// canonical library. Read-only.
pub struct MetricsReader {
    conn: Arc<Mutex<Connection>>,
}

impl MetricsReader {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    pub fn for_agent(&self, agent_id: &str, window_days: u32) -> Result<AgentMetrics> {
        let since = (chrono::Utc::now() - chrono::Duration::days(window_days as i64)).to_rfc3339();
        let conn = self.conn.lock().unwrap();

        let mut path_counts = HashMap::new();
        let mut total = 0u64;
        {
            let mut stmt = conn.prepare(
                "SELECT path, COUNT(*) FROM orchestrator_decisions
                 WHERE agent_id = ?1 AND created_at >= ?2 GROUP BY path",
            )?;
            let rows = stmt.query_map(rusqlite::params![agent_id, since], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?;
            for row in rows.flatten() {
                total += row.1;
                path_counts.insert(row.0, row.1);
            }
        }

        let (avg_confidence, avg_novelty, avg_complexity): (f64, f64, f64) = conn
            .query_row(
                "SELECT IFNULL(AVG(confidence), 0), IFNULL(AVG(novelty), 0),
                        IFNULL(AVG(complexity), 0)
                 FROM orchestrator_decisions
                 WHERE agent_id = ?1 AND created_at >= ?2",
                rusqlite::params![agent_id, since],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap_or((0.0, 0.0, 0.0));

        let mut funnel: HashMap<String, u64> = HashMap::new();
        {
            let mut stmt = conn.prepare(
                "SELECT status, COUNT(*) FROM escalation_queue
                 WHERE agent_id = ?1 AND offered_at >= ?2 GROUP BY status",
            )?;
            let rows = stmt.query_map(rusqlite::params![agent_id, since], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?;
            for row in rows.flatten() {
                funnel.insert(row.0, row.1);
            }
        }
        let offered: u64 = funnel.values().sum();

        let (canonical_answers, canonical_reuses): (i64, i64) = conn
            .query_row(
                "SELECT COUNT(*), IFNULL(SUM(reuse_count), 0)
                 FROM canonical_answers WHERE agent_id = ?1",
                [agent_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap_or((0, 0));

        Ok(AgentMetrics {
            agent_id: agent_id.to_string(),
            window_days,
            total_decisions: total,
            path_counts,
            avg_confidence: avg_confidence as f32,
            avg_novelty: avg_novelty as f32,
            avg_complexity: avg_complexity as f32,
            escalations_offered: offered,
            escalations_accepted: funnel.get("accepted").copied().unwrap_or(0)
                + funnel.get("answered").copied().unwrap_or(0),
            escalations_answered: funnel.get("answered").copied().unwrap_or(0),
            escalations_declined: funnel.get("declined").copied().unwrap_or(0),
            escalations_expired: funnel.get("expired").copied().unwrap_or(0),
            canonical_answers: canonical_answers as u64,
            canonical_reuses: canonical_reuses as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::Signals;
    use sibyl_core::types::DecisionPath;

    #[test]
    fn aggregates_paths_and_averages() {
        let conn = Arc::new(Mutex::new(Connection::open_in_memory().unwrap()));
        {
            let guard = conn.lock().unwrap();
            crate::decisions::init_db(&guard).unwrap();
            crate::escalation::init_db(&guard).unwrap();
            crate::canonical::init_db(&guard).unwrap();
        }
        {
            let mut guard = conn.lock().unwrap();
            let tx = guard.transaction().unwrap();
            for (i, path) in [DecisionPath::A, DecisionPath::A, DecisionPath::C].iter().enumerate() {
                crate::decisions::insert_tx(
                    &tx,
                    "c",
                    "u",
                    "agent-1",
                    &format!("m{i}"),
                    "msg",
                    *path,
                    Signals {
                        similarity: 0.5,
                        novelty: 0.5,
                        complexity: 0.4,
                        confidence: 0.6,
                    },
                    None,
                )
                .unwrap();
            }
            tx.commit().unwrap();
        }

        let metrics = MetricsReader::new(conn).for_agent("agent-1", 7).unwrap();
        assert_eq!(metrics.total_decisions, 3);
        assert_eq!(metrics.path_counts.get("A"), Some(&2));
        assert_eq!(metrics.path_counts.get("C"), Some(&1));
        assert!((metrics.avg_confidence - 0.6).abs() < 1e-6);
        assert_eq!(metrics.escalations_offered, 0);
    }
}
