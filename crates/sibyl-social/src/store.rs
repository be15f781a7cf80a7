use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension};
use tracing::info;
use uuid::Uuid;

use sibyl_core::types::UserTier;

use crate::db::{init_db, row_to_agent, row_to_profile, AGENT_COLS, PROFILE_COLS};
use crate::error::{Result, SocialError};
use crate::types::{
    validate_handle, Agent, OrchestratorConfig, Post, Profile, MAX_PERSONA_CHARS,
};

pub struct SocialStore {
    conn: Mutex<Connection>,
}

impl SocialStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ── Profiles ──────────────────────────────────────────────────────────────

    pub fn create_profile(&self, handle: &str, display_name: &str, bio: &str) -> Result<Profile> {
        validate_handle(handle)?;
        let conn = self.conn.lock().unwrap();
        let taken: i64 = conn.query_row(
            "SELECT (SELECT COUNT(*) FROM profiles WHERE handle = ?1)
                  + (SELECT COUNT(*) FROM agents WHERE handle = ?1)",
            [handle],
            |row| row.get(0),
        )?;
        if taken > 0 {
            return Err(SocialError::HandleTaken(handle.to_string()));
        }
        let id = Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO profiles (id, handle, display_name, bio, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![id, handle, display_name, bio, now],
        )?;
        info!(profile_id = %id, handle, "profile created");
        Ok(Profile {
            id,
            handle: handle.to_string(),
            display_name: display_name.to_string(),
            bio: bio.to_string(),
            avatar_url: None,
            is_admin: false,
            created_at: now,
        })
    }

    pub fn get_profile(&self, id: &str) -> Result<Profile> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("SELECT {PROFILE_COLS} FROM profiles WHERE id = ?1"),
            [id],
            row_to_profile,
        )
        .optional()?
        .ok_or_else(|| SocialError::ProfileNotFound { id: id.to_string() })
    }

    pub fn get_profile_by_handle(&self, handle: &str) -> Result<Profile> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("SELECT {PROFILE_COLS} FROM profiles WHERE handle = ?1"),
            [handle],
            row_to_profile,
        )
        .optional()?
        .ok_or_else(|| SocialError::ProfileNotFound {
            id: handle.to_string(),
        })
    }

    pub fn update_profile(
        &self,
        id: &str,
        display_name: Option<&str>,
        bio: Option<&str>,
        avatar_url: Option<&str>,
    ) -> Result<Profile> {
        {
            let conn = self.conn.lock().unwrap();
            let n = conn.execute(
                "UPDATE profiles SET
                    display_name = COALESCE(?2, display_name),
                    bio          = COALESCE(?3, bio),
                    avatar_url   = COALESCE(?4, avatar_url)
                 WHERE id = ?1",
                rusqlite::params![id, display_name, bio, avatar_url],
            )?;
            if n == 0 {
                return Err(SocialError::ProfileNotFound { id: id.to_string() });
            }
        }
        self.get_profile(id)
    }

    pub fn set_admin(&self, id: &str, is_admin: bool) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE profiles SET is_admin = ?2 WHERE id = ?1",
            rusqlite::params![id, is_admin as i32],
        )?;
        if n == 0 {
            return Err(SocialError::ProfileNotFound { id: id.to_string() });
        }
        Ok(())
    }

    /// Delete a profile and its owned agents (rows only — callers clean up
    /// agent-scoped vectors, memories and conversations). Returns the ids of
    /// the deleted agents.
    pub fn delete_profile(&self, id: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT id FROM agents WHERE owner_profile_id = ?1")?;
        let agent_ids: Vec<String> = stmt
            .query_map([id], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        for agent_id in &agent_ids {
            conn.execute("DELETE FROM orchestrator_configs WHERE agent_id = ?1", [agent_id])?;
            conn.execute("DELETE FROM posts WHERE agent_id = ?1", [agent_id])?;
        }
        conn.execute("DELETE FROM agents WHERE owner_profile_id = ?1", [id])?;
        conn.execute(
            "DELETE FROM follows WHERE follower_profile_id = ?1 OR followee_profile_id = ?1",
            [id],
        )?;
        let n = conn.execute("DELETE FROM profiles WHERE id = ?1", [id])?;
        if n == 0 {
            return Err(SocialError::ProfileNotFound { id: id.to_string() });
        }
        info!(profile_id = %id, agents = agent_ids.len(), "profile deleted");
        Ok(agent_ids)
    }

    // ── Agents ────────────────────────────────────────────────────────────────

    /// Create an agent. Regular profiles own at most one; admin-listed
    /// profiles are unlimited.
    pub fn create_agent(
        &self,
        owner_profile_id: &str,
        handle: &str,
        display_name: &str,
        persona: &str,
    ) -> Result<Agent> {
        validate_handle(handle)?;
        if persona.chars().count() > MAX_PERSONA_CHARS {
            return Err(SocialError::Validation(format!(
                "persona exceeds {MAX_PERSONA_CHARS} characters"
            )));
        }
        let owner = self.get_profile(owner_profile_id)?;
        let conn = self.conn.lock().unwrap();
        if !owner.is_admin {
            let owned: i64 = conn.query_row(
                "SELECT COUNT(*) FROM agents WHERE owner_profile_id = ?1",
                [owner_profile_id],
                |row| row.get(0),
            )?;
            if owned >= 1 {
                return Err(SocialError::AgentLimit {
                    owner: owner_profile_id.to_string(),
                });
            }
        }
        let taken: i64 = conn.query_row(
            "SELECT (SELECT COUNT(*) FROM profiles WHERE handle = ?1)
                  + (SELECT COUNT(*) FROM agents WHERE handle = ?1)",
            [handle],
            |row| row.get(0),
        )?;
        if taken > 0 {
            return Err(SocialError::HandleTaken(handle.to_string()));
        }
        let id = Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO agents (id, owner_profile_id, handle, display_name, persona, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![id, owner_profile_id, handle, display_name, persona, now],
        )?;
        info!(agent_id = %id, handle, owner = owner_profile_id, "agent created");
        Ok(Agent {
            id,
            owner_profile_id: owner_profile_id.to_string(),
            handle: handle.to_string(),
            display_name: display_name.to_string(),
            persona: persona.to_string(),
            auto_post_enabled: false,
            last_auto_post_at: None,
            created_at: now,
        })
    }

    pub fn get_agent(&self, id: &str) -> Result<Agent> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("SELECT {AGENT_COLS} FROM agents WHERE id = ?1"),
            [id],
            row_to_agent,
        )
        .optional()?
        .ok_or_else(|| SocialError::AgentNotFound { id: id.to_string() })
    }

    pub fn get_agent_by_handle(&self, handle: &str) -> Result<Agent> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("SELECT {AGENT_COLS} FROM agents WHERE handle = ?1"),
            [handle],
            row_to_agent,
        )
        .optional()?
        .ok_or_else(|| SocialError::AgentNotFound {
            id: handle.to_string(),
        })
    }

    pub fn update_agent(
        &self,
        id: &str,
        display_name: Option<&str>,
        persona: Option<&str>,
        auto_post_enabled: Option<bool>,
    ) -> Result<Agent> {
        if let Some(p) = persona {
            if p.chars().count() > MAX_PERSONA_CHARS {
                return Err(SocialError::Validation(format!(
                    "persona exceeds {MAX_PERSONA_CHARS} characters"
                )));
            }
        }
        {
            let conn = self.conn.lock().unwrap();
            let n = conn.execute(
                "UPDATE agents SET
                    display_name      = COALESCE(?2, display_name),
                    persona           = COALESCE(?3, persona),
                    auto_post_enabled = COALESCE(?4, auto_post_enabled)
                 WHERE id = ?1",
                rusqlite::params![id, display_name, persona, auto_post_enabled.map(|b| b as i32)],
            )?;
            if n == 0 {
                return Err(SocialError::AgentNotFound { id: id.to_string() });
            }
        }
        self.get_agent(id)
    }

    /// Agents eligible for the autopost sweep.
    pub fn autopost_candidates(&self) -> Result<Vec<Agent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {AGENT_COLS} FROM agents WHERE auto_post_enabled = 1 ORDER BY created_at"
        ))?;
        let rows = stmt.query_map([], row_to_agent)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn touch_last_auto_post(&self, agent_id: &str, at: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE agents SET last_auto_post_at = ?2 WHERE id = ?1",
            rusqlite::params![agent_id, at],
        )?;
        Ok(())
    }

    // ── Follows & tiers ───────────────────────────────────────────────────────

    pub fn follow(&self, follower: &str, followee: &str, paid: bool) -> Result<()> {
        if follower == followee {
            return Err(SocialError::Validation("cannot follow yourself".into()));
        }
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO follows (follower_profile_id, followee_profile_id, paid, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(follower_profile_id, followee_profile_id)
                DO UPDATE SET paid = excluded.paid",
            rusqlite::params![follower, followee, paid as i32, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn unfollow(&self, follower: &str, followee: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM follows WHERE follower_profile_id = ?1 AND followee_profile_id = ?2",
            rusqlite::params![follower, followee],
        )?;
        Ok(())
    }

    /// The caller's tier towards an agent's owner. Owners are not a tier —
    /// callers check ownership separately via [`Agent::owner_profile_id`].
    pub fn tier_towards(&self, caller_profile_id: &str, owner_profile_id: &str) -> Result<UserTier> {
        let conn = self.conn.lock().unwrap();
        let paid: Option<i32> = conn
            .query_row(
                "SELECT paid FROM follows
                 WHERE follower_profile_id = ?1 AND followee_profile_id = ?2",
                rusqlite::params![caller_profile_id, owner_profile_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(match paid {
            Some(p) if p != 0 => UserTier::Paid,
            Some(_) => UserTier::Follower,
            None => UserTier::Free,
        })
    }

    // ── Orchestrator config ───────────────────────────────────────────────────

    /// Per-agent config; defaults when the owner never saved one.
    pub fn orchestrator_config(&self, agent_id: &str) -> Result<OrchestratorConfig> {
        let conn = self.conn.lock().unwrap();
        let raw: Option<String> = conn
            .query_row(
                "SELECT config FROM orchestrator_configs WHERE agent_id = ?1",
                [agent_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw
            .and_then(|json| serde_json::from_str(&json).ok())
            .unwrap_or_default())
    }

    pub fn save_orchestrator_config(
        &self,
        agent_id: &str,
        config: &OrchestratorConfig,
    ) -> Result<()> {
        let json = serde_json::to_string(config)
            .map_err(|e| SocialError::Validation(e.to_string()))?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO orchestrator_configs (agent_id, config, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(agent_id) DO UPDATE SET
                config = excluded.config, updated_at = excluded.updated_at",
            rusqlite::params![agent_id, json, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    // ── Posts ─────────────────────────────────────────────────────────────────

    pub fn create_post(
        &self,
        agent_id: &str,
        content: &str,
        image_prompt: Option<&str>,
        image_url: Option<&str>,
    ) -> Result<Post> {
        let id = Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO posts (id, agent_id, content, image_prompt, image_url, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![id, agent_id, content, image_prompt, image_url, now],
        )?;
        Ok(Post {
            id,
            agent_id: agent_id.to_string(),
            content: content.to_string(),
            image_prompt: image_prompt.map(String::from),
            image_url: image_url.map(String::from),
            created_at: now,
        })
    }

    pub fn list_posts(&self, agent_id: &str, limit: usize) -> Result<Vec<Post>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, agent_id, content, image_prompt, image_url, created_at
             FROM posts WHERE agent_id = ?1
             ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![agent_id, limit], |row| {
            Ok(Post {
                id: row.get(0)?,
                agent_id: row.get(1)?,
                content: row.get(2)?,
                image_prompt: row.get(3)?,
                image_url: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SocialStore {
        SocialStore::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    #[test]
    fn profile_round_trip() {
        let s = store();
        let p = s.create_profile("maya_k", "Maya", "painter").unwrap();
        assert_eq!(s.get_profile(&p.id).unwrap().handle, "maya_k");
        assert_eq!(s.get_profile_by_handle("maya_k").unwrap().id, p.id);
    }

    #[test]
    fn duplicate_handle_rejected() {
        let s = store();
        s.create_profile("maya_k", "Maya", "").unwrap();
        assert!(matches!(
            s.create_profile("maya_k", "Other", ""),
            Err(SocialError::HandleTaken(_))
        ));
    }

    #[test]
    fn reserved_handle_rejected() {
        let s = store();
        assert!(matches!(
            s.create_profile("admin", "A", ""),
            Err(SocialError::Validation(_))
        ));
    }

    #[test]
    fn regular_user_owns_at_most_one_agent() {
        let s = store();
        let p = s.create_profile("maya_k", "Maya", "").unwrap();
        s.create_agent(&p.id, "maya_ai", "Maya AI", "persona").unwrap();
        assert!(matches!(
            s.create_agent(&p.id, "maya_ai2", "Maya AI 2", ""),
            Err(SocialError::AgentLimit { .. })
        ));
    }

    #[test]
    fn admin_owner_is_unlimited() {
        let s = store();
        let p = s.create_profile("studio", "Studio", "").unwrap();
        s.set_admin(&p.id, true).unwrap();
        s.create_agent(&p.id, "agent_one", "One", "").unwrap();
        s.create_agent(&p.id, "agent_two", "Two", "").unwrap();
    }

    #[test]
    fn agent_handle_collides_with_profile_handle() {
        let s = store();
        let p = s.create_profile("maya_k", "Maya", "").unwrap();
        assert!(matches!(
            s.create_agent(&p.id, "maya_k", "Clone", ""),
            Err(SocialError::HandleTaken(_))
        ));
    }

    #[test]
    fn persona_length_capped() {
        let s = store();
        let p = s.create_profile("maya_k", "Maya", "").unwrap();
        let long = "x".repeat(MAX_PERSONA_CHARS + 1);
        assert!(matches!(
            s.create_agent(&p.id, "maya_ai", "AI", &long),
            Err(SocialError::Validation(_))
        ));
    }

    #[test]
    fn tier_resolution() {
        let s = store();
        let owner = s.create_profile("creator", "C", "").unwrap();
        let fan = s.create_profile("fan_one", "F", "").unwrap();
        assert_eq!(s.tier_towards(&fan.id, &owner.id).unwrap(), UserTier::Free);
        s.follow(&fan.id, &owner.id, false).unwrap();
        assert_eq!(s.tier_towards(&fan.id, &owner.id).unwrap(), UserTier::Follower);
        s.follow(&fan.id, &owner.id, true).unwrap();
        assert_eq!(s.tier_towards(&fan.id, &owner.id).unwrap(), UserTier::Paid);
        s.unfollow(&fan.id, &owner.id).unwrap();
        assert_eq!(s.tier_towards(&fan.id, &owner.id).unwrap(), UserTier::Free);
    }

    #[test]
    fn orchestrator_config_defaults_then_saves() {
        let s = store();
        let p = s.create_profile("creator", "C", "").unwrap();
        let a = s.create_agent(&p.id, "creator_ai", "AI", "").unwrap();
        assert_eq!(s.orchestrator_config(&a.id).unwrap(), OrchestratorConfig::default());

        let mut cfg = OrchestratorConfig::default();
        cfg.blocked_topics = vec!["crypto".into()];
        cfg.max_escalations_per_day = 0;
        s.save_orchestrator_config(&a.id, &cfg).unwrap();
        assert_eq!(s.orchestrator_config(&a.id).unwrap(), cfg);
    }

    #[test]
    fn delete_profile_cascades_agents() {
        let s = store();
        let p = s.create_profile("creator", "C", "").unwrap();
        let a = s.create_agent(&p.id, "creator_ai", "AI", "").unwrap();
        let deleted = s.delete_profile(&p.id).unwrap();
        assert_eq!(deleted, vec![a.id.clone()]);
        assert!(matches!(s.get_agent(&a.id), Err(SocialError::AgentNotFound { .. })));
    }

    #[test]
    fn posts_round_trip() {
        let s = store();
        let p = s.create_profile("creator", "C", "").unwrap();
        let a = s.create_agent(&p.id, "creator_ai", "AI", "").unwrap();
        s.create_post(&a.id, "hello feed", Some("sunrise over lisbon"), None).unwrap();
        let posts = s.list_posts(&a.id, 10).unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].content, "hello feed");
    }
}
