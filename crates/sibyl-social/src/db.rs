use rusqlite::Connection;

use crate::types::{Agent, Profile};

/// Initialise all social tables. Safe to call on every startup (idempotent).
pub fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS profiles (
            id           TEXT PRIMARY KEY NOT NULL,
            handle       TEXT NOT NULL UNIQUE,
            display_name TEXT NOT NULL,
            bio          TEXT NOT NULL DEFAULT '',
            avatar_url   TEXT,
            is_admin     INTEGER NOT NULL DEFAULT 0,
            created_at   TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS agents (
            id                TEXT PRIMARY KEY NOT NULL,
            owner_profile_id  TEXT NOT NULL REFERENCES profiles(id),
            handle            TEXT NOT NULL UNIQUE,
            display_name      TEXT NOT NULL,
            persona           TEXT NOT NULL DEFAULT '',
            auto_post_enabled INTEGER NOT NULL DEFAULT 0,
            last_auto_post_at TEXT,
            created_at        TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_agents_owner
            ON agents(owner_profile_id);
        CREATE TABLE IF NOT EXISTS follows (
            follower_profile_id TEXT NOT NULL,
            followee_profile_id TEXT NOT NULL,
            paid                INTEGER NOT NULL DEFAULT 0,
            created_at          TEXT NOT NULL,
            PRIMARY KEY (follower_profile_id, followee_profile_id)
        );
        CREATE TABLE IF NOT EXISTS orchestrator_configs (
            agent_id   TEXT PRIMARY KEY NOT NULL REFERENCES agents(id),
            config     TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS posts (
            id           TEXT PRIMARY KEY NOT NULL,
            agent_id     TEXT NOT NULL REFERENCES agents(id),
            content      TEXT NOT NULL,
            image_prompt TEXT,
            image_url    TEXT,
            created_at   TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_posts_agent
            ON posts(agent_id, created_at DESC);",
    )
}

/// Map a SELECT row (fixed column order) to a Profile.
pub(crate) fn row_to_profile(row: &rusqlite::Row<'_>) -> rusqlite::Result<Profile> {
    Ok(Profile {
        id: row.get(0)?,
        handle: row.get(1)?,
        display_name: row.get(2)?,
        bio: row.get(3)?,
        avatar_url: row.get(4)?,
        is_admin: row.get::<_, i32>(5)? != 0,
        created_at: row.get(6)?,
    })
}

pub(crate) const PROFILE_COLS: &str =
    "id, handle, display_name, bio, avatar_url, is_admin, created_at";

/// Map a SELECT row (fixed column order) to an Agent.
pub(crate) fn row_to_agent(row: &rusqlite::Row<'_>) -> rusqlite::Result<Agent> {
    Ok(Agent {
        id: row.get(0)?,
        owner_profile_id: row.get(1)?,
        handle: row.get(2)?,
        display_name: row.get(3)?,
        persona: row.get(4)?,
        auto_post_enabled: row.get::<_, i32>(5)? != 0,
        last_auto_post_at: row.get(6)?,
        created_at: row.get(7)?,
    })
}

pub(crate) const AGENT_COLS: &str =
    "id, owner_profile_id, handle, display_name, persona, auto_post_enabled, last_auto_post_at, created_at";
