use std::sync::{Arc, Mutex};

use rusqlite::{Connection, OptionalExtension, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::error::{ConversationError, Result};
use crate::types::{
    ChatType, ConversationListEntry, ConversationSummary, DirectConversation, DirectMessage,
    SenderKind,
};

/// Preview length stored on the conversation row.
const PREVIEW_CHARS: usize = 120;

/// Initialise conversation tables. Safe to call on every startup (idempotent).
pub fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS direct_conversations (
            id                   TEXT PRIMARY KEY NOT NULL,
            participant1_id      TEXT NOT NULL,
            participant2_id      TEXT NOT NULL,
            chat_type            TEXT NOT NULL,
            target_agent_id      TEXT,
            title                TEXT,
            last_message_at      TEXT,
            last_message_preview TEXT,
            created_at           TEXT NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_conversations_pair
            ON direct_conversations(
                participant1_id, participant2_id, chat_type, IFNULL(target_agent_id, ''));
        CREATE INDEX IF NOT EXISTS idx_conversations_p1
            ON direct_conversations(participant1_id, last_message_at DESC);
        CREATE INDEX IF NOT EXISTS idx_conversations_p2
            ON direct_conversations(participant2_id, last_message_at DESC);
        CREATE TABLE IF NOT EXISTS direct_messages (
            seq               INTEGER PRIMARY KEY AUTOINCREMENT,
            id                TEXT NOT NULL UNIQUE,
            conversation_id   TEXT NOT NULL REFERENCES direct_conversations(id),
            sender_profile_id TEXT NOT NULL,
            sender_kind       TEXT NOT NULL,
            sender_agent_id   TEXT,
            content           TEXT NOT NULL,
            read_by_p1        INTEGER NOT NULL DEFAULT 0,
            read_by_p2        INTEGER NOT NULL DEFAULT 0,
            truncated         INTEGER NOT NULL DEFAULT 0,
            created_at        TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON direct_messages(conversation_id, created_at, seq);
        CREATE TABLE IF NOT EXISTS conversation_summaries (
            id              TEXT PRIMARY KEY NOT NULL,
            conversation_id TEXT NOT NULL REFERENCES direct_conversations(id),
            content         TEXT NOT NULL,
            through_count   INTEGER NOT NULL,
            created_at      TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_summaries_conversation
            ON conversation_summaries(conversation_id, created_at DESC);",
    )
}

/// Insert a message inside an open transaction. Used by the orchestrator to
/// pair the decision write with the assistant message write atomically.
///
/// Read flags start flipped for the sender's side only; the conversation row
/// gets its `last_message_*` denormalization in the same statement batch.
pub fn insert_message_tx(
    tx: &Transaction<'_>,
    conversation_id: &str,
    sender_profile_id: &str,
    sender_kind: SenderKind,
    sender_agent_id: Option<&str>,
    content: &str,
    truncated: bool,
) -> Result<DirectMessage> {
    let (p1, p2): (String, String) = tx
        .query_row(
            "SELECT participant1_id, participant2_id FROM direct_conversations WHERE id = ?1",
            [conversation_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?
        .ok_or_else(|| ConversationError::NotFound {
            id: conversation_id.to_string(),
        })?;

    let read_by_p1 = sender_profile_id == p1;
    let read_by_p2 = sender_profile_id == p2;
    let id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();

    tx.execute(
        "INSERT INTO direct_messages
         (id, conversation_id, sender_profile_id, sender_kind, sender_agent_id,
          content, read_by_p1, read_by_p2, truncated, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        rusqlite::params![
            id,
            conversation_id,
            sender_profile_id,
            sender_kind.to_string(),
            sender_agent_id,
            content,
            read_by_p1 as i32,
            read_by_p2 as i32,
            truncated as i32,
            now
        ],
    )?;
    let preview: String = content.chars().take(PREVIEW_CHARS).collect();
    tx.execute(
        "UPDATE direct_conversations
         SET last_message_at = ?2, last_message_preview = ?3 WHERE id = ?1",
        rusqlite::params![conversation_id, now, preview],
    )?;

    Ok(DirectMessage {
        id,
        conversation_id: conversation_id.to_string(),
        sender_profile_id: sender_profile_id.to_string(),
        sender_kind,
        sender_agent_id: sender_agent_id.map(String::from),
        content: content.to_string(),
        read_by_p1,
        read_by_p2,
        truncated,
        created_at: now,
    })
}

/// Conversation and message persistence over the shared chat connection.
pub struct ConversationStore {
    conn: Arc<Mutex<Connection>>,
}

impl ConversationStore {
    /// `conn` is shared with the orchestrator store; both `init_db`s run on
    /// it at startup.
    pub fn new(conn: Arc<Mutex<Connection>>) -> Result<Self> {
        {
            let guard = conn.lock().unwrap();
            init_db(&guard)?;
        }
        Ok(Self { conn })
    }

    /// Shared connection handle, for callers composing multi-store
    /// transactions.
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }

    /// Find or create the conversation for a participant pair. The pair is
    /// canonicalized (lexicographic order) so (a,b) and (b,a) are the same
    /// row.
    pub fn ensure_conversation(
        &self,
        a: &str,
        b: &str,
        chat_type: ChatType,
        target_agent_id: Option<&str>,
    ) -> Result<DirectConversation> {
        if a == b {
            return Err(ConversationError::Validation(
                "a conversation needs two distinct participants".into(),
            ));
        }
        match (chat_type, target_agent_id) {
            (ChatType::Agent, None) => {
                return Err(ConversationError::Validation(
                    "agent conversations require target_agent_id".into(),
                ))
            }
            (ChatType::Profile, Some(_)) => {
                return Err(ConversationError::Validation(
                    "profile conversations must not set target_agent_id".into(),
                ))
            }
            _ => {}
        }

        let (p1, p2) = if a <= b { (a, b) } else { (b, a) };
        let conn = self.conn.lock().unwrap();
        if let Some(existing) = conn
            .query_row(
                &format!(
                    "SELECT {CONVERSATION_COLS} FROM direct_conversations
                     WHERE participant1_id = ?1 AND participant2_id = ?2
                       AND chat_type = ?3 AND IFNULL(target_agent_id, '') = IFNULL(?4, '')"
                ),
                rusqlite::params![p1, p2, chat_type.to_string(), target_agent_id],
                row_to_conversation,
            )
            .optional()?
        {
            return Ok(existing);
        }

        let id = Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO direct_conversations
             (id, participant1_id, participant2_id, chat_type, target_agent_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![id, p1, p2, chat_type.to_string(), target_agent_id, now],
        )?;
        debug!(conversation_id = %id, "conversation created");
        Ok(DirectConversation {
            id,
            participant1_id: p1.to_string(),
            participant2_id: p2.to_string(),
            chat_type,
            target_agent_id: target_agent_id.map(String::from),
            title: None,
            last_message_at: None,
            last_message_preview: None,
            created_at: now,
        })
    }

    pub fn get(&self, id: &str) -> Result<DirectConversation> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("SELECT {CONVERSATION_COLS} FROM direct_conversations WHERE id = ?1"),
            [id],
            row_to_conversation,
        )
        .optional()?
        .ok_or_else(|| ConversationError::NotFound { id: id.to_string() })
    }

    /// Send a message outside any composed transaction.
    pub fn send_message(
        &self,
        conversation_id: &str,
        sender_profile_id: &str,
        sender_kind: SenderKind,
        sender_agent_id: Option<&str>,
        content: &str,
    ) -> Result<DirectMessage> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let msg = insert_message_tx(
            &tx,
            conversation_id,
            sender_profile_id,
            sender_kind,
            sender_agent_id,
            content,
            false,
        )?;
        tx.commit()?;
        Ok(msg)
    }

    /// Persist an agent (or system) reply outside the turn transaction —
    /// used by the streaming responder at stream end, including truncated
    /// partials.
    pub fn append_agent_message(
        &self,
        conversation_id: &str,
        sender_profile_id: &str,
        sender_kind: SenderKind,
        sender_agent_id: Option<&str>,
        content: &str,
        truncated: bool,
    ) -> Result<DirectMessage> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let msg = insert_message_tx(
            &tx,
            conversation_id,
            sender_profile_id,
            sender_kind,
            sender_agent_id,
            content,
            truncated,
        )?;
        tx.commit()?;
        Ok(msg)
    }

    /// Messages in strict `created_at` order (ties break on insertion seq).
    pub fn messages(&self, conversation_id: &str, limit: usize) -> Result<Vec<DirectMessage>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLS} FROM direct_messages
             WHERE conversation_id = ?1
             ORDER BY created_at DESC, seq DESC LIMIT ?2"
        ))?;
        let mut msgs: Vec<DirectMessage> = stmt
            .query_map(rusqlite::params![conversation_id, limit], row_to_message)?
            .filter_map(|r| r.ok())
            .collect();
        msgs.reverse();
        Ok(msgs)
    }

    pub fn get_message(&self, id: &str) -> Result<Option<DirectMessage>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                &format!("SELECT {MESSAGE_COLS} FROM direct_messages WHERE id = ?1"),
                [id],
                row_to_message,
            )
            .optional()?)
    }

    pub fn message_count(&self, conversation_id: &str) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM direct_messages WHERE conversation_id = ?1",
            [conversation_id],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    /// Mark everything the counterpart sent as read. Idempotent and
    /// participant-scoped: a non-participant gets an error, a second call
    /// changes nothing.
    pub fn mark_read(&self, conversation_id: &str, reader_profile_id: &str) -> Result<usize> {
        let conversation = self.get(conversation_id)?;
        if !conversation.has_participant(reader_profile_id) {
            return Err(ConversationError::NotParticipant {
                profile_id: reader_profile_id.to_string(),
                conversation_id: conversation_id.to_string(),
            });
        }
        let flag_col = if conversation.participant1_id == reader_profile_id {
            "read_by_p1"
        } else {
            "read_by_p2"
        };
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            &format!(
                "UPDATE direct_messages SET {flag_col} = 1
                 WHERE conversation_id = ?1 AND sender_profile_id != ?2 AND {flag_col} = 0"
            ),
            rusqlite::params![conversation_id, reader_profile_id],
        )?;
        Ok(n)
    }

    /// Batched list read: one query for the base rows, one grouped aggregate
    /// for unread counts, one first-per-group query for last messages. No
    /// per-conversation lookups.
    pub fn list_for_user(&self, profile_id: &str) -> Result<Vec<ConversationListEntry>> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare(&format!(
            "SELECT {CONVERSATION_COLS} FROM direct_conversations
             WHERE participant1_id = ?1 OR participant2_id = ?1
             ORDER BY IFNULL(last_message_at, created_at) DESC"
        ))?;
        let conversations: Vec<DirectConversation> = stmt
            .query_map([profile_id], row_to_conversation)?
            .filter_map(|r| r.ok())
            .collect();

        let mut unread_stmt = conn.prepare(
            "SELECT m.conversation_id, COUNT(*)
             FROM direct_messages m
             JOIN direct_conversations c ON c.id = m.conversation_id
             WHERE m.sender_profile_id != ?1
               AND ((c.participant1_id = ?1 AND m.read_by_p1 = 0)
                 OR (c.participant2_id = ?1 AND m.read_by_p2 = 0))
             GROUP BY m.conversation_id",
        )?;
        let unread: std::collections::HashMap<String, u32> = unread_stmt
            .query_map([profile_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u32))
            })?
            .filter_map(|r| r.ok())
            .collect();

        let mut last_stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLS_PREFIXED} FROM direct_messages m
             JOIN (SELECT conversation_id, MAX(seq) AS max_seq
                   FROM direct_messages GROUP BY conversation_id) g
               ON m.conversation_id = g.conversation_id AND m.seq = g.max_seq
             JOIN direct_conversations c ON c.id = m.conversation_id
             WHERE c.participant1_id = ?1 OR c.participant2_id = ?1"
        ))?;
        let last_messages: std::collections::HashMap<String, DirectMessage> = last_stmt
            .query_map([profile_id], row_to_message)?
            .filter_map(|r| r.ok())
            .map(|m| (m.conversation_id.clone(), m))
            .collect();

        Ok(conversations
            .into_iter()
            .map(|conversation| {
                let counterpart = conversation.counterpart(profile_id).to_string();
                let unread_count = unread.get(&conversation.id).copied().unwrap_or(0);
                let last_message = last_messages.get(&conversation.id).cloned();
                ConversationListEntry {
                    conversation,
                    counterpart_profile_id: counterpart,
                    unread_count,
                    last_message,
                }
            })
            .collect())
    }

    pub fn set_title(&self, conversation_id: &str, title: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE direct_conversations SET title = ?2 WHERE id = ?1",
            rusqlite::params![conversation_id, title],
        )?;
        if n == 0 {
            return Err(ConversationError::NotFound {
                id: conversation_id.to_string(),
            });
        }
        Ok(())
    }

    pub fn insert_summary(
        &self,
        conversation_id: &str,
        content: &str,
        through_count: usize,
    ) -> Result<ConversationSummary> {
        let id = Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO conversation_summaries
             (id, conversation_id, content, through_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![id, conversation_id, content, through_count, now],
        )?;
        Ok(ConversationSummary {
            id,
            conversation_id: conversation_id.to_string(),
            content: content.to_string(),
            through_count,
            created_at: now,
        })
    }

    pub fn latest_summary(&self, conversation_id: &str) -> Result<Option<ConversationSummary>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                "SELECT id, conversation_id, content, through_count, created_at
                 FROM conversation_summaries WHERE conversation_id = ?1
                 ORDER BY created_at DESC LIMIT 1",
                [conversation_id],
                |row| {
                    Ok(ConversationSummary {
                        id: row.get(0)?,
                        conversation_id: row.get(1)?,
                        content: row.get(2)?,
                        through_count: row.get::<_, i64>(3)? as usize,
                        created_at: row.get(4)?,
                    })
                },
            )
            .optional()?)
    }

    /// Cascade-delete everything either side of a deleted profile touched.
    pub fn delete_for_profile(&self, profile_id: &str) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id FROM direct_conversations
             WHERE participant1_id = ?1 OR participant2_id = ?1",
        )?;
        let ids: Vec<String> = stmt
            .query_map([profile_id], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        for id in &ids {
            conn.execute("DELETE FROM direct_messages WHERE conversation_id = ?1", [id])?;
            conn.execute(
                "DELETE FROM conversation_summaries WHERE conversation_id = ?1",
                [id],
            )?;
            conn.execute("DELETE FROM direct_conversations WHERE id = ?1", [id])?;
        }
        Ok(ids.len())
    }
}

const CONVERSATION_COLS: &str = "id, participant1_id, participant2_id, chat_type, \
     target_agent_id, title, last_message_at, last_message_preview, created_at";

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<DirectConversation> {
    let chat_type: String = row.get(3)?;
    Ok(DirectConversation {
        id: row.get(0)?,
        participant1_id: row.get(1)?,
        participant2_id: row.get(2)?,
        chat_type: chat_type.parse().unwrap_or(ChatType::Profile),
        target_agent_id: row.get(4)?,
        title: row.get(5)?,
        last_message_at: row.get(6)?,
        last_message_preview: row.get(7)?,
        created_at: row.get(8)?,
    })
}

const MESSAGE_COLS: &str = "id, conversation_id, sender_profile_id, sender_kind, \
     sender_agent_id, content, read_by_p1, read_by_p2, truncated, created_at";

const MESSAGE_COLS_PREFIXED: &str = "m.id, m.conversation_id, m.sender_profile_id, \
     m.sender_kind, m.sender_agent_id, m.content, m.read_by_p1, m.read_by_p2, \
     m.truncated, m.created_at";

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<DirectMessage> {
    let kind: String = row.get(3)?;
    Ok(DirectMessage {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_profile_id: row.get(2)?,
        sender_kind: kind.parse().unwrap_or(SenderKind::User),
        sender_agent_id: row.get(4)?,
        content: row.get(5)?,
        read_by_p1: row.get::<_, i32>(6)? != 0,
        read_by_p2: row.get::<_, i32>(7)? != 0,
        truncated: row.get::<_, i32>(8)? != 0,
        created_at: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ConversationStore {
        let conn = Arc::new(Mutex::new(Connection::open_in_memory().unwrap()));
        ConversationStore::new(conn).unwrap()
    }

    #[test]
    fn pair_is_canonicalized() {
        let s = store();
        let c1 = s.ensure_conversation("bob", "alice", ChatType::Profile, None).unwrap();
        let c2 = s.ensure_conversation("alice", "bob", ChatType::Profile, None).unwrap();
        assert_eq!(c1.id, c2.id);
        assert_eq!(c1.participant1_id, "alice");
    }

    #[test]
    fn agent_chat_requires_target() {
        let s = store();
        assert!(matches!(
            s.ensure_conversation("a", "b", ChatType::Agent, None),
            Err(ConversationError::Validation(_))
        ));
        assert!(s
            .ensure_conversation("a", "b", ChatType::Agent, Some("agent-1"))
            .is_ok());
    }

    #[test]
    fn same_pair_different_agents_are_distinct() {
        let s = store();
        let c1 = s.ensure_conversation("a", "b", ChatType::Agent, Some("agent-1")).unwrap();
        let c2 = s.ensure_conversation("a", "b", ChatType::Agent, Some("agent-2")).unwrap();
        assert_ne!(c1.id, c2.id);
    }

    #[test]
    fn messages_keep_send_order() {
        let s = store();
        let c = s.ensure_conversation("a", "b", ChatType::Profile, None).unwrap();
        for i in 0..5 {
            s.send_message(&c.id, "a", SenderKind::User, None, &format!("msg {i}"))
                .unwrap();
        }
        let msgs = s.messages(&c.id, 100).unwrap();
        let contents: Vec<_> = msgs.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["msg 0", "msg 1", "msg 2", "msg 3", "msg 4"]);
    }

    #[test]
    fn unread_and_mark_read_idempotent() {
        let s = store();
        let c = s.ensure_conversation("a", "b", ChatType::Profile, None).unwrap();
        s.send_message(&c.id, "a", SenderKind::User, None, "hi").unwrap();
        s.send_message(&c.id, "a", SenderKind::User, None, "there").unwrap();

        let list_b = s.list_for_user("b").unwrap();
        assert_eq!(list_b[0].unread_count, 2);

        assert_eq!(s.mark_read(&c.id, "b").unwrap(), 2);
        assert_eq!(s.mark_read(&c.id, "b").unwrap(), 0);
        assert_eq!(s.list_for_user("b").unwrap()[0].unread_count, 0);

        // Sender never counts their own messages as unread.
        assert_eq!(s.list_for_user("a").unwrap()[0].unread_count, 0);
    }

    #[test]
    fn mark_read_rejects_outsiders() {
        let s = store();
        let c = s.ensure_conversation("a", "b", ChatType::Profile, None).unwrap();
        assert!(matches!(
            s.mark_read(&c.id, "mallory"),
            Err(ConversationError::NotParticipant { .. })
        ));
    }

    #[test]
    fn list_includes_last_message_and_preview() {
        let s = store();
        let c = s.ensure_conversation("a", "b", ChatType::Profile, None).unwrap();
        s.send_message(&c.id, "a", SenderKind::User, None, "first").unwrap();
        s.send_message(&c.id, "b", SenderKind::User, None, "second").unwrap();

        let list = s.list_for_user("a").unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].counterpart_profile_id, "b");
        let last = list[0].last_message.as_ref().unwrap();
        assert_eq!(last.content, "second");
        assert_eq!(
            list[0].conversation.last_message_preview.as_deref(),
            Some("second")
        );
    }

    #[test]
    fn truncated_flag_survives_round_trip() {
        let s = store();
        let c = s.ensure_conversation("a", "b", ChatType::Profile, None).unwrap();
        let conn = s.connection();
        let msg = {
            let mut guard = conn.lock().unwrap();
            let tx = guard.transaction().unwrap();
            let m = insert_message_tx(&tx, &c.id, "b", SenderKind::Agent, Some("agent-1"), "partial ans", true)
                .unwrap();
            tx.commit().unwrap();
            m
        };
        let stored = s.get_message(&msg.id).unwrap().unwrap();
        assert!(stored.truncated);
        assert_eq!(stored.sender_kind, SenderKind::Agent);
    }

    #[test]
    fn summaries_latest_wins() {
        let s = store();
        let c = s.ensure_conversation("a", "b", ChatType::Profile, None).unwrap();
        assert!(s.latest_summary(&c.id).unwrap().is_none());
        s.insert_summary(&c.id, "early summary", 10).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        s.insert_summary(&c.id, "late summary", 50).unwrap();
        assert_eq!(s.latest_summary(&c.id).unwrap().unwrap().content, "late summary");
    }

    #[test]
    fn delete_for_profile_cascades() {
        let s = store();
        let c = s.ensure_conversation("a", "b", ChatType::Profile, None).unwrap();
        s.send_message(&c.id, "a", SenderKind::User, None, "hi").unwrap();
        assert_eq!(s.delete_for_profile("a").unwrap(), 1);
        assert!(matches!(s.get(&c.id), Err(ConversationError::NotFound { .. })));
        assert!(s.list_for_user("b").unwrap().is_empty());
    }
}
