use serde::{Deserialize, Serialize};

/// Whether a conversation is human↔human or human↔agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    Profile,
    Agent,
}

impl std::fmt::Display for ChatType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Profile => write!(f, "profile"),
            Self::Agent => write!(f, "agent"),
        }
    }
}

impl std::str::FromStr for ChatType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "profile" => Ok(Self::Profile),
            "agent" => Ok(Self::Agent),
            other => Err(format!("unknown chat type: {other}")),
        }
    }
}

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderKind {
    User,
    Agent,
    System,
}

impl std::fmt::Display for SenderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Agent => write!(f, "agent"),
            Self::System => write!(f, "system"),
        }
    }
}

impl std::str::FromStr for SenderKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "agent" => Ok(Self::Agent),
            "system" => Ok(Self::System),
            other => Err(format!("unknown sender kind: {other}")),
        }
    }
}

/// A two-party conversation, canonicalized so the same pair never yields two
/// rows: participant1 < participant2 lexicographically.
#[derive(Debug, Clone, Serialize)]
pub struct DirectConversation {
    pub id: String,
    pub participant1_id: String,
    pub participant2_id: String,
    pub chat_type: ChatType,
    /// Required iff `chat_type == Agent`.
    pub target_agent_id: Option<String>,
    pub title: Option<String>,
    pub last_message_at: Option<String>,
    pub last_message_preview: Option<String>,
    pub created_at: String,
}

impl DirectConversation {
    pub fn has_participant(&self, profile_id: &str) -> bool {
        self.participant1_id == profile_id || self.participant2_id == profile_id
    }

    /// The other participant from `profile_id`'s point of view.
    pub fn counterpart(&self, profile_id: &str) -> &str {
        if self.participant1_id == profile_id {
            &self.participant2_id
        } else {
            &self.participant1_id
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DirectMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender_profile_id: String,
    pub sender_kind: SenderKind,
    pub sender_agent_id: Option<String>,
    pub content: String,
    pub read_by_p1: bool,
    pub read_by_p2: bool,
    /// Set when a streamed response was cut off and the partial text was
    /// persisted anyway.
    pub truncated: bool,
    pub created_at: String,
}

/// Stored rolling summary of a long conversation.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    pub id: String,
    pub conversation_id: String,
    pub content: String,
    /// How many messages the summary covers.
    pub through_count: usize,
    pub created_at: String,
}

/// One row of the batched conversations list.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationListEntry {
    #[serde(flatten)]
    pub conversation: DirectConversation,
    /// The other participant, from the caller's perspective.
    pub counterpart_profile_id: String,
    pub unread_count: u32,
    pub last_message: Option<DirectMessage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counterpart_resolution() {
        let c = DirectConversation {
            id: "c".into(),
            participant1_id: "a".into(),
            participant2_id: "b".into(),
            chat_type: ChatType::Profile,
            target_agent_id: None,
            title: None,
            last_message_at: None,
            last_message_preview: None,
            created_at: String::new(),
        };
        assert_eq!(c.counterpart("a"), "b");
        assert_eq!(c.counterpart("b"), "a");
        assert!(c.has_participant("a"));
        assert!(!c.has_participant("z"));
    }

    #[test]
    fn enums_round_trip() {
        assert_eq!("agent".parse::<ChatType>().unwrap(), ChatType::Agent);
        assert_eq!("system".parse::<SenderKind>().unwrap(), SenderKind::System);
        assert_eq!(SenderKind::User.to_string(), "user");
    }
}
