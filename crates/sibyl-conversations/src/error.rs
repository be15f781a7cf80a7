use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConversationError {
    #[error("Conversation not found: {id}")]
    NotFound { id: String },

    #[error("Profile {profile_id} is not a participant of conversation {conversation_id}")]
    NotParticipant {
        profile_id: String,
        conversation_id: String,
    },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl From<ConversationError> for sibyl_core::SibylError {
    fn from(e: ConversationError) -> Self {
        match e {
            ConversationError::NotFound { id } => sibyl_core::SibylError::NotFound {
                what: format!("conversation {id}"),
            },
            ConversationError::NotParticipant {
                profile_id,
                conversation_id,
            } => sibyl_core::SibylError::PermissionDenied {
                reason: format!(
                    "profile {profile_id} is not a participant of conversation {conversation_id}"
                ),
            },
            ConversationError::Validation(msg) => sibyl_core::SibylError::Validation(msg),
            ConversationError::Database(e) => sibyl_core::SibylError::Database(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ConversationError>;
