use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Escalation not found: {id}")]
    EscalationNotFound { id: String },

    #[error("Canonical answer not found: {id}")]
    CanonicalNotFound { id: String },

    /// Invalid state transition, e.g. answering an already-answered
    /// escalation.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Vector(#[from] sibyl_vector::VectorError),

    #[error(transparent)]
    Conversation(#[from] sibyl_conversations::ConversationError),
}

impl From<OrchestratorError> for sibyl_core::SibylError {
    fn from(e: OrchestratorError) -> Self {
        match e {
            OrchestratorError::EscalationNotFound { id } => sibyl_core::SibylError::NotFound {
                what: format!("escalation {id}"),
            },
            OrchestratorError::CanonicalNotFound { id } => sibyl_core::SibylError::NotFound {
                what: format!("canonical answer {id}"),
            },
            OrchestratorError::Conflict(msg) => sibyl_core::SibylError::Conflict(msg),
            OrchestratorError::PermissionDenied(reason) => {
                sibyl_core::SibylError::PermissionDenied { reason }
            }
            OrchestratorError::Database(e) => sibyl_core::SibylError::Database(e.to_string()),
            OrchestratorError::Vector(e) => e.into(),
            OrchestratorError::Conversation(e) => e.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
