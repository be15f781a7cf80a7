use thiserror::Error;

#[derive(Debug, Error)]
pub enum SocialError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Handle '{0}' is already taken")]
    HandleTaken(String),

    #[error("Profile not found: {id}")]
    ProfileNotFound { id: String },

    #[error("Agent not found: {id}")]
    AgentNotFound { id: String },

    #[error("Agent limit reached for profile {owner}")]
    AgentLimit { owner: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl From<SocialError> for sibyl_core::SibylError {
    fn from(e: SocialError) -> Self {
        match e {
            SocialError::Validation(msg) => sibyl_core::SibylError::Validation(msg),
            SocialError::HandleTaken(h) => {
                sibyl_core::SibylError::Conflict(format!("handle '{h}' is already taken"))
            }
            SocialError::ProfileNotFound { id } => sibyl_core::SibylError::NotFound {
                what: format!("profile {id}"),
            },
            SocialError::AgentNotFound { id } => sibyl_core::SibylError::NotFound {
                what: format!("agent {id}"),
            },
            SocialError::AgentLimit { owner } => sibyl_core::SibylError::QuotaExceeded(format!(
                "profile {owner} already owns an agent"
            )),
            SocialError::Database(e) => sibyl_core::SibylError::Database(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, SocialError>;
