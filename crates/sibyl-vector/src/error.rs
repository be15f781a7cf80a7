use thiserror::Error;

#[derive(Debug, Error)]
pub enum VectorError {
    /// Embedding or search backend is down or rate-limiting. Retryable.
    #[error("Vector backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Vector width does not match the configured dimension. Fatal — this is
    /// a deployment configuration bug, not a runtime condition.
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Embedding response malformed: {0}")]
    Parse(String),
}

impl VectorError {
    pub fn retryable(&self) -> bool {
        matches!(self, VectorError::BackendUnavailable(_))
    }
}

impl From<VectorError> for sibyl_core::SibylError {
    fn from(e: VectorError) -> Self {
        match e {
            VectorError::BackendUnavailable(reason) => sibyl_core::SibylError::UpstreamUnavailable {
                service: "vector".into(),
                reason,
            },
            VectorError::DimensionMismatch { expected, got } => sibyl_core::SibylError::Fatal(
                format!("embedding dimension mismatch: expected {expected}, got {got}"),
            ),
            VectorError::Database(e) => sibyl_core::SibylError::Database(e.to_string()),
            VectorError::Parse(reason) => sibyl_core::SibylError::UpstreamUnavailable {
                service: "embeddings".into(),
                reason,
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, VectorError>;
