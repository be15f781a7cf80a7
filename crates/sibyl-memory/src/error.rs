use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Vector(#[from] sibyl_vector::VectorError),

    #[error("Extraction payload malformed: {0}")]
    Parse(String),
}

impl From<MemoryError> for sibyl_core::SibylError {
    fn from(e: MemoryError) -> Self {
        match e {
            MemoryError::Database(e) => sibyl_core::SibylError::Database(e.to_string()),
            MemoryError::Vector(e) => e.into(),
            MemoryError::Parse(msg) => sibyl_core::SibylError::Validation(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, MemoryError>;
