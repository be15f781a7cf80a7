use thiserror::Error;

#[derive(Debug, Error)]
pub enum KnowledgeError {
    /// The retrieval substrate (embeddings or vector search) is down.
    /// Callers degrade to a no-RAG prompt.
    #[error("Retrieval unavailable: {0}")]
    RetrievalUnavailable(String),

    #[error("Document not found: {id}")]
    DocumentNotFound { id: String },

    /// Every chunk of a document failed to embed — the document was not
    /// ingested.
    #[error("Ingestion produced no chunks for document from source '{doc_source}'")]
    NothingIngested { doc_source: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Vector(#[from] sibyl_vector::VectorError),
}

impl From<KnowledgeError> for sibyl_core::SibylError {
    fn from(e: KnowledgeError) -> Self {
        match e {
            KnowledgeError::RetrievalUnavailable(reason) => {
                sibyl_core::SibylError::UpstreamUnavailable {
                    service: "retrieval".into(),
                    reason,
                }
            }
            KnowledgeError::DocumentNotFound { id } => sibyl_core::SibylError::NotFound {
                what: format!("document {id}"),
            },
            KnowledgeError::NothingIngested { doc_source } => sibyl_core::SibylError::UpstreamUnavailable {
                service: "ingest".into(),
                reason: format!("no chunk of '{doc_source}' could be embedded"),
            },
            KnowledgeError::Database(e) => sibyl_core::SibylError::Database(e.to_string()),
            KnowledgeError::Vector(e) => e.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, KnowledgeError>;
