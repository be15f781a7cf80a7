use thiserror::Error;

/// Platform-wide error taxonomy. Subsystem crates define their own error
/// enums and convert into this at the gateway boundary, where `code()` and
/// `status()` become the stable wire contract.
#[derive(Debug, Error)]
pub enum SibylError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Permission denied: {reason}")]
    PermissionDenied { reason: String },

    #[error("Not found: {what}")]
    NotFound { what: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Upstream unavailable ({service}): {reason}")]
    UpstreamUnavailable { service: String, reason: String },

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Request timeout after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl SibylError {
    /// Short error code string included in JSON error bodies and SSE error
    /// events. Stable — clients match on these.
    pub fn code(&self) -> &'static str {
        match self {
            SibylError::Config(_) => "CONFIG_ERROR",
            SibylError::AuthFailed(_) => "AUTH_FAILED",
            SibylError::PermissionDenied { .. } => "PERMISSION_DENIED",
            SibylError::NotFound { .. } => "NOT_FOUND",
            SibylError::Validation(_) => "VALIDATION",
            SibylError::QuotaExceeded(_) => "QUOTA_EXCEEDED",
            SibylError::Conflict(_) => "CONFLICT",
            SibylError::UpstreamUnavailable { .. } => "UPSTREAM_UNAVAILABLE",
            SibylError::Transient(_) => "TRANSIENT",
            SibylError::Database(_) => "DATABASE_ERROR",
            SibylError::Serialization(_) => "SERIALIZATION_ERROR",
            SibylError::Io(_) => "IO_ERROR",
            SibylError::Timeout { .. } => "TIMEOUT",
            SibylError::Fatal(_) => "FATAL",
        }
    }

    /// HTTP status for the boundary. Retryable kinds map to 503 so clients
    /// can back off; everything internal is a 500.
    pub fn status(&self) -> u16 {
        match self {
            SibylError::AuthFailed(_) => 401,
            SibylError::PermissionDenied { .. } => 403,
            SibylError::NotFound { .. } => 404,
            SibylError::Validation(_) => 422,
            SibylError::QuotaExceeded(_) => 429,
            SibylError::Conflict(_) => 409,
            SibylError::UpstreamUnavailable { .. } | SibylError::Transient(_) => 503,
            SibylError::Timeout { .. } => 504,
            _ => 500,
        }
    }

    /// Whether an internal retry (with backoff) is worth attempting.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            SibylError::UpstreamUnavailable { .. }
                | SibylError::Transient(_)
                | SibylError::Timeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SibylError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(SibylError::AuthFailed("x".into()).code(), "AUTH_FAILED");
        assert_eq!(
            SibylError::QuotaExceeded("x".into()).code(),
            "QUOTA_EXCEEDED"
        );
        assert_eq!(SibylError::Conflict("x".into()).code(), "CONFLICT");
    }

    #[test]
    fn retryable_kinds() {
        assert!(SibylError::Transient("timeout".into()).retryable());
        assert!(SibylError::UpstreamUnavailable {
            service: "embeddings".into(),
            reason: "503".into()
        }
        .retryable());
        assert!(!SibylError::Validation("bad handle".into()).retryable());
    }

    #[test]
    fn status_mapping() {
        assert_eq!(SibylError::Validation("x".into()).status(), 422);
        assert_eq!(SibylError::QuotaExceeded("x".into()).status(), 429);
        assert_eq!(
            SibylError::NotFound { what: "agent".into() }.status(),
            404
        );
        assert_eq!(SibylError::Transient("x".into()).status(), 503);
    }
}
