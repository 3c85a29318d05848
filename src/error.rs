//! Error taxonomy for the RAG core
//!
//! Every fallible operation in the library returns [`RagResult`]. The variants
//! split along the lines the retry policy and the HTTP layer care about:
//! transient dependency failures are retried, everything else surfaces
//! immediately.

use std::time::Duration;

use thiserror::Error;

/// Library result alias
pub type RagResult<T> = std::result::Result<T, RagError>;

/// RAG core error
#[derive(Debug, Error)]
pub enum RagError {
    /// Network failure, per-call timeout, 5xx or 429 from a dependency
    #[error("{service} temporarily unavailable: {message}")]
    Transient {
        service: &'static str,
        message: String,
    },

    /// Non-transient dependency failure (4xx, malformed payload)
    #[error("{service} request failed: {message}")]
    Dependency {
        service: &'static str,
        message: String,
    },

    /// Dimension mismatch, missing credentials, invalid settings
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Unknown company, run id or dataset
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Job superseded by a company deletion
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Malformed request parameters
    #[error("invalid request: {0}")]
    Validation(String),

    /// Job or request deadline exceeded
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Embedded store (SQLite, LanceDB, filesystem) failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Bug surfaced at runtime, e.g. a job task that panicked
    #[error("internal error: {0}")]
    Internal(String),
}

impl RagError {
    pub fn transient(service: &'static str, message: impl Into<String>) -> Self {
        Self::Transient {
            service,
            message: message.into(),
        }
    }

    pub fn dependency(service: &'static str, message: impl Into<String>) -> Self {
        Self::Dependency {
            service,
            message: message.into(),
        }
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Whether the retry policy may attempt the call again
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::Transient { .. } => "dependency_unavailable",
            Self::Dependency { .. } => "dependency_error",
            Self::Configuration(_) => "configuration_error",
            Self::NotFound { .. } => "not_found",
            Self::Cancelled(_) => "cancelled",
            Self::Validation(_) => "bad_request",
            Self::Timeout(_) => "timeout",
            Self::Storage(_) => "storage_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Classify an HTTP status returned by a dependency
    pub fn from_status(service: &'static str, status: reqwest::StatusCode, body: &str) -> Self {
        let message = format!("HTTP {}: {}", status, truncate(body, 300));
        if status.is_server_error() || status.as_u16() == 429 || status.as_u16() == 408 {
            Self::transient(service, message)
        } else {
            Self::dependency(service, message)
        }
    }

    /// Classify a transport-level `reqwest` failure
    pub fn from_reqwest(service: &'static str, err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            return Self::transient(service, err.to_string());
        }
        if let Some(status) = err.status() {
            return Self::from_status(service, status, &err.to_string());
        }
        if err.is_decode() {
            return Self::dependency(service, format!("malformed response: {}", err));
        }
        Self::transient(service, err.to_string())
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let head: String = text.chars().take(max_chars).collect();
        format!("{}...", head)
    }
}

impl From<rusqlite::Error> for RagError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(format!("sqlite: {}", err))
    }
}

impl From<lancedb::Error> for RagError {
    fn from(err: lancedb::Error) -> Self {
        Self::Storage(format!("lancedb: {}", err))
    }
}

impl From<arrow_schema::ArrowError> for RagError {
    fn from(err: arrow_schema::ArrowError) -> Self {
        Self::Storage(format!("arrow: {}", err))
    }
}

impl From<std::io::Error> for RagError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(format!("io: {}", err))
    }
}

impl From<serde_json::Error> for RagError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(format!("json: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        let err = RagError::from_status("ollama", reqwest::StatusCode::SERVICE_UNAVAILABLE, "");
        assert!(err.is_transient());

        let err = RagError::from_status("ollama", reqwest::StatusCode::TOO_MANY_REQUESTS, "");
        assert!(err.is_transient());

        let err = RagError::from_status("ollama", reqwest::StatusCode::BAD_REQUEST, "bad");
        assert!(!err.is_transient());
        assert_eq!(err.code(), "dependency_error");
    }

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(!RagError::Configuration("dim".into()).is_transient());
        assert!(!RagError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!RagError::Cancelled("deleted".into()).is_transient());
        assert!(RagError::transient("store", "reset").is_transient());
    }

    #[test]
    fn test_long_body_is_truncated() {
        let body = "x".repeat(1000);
        let err = RagError::from_status("crawler", reqwest::StatusCode::NOT_FOUND, &body);
        assert!(err.to_string().len() < 400);
    }
}
