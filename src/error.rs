//! Domain error types shared across the service.
//!
//! Every fallible operation in the core returns [`Result`]. Transient backend
//! failures (embedding service, vector store, LLM) are retried inside the
//! owning client; errors that reach a caller here are final. The HTTP layer
//! maps each variant to a status code in `server`.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Invalid caller input (maps to 400).
    #[error("validation error: {0}")]
    Validation(String),

    /// Uniqueness or lifecycle invariant violated on create/update (409).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Missing knowledge base or file (404).
    #[error("not found: {0}")]
    NotFound(String),

    /// Embedding service failure after retries, or dimension mismatch (503).
    #[error("embedding error: {0}")]
    Embedding(String),

    /// Vector store failure after retries (503).
    #[error("vector store error: {0}")]
    VectorStore(String),

    /// LLM failure after retries (503).
    #[error("llm error: {0}")]
    Llm(String),

    /// Deadline exceeded on an external call (504).
    #[error("timeout: {0}")]
    Timeout(String),

    /// Unsupported or malformed file. Recorded in ingestion reports, never
    /// fatal to sibling files.
    #[error("loader error: {0}")]
    Loader(String),

    /// Unclassified failure (500).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for failures worth retrying at a component boundary: transport
    /// errors and deadline expiry. Dimension mismatches, validation and
    /// lifecycle errors are final.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Internal(e.to_string())
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Error::Internal(format!("metadata store: {e}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Internal(format!("serialization: {e}"))
    }
}

/// Classify a reqwest failure: timeouts keep their own kind so retry
/// policies can distinguish them from connection refusals.
pub fn classify_http_error(e: &reqwest::Error, backend: &str) -> Error {
    if e.is_timeout() {
        Error::Timeout(format!("{backend}: {e}"))
    } else {
        match backend {
            "embedding" => Error::Embedding(e.to_string()),
            "vector store" => Error::VectorStore(e.to_string()),
            "llm" => Error::Llm(e.to_string()),
            _ => Error::Internal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_transient() {
        assert!(Error::Timeout("llm".into()).is_transient());
        assert!(!Error::Validation("bad".into()).is_transient());
        assert!(!Error::Conflict("dup".into()).is_transient());
    }

    #[test]
    fn display_includes_kind() {
        let e = Error::Conflict("knowledge base 'notes' already exists".into());
        assert!(e.to_string().contains("conflict"));
        assert!(e.to_string().contains("notes"));
    }
}
