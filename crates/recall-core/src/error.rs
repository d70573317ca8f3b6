//! Error types for the retrieval core.

use thiserror::Error;

/// Result type alias using RecallError.
pub type Result<T> = std::result::Result<T, RecallError>;

/// Errors that can occur in the retrieval core.
#[derive(Error, Debug)]
pub enum RecallError {
    /// Embedding model missing, failed to load, or inference failed.
    #[error("Embedding unavailable: {message}")]
    EmbeddingUnavailable { message: String },

    /// Input text is empty or otherwise unembeddable.
    ///
    /// Raised instead of returning a zero vector, which would silently
    /// corrupt similarity rankings.
    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    /// Index storage unreachable or corrupted. Distinct from "no matches".
    #[error("Index unavailable: {message}")]
    IndexUnavailable { message: String },

    /// Embedding record storage error.
    #[error("Storage error: {message}")]
    Storage { message: String },

    /// Invalid parameter at the coordinator boundary (k <= 0, bad threshold).
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Document not tracked by the index.
    #[error("Document not found: {id}")]
    DocumentNotFound { id: String },

    /// Collection has no tracked documents.
    #[error("Collection not found: {id}")]
    CollectionNotFound { id: String },

    /// Vector length does not match the model dimension.
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RecallError {
    /// Create an embedding-unavailable error.
    pub fn embedding(message: impl Into<String>) -> Self {
        Self::EmbeddingUnavailable {
            message: message.into(),
        }
    }

    /// Create an invalid-input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an index-unavailable error.
    pub fn index(message: impl Into<String>) -> Self {
        Self::IndexUnavailable {
            message: message.into(),
        }
    }

    /// Create a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Create an invalid-argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Whether the indexing worker should retry this error with backoff.
    ///
    /// Transient infrastructure failures are retryable; caller mistakes
    /// (invalid input, bad arguments) are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::EmbeddingUnavailable { .. }
                | Self::IndexUnavailable { .. }
                | Self::Storage { .. }
                | Self::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RecallError::DocumentNotFound {
            id: "01ARZ3NDEKTSV4RRFFQ69G5FAV".to_string(),
        };
        assert!(err.to_string().contains("01ARZ3NDEKTSV4RRFFQ69G5FAV"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(RecallError::embedding("model offline").is_retryable());
        assert!(RecallError::index("db locked").is_retryable());
        assert!(!RecallError::invalid_input("empty text").is_retryable());
        assert!(!RecallError::invalid_argument("k must be >= 1").is_retryable());
    }
}
