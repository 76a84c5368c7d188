use thiserror::Error;

/// Storage backend errors
#[derive(Debug, Error)]
pub enum StorageError {
    /// Connection to the backend failed
    #[error("Connection error: {0}")]
    Connection(String),

    /// Operation timed out
    #[error("Operation timed out")]
    Timeout,

    /// Entity not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Serialization or deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal backend error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StorageError {
    /// True for errors indicating the backend is temporarily unreachable.
    ///
    /// Transient errors may be retried or served from a fallback cache;
    /// everything else is a definitive response.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Connection(_) | StorageError::Timeout)
    }
}

/// Result type alias for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;
