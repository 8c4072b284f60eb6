//! Error types for the storage layer.

/// Errors that can occur when talking to a storage backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Object (or bucket) does not exist
    #[error("object not found: {0}")]
    NotFound(String),

    /// Network or backend hiccup; worth retrying
    #[error("transient storage error: {0}")]
    Transient(String),

    /// Authentication, permission or request error; retrying will not help
    #[error("permanent storage error: {0}")]
    Permanent(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Bucket not found - must be created before use
    #[error("bucket '{0}' does not exist. Create it with --create-bucket first.")]
    BucketNotFound(String),

    /// Bucket already exists
    #[error("bucket '{0}' already exists")]
    BucketExists(String),

    /// Bucket still holds objects
    #[error("bucket '{0}' is not empty")]
    BucketNotEmpty(String),

    /// Operation the backend cannot perform
    #[error("{operation} is not supported by the {backend} store")]
    Unsupported {
        operation: &'static str,
        backend: &'static str,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Whether the operation may succeed if simply tried again.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

impl From<object_store::Error> for StoreError {
    fn from(err: object_store::Error) -> Self {
        use object_store::Error as E;
        match err {
            E::NotFound { path, .. } => StoreError::NotFound(path),
            e @ (E::PermissionDenied { .. }
            | E::Unauthenticated { .. }
            | E::InvalidPath { .. }
            | E::NotSupported { .. }
            | E::NotImplemented
            | E::AlreadyExists { .. }
            | E::Precondition { .. }
            | E::UnknownConfigurationKey { .. }) => StoreError::Permanent(e.to_string()),
            e => StoreError::Transient(e.to_string()),
        }
    }
}

/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;
