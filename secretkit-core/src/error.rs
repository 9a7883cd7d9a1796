//! Error types for the secrets daemon core.

use thiserror::Error;

use secretkit_db::DbError;

/// Result type alias for daemon core operations.
pub type SecretsResult<T> = Result<T, SecretsError>;

/// Errors surfaced to clients of the request processor.
///
/// Each variant is a distinct error kind, not a stringly-typed code; the
/// payload carries the human-readable detail reported alongside it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SecretsError {
    /// The named collection does not exist, is reserved, or is invalid.
    #[error("invalid collection: {0}")]
    InvalidCollection(String),

    /// The named secret does not exist or its name is invalid.
    #[error("invalid secret: {0}")]
    InvalidSecret(String),

    /// The supplied filter is empty or malformed.
    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    /// A plugin referenced by the request or by stored metadata does not
    /// resolve in the registry.
    #[error("invalid extension plugin: {0}")]
    InvalidExtensionPlugin(String),

    /// A collection with this name already exists.
    #[error("collection already exists: {0}")]
    CollectionAlreadyExists(String),

    /// A secret with this identifier already exists.
    #[error("secret already exists: {0}")]
    SecretAlreadyExists(String),

    /// The collection (or device-locked secret) is locked and requires
    /// device lock authentication.
    #[error("collection is locked: {0}")]
    CollectionIsLocked(String),

    /// The presented authentication code or key was incorrect.
    #[error("incorrect authentication code: {0}")]
    IncorrectAuthenticationCode(String),

    /// The operation needs a user prompt but interaction was prevented.
    #[error("operation requires user interaction: {0}")]
    OperationRequiresUserInteraction(String),

    /// The authentication plugin requires in-process application
    /// interaction which the caller did not offer.
    #[error("operation requires application user interaction: {0}")]
    OperationRequiresApplicationUserInteraction(String),

    /// The operation is recognised but not supported.
    #[error("operation not supported: {0}")]
    OperationNotSupported(String),

    /// The caller is not permitted to perform this operation.
    #[error("permission denied: {0}")]
    Permissions(String),

    /// The daemon's bookkeeping database is locked.
    #[error("secrets daemon is locked: {0}")]
    SecretsDaemonLocked(String),

    /// The user cancelled the interaction view.
    #[error("user canceled interaction: {0}")]
    InteractionViewUserCanceled(String),

    /// Another structural request is operating on the same collection;
    /// the caller may retry.
    #[error("interleaved request: {0}")]
    InterleavedRequest(String),

    /// A bookkeeping database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// An unclassified failure.
    #[error("unknown error: {0}")]
    Unknown(String),
}

impl SecretsError {
    /// Creates an unknown error.
    pub fn unknown<S: Into<String>>(message: S) -> Self {
        Self::Unknown(message.into())
    }

    /// True for errors a caller may reasonably retry without change.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::InterleavedRequest(_))
    }
}

impl From<DbError> for SecretsError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Locked => {
                Self::SecretsDaemonLocked("the bookkeeping database is locked".into())
            }
            DbError::IncorrectLockKey => {
                Self::SecretsDaemonLocked("incorrect bookkeeping database lock key".into())
            }
            other => Self::Database(other.to_string()),
        }
    }
}
