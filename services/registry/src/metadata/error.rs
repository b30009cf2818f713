//! Metadata store error types.

use thiserror::Error;

/// Metadata store operation errors.
#[derive(Debug, Error)]
pub enum MetadataError {
    /// The row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A unique column already holds this value.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// An optimistic update or named lock lost a race.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A namespace or repository limit would be exceeded.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Any other database failure.
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),

    /// A stored payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for metadata operations.
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;

impl From<sqlx::Error> for MetadataError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => MetadataError::NotFound("row".into()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                MetadataError::AlreadyExists(db.message().to_owned())
            }
            _ => MetadataError::Database(err),
        }
    }
}

impl MetadataError {
    /// Whether the row asked for does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, MetadataError::NotFound(_))
    }

    /// Whether retrying the same operation later could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            MetadataError::Database(err) => match err {
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
                // SQLITE_BUSY / SQLITE_LOCKED
                sqlx::Error::Database(db) => {
                    matches!(db.code().as_deref(), Some("5") | Some("6") | Some("517"))
                }
                _ => false,
            },
            _ => false,
        }
    }
}

/// Failures which may clear up when the same operation runs again.
pub trait Transient {
    /// Whether retrying may succeed.
    fn is_transient(&self) -> bool;
}

impl Transient for MetadataError {
    fn is_transient(&self) -> bool {
        MetadataError::is_transient(self)
    }
}
