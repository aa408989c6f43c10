use std::io;
use thiserror::Error;

/// Errors shared by every blob and metadata backend and the object service.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("malformed identifier `{0}`")]
    MalformedIdentifier(String),
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error("object `{0}` has expired")]
    Expired(String),
    #[error("object `{0}` has not expired yet")]
    NotExpired(String),
    #[error("write failed: {0}")]
    WriteFailure(String),
    #[error("redis: {0}")]
    Redis(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    /// Wrap a backend error raised while persisting data.
    pub fn write(err: impl std::fmt::Display) -> Self {
        StoreError::WriteFailure(err.to_string())
    }

    /// True for outcomes a caller sees as "this object is gone".
    pub fn is_gone(&self) -> bool {
        matches!(self, StoreError::NotFound(_) | StoreError::Expired(_))
    }
}
