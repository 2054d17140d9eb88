//! Error types for certdesk.

use thiserror::Error;

use crate::attachment::AttachmentError;
use crate::model::Status;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed input. Fail the request, do not retry.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: Status, to: Status },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// Transient infrastructure failure. Callers retry with backoff.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error(transparent)]
    Attachment(#[from] AttachmentError),

    #[error("config error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether retrying the whole operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::StorageUnavailable(_) => true,
            Error::Http(e) => e.is_connect() || e.is_timeout(),
            Error::Database(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
