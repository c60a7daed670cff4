use thiserror::Error;

use crate::remote::RemoteError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid identity key: {0}")]
    InvalidKey(String),

    #[error("invalid entry: {0}")]
    InvalidEntry(String),

    #[error("companion mode is read-only; clear the companion target to edit")]
    ReadOnlyMode,

    #[error("remote store unavailable: {0}")]
    RemoteUnavailable(#[from] RemoteError),

    #[error("corrupt record for {day}: {reason}")]
    CorruptRecord { day: String, reason: String },

    #[error("local store error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    /// Transient failures that the engine already keeps queued for retry.
    /// Anything else is terminal and must be shown to the caller.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RemoteUnavailable(_))
    }
}
