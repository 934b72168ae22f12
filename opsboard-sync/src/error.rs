//! Error types for opsboard-sync.

use std::path::PathBuf;

use thiserror::Error;

use opsboard_core::BoardError;

/// Failure reported by a persistence collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistError {
    /// The call did not reach the service or its answer was lost. Retried
    /// through the per-order fallback path.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The service holds newer data than the request assumed. The
    /// authoritative refetch wins; the request is retried once.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The service refused the request outright.
    #[error("rejected: {0}")]
    Rejected(String),
}

/// All errors that can arise from synchronization operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A local mutation was refused (unknown order, permission, bad move).
    #[error("board error: {0}")]
    Board(#[from] BoardError),

    /// A persistence call failed outside of a save.
    #[error("persistence error: {0}")]
    Persist(#[from] PersistError),

    /// A save failed on every path. Local state was restored from the
    /// authoritative source and the pending changes are back in the ledger.
    #[error("save failed, {pending} pending change(s) kept for retry: {source}")]
    SaveFailed {
        pending: usize,
        #[source]
        source: PersistError,
    },

    /// `save` was invoked while a previous save is still running.
    #[error("a save is already in progress")]
    SaveInProgress,

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Signal token (de)serialization failure.
    #[error("signal JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),
}

impl SyncError {
    /// Whether the same operation can simply be attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::SaveFailed { .. }
                | SyncError::SaveInProgress
                | SyncError::Persist(PersistError::Transport(_))
        )
    }
}

/// Convenience constructor for [`SyncError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}
