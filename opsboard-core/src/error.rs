//! Error types for opsboard-core.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::{ActorId, OrderId};

/// Errors raised by local board mutations and event ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BoardError {
    /// The referenced order is not in the store.
    #[error("unknown order '{0}'")]
    UnknownOrder(OrderId),

    /// The actor lacks the privilege for the attempted action. Raised before
    /// any state mutation or network call.
    #[error("actor '{actor}' is not permitted to {action}")]
    PermissionDenied { actor: ActorId, action: &'static str },

    /// A move intent that cannot be placed (self-anchor, anchor in another group).
    #[error("invalid move of '{order_id}': {reason}")]
    InvalidMove { order_id: OrderId, reason: String },

    /// An inbound event that cannot be interpreted.
    #[error("invalid event for '{order_id}': {reason}")]
    InvalidEvent { order_id: OrderId, reason: String },
}

/// Errors raised while loading [`crate::config::SyncConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parse error on load: includes file path and line context from serde_yaml.
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// `dirs::home_dir()` returned `None`: cannot locate `~/.opsboard/`.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,
}
