//! Cross-device resync signal.
//!
//! A committed save writes a [`SignalToken`] to a shared store. Every session
//! compares the token's timestamp against the last one it has seen; a newer
//! token from another session triggers a full resync from the source. Polling
//! this token is the fallback when the push channel is degraded.
//!
//! # Storage layout (file store)
//!
//! ```text
//! ~/.opsboard/
//!   signals/
//!     <group_key>.json   (latest token, written via .tmp + rename)
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use opsboard_core::{ActorId, GroupKey, SessionId};

use crate::error::{io_err, SyncError};

/// Broadcast after every committed save.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalToken {
    pub timestamp: DateTime<Utc>,
    pub actor_id: ActorId,
    pub session_id: SessionId,
    pub group_key: GroupKey,
}

/// Shared token storage.
#[async_trait]
pub trait SignalStore: Send + Sync {
    async fn publish(&self, token: &SignalToken) -> Result<(), SyncError>;

    /// The latest token, if any was ever published.
    async fn read(&self) -> Result<Option<SignalToken>, SyncError>;
}

// ---------------------------------------------------------------------------
// Watcher
// ---------------------------------------------------------------------------

/// What a session should do about an observed token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalDecision {
    /// Already seen, own session, or another group.
    Ignore,
    /// Reload the group from the source. `notify_user` is set when the change
    /// came from a different actor.
    Resync { notify_user: bool, token: SignalToken },
}

#[derive(Debug, Clone)]
pub struct SignalWatcher {
    session_id: SessionId,
    actor_id: ActorId,
    group_key: GroupKey,
    last_seen: Option<DateTime<Utc>>,
}

impl SignalWatcher {
    pub fn new(session_id: SessionId, actor_id: ActorId, group_key: GroupKey) -> Self {
        Self {
            session_id,
            actor_id,
            group_key,
            last_seen: None,
        }
    }

    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.last_seen
    }

    /// Record a timestamp the session already reflects (its own publish, or
    /// the token present when it loaded).
    pub fn mark_seen(&mut self, timestamp: DateTime<Utc>) {
        if self.last_seen.map_or(true, |seen| timestamp > seen) {
            self.last_seen = Some(timestamp);
        }
    }

    pub fn observe(&mut self, token: &SignalToken) -> SignalDecision {
        if self.last_seen.is_some_and(|seen| token.timestamp <= seen) {
            return SignalDecision::Ignore;
        }
        self.last_seen = Some(token.timestamp);
        if token.session_id == self.session_id || token.group_key != self.group_key {
            return SignalDecision::Ignore;
        }
        SignalDecision::Resync {
            notify_user: token.actor_id != self.actor_id,
            token: token.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Stores
// ---------------------------------------------------------------------------

/// Token store shared by sessions within one process.
#[derive(Debug, Default)]
pub struct MemorySignalStore {
    token: RwLock<Option<SignalToken>>,
}

impl MemorySignalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SignalStore for MemorySignalStore {
    async fn publish(&self, token: &SignalToken) -> Result<(), SyncError> {
        let mut guard = self.token.write().await;
        *guard = Some(token.clone());
        Ok(())
    }

    async fn read(&self) -> Result<Option<SignalToken>, SyncError> {
        Ok(self.token.read().await.clone())
    }
}

/// Token store backed by one JSON file, shareable between processes on the
/// same machine.
#[derive(Debug, Clone)]
pub struct FileSignalStore {
    path: PathBuf,
}

/// `<home>/.opsboard/signals/<group>.json`: pure, no I/O.
///
/// The group key is percent-encoded, so every key maps to a distinct file
/// directly under `signals/`.
pub fn token_path_at(home: &Path, group: &GroupKey) -> PathBuf {
    home.join(".opsboard")
        .join("signals")
        .join(format!("{}.json", file_stem(&group.0)))
}

fn file_stem(key: &str) -> String {
    if key.is_empty() {
        return "%".to_string();
    }
    let mut stem = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            stem.push(char::from(byte));
        } else {
            stem.push_str(&format!("%{byte:02X}"));
        }
    }
    stem
}

impl FileSignalStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn at(home: &Path, group: &GroupKey) -> Self {
        Self::new(token_path_at(home, group))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SignalStore for FileSignalStore {
    async fn publish(&self, token: &SignalToken) -> Result<(), SyncError> {
        let path = self.path.clone();
        let token = token.clone();
        tokio::task::spawn_blocking(move || write_token(&path, &token))
            .await
            .map_err(|_| SyncError::ChannelClosed("signal write task"))?
    }

    async fn read(&self) -> Result<Option<SignalToken>, SyncError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || read_token(&path))
            .await
            .map_err(|_| SyncError::ChannelClosed("signal read task"))?
    }
}

/// Write flow: serialize → `.json.tmp` sibling → `rename`.
fn write_token(path: &Path, token: &SignalToken) -> Result<(), SyncError> {
    let Some(dir) = path.parent() else {
        return Err(io_err(
            path,
            std::io::Error::other("invalid signal token path"),
        ));
    };
    std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;

    let json = serde_json::to_string_pretty(token)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).map_err(|e| io_err(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| io_err(path, e))?;
    Ok(())
}

fn read_token(path: &Path) -> Result<Option<SignalToken>, SyncError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(io_err(path, err)),
    };
    Ok(Some(serde_json::from_str(&contents)?))
}
