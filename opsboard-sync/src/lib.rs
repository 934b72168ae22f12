//! # opsboard-sync
//!
//! Keeps a local board consistent with the authoritative order service.
//!
//! - [`session::BoardSession`]: synchronous state machine for one open board
//! - [`runtime::spawn_session`]: tokio task driving a session
//! - [`coordinator`]: save state machine and persistence fallbacks
//! - [`reconciler`]: inbound change decisions and batching
//! - [`signal`]: cross-device resync token
//! - [`persistence`]: collaborator contracts; [`memory`] implements them in-process

pub mod coordinator;
pub mod error;
pub mod memory;
pub mod persistence;
pub mod reconciler;
pub mod runtime;
pub mod session;
pub mod signal;

pub use coordinator::{PersistPath, SaveOutcome, SaveReport, SaveState};
pub use error::{PersistError, SyncError};
pub use memory::{MemoryBackend, Operation};
pub use persistence::{BulkReorder, OrderUpdate, PersistenceService, PushChannel};
pub use reconciler::{DropReason, ReconcileReport};
pub use runtime::{spawn_session, BoardSnapshot, SessionHandle};
pub use session::{BoardSession, StatusUpdate};
pub use signal::{FileSignalStore, MemorySignalStore, SignalDecision, SignalStore, SignalToken};
