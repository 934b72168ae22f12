//! opsboard core library: order model, local store, pending-intent ledger,
//! display ordering, configuration.
//!
//! Public API surface:
//! - [`types`]: newtypes, orders, inbound change events
//! - [`store`]: [`OrderStore`], the canonical collection
//! - [`apply`]: optimistic status / reorder application
//! - [`ledger`]: [`PendingChangeLedger`]
//! - [`position`]: move intent → sort order planning
//! - [`sort`]: display-order comparator
//! - [`config`]: [`SyncConfig`] loading
//! - [`error`]: [`BoardError`], [`ConfigError`]

pub mod apply;
pub mod config;
pub mod error;
pub mod ledger;
pub mod position;
pub mod sort;
pub mod store;
pub mod types;

pub use config::SyncConfig;
pub use error::{BoardError, ConfigError};
pub use ledger::{LedgerSnapshot, PendingChangeLedger};
pub use position::{MoveIntent, Placement};
pub use store::OrderStore;
pub use types::{
    Actor, ActorId, ChangeEvent, ChangeKind, ChangedFields, CorrelationId, FieldPatch, GroupKey,
    InboundChange, Order, OrderId, OrderStatus, PendingIntent, SessionId,
};
