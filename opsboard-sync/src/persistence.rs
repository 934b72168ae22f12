//! Contracts of the external collaborators: the persistence service and the
//! push channel. Wire formats are left to implementations.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use opsboard_core::{ActorId, ChangeEvent, ChangedFields, CorrelationId, GroupKey, Order, OrderId};

use crate::error::PersistError;

/// One bulk persist call carrying every pending position of a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkReorder {
    pub group_key: GroupKey,
    pub changes: BTreeMap<OrderId, i64>,
    pub actor: ActorId,
    /// Strictly increasing per session.
    pub timestamp: DateTime<Utc>,
    pub correlation_id: CorrelationId,
}

impl BulkReorder {
    /// The per-order update equivalent to one entry of this request.
    pub fn update_for(&self, sort_order: i64) -> OrderUpdate {
        OrderUpdate {
            fields: ChangedFields {
                sort_order: Some(sort_order),
                ..ChangedFields::default()
            },
            actor: self.actor.clone(),
            timestamp: self.timestamp,
            correlation_id: self.correlation_id,
            is_drag_operation: true,
        }
    }

    /// This request narrowed to what still needs writing against `authoritative`:
    /// orders the server no longer has, or that already sit at their target,
    /// are left out.
    pub fn rebased_on(&self, authoritative: &[Order]) -> BulkReorder {
        let changes = self
            .changes
            .iter()
            .filter(|(id, target)| {
                authoritative
                    .iter()
                    .find(|o| &o.id == *id)
                    .is_some_and(|o| o.sort_order != Some(**target))
            })
            .map(|(id, target)| (id.clone(), *target))
            .collect();
        BulkReorder {
            changes,
            ..self.clone()
        }
    }
}

/// A single-order update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub fields: ChangedFields,
    pub actor: ActorId,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: CorrelationId,
    #[serde(default)]
    pub is_drag_operation: bool,
}

/// Authoritative order storage.
#[async_trait]
pub trait PersistenceService: Send + Sync {
    async fn bulk_reorder(&self, request: &BulkReorder) -> Result<(), PersistError>;

    async fn update_order(&self, order_id: &OrderId, update: &OrderUpdate)
        -> Result<(), PersistError>;

    /// The source of truth for a group.
    async fn fetch_group(&self, group: &GroupKey) -> Result<Vec<Order>, PersistError>;
}

/// Inbound change notifications.
pub trait PushChannel: Send + Sync {
    /// A new subscription. The receiver closes when the channel goes away.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ChangeEvent>;
}
