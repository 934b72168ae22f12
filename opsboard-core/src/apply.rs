//! Local intent application.
//!
//! Both entry points mutate the store optimistically and re-sort the affected
//! group. Applying the same input twice leaves the order identical: when the
//! resulting fields already match, nothing (not even the modification stamp)
//! is written.

use chrono::{DateTime, Utc};

use crate::error::BoardError;
use crate::store::OrderStore;
use crate::types::{Actor, ActorId, Order, OrderId, OrderStatus};

/// Set `new_status` on `order_id`.
///
/// `Assigned`/`Completed` without `explicit_assignee` assign the order to
/// `actor`; `Unassigned` clears the assignee. Permitted for every actor.
pub fn apply_status_change(
    store: &mut OrderStore,
    order_id: &OrderId,
    new_status: OrderStatus,
    explicit_assignee: Option<ActorId>,
    actor: &Actor,
    now: DateTime<Utc>,
) -> Result<Order, BoardError> {
    let assigned_to = match new_status {
        OrderStatus::Unassigned => None,
        OrderStatus::Assigned | OrderStatus::Completed => {
            Some(explicit_assignee.unwrap_or_else(|| actor.id.clone()))
        }
    };

    let group = store.modify(order_id, |order| {
        if order.status == new_status && order.assigned_to == assigned_to {
            return;
        }
        order.status = new_status;
        order.assigned_to = assigned_to;
        stamp(order, actor, now);
    })?;
    store.resort(&group);
    snapshot(store, order_id)
}

/// Set the manual position of `order_id`. Status and assignment are left alone.
///
/// Rejected for non-privileged actors before anything is touched.
pub fn apply_reorder(
    store: &mut OrderStore,
    actor: &Actor,
    order_id: &OrderId,
    target_sort_order: i64,
    now: DateTime<Utc>,
) -> Result<Order, BoardError> {
    ensure_can_reorder(actor)?;
    let group = store.modify(order_id, |order| {
        if order.sort_order == Some(target_sort_order) {
            return;
        }
        order.sort_order = Some(target_sort_order);
        stamp(order, actor, now);
    })?;
    store.resort(&group);
    snapshot(store, order_id)
}

/// Reordering is reserved to privileged actors.
pub fn ensure_can_reorder(actor: &Actor) -> Result<(), BoardError> {
    if actor.privileged {
        Ok(())
    } else {
        Err(BoardError::PermissionDenied {
            actor: actor.id.clone(),
            action: "reorder orders",
        })
    }
}

fn stamp(order: &mut Order, actor: &Actor, now: DateTime<Utc>) {
    order.last_modified_by = Some(actor.id.clone());
    order.last_modified_at = Some(now);
}

fn snapshot(store: &OrderStore, order_id: &OrderId) -> Result<Order, BoardError> {
    store
        .get(order_id)
        .cloned()
        .ok_or_else(|| BoardError::UnknownOrder(order_id.clone()))
}
