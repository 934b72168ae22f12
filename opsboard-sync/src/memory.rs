//! In-process authoritative backend.
//!
//! [`MemoryBackend`] implements both [`PersistenceService`] and
//! [`PushChannel`]: every accepted write is applied to its own order table
//! and broadcast to all subscribers, the way the real service echoes changes
//! back to every client. Failures can be queued per operation to exercise the
//! fallback and recovery paths.
//!
//! ## Limitations
//!
//! - **Single-process only**: nothing is shared across process boundaries
//! - **No persistence**: all state is lost when the backend is dropped

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use opsboard_core::{ChangeEvent, ChangeKind, GroupKey, Order, OrderId};

use crate::error::PersistError;
use crate::persistence::{BulkReorder, OrderUpdate, PersistenceService, PushChannel};

/// Operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    BulkReorder,
    UpdateOrder,
    FetchGroup,
}

#[derive(Debug, Default)]
struct BackendState {
    orders: Vec<Order>,
    subscribers: Vec<mpsc::UnboundedSender<ChangeEvent>>,
    failures: HashMap<Operation, VecDeque<PersistError>>,
    calls: Vec<Operation>,
}

impl BackendState {
    fn take_failure(&mut self, op: Operation) -> Option<PersistError> {
        self.calls.push(op);
        self.failures.get_mut(&op).and_then(VecDeque::pop_front)
    }

    fn broadcast(&mut self, event: &ChangeEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn order_mut(&mut self, id: &OrderId) -> Option<&mut Order> {
        self.orders.iter_mut().find(|o| &o.id == id)
    }
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<BackendState>,
}

fn poison_err<T>(_: PoisonError<T>) -> PersistError {
    PersistError::Transport("backend lock poisoned".to_string())
}

impl MemoryBackend {
    pub fn new(orders: Vec<Order>) -> Self {
        Self {
            state: Mutex::new(BackendState {
                orders,
                ..BackendState::default()
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, BackendState>, PersistError> {
        self.state.lock().map_err(poison_err)
    }

    /// Make the next call of `op` fail with `error`. Queued failures are
    /// consumed in order.
    pub fn fail_next(&self, op: Operation, error: PersistError) -> Result<(), PersistError> {
        self.lock()?.failures.entry(op).or_default().push_back(error);
        Ok(())
    }

    /// Every call received so far, in order.
    pub fn calls(&self) -> Result<Vec<Operation>, PersistError> {
        Ok(self.lock()?.calls.clone())
    }

    /// Current authoritative contents of `group`.
    pub fn orders(&self, group: &GroupKey) -> Result<Vec<Order>, PersistError> {
        Ok(self
            .lock()?
            .orders
            .iter()
            .filter(|o| &o.group_key == group)
            .cloned()
            .collect())
    }

    /// Apply a change made elsewhere (another client, ingestion) and push it
    /// to every subscriber.
    pub fn publish_external(&self, event: ChangeEvent) -> Result<(), PersistError> {
        let mut state = self.lock()?;
        match event.kind {
            ChangeKind::Created => {
                if let Some(order) = event.order.clone() {
                    state.orders.retain(|o| o.id != order.id);
                    state.orders.push(order);
                }
            }
            ChangeKind::Deleted => state.orders.retain(|o| o.id != event.order_id),
            ChangeKind::Updated => {
                if let Some(order) = state.order_mut(&event.order_id) {
                    event.changed.apply_to(order);
                    order.last_modified_by = Some(event.updated_by.clone());
                    order.last_modified_at = Some(event.timestamp);
                }
            }
        }
        state.broadcast(&event);
        Ok(())
    }
}

#[async_trait]
impl PersistenceService for MemoryBackend {
    async fn bulk_reorder(&self, request: &BulkReorder) -> Result<(), PersistError> {
        let mut state = self.lock()?;
        if let Some(err) = state.take_failure(Operation::BulkReorder) {
            return Err(err);
        }
        if let Some(missing) = request
            .changes
            .keys()
            .find(|id| !state.orders.iter().any(|o| &o.id == *id))
        {
            return Err(PersistError::Rejected(format!("unknown order '{missing}'")));
        }

        let mut events = Vec::with_capacity(request.changes.len());
        for (id, sort_order) in &request.changes {
            let update = request.update_for(*sort_order);
            if let Some(order) = state.order_mut(id) {
                update.fields.apply_to(order);
                order.last_modified_by = Some(request.actor.clone());
                order.last_modified_at = Some(request.timestamp);
            }
            events.push(echo_event(id, &update));
        }
        for event in &events {
            state.broadcast(event);
        }
        Ok(())
    }

    async fn update_order(
        &self,
        order_id: &OrderId,
        update: &OrderUpdate,
    ) -> Result<(), PersistError> {
        let mut state = self.lock()?;
        if let Some(err) = state.take_failure(Operation::UpdateOrder) {
            return Err(err);
        }
        let Some(order) = state.order_mut(order_id) else {
            return Err(PersistError::Rejected(format!("unknown order '{order_id}'")));
        };
        update.fields.apply_to(order);
        order.last_modified_by = Some(update.actor.clone());
        order.last_modified_at = Some(update.timestamp);
        let event = echo_event(order_id, update);
        state.broadcast(&event);
        Ok(())
    }

    async fn fetch_group(&self, group: &GroupKey) -> Result<Vec<Order>, PersistError> {
        let mut state = self.lock()?;
        if let Some(err) = state.take_failure(Operation::FetchGroup) {
            return Err(err);
        }
        Ok(state
            .orders
            .iter()
            .filter(|o| &o.group_key == group)
            .cloned()
            .collect())
    }
}

impl PushChannel for MemoryBackend {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ChangeEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        match self.state.lock() {
            Ok(mut state) => state.subscribers.push(tx),
            // Dropping the sender closes the receiver; the session then
            // falls back to signal polling.
            Err(_) => tracing::warn!("backend lock poisoned; subscription closed"),
        }
        rx
    }
}

fn echo_event(order_id: &OrderId, update: &OrderUpdate) -> ChangeEvent {
    ChangeEvent {
        is_drag_operation: update.is_drag_operation,
        correlation_id: Some(update.correlation_id),
        ..ChangeEvent::updated(
            order_id.clone(),
            update.fields.clone(),
            update.actor.clone(),
            update.timestamp,
        )
    }
}
