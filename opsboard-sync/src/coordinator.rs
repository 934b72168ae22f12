//! Save state machine.
//!
//! ```text
//! Idle ──begin──▶ Saving ──finish──▶ Committed ─┐
//!                   │                           ├─▶ Idle (next begin)
//!                   └──────finish──▶ Failed ────┘
//! ```
//!
//! The network part ([`run_save`]) borrows no board state: `begin` snapshots
//! the ledger into a [`SaveJob`], `run_save` persists it, and `finish` folds
//! the [`SaveOutcome`] back into the store and ledger. While a save is in
//! flight its snapshot keeps blocking positional events for the saved orders.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use opsboard_core::{
    Actor, CorrelationId, GroupKey, LedgerSnapshot, Order, OrderId, OrderStore,
    PendingChangeLedger, PendingIntent, SessionId,
};

use crate::error::{PersistError, SyncError};
use crate::persistence::{BulkReorder, PersistenceService};
use crate::signal::SignalToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveState {
    Idle,
    Saving,
    Committed,
    Failed,
}

/// Orders whose inbound updates are blocked until `until`, unless the update
/// comes from the authoritative post-save refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectionWindow {
    orders: BTreeSet<OrderId>,
    until: Instant,
}

impl ProtectionWindow {
    pub fn new(orders: impl IntoIterator<Item = OrderId>, until: Instant) -> Self {
        Self {
            orders: orders.into_iter().collect(),
            until,
        }
    }

    pub fn covers(&self, id: &OrderId, now: Instant) -> bool {
        now < self.until && self.orders.contains(id)
    }

    pub fn until(&self) -> Instant {
        self.until
    }
}

/// Everything the network part of a save needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveJob {
    pub request: BulkReorder,
}

/// Which persistence path carried a committed save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistPath {
    Bulk,
    /// The bulk call conflicted; the retry, rebased on the refetched group,
    /// succeeded or had nothing left to write.
    BulkRetry,
    /// The bulk call hit a transport failure; every order was saved on its own.
    PerOrder,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Persisted. `authoritative` is `None` when the follow-up refetch failed.
    Committed {
        path: PersistPath,
        authoritative: Option<Vec<Order>>,
    },
    /// Every path failed. `authoritative` is `None` when the recovery refetch
    /// failed as well.
    Failed {
        error: PersistError,
        authoritative: Option<Vec<Order>>,
    },
}

/// Result of a committed save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveReport {
    pub saved: Vec<OrderId>,
    pub path: PersistPath,
    pub token: SignalToken,
}

#[derive(Debug)]
pub struct SaveCoordinator {
    state: SaveState,
    in_flight: Option<LedgerSnapshot>,
    protection: Option<ProtectionWindow>,
    last_stamp: Option<DateTime<Utc>>,
    protection_window: Duration,
}

impl SaveCoordinator {
    pub fn new(protection_window: Duration) -> Self {
        Self {
            state: SaveState::Idle,
            in_flight: None,
            protection: None,
            last_stamp: None,
            protection_window,
        }
    }

    pub fn state(&self) -> SaveState {
        self.state
    }

    pub fn in_flight(&self) -> Option<&LedgerSnapshot> {
        self.in_flight.as_ref()
    }

    pub fn protection(&self) -> Option<&ProtectionWindow> {
        self.protection.as_ref()
    }

    /// Snapshot the ledger and build the persistence request.
    ///
    /// Returns `Ok(None)` when there is nothing to save. Intents for orders
    /// deleted since they were recorded are left out of the request.
    pub fn begin(
        &mut self,
        ledger: &mut PendingChangeLedger,
        store: &OrderStore,
        actor: &Actor,
        group: &GroupKey,
        now: DateTime<Utc>,
    ) -> Result<Option<SaveJob>, SyncError> {
        if self.state == SaveState::Saving {
            return Err(SyncError::SaveInProgress);
        }
        self.state = SaveState::Idle;
        if ledger.is_empty() {
            return Ok(None);
        }

        let mut snapshot = ledger.commit();
        let orphaned = snapshot.split_off_where(|id| !store.contains(id));
        for id in &orphaned {
            tracing::warn!(order_id = %id, "order deleted before save; dropping its pending position");
        }
        if snapshot.is_empty() {
            return Ok(None);
        }

        let request = BulkReorder {
            group_key: group.clone(),
            changes: snapshot.changes(),
            actor: actor.id.clone(),
            timestamp: self.next_stamp(now),
            correlation_id: CorrelationId::new(),
        };
        tracing::debug!(
            changes = request.changes.len(),
            correlation_id = %request.correlation_id,
            "save started",
        );
        self.in_flight = Some(snapshot);
        self.state = SaveState::Saving;
        Ok(Some(SaveJob { request }))
    }

    /// Fold a save outcome back into local state.
    ///
    /// On success the group is replaced by the authoritative list, intents
    /// recorded while saving are re-applied on top, and a protection window
    /// opens over the saved orders. On failure the group is replaced by the
    /// authoritative list (when available) and the snapshot goes back into
    /// the ledger; the returned error is retryable.
    pub fn finish(
        &mut self,
        job: &SaveJob,
        outcome: SaveOutcome,
        store: &mut OrderStore,
        ledger: &mut PendingChangeLedger,
        session_id: SessionId,
        now: Instant,
    ) -> Result<SaveReport, SyncError> {
        let snapshot = self.in_flight.take().unwrap_or_default();
        let group = &job.request.group_key;

        match outcome {
            SaveOutcome::Committed {
                path,
                authoritative,
            } => {
                if let Some(orders) = authoritative {
                    store.replace_group(group, orders);
                    reapply_pending(store, ledger.iter());
                }
                let saved: Vec<OrderId> = snapshot.iter().map(|(id, _)| id.clone()).collect();
                self.protection = Some(ProtectionWindow::new(
                    saved.iter().cloned(),
                    now + self.protection_window,
                ));
                self.state = SaveState::Committed;
                tracing::info!(saved = saved.len(), path = ?path, "save committed");
                Ok(SaveReport {
                    saved,
                    path,
                    token: SignalToken {
                        timestamp: job.request.timestamp,
                        actor_id: job.request.actor.clone(),
                        session_id,
                        group_key: group.clone(),
                    },
                })
            }
            SaveOutcome::Failed {
                error,
                authoritative,
            } => {
                match authoritative {
                    Some(orders) => {
                        store.replace_group(group, orders);
                        // Only intents recorded during the save are shown;
                        // the failed ones wait in the ledger for a retry.
                        reapply_pending(store, ledger.iter());
                    }
                    None => tracing::warn!("recovery refetch failed; keeping optimistic view"),
                }
                ledger.restore(snapshot);
                self.state = SaveState::Failed;
                tracing::error!(error = %error, pending = ledger.len(), "save failed");
                Err(SyncError::SaveFailed {
                    pending: ledger.len(),
                    source: error,
                })
            }
        }
    }

    /// Close an expired protection window.
    pub fn expire_protection(&mut self, now: Instant) {
        if self.protection.as_ref().is_some_and(|p| now >= p.until) {
            self.protection = None;
        }
    }

    fn next_stamp(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        let stamp = match self.last_stamp {
            Some(last) if now <= last => last + chrono::Duration::milliseconds(1),
            _ => now,
        };
        self.last_stamp = Some(stamp);
        stamp
    }
}

/// Write pending positions onto the store so local intent stays visible
/// over authoritative data.
pub(crate) fn reapply_pending<'a>(
    store: &mut OrderStore,
    intents: impl IntoIterator<Item = (&'a OrderId, &'a PendingIntent)>,
) {
    let mut groups = BTreeSet::new();
    for (id, intent) in intents {
        match store.modify(id, |order| order.sort_order = Some(intent.target_sort_order)) {
            Ok(group) => {
                groups.insert(group);
            }
            Err(_) => tracing::debug!(order_id = %id, "pending order absent from refresh"),
        }
    }
    for group in groups {
        store.resort(&group);
    }
}

/// The network part of a save: bulk call, fallbacks, authoritative refetch.
///
/// On conflict the refetched group decides the retry: only positions the
/// server does not already hold, for orders it still has, are sent again.
pub async fn run_save(job: &SaveJob, persistence: &dyn PersistenceService) -> SaveOutcome {
    let request = &job.request;
    let mut conflict_view = None;
    let persisted = match persistence.bulk_reorder(request).await {
        Ok(()) => Ok(PersistPath::Bulk),
        Err(PersistError::Conflict(reason)) => {
            tracing::warn!(%reason, "bulk save conflicted; refetching and retrying once");
            match persistence.fetch_group(&request.group_key).await {
                Ok(orders) => {
                    let retry = request.rebased_on(&orders);
                    conflict_view = Some(orders);
                    if retry.changes.is_empty() {
                        tracing::info!("refetch already holds every pending position");
                        Ok(PersistPath::BulkRetry)
                    } else {
                        persistence
                            .bulk_reorder(&retry)
                            .await
                            .map(|()| PersistPath::BulkRetry)
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "conflict refetch failed; not retrying");
                    Err(PersistError::Conflict(reason))
                }
            }
        }
        Err(PersistError::Transport(reason)) => {
            tracing::warn!(%reason, "bulk save unreachable; falling back to per-order saves");
            persist_each(request, persistence)
                .await
                .map(|()| PersistPath::PerOrder)
        }
        Err(err) => Err(err),
    };

    let authoritative = match persistence.fetch_group(&request.group_key).await {
        Ok(orders) => Some(orders),
        Err(err) => {
            tracing::warn!(error = %err, group = %request.group_key, "authoritative refetch failed");
            conflict_view
        }
    };

    match persisted {
        Ok(path) => SaveOutcome::Committed {
            path,
            authoritative,
        },
        Err(error) => SaveOutcome::Failed {
            error,
            authoritative,
        },
    }
}

async fn persist_each(
    request: &BulkReorder,
    persistence: &dyn PersistenceService,
) -> Result<(), PersistError> {
    for (id, sort_order) in &request.changes {
        persistence
            .update_order(id, &request.update_for(*sort_order))
            .await?;
    }
    Ok(())
}
