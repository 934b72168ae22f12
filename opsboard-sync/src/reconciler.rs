//! Inbound change reconciliation.
//!
//! Every event runs through the same decision chain, first match wins:
//!
//! 1. delete → remove, regardless of intent or window
//! 2. own echo (correlation id, or same actor and non-positional) → drop
//! 3. positional change with a pending intent → drop
//! 4. order under post-save protection, not from the refresh → drop
//! 5. own recent drag → drop
//! 6. apply
//!
//! Events of one tick are merged field by field per order and each affected
//! group is re-sorted once. Created snapshots for another board are not
//! kept; an order that moved to another board leaves this one.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use opsboard_core::{
    ActorId, ChangeEvent, ChangedFields, CorrelationId, GroupKey, InboundChange, LedgerSnapshot,
    OrderId, OrderStore, PendingChangeLedger, SyncConfig,
};

use crate::coordinator::ProtectionWindow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    SelfEcho,
    PendingIntent,
    ProtectionWindow,
    RecentSelfDrag,
    UnknownOrder,
    ForeignGroup,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Delete,
    Apply,
    Drop(DropReason),
}

/// Correlation ids of locally originated mutations, remembered for a while.
#[derive(Debug, Clone)]
pub struct EchoTracker {
    ttl: Duration,
    expires: HashMap<CorrelationId, Instant>,
}

impl EchoTracker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            expires: HashMap::new(),
        }
    }

    pub fn remember(&mut self, id: CorrelationId, now: Instant) {
        self.prune(now);
        self.expires.insert(id, now + self.ttl);
    }

    pub fn is_local(&self, id: &CorrelationId, now: Instant) -> bool {
        self.expires.get(id).is_some_and(|until| now < *until)
    }

    pub fn len(&self) -> usize {
        self.expires.len()
    }

    pub fn is_empty(&self) -> bool {
        self.expires.is_empty()
    }

    fn prune(&mut self, now: Instant) {
        self.expires.retain(|_, until| now < *until);
    }
}

/// Local state the decision chain consults.
#[derive(Debug, Clone, Copy)]
pub struct Guards<'a> {
    pub ledger: &'a PendingChangeLedger,
    pub in_flight: Option<&'a LedgerSnapshot>,
    pub protection: Option<&'a ProtectionWindow>,
}

impl<'a> Guards<'a> {
    pub fn new(ledger: &'a PendingChangeLedger) -> Self {
        Self {
            ledger,
            in_flight: None,
            protection: None,
        }
    }

    /// Target position of an uncommitted local intent, including one that is
    /// being saved right now. The ledger holds the newer value.
    pub fn pending_target(&self, id: &OrderId) -> Option<i64> {
        self.ledger
            .get(id)
            .or_else(|| self.in_flight.and_then(|s| s.get(id)))
            .map(|intent| intent.target_sort_order)
    }
}

/// What one reconcile pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub applied: Vec<OrderId>,
    pub created: Vec<OrderId>,
    pub deleted: Vec<OrderId>,
    pub dropped: Vec<(OrderId, DropReason)>,
    pub resorted: Vec<GroupKey>,
}

impl ReconcileReport {
    pub fn changed_view(&self) -> bool {
        !(self.applied.is_empty() && self.created.is_empty() && self.deleted.is_empty())
    }
}

/// Field changes accumulated for one order during a pass.
#[derive(Debug)]
struct Merged {
    fields: ChangedFields,
    by: ActorId,
    at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct RealtimeReconciler {
    local_actor: ActorId,
    group: GroupKey,
    self_echo_window: Duration,
    echoes: EchoTracker,
}

impl RealtimeReconciler {
    pub fn new(local_actor: ActorId, group: GroupKey, config: &SyncConfig) -> Self {
        Self {
            local_actor,
            group,
            self_echo_window: config.self_echo_window(),
            echoes: EchoTracker::new(config.correlation_ttl()),
        }
    }

    /// Register the correlation id of a mutation this session sent.
    pub fn remember_local(&mut self, id: CorrelationId, now: Instant) {
        self.echoes.remember(id, now);
    }

    pub fn echoes(&self) -> &EchoTracker {
        &self.echoes
    }

    /// Run the decision chain for one classified event about `order_id`.
    pub fn decide(
        &self,
        event: &ChangeEvent,
        change: &InboundChange,
        order_id: &OrderId,
        guards: &Guards<'_>,
        now: Instant,
        wall_now: DateTime<Utc>,
    ) -> Verdict {
        if matches!(change, InboundChange::Deleted) {
            return Verdict::Delete;
        }

        let from_local_actor = event.updated_by == self.local_actor;
        let echo = match &event.correlation_id {
            Some(id) => self.echoes.is_local(id, now),
            None => from_local_actor && !change.is_positional(),
        };
        if echo {
            return Verdict::Drop(DropReason::SelfEcho);
        }

        if change.is_positional() && guards.pending_target(order_id).is_some() {
            return Verdict::Drop(DropReason::PendingIntent);
        }

        if !event.from_refresh && guards.protection.is_some_and(|p| p.covers(order_id, now)) {
            return Verdict::Drop(DropReason::ProtectionWindow);
        }

        if from_local_actor && event.is_drag_operation && self.is_recent(event.timestamp, wall_now) {
            return Verdict::Drop(DropReason::RecentSelfDrag);
        }

        Verdict::Apply
    }

    /// Apply one tick's worth of events to `store`.
    pub fn reconcile(
        &mut self,
        store: &mut OrderStore,
        guards: Guards<'_>,
        events: Vec<ChangeEvent>,
        now: Instant,
        wall_now: DateTime<Utc>,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let mut merged: BTreeMap<OrderId, Merged> = BTreeMap::new();
        let mut touched: BTreeSet<GroupKey> = BTreeSet::new();

        for event in events {
            let change = match event.classify() {
                Ok(change) => change,
                Err(err) => {
                    tracing::warn!(error = %err, "invalid change event dropped");
                    report.dropped.push((event.order_id, DropReason::Invalid));
                    continue;
                }
            };

            let order_id = match &change {
                InboundChange::Created(order) => order.id.clone(),
                _ => match store.resolve(&event.order_id, event.secondary_id.as_deref()) {
                    Some(id) => id,
                    None => {
                        tracing::warn!(
                            order_id = %event.order_id,
                            kind = ?event.kind,
                            "change for unknown order dropped",
                        );
                        report.dropped.push((event.order_id, DropReason::UnknownOrder));
                        continue;
                    }
                },
            };

            match self.decide(&event, &change, &order_id, &guards, now, wall_now) {
                Verdict::Drop(reason) => {
                    tracing::debug!(order_id = %order_id, reason = ?reason, "inbound change suppressed");
                    report.dropped.push((order_id, reason));
                }
                Verdict::Delete => {
                    merged.remove(&order_id);
                    if store.remove(&order_id).is_some() {
                        tracing::debug!(order_id = %order_id, "order deleted");
                        report.deleted.push(order_id);
                    }
                }
                Verdict::Apply => match change {
                    InboundChange::Created(order) if order.group_key != self.group => {
                        merged.remove(&order_id);
                        if store.remove(&order_id).is_some() {
                            tracing::debug!(
                                order_id = %order_id,
                                group = %order.group_key,
                                "order moved to another board",
                            );
                            report.deleted.push(order_id);
                        } else {
                            tracing::debug!(
                                order_id = %order_id,
                                group = %order.group_key,
                                "created order belongs to another board",
                            );
                            report.dropped.push((order_id, DropReason::ForeignGroup));
                        }
                    }
                    InboundChange::Created(mut order) => {
                        merged.remove(&order_id);
                        if let Some(target) = guards.pending_target(&order_id) {
                            order.sort_order = Some(target);
                        }
                        touched.insert(store.insert_or_replace(order));
                        report.created.push(order_id);
                    }
                    other => {
                        let fields = other.fields();
                        match merged.get_mut(&order_id) {
                            Some(entry) => {
                                entry.fields.merge(fields);
                                entry.by = event.updated_by;
                                entry.at = event.timestamp;
                            }
                            None => {
                                merged.insert(
                                    order_id,
                                    Merged {
                                        fields,
                                        by: event.updated_by,
                                        at: event.timestamp,
                                    },
                                );
                            }
                        }
                    }
                },
            }
        }

        for (order_id, entry) in merged {
            let mut changed = false;
            let result = store.modify(&order_id, |order| {
                changed = entry.fields.apply_to(order);
                if changed {
                    order.last_modified_by = Some(entry.by);
                    order.last_modified_at = Some(entry.at);
                }
            });
            match result {
                Ok(group) if changed => {
                    touched.insert(group);
                    report.applied.push(order_id);
                }
                Ok(_) => {}
                // Deleted later in the same batch.
                Err(_) => {}
            }
        }

        for group in touched {
            store.resort(&group);
            report.resorted.push(group);
        }
        report
    }

    fn is_recent(&self, at: DateTime<Utc>, wall_now: DateTime<Utc>) -> bool {
        match (wall_now - at).to_std() {
            Ok(age) => age <= self.self_echo_window,
            // Timestamp in the future: clock skew, still recent.
            Err(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsboard_core::{Order, OrderStatus};

    fn g() -> GroupKey {
        GroupKey::from("g")
    }

    fn store() -> OrderStore {
        OrderStore::from_orders(vec![
            Order::new("A", "g").with_sort_order(10),
            Order::new("B", "g").with_sort_order(20).with_secondary_id("ext-B"),
            Order::new("C", "g").with_sort_order(30),
        ])
    }

    fn reconciler() -> RealtimeReconciler {
        RealtimeReconciler::new(ActorId::from("kim"), g(), &SyncConfig::default())
    }

    fn sort_event(id: &str, sort_order: i64, by: &str) -> ChangeEvent {
        ChangeEvent::updated(
            id,
            ChangedFields {
                sort_order: Some(sort_order),
                ..ChangedFields::default()
            },
            by,
            Utc::now() - chrono::Duration::minutes(5),
        )
    }

    fn status_event(id: &str, status: OrderStatus, by: &str) -> ChangeEvent {
        ChangeEvent::updated(
            id,
            ChangedFields {
                status: Some(status),
                ..ChangedFields::default()
            },
            by,
            Utc::now(),
        )
    }

    fn ids(store: &OrderStore) -> Vec<String> {
        store.display_order(&g()).into_iter().map(|id| id.0).collect()
    }

    #[test]
    fn remote_move_is_applied_and_resorted() {
        let mut store = store();
        let ledger = PendingChangeLedger::new();
        let report = reconciler().reconcile(
            &mut store,
            Guards::new(&ledger),
            vec![sort_event("A", 25, "lee")],
            Instant::now(),
            Utc::now(),
        );
        assert_eq!(report.applied, vec![OrderId::from("A")]);
        assert_eq!(report.resorted, vec![g()]);
        assert_eq!(ids(&store), ["B", "A", "C"]);
    }

    #[test]
    fn pending_intent_blocks_positional_change() {
        let mut store = store();
        let mut ledger = PendingChangeLedger::new();
        ledger.record_intent(OrderId::from("A"), 25, Utc::now());
        let report = reconciler().reconcile(
            &mut store,
            Guards::new(&ledger),
            vec![sort_event("A", 5, "lee")],
            Instant::now(),
            Utc::now(),
        );
        assert_eq!(report.dropped, vec![(OrderId::from("A"), DropReason::PendingIntent)]);
        assert_eq!(store.get(&OrderId::from("A")).unwrap().sort_order, Some(10));
    }

    #[test]
    fn in_flight_snapshot_also_blocks() {
        let mut store = store();
        let mut ledger = PendingChangeLedger::new();
        ledger.record_intent(OrderId::from("A"), 25, Utc::now());
        let snapshot = ledger.commit();
        let guards = Guards {
            ledger: &ledger,
            in_flight: Some(&snapshot),
            protection: None,
        };
        let report = reconciler().reconcile(
            &mut store,
            guards,
            vec![sort_event("A", 5, "lee")],
            Instant::now(),
            Utc::now(),
        );
        assert_eq!(report.dropped[0].1, DropReason::PendingIntent);
    }

    #[test]
    fn pending_intent_does_not_block_status_change() {
        let mut store = store();
        let mut ledger = PendingChangeLedger::new();
        ledger.record_intent(OrderId::from("A"), 25, Utc::now());
        let report = reconciler().reconcile(
            &mut store,
            Guards::new(&ledger),
            vec![status_event("A", OrderStatus::Completed, "lee")],
            Instant::now(),
            Utc::now(),
        );
        assert_eq!(report.applied, vec![OrderId::from("A")]);
        assert_eq!(ids(&store), ["B", "C", "A"]);
    }

    #[test]
    fn delete_wins_over_pending_intent() {
        let mut store = store();
        let mut ledger = PendingChangeLedger::new();
        ledger.record_intent(OrderId::from("A"), 25, Utc::now());
        let report = reconciler().reconcile(
            &mut store,
            Guards::new(&ledger),
            vec![ChangeEvent::deleted("A", "kim", Utc::now())],
            Instant::now(),
            Utc::now(),
        );
        assert_eq!(report.deleted, vec![OrderId::from("A")]);
        assert!(!store.contains(&OrderId::from("A")));
        assert!(ledger.has_pending_intent(&OrderId::from("A")));
    }

    #[test]
    fn correlated_echo_is_dropped() {
        let mut store = store();
        let ledger = PendingChangeLedger::new();
        let mut reconciler = reconciler();
        let cid = CorrelationId::new();
        let now = Instant::now();
        reconciler.remember_local(cid, now);

        let mut event = status_event("A", OrderStatus::Assigned, "kim");
        event.correlation_id = Some(cid);
        let report = reconciler.reconcile(&mut store, Guards::new(&ledger), vec![event], now, Utc::now());
        assert_eq!(report.dropped, vec![(OrderId::from("A"), DropReason::SelfEcho)]);
        assert_eq!(store.get(&OrderId::from("A")).unwrap().status, OrderStatus::Unassigned);
    }

    #[test]
    fn foreign_correlation_id_from_same_actor_applies() {
        let mut store = store();
        let ledger = PendingChangeLedger::new();
        let mut event = status_event("A", OrderStatus::Assigned, "kim");
        event.correlation_id = Some(CorrelationId::new());
        let report = reconciler().reconcile(
            &mut store,
            Guards::new(&ledger),
            vec![event],
            Instant::now(),
            Utc::now(),
        );
        assert_eq!(report.applied, vec![OrderId::from("A")]);
    }

    #[test]
    fn uncorrelated_own_status_change_is_echo() {
        let mut store = store();
        let ledger = PendingChangeLedger::new();
        let report = reconciler().reconcile(
            &mut store,
            Guards::new(&ledger),
            vec![status_event("A", OrderStatus::Assigned, "kim")],
            Instant::now(),
            Utc::now(),
        );
        assert_eq!(report.dropped[0].1, DropReason::SelfEcho);
    }

    #[test]
    fn recent_own_drag_is_dropped_but_old_one_applies() {
        let mut store = store();
        let ledger = PendingChangeLedger::new();
        let mut recent = sort_event("A", 25, "kim");
        recent.timestamp = Utc::now();
        recent.is_drag_operation = true;
        let mut old = sort_event("B", 35, "kim");
        old.is_drag_operation = true;

        let report = reconciler().reconcile(
            &mut store,
            Guards::new(&ledger),
            vec![recent, old],
            Instant::now(),
            Utc::now(),
        );
        assert_eq!(report.dropped, vec![(OrderId::from("A"), DropReason::RecentSelfDrag)]);
        assert_eq!(report.applied, vec![OrderId::from("B")]);
    }

    #[test]
    fn unknown_order_is_dropped_not_fatal() {
        let mut store = store();
        let ledger = PendingChangeLedger::new();
        let report = reconciler().reconcile(
            &mut store,
            Guards::new(&ledger),
            vec![sort_event("Z", 1, "lee"), sort_event("A", 25, "lee")],
            Instant::now(),
            Utc::now(),
        );
        assert_eq!(report.dropped, vec![(OrderId::from("Z"), DropReason::UnknownOrder)]);
        assert_eq!(report.applied, vec![OrderId::from("A")]);
    }

    #[test]
    fn secondary_id_resolves() {
        let mut store = store();
        let ledger = PendingChangeLedger::new();
        let mut event = sort_event("unknown", 1, "lee");
        event.secondary_id = Some("ext-B".into());
        reconciler().reconcile(&mut store, Guards::new(&ledger), vec![event], Instant::now(), Utc::now());
        assert_eq!(ids(&store), ["B", "A", "C"]);
    }

    #[test]
    fn batch_merges_fields_per_order() {
        let mut store = store();
        let ledger = PendingChangeLedger::new();
        let notes = ChangeEvent::updated(
            "A",
            ChangedFields {
                notes: Some("fragile".into()),
                ..ChangedFields::default()
            },
            "lee",
            Utc::now(),
        );
        let report = reconciler().reconcile(
            &mut store,
            Guards::new(&ledger),
            vec![sort_event("A", 25, "lee"), notes, sort_event("A", 35, "lee")],
            Instant::now(),
            Utc::now(),
        );
        assert_eq!(report.applied, vec![OrderId::from("A")]);
        assert_eq!(report.resorted, vec![g()]);
        let a = store.get(&OrderId::from("A")).unwrap();
        assert_eq!(a.sort_order, Some(35));
        assert_eq!(a.notes, "fragile");
    }

    #[test]
    fn created_snapshot_keeps_pending_position() {
        let mut store = store();
        let mut ledger = PendingChangeLedger::new();
        ledger.record_intent(OrderId::from("A"), 25, Utc::now());
        let snapshot = Order::new("A", "g").with_sort_order(1);
        let report = reconciler().reconcile(
            &mut store,
            Guards::new(&ledger),
            vec![ChangeEvent::created(snapshot, "ingest", Utc::now())],
            Instant::now(),
            Utc::now(),
        );
        assert_eq!(report.created, vec![OrderId::from("A")]);
        assert_eq!(store.get(&OrderId::from("A")).unwrap().sort_order, Some(25));
        assert_eq!(ids(&store), ["B", "A", "C"]);
    }

    #[test]
    fn created_event_without_snapshot_is_invalid() {
        let mut store = store();
        let ledger = PendingChangeLedger::new();
        let mut event = ChangeEvent::created(Order::new("D", "g"), "ingest", Utc::now());
        event.order = None;
        let report = reconciler().reconcile(
            &mut store,
            Guards::new(&ledger),
            vec![event],
            Instant::now(),
            Utc::now(),
        );
        assert_eq!(report.dropped[0].1, DropReason::Invalid);
        assert_eq!(store.len(), 3);
    }

    fn protected_a(now: Instant) -> ProtectionWindow {
        ProtectionWindow::new([OrderId::from("A")], now + Duration::from_secs(3))
    }

    #[test]
    fn protection_window_blocks_remote_update() {
        let mut store = store();
        let ledger = PendingChangeLedger::new();
        let now = Instant::now();
        let window = protected_a(now);
        let guards = Guards {
            protection: Some(&window),
            ..Guards::new(&ledger)
        };
        let report = reconciler().reconcile(
            &mut store,
            guards,
            vec![sort_event("A", 25, "lee"), sort_event("B", 5, "lee")],
            now,
            Utc::now(),
        );
        assert_eq!(report.dropped, vec![(OrderId::from("A"), DropReason::ProtectionWindow)]);
        assert_eq!(report.applied, vec![OrderId::from("B")]);
        assert_eq!(store.get(&OrderId::from("A")).unwrap().sort_order, Some(10));
    }

    #[test]
    fn refresh_event_passes_protection_window() {
        let mut store = store();
        let ledger = PendingChangeLedger::new();
        let now = Instant::now();
        let window = protected_a(now);
        let guards = Guards {
            protection: Some(&window),
            ..Guards::new(&ledger)
        };
        let mut event = sort_event("A", 25, "lee");
        event.from_refresh = true;
        let report = reconciler().reconcile(&mut store, guards, vec![event], now, Utc::now());
        assert!(report.dropped.is_empty());
        assert_eq!(report.applied, vec![OrderId::from("A")]);
        assert_eq!(ids(&store), ["B", "A", "C"]);
    }

    #[test]
    fn expired_protection_window_applies() {
        let mut store = store();
        let ledger = PendingChangeLedger::new();
        let now = Instant::now();
        let window = protected_a(now);
        let guards = Guards {
            protection: Some(&window),
            ..Guards::new(&ledger)
        };
        let report = reconciler().reconcile(
            &mut store,
            guards,
            vec![sort_event("A", 25, "lee")],
            window.until(),
            Utc::now(),
        );
        assert_eq!(report.applied, vec![OrderId::from("A")]);
    }

    #[test]
    fn created_order_for_another_board_is_not_kept() {
        let mut store = store();
        let ledger = PendingChangeLedger::new();
        let report = reconciler().reconcile(
            &mut store,
            Guards::new(&ledger),
            vec![ChangeEvent::created(
                Order::new("D", "other").with_sort_order(5),
                "ingest",
                Utc::now(),
            )],
            Instant::now(),
            Utc::now(),
        );
        assert_eq!(report.dropped, vec![(OrderId::from("D"), DropReason::ForeignGroup)]);
        assert!(!store.contains(&OrderId::from("D")));
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn order_moved_to_another_board_leaves_this_one() {
        let mut store = store();
        let ledger = PendingChangeLedger::new();
        let report = reconciler().reconcile(
            &mut store,
            Guards::new(&ledger),
            vec![ChangeEvent::created(Order::new("B", "other"), "ingest", Utc::now())],
            Instant::now(),
            Utc::now(),
        );
        assert_eq!(report.deleted, vec![OrderId::from("B")]);
        assert!(store.groups().all(|group| group == &g()));
        assert_eq!(ids(&store), ["A", "C"]);
    }

    #[test]
    fn echo_tracker_forgets_after_ttl() {
        let mut tracker = EchoTracker::new(Duration::from_secs(1));
        let now = Instant::now();
        let cid = CorrelationId::new();
        tracker.remember(cid, now);
        assert!(tracker.is_local(&cid, now));
        assert!(!tracker.is_local(&cid, now + Duration::from_secs(1)));
        tracker.remember(CorrelationId::new(), now + Duration::from_secs(2));
        assert_eq!(tracker.len(), 1);
    }
}
