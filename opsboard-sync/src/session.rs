//! One open board: the synchronous state machine behind a session.
//!
//! [`BoardSession`] owns the store, the ledger, the save coordinator, the
//! reconciler and the signal watcher. Every transition is synchronous; the
//! async helpers at the bottom only sequence network calls around them.
//! [`crate::runtime`] drives the same transitions from a tokio task.

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use opsboard_core::apply::{apply_reorder, apply_status_change, ensure_can_reorder};
use opsboard_core::position::plan_move;
use opsboard_core::{
    Actor, ActorId, BoardError, ChangeEvent, ChangedFields, CorrelationId, GroupKey, MoveIntent, Order,
    OrderId, OrderStatus, OrderStore, PendingChangeLedger, SessionId, SyncConfig,
};

use crate::coordinator::{
    reapply_pending, run_save, SaveCoordinator, SaveJob, SaveOutcome, SaveReport, SaveState,
};
use crate::error::SyncError;
use crate::persistence::{OrderUpdate, PersistenceService};
use crate::reconciler::{Guards, ReconcileReport, RealtimeReconciler};
use crate::signal::{SignalDecision, SignalStore, SignalToken, SignalWatcher};

/// A locally applied status change, ready to be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub order: Order,
    pub update: OrderUpdate,
}

#[derive(Debug)]
pub struct BoardSession {
    actor: Actor,
    session_id: SessionId,
    group: GroupKey,
    config: SyncConfig,
    store: OrderStore,
    ledger: PendingChangeLedger,
    coordinator: SaveCoordinator,
    reconciler: RealtimeReconciler,
    watcher: SignalWatcher,
}

impl BoardSession {
    /// An empty session. Use [`BoardSession::open`] to load from the source.
    pub fn new(actor: Actor, group: GroupKey, config: SyncConfig) -> Self {
        let session_id = SessionId::new();
        Self {
            coordinator: SaveCoordinator::new(config.protection_window()),
            reconciler: RealtimeReconciler::new(actor.id.clone(), group.clone(), &config),
            watcher: SignalWatcher::new(session_id, actor.id.clone(), group.clone()),
            store: OrderStore::new(),
            ledger: PendingChangeLedger::new(),
            actor,
            session_id,
            group,
            config,
        }
    }

    /// Load `group` from the source. The signal token present at load time is
    /// already reflected and will not trigger a resync.
    pub async fn open(
        actor: Actor,
        group: GroupKey,
        config: SyncConfig,
        persistence: &dyn PersistenceService,
        signals: &dyn SignalStore,
    ) -> Result<Self, SyncError> {
        let mut session = Self::new(actor, group, config);
        let orders = persistence.fetch_group(&session.group).await?;
        session.resync(orders);
        if let Some(token) = signals.read().await? {
            session.watcher.mark_seen(token.timestamp);
        }
        tracing::info!(
            group = %session.group,
            session_id = %session.session_id,
            orders = session.store.len(),
            "session opened",
        );
        Ok(session)
    }

    pub fn actor(&self) -> &Actor {
        &self.actor
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn group(&self) -> &GroupKey {
        &self.group
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &OrderStore {
        &self.store
    }

    pub fn ledger(&self) -> &PendingChangeLedger {
        &self.ledger
    }

    pub fn save_state(&self) -> SaveState {
        self.coordinator.state()
    }

    pub fn orders(&self) -> &[Order] {
        self.store.group(&self.group)
    }

    pub fn display_order(&self) -> Vec<OrderId> {
        self.store.display_order(&self.group)
    }

    // -----------------------------------------------------------------------
    // Local intents
    // -----------------------------------------------------------------------

    /// Move an order before/after another one and record the resulting
    /// positions as pending intents. Returns the orders whose position changed.
    pub fn move_order(&mut self, intent: &MoveIntent) -> Result<Vec<Order>, SyncError> {
        ensure_can_reorder(&self.actor)?;
        let group = self
            .store
            .get(&intent.order_id)
            .map(|o| o.group_key.clone())
            .ok_or_else(|| BoardError::UnknownOrder(intent.order_id.clone()))?;
        let changes = plan_move(self.store.group(&group), intent, self.config.sort_gap)?;

        let now = Utc::now();
        let mut moved = Vec::with_capacity(changes.len());
        for (order_id, target) in changes {
            moved.push(apply_reorder(&mut self.store, &self.actor, &order_id, target, now)?);
            self.ledger.record_intent(order_id, target, now);
        }
        tracing::debug!(
            order_id = %intent.order_id,
            anchor = %intent.anchor,
            changes = moved.len(),
            "move recorded",
        );
        Ok(moved)
    }

    /// Set an explicit position for one order and record it as pending.
    pub fn set_sort_order(&mut self, order_id: &OrderId, target: i64) -> Result<Order, SyncError> {
        let now = Utc::now();
        let order = apply_reorder(&mut self.store, &self.actor, order_id, target, now)?;
        self.ledger.record_intent(order_id.clone(), target, now);
        Ok(order)
    }

    /// Apply a status change locally and prepare its persistence update. The
    /// update's correlation id is registered so its echo is recognised.
    pub fn change_status(
        &mut self,
        order_id: &OrderId,
        status: OrderStatus,
        assignee: Option<ActorId>,
    ) -> Result<StatusUpdate, SyncError> {
        let now = Utc::now();
        let order = apply_status_change(&mut self.store, order_id, status, assignee, &self.actor, now)?;
        let correlation_id = CorrelationId::new();
        self.reconciler.remember_local(correlation_id, Instant::now());
        Ok(StatusUpdate {
            update: OrderUpdate {
                fields: ChangedFields {
                    status: Some(order.status),
                    assigned_to: Some(order.assigned_to.clone()),
                    ..ChangedFields::default()
                },
                actor: self.actor.id.clone(),
                timestamp: now,
                correlation_id,
                is_drag_operation: false,
            },
            order,
        })
    }

    /// Drop every pending intent. The caller restores the view with
    /// [`BoardSession::refresh`] or [`BoardSession::resync`].
    pub fn discard_pending(&mut self) {
        tracing::info!(pending = self.ledger.len(), "pending changes discarded");
        self.ledger.rollback();
    }

    // -----------------------------------------------------------------------
    // Save
    // -----------------------------------------------------------------------

    pub fn begin_save(&mut self) -> Result<Option<SaveJob>, SyncError> {
        let job = self
            .coordinator
            .begin(&mut self.ledger, &self.store, &self.actor, &self.group, Utc::now())?;
        if let Some(job) = &job {
            self.reconciler
                .remember_local(job.request.correlation_id, Instant::now());
        }
        Ok(job)
    }

    pub fn finish_save(&mut self, job: &SaveJob, outcome: SaveOutcome) -> Result<SaveReport, SyncError> {
        let report = self.coordinator.finish(
            job,
            outcome,
            &mut self.store,
            &mut self.ledger,
            self.session_id,
            Instant::now(),
        )?;
        self.watcher.mark_seen(report.token.timestamp);
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Reconcile one tick's worth of inbound events.
    pub fn handle_events(&mut self, events: Vec<ChangeEvent>) -> ReconcileReport {
        let now = Instant::now();
        self.coordinator.expire_protection(now);
        let guards = Guards {
            ledger: &self.ledger,
            in_flight: self.coordinator.in_flight(),
            protection: self.coordinator.protection(),
        };
        self.reconciler
            .reconcile(&mut self.store, guards, events, now, Utc::now())
    }

    pub fn observe_signal(&mut self, token: &SignalToken) -> SignalDecision {
        let decision = self.watcher.observe(token);
        if let SignalDecision::Resync { notify_user, .. } = &decision {
            tracing::info!(
                by = %token.actor_id,
                notify_user = *notify_user,
                "board changed on another device; resync requested",
            );
        }
        decision
    }

    /// Replace the group with authoritative `orders`, keeping pending
    /// positions (in flight and recorded) on top.
    pub fn resync(&mut self, orders: Vec<Order>) {
        self.store.replace_group(&self.group, orders);
        let in_flight = self.coordinator.in_flight().into_iter().flat_map(|s| s.iter());
        reapply_pending(&mut self.store, in_flight.chain(self.ledger.iter()));
    }

    // -----------------------------------------------------------------------
    // Async conveniences
    // -----------------------------------------------------------------------

    /// Save every pending intent and publish the signal token. `Ok(None)`
    /// when nothing was pending.
    pub async fn save(
        &mut self,
        persistence: &dyn PersistenceService,
        signals: &dyn SignalStore,
    ) -> Result<Option<SaveReport>, SyncError> {
        let Some(job) = self.begin_save()? else {
            return Ok(None);
        };
        let outcome = run_save(&job, persistence).await;
        let report = self.finish_save(&job, outcome)?;
        if let Err(err) = signals.publish(&report.token).await {
            tracing::warn!(error = %err, "signal publish failed; other devices will catch up on refresh");
        }
        Ok(Some(report))
    }

    /// Persist a status change. On failure the view is restored from the
    /// source before the error is returned.
    pub async fn persist_status(
        &mut self,
        status: &StatusUpdate,
        persistence: &dyn PersistenceService,
    ) -> Result<(), SyncError> {
        match persistence.update_order(&status.order.id, &status.update).await {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::warn!(order_id = %status.order.id, error = %err, "status save failed; resyncing");
                if let Err(refresh_err) = self.refresh(persistence).await {
                    tracing::warn!(error = %refresh_err, "resync after failed status save failed");
                }
                Err(err.into())
            }
        }
    }

    /// Read the shared token and resync if another session saved since.
    pub async fn poll_signal(
        &mut self,
        signals: &dyn SignalStore,
        persistence: &dyn PersistenceService,
    ) -> Result<SignalDecision, SyncError> {
        let Some(token) = signals.read().await? else {
            return Ok(SignalDecision::Ignore);
        };
        let decision = self.observe_signal(&token);
        if matches!(decision, SignalDecision::Resync { .. }) {
            self.refresh(persistence).await?;
        }
        Ok(decision)
    }

    /// Reload the group from the source.
    pub async fn refresh(&mut self, persistence: &dyn PersistenceService) -> Result<(), SyncError> {
        let orders = persistence.fetch_group(&self.group).await?;
        self.resync(orders);
        Ok(())
    }

    /// Timestamp of the newest signal this session reflects.
    pub fn last_signal_seen(&self) -> Option<DateTime<Utc>> {
        self.watcher.last_seen()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use crate::signal::MemorySignalStore;

    fn orders() -> Vec<Order> {
        vec![
            Order::new("A", "g").with_sort_order(10),
            Order::new("B", "g").with_sort_order(20),
            Order::new("C", "g")
                .with_sort_order(30)
                .with_status(OrderStatus::Completed),
        ]
    }

    fn ids(session: &BoardSession) -> Vec<String> {
        session.display_order().into_iter().map(|id| id.0).collect()
    }

    async fn open(actor: Actor, backend: &MemoryBackend, signals: &MemorySignalStore) -> BoardSession {
        BoardSession::open(actor, GroupKey::from("g"), SyncConfig::default(), backend, signals)
            .await
            .expect("open")
    }

    #[tokio::test]
    async fn move_records_intent_and_updates_view() {
        let backend = MemoryBackend::new(orders());
        let signals = MemorySignalStore::new();
        let mut session = open(Actor::new("kim", "Kim", true), &backend, &signals).await;

        let moved = session.move_order(&MoveIntent::after("A", "B")).expect("move");
        assert_eq!(moved.len(), 1);
        assert_eq!(ids(&session), ["B", "A", "C"]);
        assert_eq!(
            session.ledger().get(&OrderId::from("A")).unwrap().target_sort_order,
            25
        );
    }

    #[tokio::test]
    async fn viewer_cannot_move() {
        let backend = MemoryBackend::new(orders());
        let signals = MemorySignalStore::new();
        let mut session = open(Actor::new("sam", "Sam", false), &backend, &signals).await;

        let err = session.move_order(&MoveIntent::after("A", "B")).unwrap_err();
        assert!(matches!(
            err,
            SyncError::Board(BoardError::PermissionDenied { .. })
        ));
        assert!(session.ledger().is_empty());
        assert_eq!(ids(&session), ["A", "B", "C"]);
    }

    #[tokio::test]
    async fn status_change_registers_its_echo() {
        let backend = MemoryBackend::new(orders());
        let signals = MemorySignalStore::new();
        let mut session = open(Actor::new("sam", "Sam", false), &backend, &signals).await;

        let status = session
            .change_status(&OrderId::from("A"), OrderStatus::Assigned, None)
            .expect("status");
        assert_eq!(status.order.assigned_to, Some(ActorId::from("sam")));
        assert!(session
            .reconciler
            .echoes()
            .is_local(&status.update.correlation_id, Instant::now()));
        session.persist_status(&status, &backend).await.expect("persist");
    }

    #[tokio::test]
    async fn resync_keeps_pending_positions() {
        let backend = MemoryBackend::new(orders());
        let signals = MemorySignalStore::new();
        let mut session = open(Actor::new("kim", "Kim", true), &backend, &signals).await;
        session.move_order(&MoveIntent::after("A", "B")).expect("move");

        session.refresh(&backend).await.expect("refresh");
        assert_eq!(ids(&session), ["B", "A", "C"]);

        session.discard_pending();
        session.refresh(&backend).await.expect("refresh");
        assert_eq!(ids(&session), ["A", "B", "C"]);
    }

    #[tokio::test]
    async fn save_publishes_token_and_marks_it_seen() {
        let backend = MemoryBackend::new(orders());
        let signals = MemorySignalStore::new();
        let mut session = open(Actor::new("kim", "Kim", true), &backend, &signals).await;
        session.move_order(&MoveIntent::after("A", "B")).expect("move");

        let report = session
            .save(&backend, &signals)
            .await
            .expect("save")
            .expect("report");
        let published = signals.read().await.expect("read").expect("token");
        assert_eq!(published, report.token);
        assert_eq!(session.last_signal_seen(), Some(report.token.timestamp));
        assert_eq!(
            session.poll_signal(&signals, &backend).await.expect("poll"),
            SignalDecision::Ignore
        );
    }

    #[tokio::test]
    async fn empty_save_is_noop() {
        let backend = MemoryBackend::new(orders());
        let signals = MemorySignalStore::new();
        let mut session = open(Actor::new("kim", "Kim", true), &backend, &signals).await;
        assert!(session.save(&backend, &signals).await.expect("save").is_none());
        assert!(signals.read().await.expect("read").is_none());
    }
}
