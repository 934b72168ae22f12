//! Tokio session runtime.
//!
//! One task owns the [`BoardSession`] and is the only place it is mutated.
//! It multiplexes:
//!
//! - commands from [`SessionHandle`]s (move, status change, save, snapshot)
//! - push events, batched per tick before one reconcile pass
//! - signal poll ticks (the fallback when push is degraded)
//! - completions of network work running in spawned tasks
//!
//! Network tasks never touch session state; they report back through the
//! completion channel.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use opsboard_core::{ActorId, ChangeEvent, MoveIntent, Order, OrderId, OrderStatus};

use crate::coordinator::{run_save, SaveJob, SaveOutcome, SaveReport, SaveState};
use crate::error::{PersistError, SyncError};
use crate::persistence::PersistenceService;
use crate::session::BoardSession;
use crate::signal::{SignalDecision, SignalStore, SignalToken};

/// Point-in-time view of a running session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardSnapshot {
    pub orders: Vec<Order>,
    pub pending: usize,
    pub save_state: SaveState,
    pub last_signal_seen: Option<DateTime<Utc>>,
}

impl BoardSnapshot {
    pub fn display_order(&self) -> Vec<OrderId> {
        self.orders.iter().map(|o| o.id.clone()).collect()
    }
}

enum SessionCommand {
    Move {
        intent: MoveIntent,
        respond_to: oneshot::Sender<Result<Vec<Order>, SyncError>>,
    },
    ChangeStatus {
        order_id: OrderId,
        status: OrderStatus,
        assignee: Option<ActorId>,
        respond_to: oneshot::Sender<Result<Order, SyncError>>,
    },
    Save {
        respond_to: oneshot::Sender<Result<Option<SaveReport>, SyncError>>,
    },
    Snapshot {
        respond_to: oneshot::Sender<BoardSnapshot>,
    },
}

enum Completion {
    Saved {
        job: SaveJob,
        outcome: SaveOutcome,
        respond_to: oneshot::Sender<Result<Option<SaveReport>, SyncError>>,
    },
    StatusPersisted {
        order_id: OrderId,
        result: Result<(), PersistError>,
    },
    SignalRead(Result<Option<SignalToken>, SyncError>),
    Refreshed(Result<Vec<Order>, PersistError>),
}

/// Client side of a running session.
#[derive(Debug)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<BoardSession>,
}

impl SessionHandle {
    pub async fn move_order(&self, intent: MoveIntent) -> Result<Vec<Order>, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::Move {
            intent,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| SyncError::ChannelClosed("move response"))?
    }

    /// Apply a status change. Returns once applied locally; persistence runs
    /// in the background and a failure resyncs the board.
    pub async fn change_status(
        &self,
        order_id: OrderId,
        status: OrderStatus,
        assignee: Option<ActorId>,
    ) -> Result<Order, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::ChangeStatus {
            order_id,
            status,
            assignee,
            respond_to: tx,
        })
        .await?;
        rx.await
            .map_err(|_| SyncError::ChannelClosed("status response"))?
    }

    /// Save pending intents. Resolves once the save is committed (and its
    /// signal published) or has failed.
    pub async fn save(&self) -> Result<Option<SaveReport>, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::Save { respond_to: tx }).await?;
        rx.await.map_err(|_| SyncError::ChannelClosed("save response"))?
    }

    pub async fn snapshot(&self) -> Result<BoardSnapshot, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::Snapshot { respond_to: tx }).await?;
        rx.await
            .map_err(|_| SyncError::ChannelClosed("snapshot response"))
    }

    /// Stop the session task and get the session back.
    pub async fn shutdown(self) -> Result<BoardSession, SyncError> {
        let _ = self.shutdown.send(());
        self.task
            .await
            .map_err(|_| SyncError::ChannelClosed("session task"))
    }

    async fn send(&self, command: SessionCommand) -> Result<(), SyncError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SyncError::ChannelClosed("session commands"))
    }
}

/// Spawn the task that owns `session`.
pub fn spawn_session(
    session: BoardSession,
    persistence: Arc<dyn PersistenceService>,
    signals: Arc<dyn SignalStore>,
    push: mpsc::UnboundedReceiver<ChangeEvent>,
) -> SessionHandle {
    let (command_tx, command_rx) = mpsc::channel::<SessionCommand>(64);
    let (shutdown_tx, _) = broadcast::channel::<()>(4);
    let shutdown_rx = shutdown_tx.subscribe();
    let task = tokio::spawn(session_task(
        session,
        persistence,
        signals,
        push,
        command_rx,
        shutdown_rx,
    ));
    SessionHandle {
        commands: command_tx,
        shutdown: shutdown_tx,
        task,
    }
}

struct Context {
    persistence: Arc<dyn PersistenceService>,
    signals: Arc<dyn SignalStore>,
    completions: mpsc::UnboundedSender<Completion>,
}

async fn session_task(
    mut session: BoardSession,
    persistence: Arc<dyn PersistenceService>,
    signals: Arc<dyn SignalStore>,
    mut push: mpsc::UnboundedReceiver<ChangeEvent>,
    mut commands: mpsc::Receiver<SessionCommand>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> BoardSession {
    let (completion_tx, mut completions) = mpsc::unbounded_channel::<Completion>();
    let ctx = Context {
        persistence,
        signals,
        completions: completion_tx,
    };

    let batch_tick = session.config().batch_tick();
    let mut poll = tokio::time::interval(
        session
            .config()
            .signal_poll_interval(session.actor().privileged),
    );
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
    poll.tick().await; // consume the first immediate tick

    let mut batch: Vec<ChangeEvent> = Vec::new();
    let mut flush_at = Instant::now();
    let mut push_open = true;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            maybe_command = commands.recv() => {
                let Some(command) = maybe_command else { break };
                handle_command(&mut session, &ctx, command);
            }
            event = push.recv(), if push_open => match event {
                Some(event) => {
                    if batch.is_empty() {
                        flush_at = Instant::now() + batch_tick;
                    }
                    batch.push(event);
                }
                None => {
                    push_open = false;
                    tracing::warn!("push channel closed; relying on signal polling");
                }
            },
            _ = tokio::time::sleep_until(flush_at), if !batch.is_empty() => {
                let report = session.handle_events(std::mem::take(&mut batch));
                tracing::debug!(
                    applied = report.applied.len(),
                    created = report.created.len(),
                    deleted = report.deleted.len(),
                    dropped = report.dropped.len(),
                    "inbound batch reconciled",
                );
            }
            _ = poll.tick() => {
                let signals = ctx.signals.clone();
                let completions = ctx.completions.clone();
                tokio::spawn(async move {
                    let _ = completions.send(Completion::SignalRead(signals.read().await));
                });
            }
            Some(completion) = completions.recv() => {
                handle_completion(&mut session, &ctx, completion);
            }
        }
    }

    if !batch.is_empty() {
        session.handle_events(batch);
    }
    tracing::info!(session_id = %session.session_id(), "session stopped");
    session
}

fn handle_command(session: &mut BoardSession, ctx: &Context, command: SessionCommand) {
    match command {
        SessionCommand::Move { intent, respond_to } => {
            let _ = respond_to.send(session.move_order(&intent));
        }
        SessionCommand::ChangeStatus {
            order_id,
            status,
            assignee,
            respond_to,
        } => match session.change_status(&order_id, status, assignee) {
            Ok(applied) => {
                let persistence = ctx.persistence.clone();
                let completions = ctx.completions.clone();
                let update = applied.update;
                let order_id = applied.order.id.clone();
                tokio::spawn(async move {
                    let result = persistence.update_order(&order_id, &update).await;
                    let _ = completions.send(Completion::StatusPersisted { order_id, result });
                });
                let _ = respond_to.send(Ok(applied.order));
            }
            Err(err) => {
                let _ = respond_to.send(Err(err));
            }
        },
        SessionCommand::Save { respond_to } => match session.begin_save() {
            Ok(Some(job)) => {
                let persistence = ctx.persistence.clone();
                let completions = ctx.completions.clone();
                tokio::spawn(async move {
                    let outcome = run_save(&job, persistence.as_ref()).await;
                    let _ = completions.send(Completion::Saved {
                        job,
                        outcome,
                        respond_to,
                    });
                });
            }
            Ok(None) => {
                let _ = respond_to.send(Ok(None));
            }
            Err(err) => {
                let _ = respond_to.send(Err(err));
            }
        },
        SessionCommand::Snapshot { respond_to } => {
            let _ = respond_to.send(BoardSnapshot {
                orders: session.orders().to_vec(),
                pending: session.ledger().len(),
                save_state: session.save_state(),
                last_signal_seen: session.last_signal_seen(),
            });
        }
    }
}

fn handle_completion(session: &mut BoardSession, ctx: &Context, completion: Completion) {
    match completion {
        Completion::Saved {
            job,
            outcome,
            respond_to,
        } => match session.finish_save(&job, outcome) {
            Ok(report) => {
                let signals = ctx.signals.clone();
                tokio::spawn(async move {
                    if let Err(err) = signals.publish(&report.token).await {
                        tracing::warn!(error = %err, "signal publish failed");
                    }
                    let _ = respond_to.send(Ok(Some(report)));
                });
            }
            Err(err) => {
                let _ = respond_to.send(Err(err));
            }
        },
        Completion::StatusPersisted { order_id, result } => {
            if let Err(err) = result {
                tracing::warn!(order_id = %order_id, error = %err, "status save failed; resyncing");
                spawn_refresh(session, ctx);
            }
        }
        Completion::SignalRead(Ok(Some(token))) => {
            if let SignalDecision::Resync { .. } = session.observe_signal(&token) {
                spawn_refresh(session, ctx);
            }
        }
        Completion::SignalRead(Ok(None)) => {}
        Completion::SignalRead(Err(err)) => {
            tracing::warn!(error = %err, "signal poll failed");
        }
        Completion::Refreshed(Ok(orders)) => {
            session.resync(orders);
            tracing::info!(group = %session.group(), orders = session.orders().len(), "board resynced");
        }
        Completion::Refreshed(Err(err)) => {
            tracing::warn!(error = %err, "refresh failed; next poll retries");
        }
    }
}

fn spawn_refresh(session: &BoardSession, ctx: &Context) {
    let persistence = ctx.persistence.clone();
    let completions = ctx.completions.clone();
    let group = session.group().clone();
    tokio::spawn(async move {
        let result = persistence.fetch_group(&group).await;
        let _ = completions.send(Completion::Refreshed(result));
    });
}
