//! `opsboard replay`: scripted multi-client scenarios.
//!
//! A scenario seeds an in-memory backend, opens the local session (and an
//! optional observer session on another device), then runs its steps in
//! order. After every step the local session reconciles whatever the push
//! channel delivered, and the display order is recorded.
//!
//! ```yaml
//! group: store-7
//! actor: { id: kim, display_name: Kim, privileged: true }
//! observer: { id: sam, display_name: Sam }
//! orders:
//!   - { id: A, group_key: store-7, sort_order: 10 }
//! steps:
//!   - { step: move, order: A, after: B }
//!   - { step: remote, order: A, by: lee, sort_order: 15 }
//!   - { step: save }
//!   - { step: signal }
//! ```

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Args;
use colored::Colorize;
use serde::{Deserialize, Serialize};
use tabled::{settings::Style, Table, Tabled};
use tokio::sync::mpsc;

use opsboard_core::{
    config, Actor, ActorId, ChangeEvent, ChangeKind, ChangedFields, GroupKey, MoveIntent, Order,
    OrderId, OrderStatus, SyncConfig,
};
use opsboard_sync::{
    BoardSession, MemoryBackend, MemorySignalStore, Operation, PersistError, PushChannel,
    SignalDecision,
};

/// Arguments for `opsboard replay`.
#[derive(Args, Debug)]
pub struct ReplayArgs {
    /// Scenario file (YAML).
    pub scenario: PathBuf,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

// ---------------------------------------------------------------------------
// Scenario format
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Scenario {
    group: GroupKey,
    actor: Actor,
    #[serde(default)]
    observer: Option<Actor>,
    #[serde(default)]
    config: Option<SyncConfig>,
    orders: Vec<Order>,
    steps: Vec<Step>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
enum Step {
    /// Local gesture: move `order` directly before or after another order.
    Move {
        order: OrderId,
        #[serde(default)]
        after: Option<OrderId>,
        #[serde(default)]
        before: Option<OrderId>,
    },
    /// Local status change, persisted immediately.
    Status {
        order: OrderId,
        to: OrderStatus,
        #[serde(default)]
        assignee: Option<ActorId>,
    },
    /// A change made by someone else, delivered through the push channel.
    Remote(RemoteChange),
    Save,
    /// Make the next save fail.
    FailNextSave {
        error: FailureKind,
        /// For transport failures: let the per-order fallback succeed.
        #[serde(default)]
        fallback_ok: bool,
    },
    /// The observer polls the cross-device signal.
    Signal,
}

#[derive(Debug, Deserialize)]
struct RemoteChange {
    order: OrderId,
    by: ActorId,
    #[serde(default = "default_kind")]
    kind: ChangeKind,
    #[serde(default)]
    sort_order: Option<i64>,
    #[serde(default)]
    status: Option<OrderStatus>,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default)]
    drag: bool,
    /// Full order for `created` changes.
    #[serde(default)]
    snapshot: Option<Order>,
}

fn default_kind() -> ChangeKind {
    ChangeKind::Updated
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum FailureKind {
    Transport,
    Conflict,
    Rejected,
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct StepRecord {
    step: usize,
    action: String,
    outcome: String,
    ok: bool,
    display: Vec<String>,
    pending: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    observer: Option<Vec<String>>,
}

#[derive(Tabled)]
struct StepRow {
    #[tabled(rename = "#")]
    step: usize,
    #[tabled(rename = "step")]
    action: String,
    #[tabled(rename = "outcome")]
    outcome: String,
    #[tabled(rename = "display")]
    display: String,
    #[tabled(rename = "pending")]
    pending: usize,
    #[tabled(rename = "observer")]
    observer: String,
}

impl ReplayArgs {
    pub fn run(self) -> Result<()> {
        let contents = std::fs::read_to_string(&self.scenario)
            .with_context(|| format!("failed to read {}", self.scenario.display()))?;
        let scenario: Scenario = serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse scenario {}", self.scenario.display()))?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to start tokio runtime")?;
        let records = runtime.block_on(replay(scenario))?;

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&records).context("failed to serialize replay JSON")?
            );
        } else {
            print_table(&records);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

async fn replay(scenario: Scenario) -> Result<Vec<StepRecord>> {
    let cfg = match scenario.config {
        Some(cfg) => cfg,
        None => config::load().unwrap_or_else(|err| {
            tracing::warn!(error = %err, "using default config");
            SyncConfig::default()
        }),
    };
    let backend = MemoryBackend::new(scenario.orders);
    let signals = MemorySignalStore::new();

    let mut local = BoardSession::open(
        scenario.actor,
        scenario.group.clone(),
        cfg.clone(),
        &backend,
        &signals,
    )
    .await
    .context("failed to open local session")?;
    let mut push = backend.subscribe();

    let mut observer = match scenario.observer {
        Some(actor) => Some(
            BoardSession::open(actor, scenario.group, cfg, &backend, &signals)
                .await
                .context("failed to open observer session")?,
        ),
        None => None,
    };

    let mut records = Vec::with_capacity(scenario.steps.len());
    for (i, step) in scenario.steps.into_iter().enumerate() {
        let action = describe(&step);
        let outcome = match step {
            Step::Move {
                order,
                after,
                before,
            } => {
                let intent = match (after, before) {
                    (Some(anchor), None) => MoveIntent::after(order, anchor),
                    (None, Some(anchor)) => MoveIntent::before(order, anchor),
                    _ => bail!("step {}: move needs exactly one of `after`/`before`", i + 1),
                };
                local
                    .move_order(&intent)
                    .map(|moved| format!("{} position(s) pending", moved.len()))
                    .map_err(|e| e.to_string())
            }
            Step::Status {
                order,
                to,
                assignee,
            } => match local.change_status(&order, to, assignee) {
                Ok(update) => local
                    .persist_status(&update, &backend)
                    .await
                    .map(|()| format!("{} is {}", update.order.id, update.order.status))
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            },
            Step::Remote(change) => {
                let event = remote_event(change)?;
                backend
                    .publish_external(event)
                    .map(|()| "delivered".to_string())
                    .map_err(|e| e.to_string())
            }
            Step::Save => match local.save(&backend, &signals).await {
                Ok(Some(report)) => Ok(format!(
                    "saved {} via {:?}",
                    report.saved.len(),
                    report.path
                )),
                Ok(None) => Ok("nothing to save".to_string()),
                Err(e) => Err(e.to_string()),
            },
            Step::FailNextSave { error, fallback_ok } => {
                inject_failure(&backend, error, fallback_ok)?;
                Ok(format!("next save fails ({error:?})"))
            }
            Step::Signal => match observer.as_mut() {
                Some(session) => match session.poll_signal(&signals, &backend).await {
                    Ok(SignalDecision::Resync { notify_user, .. }) => Ok(if notify_user {
                        "observer resynced (changed by someone else)".to_string()
                    } else {
                        "observer resynced".to_string()
                    }),
                    Ok(SignalDecision::Ignore) => Ok("nothing new".to_string()),
                    Err(e) => Err(e.to_string()),
                },
                None => bail!("step {}: `signal` needs an observer", i + 1),
            },
        };

        let mut events = Vec::new();
        drain(&mut push, &mut events);
        let report = local.handle_events(events);
        let suppressed = report.dropped.len();

        let (ok, mut outcome) = match outcome {
            Ok(text) => (true, text),
            Err(text) => (false, text),
        };
        if suppressed > 0 {
            outcome.push_str(&format!("; {suppressed} inbound suppressed"));
        }
        records.push(StepRecord {
            step: i + 1,
            action,
            outcome,
            ok,
            display: local.display_order().into_iter().map(|id| id.0).collect(),
            pending: local.ledger().len(),
            observer: observer
                .as_ref()
                .map(|s| s.display_order().into_iter().map(|id| id.0).collect()),
        });
    }
    Ok(records)
}

fn drain(push: &mut mpsc::UnboundedReceiver<ChangeEvent>, into: &mut Vec<ChangeEvent>) {
    while let Ok(event) = push.try_recv() {
        into.push(event);
    }
}

fn remote_event(change: RemoteChange) -> Result<ChangeEvent> {
    let now = Utc::now();
    let event = match change.kind {
        ChangeKind::Deleted => ChangeEvent::deleted(change.order, change.by, now),
        ChangeKind::Created => {
            let snapshot = change
                .snapshot
                .context("remote `created` change needs a `snapshot`")?;
            ChangeEvent::created(snapshot, change.by, now)
        }
        ChangeKind::Updated => ChangeEvent {
            is_drag_operation: change.drag,
            ..ChangeEvent::updated(
                change.order,
                ChangedFields {
                    status: change.status,
                    sort_order: change.sort_order,
                    notes: change.notes,
                    ..ChangedFields::default()
                },
                change.by,
                now,
            )
        },
    };
    Ok(event)
}

fn inject_failure(backend: &MemoryBackend, kind: FailureKind, fallback_ok: bool) -> Result<()> {
    let error = match kind {
        FailureKind::Transport => PersistError::Transport("injected".to_string()),
        FailureKind::Conflict => PersistError::Conflict("injected".to_string()),
        FailureKind::Rejected => PersistError::Rejected("injected".to_string()),
    };
    backend.fail_next(Operation::BulkReorder, error.clone())?;
    match kind {
        FailureKind::Transport if !fallback_ok => {
            backend.fail_next(Operation::UpdateOrder, error)?;
        }
        // A single conflict is absorbed by the retry; fail that too.
        FailureKind::Conflict if !fallback_ok => {
            backend.fail_next(Operation::BulkReorder, error)?;
        }
        _ => {}
    }
    Ok(())
}

fn describe(step: &Step) -> String {
    match step {
        Step::Move {
            order,
            after: Some(anchor),
            ..
        } => format!("move {order} after {anchor}"),
        Step::Move {
            order,
            before: Some(anchor),
            ..
        } => format!("move {order} before {anchor}"),
        Step::Move { order, .. } => format!("move {order}"),
        Step::Status { order, to, .. } => format!("status {order} → {to}"),
        Step::Remote(change) => {
            let mut parts = vec![format!("{:?}", change.kind).to_lowercase()];
            if let Some(sort_order) = change.sort_order {
                parts.push(format!("sort={sort_order}"));
            }
            if let Some(status) = change.status {
                parts.push(format!("status={status}"));
            }
            format!("remote {} {} by {}", change.order, parts.join(" "), change.by)
        }
        Step::Save => "save".to_string(),
        Step::FailNextSave { error, .. } => format!("fail next save ({error:?})").to_lowercase(),
        Step::Signal => "observer polls signal".to_string(),
    }
}

fn print_table(records: &[StepRecord]) {
    let rows: Vec<StepRow> = records
        .iter()
        .map(|r| StepRow {
            step: r.step,
            action: r.action.clone(),
            outcome: if r.ok {
                r.outcome.green().to_string()
            } else {
                r.outcome.red().to_string()
            },
            display: r.display.join(" "),
            pending: r.pending,
            observer: r
                .observer
                .as_ref()
                .map(|o| o.join(" "))
                .unwrap_or_default(),
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");

    let failed = records.iter().filter(|r| !r.ok).count();
    if failed > 0 {
        println!("{}", format!("{failed} step(s) failed").yellow());
    }
}
