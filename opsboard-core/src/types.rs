//! Domain types for the operational board.
//!
//! Everything here is plain data: serializable with serde so the same shapes
//! travel over the push channel, land in scenario files, and come back from
//! the persistence service.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::error::BoardError;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_newtype!(
    /// Stable identifier of a work item.
    OrderId
);
string_newtype!(
    /// Identifier of an operator (the identity provider's user id).
    ActorId
);
string_newtype!(
    /// Bucket an order belongs to (store, time window, ...). Display order is
    /// computed per group.
    GroupKey
);

/// Identifier of one open board session. An actor can have several sessions
/// open on different devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Tag attached to every locally originated mutation before it is sent to
/// persistence. Inbound events carrying a known tag are echoes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Workflow status of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    #[default]
    Unassigned,
    Assigned,
    Completed,
}

impl OrderStatus {
    /// Terminal statuses sort after every non-terminal one.
    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Completed)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderStatus::Unassigned => write!(f, "unassigned"),
            OrderStatus::Assigned => write!(f, "assigned"),
            OrderStatus::Completed => write!(f, "completed"),
        }
    }
}

/// Kind of an inbound change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

// ---------------------------------------------------------------------------
// Domain structs
// ---------------------------------------------------------------------------

/// A single work item on the board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    /// External reference (e.g. the upstream order number). Used to match
    /// inbound events that do not carry the primary id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_id: Option<String>,
    #[serde(default)]
    pub status: OrderStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<ActorId>,
    /// Manual position. Not unique; absent sorts last.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_order: Option<i64>,
    pub group_key: GroupKey,
    #[serde(default)]
    pub is_priority: bool,
    #[serde(default)]
    pub notes: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_by: Option<ActorId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_at: Option<DateTime<Utc>>,
}

impl Order {
    /// A fresh unassigned order with no manual position.
    pub fn new(id: impl Into<OrderId>, group_key: impl Into<GroupKey>) -> Self {
        Self {
            id: id.into(),
            secondary_id: None,
            status: OrderStatus::Unassigned,
            assigned_to: None,
            sort_order: None,
            group_key: group_key.into(),
            is_priority: false,
            notes: String::new(),
            last_modified_by: None,
            last_modified_at: None,
        }
    }

    pub fn with_sort_order(mut self, sort_order: i64) -> Self {
        self.sort_order = Some(sort_order);
        self
    }

    pub fn with_status(mut self, status: OrderStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_priority(mut self, is_priority: bool) -> Self {
        self.is_priority = is_priority;
        self
    }

    pub fn with_secondary_id(mut self, secondary_id: impl Into<String>) -> Self {
        self.secondary_id = Some(secondary_id.into());
        self
    }
}

/// The current operator as supplied by the identity/permission provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: ActorId,
    pub display_name: String,
    /// Privileged actors may reorder; everyone may change status.
    #[serde(default)]
    pub privileged: bool,
}

impl Actor {
    pub fn new(id: impl Into<ActorId>, display_name: impl Into<String>, privileged: bool) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            privileged,
        }
    }
}

/// Uncommitted local reorder intent for one order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingIntent {
    pub target_sort_order: i64,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Inbound change events
// ---------------------------------------------------------------------------

/// Optional field changes carried by an inbound event.
///
/// `assigned_to` distinguishes "absent" (`None`) from "explicitly cleared"
/// (`Some(None)`, JSON `null`).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChangedFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<OrderStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_order: Option<i64>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present_or_null"
    )]
    pub assigned_to: Option<Option<ActorId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl ChangedFields {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.sort_order.is_none()
            && self.assigned_to.is_none()
            && self.notes.is_none()
    }

    /// Overlay `newer` on top of `self`, field by field.
    pub fn merge(&mut self, newer: ChangedFields) {
        if newer.status.is_some() {
            self.status = newer.status;
        }
        if newer.sort_order.is_some() {
            self.sort_order = newer.sort_order;
        }
        if newer.assigned_to.is_some() {
            self.assigned_to = newer.assigned_to;
        }
        if newer.notes.is_some() {
            self.notes = newer.notes;
        }
    }

    /// Write every present field into `order`. Returns whether anything changed.
    pub fn apply_to(&self, order: &mut Order) -> bool {
        let before = (
            order.status,
            order.sort_order,
            order.assigned_to.clone(),
            order.notes.clone(),
        );
        if let Some(status) = self.status {
            order.status = status;
        }
        if let Some(sort_order) = self.sort_order {
            order.sort_order = Some(sort_order);
        }
        if let Some(assigned_to) = &self.assigned_to {
            order.assigned_to = assigned_to.clone();
        }
        if let Some(notes) = &self.notes {
            order.notes = notes.clone();
        }
        before
            != (
                order.status,
                order.sort_order,
                order.assigned_to.clone(),
                order.notes.clone(),
            )
    }
}

fn present_or_null<'de, D>(deserializer: D) -> Result<Option<Option<ActorId>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<ActorId>::deserialize(deserializer).map(Some)
}

/// Loosely typed change notification as delivered by the push channel or
/// detected by polling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub order_id: OrderId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_id: Option<String>,
    #[serde(default)]
    pub changed: ChangedFields,
    /// Full snapshot, carried by `created` events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<Order>,
    pub updated_by: ActorId,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub is_drag_operation: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    /// Set on events produced by the authoritative post-save refresh.
    #[serde(default)]
    pub from_refresh: bool,
}

impl ChangeEvent {
    /// An `updated` event carrying `changed`.
    pub fn updated(
        order_id: impl Into<OrderId>,
        changed: ChangedFields,
        updated_by: impl Into<ActorId>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: ChangeKind::Updated,
            order_id: order_id.into(),
            secondary_id: None,
            changed,
            order: None,
            updated_by: updated_by.into(),
            timestamp,
            is_drag_operation: false,
            correlation_id: None,
            from_refresh: false,
        }
    }

    pub fn deleted(
        order_id: impl Into<OrderId>,
        updated_by: impl Into<ActorId>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: ChangeKind::Deleted,
            ..Self::updated(order_id, ChangedFields::default(), updated_by, timestamp)
        }
    }

    pub fn created(order: Order, updated_by: impl Into<ActorId>, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind: ChangeKind::Created,
            order_id: order.id.clone(),
            secondary_id: order.secondary_id.clone(),
            order: Some(order),
            ..Self::updated("", ChangedFields::default(), updated_by, timestamp)
        }
    }

    /// Resolve the loosely typed event into an [`InboundChange`].
    pub fn classify(&self) -> Result<InboundChange, BoardError> {
        match self.kind {
            ChangeKind::Deleted => Ok(InboundChange::Deleted),
            ChangeKind::Created => match &self.order {
                Some(order) => Ok(InboundChange::Created(order.clone())),
                None => Err(BoardError::InvalidEvent {
                    order_id: self.order_id.clone(),
                    reason: "created event without order snapshot".to_string(),
                }),
            },
            ChangeKind::Updated => {
                let patch = FieldPatch {
                    status: self.changed.status,
                    assigned_to: self.changed.assigned_to.clone(),
                    notes: self.changed.notes.clone(),
                };
                Ok(match self.changed.sort_order {
                    Some(sort_order) if patch.is_empty() => {
                        InboundChange::SortOrderChanged(sort_order)
                    }
                    Some(sort_order) => InboundChange::AttributesAndSortOrder { sort_order, patch },
                    None => InboundChange::AttributesChanged(patch),
                })
            }
        }
    }
}

/// Non-positional field changes (status, assignment, notes).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FieldPatch {
    pub status: Option<OrderStatus>,
    pub assigned_to: Option<Option<ActorId>>,
    pub notes: Option<String>,
}

impl FieldPatch {
    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.assigned_to.is_none() && self.notes.is_none()
    }
}

/// An inbound event resolved once at ingestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundChange {
    Created(Order),
    Deleted,
    AttributesChanged(FieldPatch),
    SortOrderChanged(i64),
    AttributesAndSortOrder { sort_order: i64, patch: FieldPatch },
}

impl InboundChange {
    /// Whether applying this change can move the order.
    pub fn is_positional(&self) -> bool {
        matches!(
            self,
            InboundChange::SortOrderChanged(_) | InboundChange::AttributesAndSortOrder { .. }
        )
    }

    /// Flatten back into mergeable fields. `Created`/`Deleted` carry none.
    pub fn fields(&self) -> ChangedFields {
        let from_patch = |patch: &FieldPatch, sort_order: Option<i64>| ChangedFields {
            status: patch.status,
            sort_order,
            assigned_to: patch.assigned_to.clone(),
            notes: patch.notes.clone(),
        };
        match self {
            InboundChange::AttributesChanged(patch) => from_patch(patch, None),
            InboundChange::SortOrderChanged(sort_order) => ChangedFields {
                sort_order: Some(*sort_order),
                ..ChangedFields::default()
            },
            InboundChange::AttributesAndSortOrder { sort_order, patch } => {
                from_patch(patch, Some(*sort_order))
            }
            InboundChange::Created(_) | InboundChange::Deleted => ChangedFields::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn newtype_display() {
        assert_eq!(OrderId::from("ord-1").to_string(), "ord-1");
        assert_eq!(ActorId::from("kim").to_string(), "kim");
        assert_eq!(GroupKey::from("store-7").to_string(), "store-7");
    }

    #[test]
    fn completed_is_the_only_terminal_status() {
        assert!(!OrderStatus::Unassigned.is_terminal());
        assert!(!OrderStatus::Assigned.is_terminal());
        assert!(OrderStatus::Completed.is_terminal());
    }

    #[test]
    fn classify_sort_only_update() {
        let changed = ChangedFields {
            sort_order: Some(15),
            ..ChangedFields::default()
        };
        let event = ChangeEvent::updated("A", changed, "lee", now());
        assert_eq!(event.classify().unwrap(), InboundChange::SortOrderChanged(15));
    }

    #[test]
    fn classify_status_and_position_update() {
        let changed = ChangedFields {
            status: Some(OrderStatus::Assigned),
            sort_order: Some(40),
            ..ChangedFields::default()
        };
        let change = ChangeEvent::updated("A", changed, "lee", now())
            .classify()
            .unwrap();
        assert!(change.is_positional());
        assert!(matches!(
            change,
            InboundChange::AttributesAndSortOrder { sort_order: 40, .. }
        ));
    }

    #[test]
    fn classify_created_without_snapshot_is_invalid() {
        let mut event = ChangeEvent::created(Order::new("A", "g"), "lee", now());
        event.order = None;
        assert!(matches!(
            event.classify(),
            Err(BoardError::InvalidEvent { .. })
        ));
    }

    #[test]
    fn assigned_to_null_means_cleared() {
        let json = r#"{"assigned_to":null}"#;
        let fields: ChangedFields = parse_fields(json);
        assert_eq!(fields.assigned_to, Some(None));

        let absent: ChangedFields = parse_fields("{}");
        assert_eq!(absent.assigned_to, None);
    }

    // YAML flow mappings accept the JSON fixtures as-is.
    fn parse_fields(src: &str) -> ChangedFields {
        serde_yaml::from_str(src).expect("parse changed fields")
    }

    #[test]
    fn merge_overlays_newer_fields_only() {
        let mut base = ChangedFields {
            status: Some(OrderStatus::Assigned),
            notes: Some("first".into()),
            ..ChangedFields::default()
        };
        base.merge(ChangedFields {
            notes: Some("second".into()),
            sort_order: Some(30),
            ..ChangedFields::default()
        });
        assert_eq!(base.status, Some(OrderStatus::Assigned));
        assert_eq!(base.notes.as_deref(), Some("second"));
        assert_eq!(base.sort_order, Some(30));
    }

    #[test]
    fn apply_reports_whether_anything_changed() {
        let mut order = Order::new("A", "g").with_sort_order(10);
        let fields = ChangedFields {
            sort_order: Some(10),
            ..ChangedFields::default()
        };
        assert!(!fields.apply_to(&mut order));
        let fields = ChangedFields {
            assigned_to: Some(Some(ActorId::from("kim"))),
            ..ChangedFields::default()
        };
        assert!(fields.apply_to(&mut order));
        assert_eq!(order.assigned_to, Some(ActorId::from("kim")));
    }

    #[test]
    fn order_yaml_roundtrip_defaults() {
        let yaml = "id: A\ngroup_key: store-1\nsort_order: 10\n";
        let order: Order = serde_yaml::from_str(yaml).expect("parse order");
        assert_eq!(order.status, OrderStatus::Unassigned);
        assert_eq!(order.sort_order, Some(10));
        assert!(!order.is_priority);
    }
}
