//! Translation of "move X before/after Y" intents into sort orders.
//!
//! New positions are spaced with a gap so later insertions rarely need more
//! than one change. When no integer fits between the new neighbours (or a
//! neighbour has no manual position) the whole group is renumbered.

use serde::{Deserialize, Serialize};

use crate::error::BoardError;
use crate::types::{Order, OrderId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Placement {
    Before,
    After,
}

/// "Move `order_id` directly before/after `anchor`", as emitted by the gesture layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveIntent {
    pub order_id: OrderId,
    pub anchor: OrderId,
    pub placement: Placement,
}

impl MoveIntent {
    pub fn after(order_id: impl Into<OrderId>, anchor: impl Into<OrderId>) -> Self {
        Self {
            order_id: order_id.into(),
            anchor: anchor.into(),
            placement: Placement::After,
        }
    }

    pub fn before(order_id: impl Into<OrderId>, anchor: impl Into<OrderId>) -> Self {
        Self {
            order_id: order_id.into(),
            anchor: anchor.into(),
            placement: Placement::Before,
        }
    }
}

/// Compute the sort-order changes that realise `intent` within `group`
/// (a slice in display order). Orders whose position does not change are
/// omitted.
pub fn plan_move(
    group: &[Order],
    intent: &MoveIntent,
    gap: i64,
) -> Result<Vec<(OrderId, i64)>, BoardError> {
    let invalid = |reason: &str| BoardError::InvalidMove {
        order_id: intent.order_id.clone(),
        reason: reason.to_string(),
    };
    if intent.order_id == intent.anchor {
        return Err(invalid("order cannot be anchored to itself"));
    }
    if gap < 2 {
        return Err(invalid("sort gap must be at least 2"));
    }
    let moving = group
        .iter()
        .find(|o| o.id == intent.order_id)
        .ok_or_else(|| BoardError::UnknownOrder(intent.order_id.clone()))?;

    let rest: Vec<&Order> = group.iter().filter(|o| o.id != intent.order_id).collect();
    let anchor_idx = rest
        .iter()
        .position(|o| o.id == intent.anchor)
        .ok_or_else(|| invalid("anchor is not in the same group"))?;
    let insert_at = match intent.placement {
        Placement::Before => anchor_idx,
        Placement::After => anchor_idx + 1,
    };

    let prev = insert_at.checked_sub(1).and_then(|i| rest.get(i)).map(|o| o.sort_order);
    let next = rest.get(insert_at).map(|o| o.sort_order);

    let slot = match (prev, next) {
        (Some(Some(p)), Some(Some(n))) => n
            .checked_sub(p)
            .filter(|room| *room >= 2)
            .map(|room| p + room / 2),
        (Some(Some(p)), None) => p.checked_add(gap),
        (None, Some(Some(n))) => n.checked_sub(gap),
        (None, None) => Some(gap),
        _ => None,
    };

    if let Some(target) = slot {
        if moving.sort_order == Some(target) {
            return Ok(vec![]);
        }
        return Ok(vec![(moving.id.clone(), target)]);
    }

    let mut sequence = rest;
    sequence.insert(insert_at, moving);
    let mut changes = Vec::new();
    for (order, rank) in sequence.into_iter().zip(1i64..) {
        let target = rank
            .checked_mul(gap)
            .ok_or_else(|| invalid("sort gap too large to renumber the group"))?;
        if order.sort_order != Some(target) {
            changes.push((order.id.clone(), target));
        }
    }
    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OrderStatus;

    fn board() -> Vec<Order> {
        vec![
            Order::new("A", "g").with_sort_order(10),
            Order::new("B", "g").with_sort_order(20),
            Order::new("C", "g")
                .with_sort_order(30)
                .with_status(OrderStatus::Completed),
        ]
    }

    fn change(id: &str, sort: i64) -> (OrderId, i64) {
        (OrderId::from(id), sort)
    }

    #[test]
    fn after_takes_midpoint() {
        let plan = plan_move(&board(), &MoveIntent::after("A", "B"), 10).expect("plan");
        assert_eq!(plan, vec![change("A", 25)]);
    }

    #[test]
    fn before_first_steps_down_one_gap() {
        let plan = plan_move(&board(), &MoveIntent::before("C", "A"), 10).expect("plan");
        assert_eq!(plan, vec![change("C", 0)]);
    }

    #[test]
    fn after_last_steps_up_one_gap() {
        let plan = plan_move(&board(), &MoveIntent::after("A", "C"), 10).expect("plan");
        assert_eq!(plan, vec![change("A", 40)]);
    }

    #[test]
    fn no_room_renumbers_group() {
        let group = vec![
            Order::new("A", "g").with_sort_order(10),
            Order::new("B", "g").with_sort_order(11),
            Order::new("C", "g").with_sort_order(12),
        ];
        let plan = plan_move(&group, &MoveIntent::after("C", "A"), 10).expect("plan");
        // New sequence A, C, B → 10, 20, 30; A already at 10.
        assert_eq!(plan, vec![change("C", 20), change("B", 30)]);
    }

    #[test]
    fn neighbour_without_position_renumbers() {
        let group = vec![
            Order::new("A", "g").with_sort_order(10),
            Order::new("B", "g"),
            Order::new("C", "g"),
        ];
        let plan = plan_move(&group, &MoveIntent::after("C", "A"), 10).expect("plan");
        assert_eq!(plan, vec![change("C", 20), change("B", 30)]);
    }

    #[test]
    fn already_in_place_is_empty() {
        let group = vec![
            Order::new("A", "g").with_sort_order(10),
            Order::new("B", "g").with_sort_order(15),
            Order::new("C", "g").with_sort_order(20),
        ];
        let plan = plan_move(&group, &MoveIntent::after("B", "A"), 10).expect("plan");
        assert!(plan.is_empty());
    }

    #[test]
    fn extreme_neighbours_renumber_instead_of_overflowing() {
        let group = vec![
            Order::new("A", "g").with_sort_order(-10),
            Order::new("B", "g").with_sort_order(i64::MAX),
            Order::new("C", "g").with_sort_order(i64::MAX),
        ];
        let plan = plan_move(&group, &MoveIntent::after("C", "A"), 10).expect("plan");
        assert_eq!(
            plan,
            vec![change("A", 10), change("C", 20), change("B", 30)]
        );

        let group = vec![
            Order::new("A", "g").with_sort_order(i64::MIN),
            Order::new("B", "g").with_sort_order(i64::MAX),
        ];
        let plan = plan_move(&group, &MoveIntent::before("B", "A"), 10).expect("plan");
        assert_eq!(plan, vec![change("B", 10), change("A", 20)]);

        let plan = plan_move(&group, &MoveIntent::after("A", "B"), 10).expect("plan");
        assert_eq!(plan, vec![change("B", 10), change("A", 20)]);
    }

    #[test]
    fn oversized_gap_is_invalid_not_a_panic() {
        let group = vec![
            Order::new("A", "g").with_sort_order(1),
            Order::new("B", "g").with_sort_order(2),
            Order::new("C", "g").with_sort_order(3),
        ];
        let err = plan_move(&group, &MoveIntent::after("C", "A"), i64::MAX).unwrap_err();
        assert!(matches!(err, BoardError::InvalidMove { .. }));
    }

    #[test]
    fn self_anchor_is_invalid() {
        let err = plan_move(&board(), &MoveIntent::after("A", "A"), 10).unwrap_err();
        assert!(matches!(err, BoardError::InvalidMove { .. }));
    }

    #[test]
    fn foreign_anchor_is_invalid() {
        let err = plan_move(&board(), &MoveIntent::after("A", "Z"), 10).unwrap_err();
        assert!(matches!(err, BoardError::InvalidMove { .. }));
    }
}
