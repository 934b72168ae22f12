//! Display-order comparator.
//!
//! Tie-break chain:
//! 1. status tier: non-terminal before terminal
//! 2. priority class: priority before normal
//! 3. manual `sort_order` ascending, missing last
//! 4. input order (the sort is stable)
//!
//! The order is always recomputed over a whole group, never patched.

use std::cmp::Ordering;

use crate::types::{Order, OrderId};

/// Compare two orders by display precedence. Returns `Equal` for fully tied
/// orders so a stable sort keeps their input order.
pub fn compare(a: &Order, b: &Order) -> Ordering {
    a.status
        .is_terminal()
        .cmp(&b.status.is_terminal())
        .then_with(|| b.is_priority.cmp(&a.is_priority))
        .then_with(|| compare_sort_order(a.sort_order, b.sort_order))
}

fn compare_sort_order(a: Option<i64>, b: Option<i64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Sort `orders` in place into display order.
pub fn sort_orders(orders: &mut [Order]) {
    // slice::sort_by is stable.
    orders.sort_by(compare);
}

/// Display order of `orders` as ids, without touching the input.
pub fn display_order(orders: &[Order]) -> Vec<OrderId> {
    let mut refs: Vec<&Order> = orders.iter().collect();
    refs.sort_by(|a, b| compare(a, b));
    refs.into_iter().map(|o| o.id.clone()).collect()
}
