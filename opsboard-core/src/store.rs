//! Canonical in-memory order collection.
//!
//! Orders are partitioned by [`GroupKey`]; each partition is kept in display
//! order, so re-sorting a partition preserves the previous relative order of
//! fully tied orders. An id → group index gives O(1) group lookup.
//!
//! Mutation goes through a small set of entry points. [`OrderStore::modify`]
//! edits without re-sorting so a batch of changes can be followed by a single
//! [`OrderStore::resort`].

use std::collections::{BTreeMap, HashMap};

use crate::error::BoardError;
use crate::sort;
use crate::types::{GroupKey, Order, OrderId};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderStore {
    groups: BTreeMap<GroupKey, Vec<Order>>,
    index: HashMap<OrderId, GroupKey>,
}

impl OrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from an unsorted list. Each group is sorted once.
    pub fn from_orders(orders: impl IntoIterator<Item = Order>) -> Self {
        let mut store = Self::new();
        for order in orders {
            store.insert_unsorted(order);
        }
        let keys: Vec<GroupKey> = store.groups.keys().cloned().collect();
        for key in keys {
            store.resort(&key);
        }
        store
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, id: &OrderId) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, id: &OrderId) -> Option<&Order> {
        let group = self.index.get(id)?;
        self.groups.get(group)?.iter().find(|o| &o.id == id)
    }

    pub fn find_by_secondary(&self, secondary_id: &str) -> Option<&Order> {
        self.groups
            .values()
            .flatten()
            .find(|o| o.secondary_id.as_deref() == Some(secondary_id))
    }

    /// Resolve an event's order reference: primary id first, then the
    /// secondary id.
    pub fn resolve(&self, id: &OrderId, secondary_id: Option<&str>) -> Option<OrderId> {
        if self.contains(id) {
            return Some(id.clone());
        }
        secondary_id
            .and_then(|s| self.find_by_secondary(s))
            .map(|o| o.id.clone())
    }

    /// Orders of `group` in display order (empty if the group is unknown).
    pub fn group(&self, group: &GroupKey) -> &[Order] {
        self.groups.get(group).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn display_order(&self, group: &GroupKey) -> Vec<OrderId> {
        self.group(group).iter().map(|o| o.id.clone()).collect()
    }

    pub fn groups(&self) -> impl Iterator<Item = &GroupKey> {
        self.groups.keys()
    }

    /// Insert or replace an order, then re-sort its group (and its previous
    /// group if it moved between groups).
    pub fn upsert(&mut self, order: Order) {
        let group = order.group_key.clone();
        let previous = self.index.get(&order.id).cloned();
        match previous {
            Some(prev) if prev == group => {
                if let Some(slot) = self
                    .groups
                    .get_mut(&group)
                    .and_then(|orders| orders.iter_mut().find(|o| o.id == order.id))
                {
                    *slot = order;
                }
            }
            Some(prev) => {
                self.detach(&order.id, &prev);
                self.resort(&prev);
                self.insert_unsorted(order);
            }
            None => self.insert_unsorted(order),
        }
        self.resort(&group);
    }

    /// Insert or replace an order without re-sorting. Returns its group.
    ///
    /// The order lands at the end of its group (or keeps its slot when it was
    /// already there); call [`resort`](Self::resort) once the batch is done.
    pub fn insert_or_replace(&mut self, order: Order) -> GroupKey {
        let group = order.group_key.clone();
        match self.index.get(&order.id).cloned() {
            Some(prev) if prev == group => {
                if let Some(slot) = self
                    .groups
                    .get_mut(&group)
                    .and_then(|orders| orders.iter_mut().find(|o| o.id == order.id))
                {
                    *slot = order;
                }
            }
            Some(prev) => {
                self.detach(&order.id, &prev);
                if self.groups.get(&prev).is_some_and(Vec::is_empty) {
                    self.groups.remove(&prev);
                }
                self.insert_unsorted(order);
            }
            None => self.insert_unsorted(order),
        }
        group
    }

    /// Remove an order. Removal keeps the remaining orders in place.
    pub fn remove(&mut self, id: &OrderId) -> Option<Order> {
        let group = self.index.remove(id)?;
        let removed = self.detach(id, &group);
        if self.groups.get(&group).is_some_and(Vec::is_empty) {
            self.groups.remove(&group);
        }
        removed
    }

    /// Replace a whole group with an authoritative list. Orders from the
    /// previous contents that are absent from `orders` are dropped.
    pub fn replace_group(&mut self, group: &GroupKey, orders: Vec<Order>) {
        if let Some(previous) = self.groups.remove(group) {
            for order in previous {
                self.index.remove(&order.id);
            }
        }
        for order in orders {
            if order.group_key != *group {
                // A stray order from another group is still authoritative.
                self.upsert(order);
                continue;
            }
            if let Some(prev) = self.index.get(&order.id).cloned() {
                self.detach(&order.id, &prev);
            }
            self.insert_unsorted(order);
        }
        self.resort(group);
    }

    /// Mutate one order in place without re-sorting. Returns the order's group
    /// so the caller can [`resort`](Self::resort) it once per batch.
    ///
    /// The closure must not change `id` or `group_key`.
    pub fn modify<F>(&mut self, id: &OrderId, f: F) -> Result<GroupKey, BoardError>
    where
        F: FnOnce(&mut Order),
    {
        let group = self
            .index
            .get(id)
            .cloned()
            .ok_or_else(|| BoardError::UnknownOrder(id.clone()))?;
        let order = self
            .groups
            .get_mut(&group)
            .and_then(|orders| orders.iter_mut().find(|o| &o.id == id))
            .ok_or_else(|| BoardError::UnknownOrder(id.clone()))?;
        f(order);
        Ok(group)
    }

    /// Recompute display order of `group`.
    pub fn resort(&mut self, group: &GroupKey) {
        if let Some(orders) = self.groups.get_mut(group) {
            sort::sort_orders(orders);
        }
    }

    fn insert_unsorted(&mut self, order: Order) {
        self.index.insert(order.id.clone(), order.group_key.clone());
        self.groups
            .entry(order.group_key.clone())
            .or_default()
            .push(order);
    }

    fn detach(&mut self, id: &OrderId, group: &GroupKey) -> Option<Order> {
        let orders = self.groups.get_mut(group)?;
        let pos = orders.iter().position(|o| &o.id == id)?;
        Some(orders.remove(pos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OrderStatus;

    fn g() -> GroupKey {
        GroupKey::from("store-1")
    }

    fn board() -> OrderStore {
        OrderStore::from_orders(vec![
            Order::new("C", "store-1")
                .with_sort_order(30)
                .with_status(OrderStatus::Completed),
            Order::new("B", "store-1").with_sort_order(20),
            Order::new("A", "store-1")
                .with_sort_order(10)
                .with_secondary_id("ext-A"),
        ])
    }

    fn ids(store: &OrderStore) -> Vec<String> {
        store.display_order(&g()).into_iter().map(|id| id.0).collect()
    }

    #[test]
    fn from_orders_sorts_each_group() {
        assert_eq!(ids(&board()), ["A", "B", "C"]);
    }

    #[test]
    fn resolve_falls_back_to_secondary_id() {
        let store = board();
        assert_eq!(store.resolve(&OrderId::from("A"), None), Some(OrderId::from("A")));
        assert_eq!(
            store.resolve(&OrderId::from("unknown"), Some("ext-A")),
            Some(OrderId::from("A"))
        );
        assert_eq!(store.resolve(&OrderId::from("unknown"), Some("nope")), None);
    }

    #[test]
    fn modify_defers_resort() {
        let mut store = board();
        let group = store
            .modify(&OrderId::from("A"), |o| o.sort_order = Some(25))
            .expect("modify");
        assert_eq!(ids(&store), ["A", "B", "C"], "no resort yet");
        store.resort(&group);
        assert_eq!(ids(&store), ["B", "A", "C"]);
    }

    #[test]
    fn modify_unknown_order_errors() {
        let mut store = board();
        let err = store.modify(&OrderId::from("Z"), |_| {}).unwrap_err();
        assert_eq!(err, BoardError::UnknownOrder(OrderId::from("Z")));
    }

    #[test]
    fn upsert_moves_between_groups() {
        let mut store = board();
        let moved = Order::new("B", "store-2").with_sort_order(5);
        store.upsert(moved);
        assert_eq!(ids(&store), ["A", "C"]);
        assert_eq!(store.display_order(&GroupKey::from("store-2")), vec![OrderId::from("B")]);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn insert_or_replace_defers_resort() {
        let mut store = board();
        let group = store.insert_or_replace(Order::new("D", "store-1").with_sort_order(1));
        assert_eq!(ids(&store), ["A", "B", "C", "D"]);
        store.resort(&group);
        assert_eq!(ids(&store), ["D", "A", "B", "C"]);

        store.insert_or_replace(Order::new("A", "store-1").with_sort_order(99));
        assert_eq!(store.len(), 4);
        assert_eq!(store.get(&OrderId::from("A")).unwrap().sort_order, Some(99));
    }

    #[test]
    fn remove_keeps_index_consistent() {
        let mut store = board();
        let removed = store.remove(&OrderId::from("B")).expect("removed");
        assert_eq!(removed.id, OrderId::from("B"));
        assert!(!store.contains(&OrderId::from("B")));
        assert!(store.remove(&OrderId::from("B")).is_none());
        assert_eq!(ids(&store), ["A", "C"]);
    }

    #[test]
    fn replace_group_drops_missing_orders() {
        let mut store = board();
        store.replace_group(
            &g(),
            vec![
                Order::new("B", "store-1").with_sort_order(20),
                Order::new("A", "store-1").with_sort_order(25),
            ],
        );
        assert_eq!(ids(&store), ["B", "A"]);
        assert!(!store.contains(&OrderId::from("C")));
    }
}
