//! Pending local reorder intents.
//!
//! An entry exists for an order exactly while a local reorder of it is
//! uncommitted. Its presence is what makes local intent win over remote
//! positional data during reconciliation. Entries are only removed by
//! [`PendingChangeLedger::commit`] or [`PendingChangeLedger::rollback`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::types::{OrderId, PendingIntent};

/// Entries taken out of the ledger by a commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerSnapshot {
    entries: BTreeMap<OrderId, PendingIntent>,
}

impl LedgerSnapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &OrderId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &OrderId) -> Option<&PendingIntent> {
        self.entries.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OrderId, &PendingIntent)> {
        self.entries.iter()
    }

    /// `order id → target sort order`, the payload of a bulk persist call.
    pub fn changes(&self) -> BTreeMap<OrderId, i64> {
        self.entries
            .iter()
            .map(|(id, intent)| (id.clone(), intent.target_sort_order))
            .collect()
    }

    /// Drop entries matching `predicate`, returning them.
    pub fn split_off_where<F>(&mut self, mut predicate: F) -> Vec<OrderId>
    where
        F: FnMut(&OrderId) -> bool,
    {
        let matched: Vec<OrderId> = self.entries.keys().filter(|id| predicate(id)).cloned().collect();
        for id in &matched {
            self.entries.remove(id);
        }
        matched
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingChangeLedger {
    entries: BTreeMap<OrderId, PendingIntent>,
}

impl PendingChangeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record (or overwrite) the intent to move `order_id` to `target_sort_order`.
    pub fn record_intent(&mut self, order_id: OrderId, target_sort_order: i64, now: DateTime<Utc>) {
        self.entries.insert(
            order_id,
            PendingIntent {
                target_sort_order,
                created_at: now,
            },
        );
    }

    pub fn has_pending_intent(&self, order_id: &OrderId) -> bool {
        self.entries.contains_key(order_id)
    }

    pub fn get(&self, order_id: &OrderId) -> Option<&PendingIntent> {
        self.entries.get(order_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OrderId, &PendingIntent)> {
        self.entries.iter()
    }

    /// Take every entry out of the ledger in one step.
    pub fn commit(&mut self) -> LedgerSnapshot {
        LedgerSnapshot {
            entries: std::mem::take(&mut self.entries),
        }
    }

    /// Clear the ledger. The store is not touched; the caller restores it
    /// from the authoritative source.
    pub fn rollback(&mut self) {
        self.entries.clear();
    }

    /// Put a snapshot back for retry. Entries recorded after the snapshot was
    /// taken are newer and win.
    pub fn restore(&mut self, snapshot: LedgerSnapshot) {
        for (id, intent) in snapshot.entries {
            self.entries.entry(id).or_insert(intent);
        }
    }
}
