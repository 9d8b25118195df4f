// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The watchlist: entities with outstanding spec/status differences.

use std::collections::BTreeMap;

use crate::model::{Diff, EntityReference};

/// Snapshot of the persisted watchlist, ordered by entity reference.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Watchlist {
    entries: BTreeMap<EntityReference, Vec<Diff>>,
}

impl Watchlist {
    /// Create an empty watchlist.
    pub fn new() -> Self {
        Self::default()
    }

    /// Diffs last recorded for `entity_ref`.
    pub fn get(&self, entity_ref: &EntityReference) -> Option<&[Diff]> {
        self.entries.get(entity_ref).map(Vec::as_slice)
    }

    /// Whether `entity_ref` is watched.
    pub fn contains(&self, entity_ref: &EntityReference) -> bool {
        self.entries.contains_key(entity_ref)
    }

    /// Set the diffs of `entity_ref`, adding it if needed.
    pub fn set(&mut self, entity_ref: EntityReference, diffs: Vec<Diff>) {
        self.entries.insert(entity_ref, diffs);
    }

    /// Stop watching `entity_ref`. Returns the diffs it had.
    pub fn remove(&mut self, entity_ref: &EntityReference) -> Option<Vec<Diff>> {
        self.entries.remove(entity_ref)
    }

    /// Number of watched entities.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is watched.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in reference order.
    pub fn iter(&self) -> impl Iterator<Item = (&EntityReference, &[Diff])> {
        self.entries.iter().map(|(r, d)| (r, d.as_slice()))
    }
}

impl FromIterator<(EntityReference, Vec<Diff>)> for Watchlist {
    fn from_iter<I: IntoIterator<Item = (EntityReference, Vec<Diff>)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
