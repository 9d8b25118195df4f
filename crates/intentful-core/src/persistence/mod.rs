// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for intentful-core.
//!
//! The engine only talks to storage through [`Persistence`]. Backends must
//! make the following operations atomic per entity:
//!
//! - [`update_spec`](Persistence::update_spec): compare-and-swap on `spec_version`
//! - [`create_entity`](Persistence::create_entity): graveyard check plus insert
//! - [`delete_entity`](Persistence::delete_entity): move into the graveyard
//! - [`insert_watchlist_entry_if_absent`](Persistence::insert_watchlist_entry_if_absent)
//! - [`remove_watchlist_entry_if_unchanged`](Persistence::remove_watchlist_entry_if_unchanged):
//!   conditional on the entry's revision
//! - [`update_watcher`](Persistence::update_watcher): applied only while the stored watcher is active

pub mod sqlite;

pub use self::sqlite::SqlitePersistence;

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::CoreError;
use crate::graveyard::GraveyardRecord;
use crate::model::{Diff, Entity, EntityReference, Metadata, Provider};
use crate::watcher::{IntentWatcher, IntentfulStatus};
use crate::watchlist::Watchlist;

/// Ordering by creation time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    /// Oldest first.
    #[default]
    Asc,
    /// Newest first.
    Desc,
}

impl SortOrder {
    /// SQL keyword for this order.
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// Filter for [`Persistence::list_status`].
#[derive(Debug, Clone, Default)]
pub struct StatusFilter {
    /// Only entities of this provider.
    pub provider_prefix: Option<String>,
    /// Only entities of this provider version.
    pub provider_version: Option<String>,
    /// Only entities of this kind.
    pub kind: Option<String>,
    /// Only entities whose status matches this document.
    pub status: Option<Value>,
    /// Match `status` exactly instead of as a subset.
    pub exact_match: bool,
    /// Creation-time ordering.
    pub sort: SortOrder,
}

impl StatusFilter {
    /// Whether `status` satisfies the status part of this filter.
    pub fn matches_status(&self, status: &Value) -> bool {
        match &self.status {
            None => true,
            Some(expected) if self.exact_match => expected == status,
            Some(expected) => contains(status, expected),
        }
    }
}

/// Whether `actual` contains every field of `expected`, recursively.
fn contains(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Object(actual), Value::Object(expected)) => expected
            .iter()
            .all(|(k, v)| actual.get(k).is_some_and(|a| contains(a, v))),
        _ => actual == expected,
    }
}

/// Filter for [`Persistence::list_watchers`].
#[derive(Debug, Clone, Default)]
pub struct WatcherFilter {
    /// Only watchers of this entity.
    pub entity_uuid: Option<Uuid>,
    /// Only watchers in this state.
    pub status: Option<IntentfulStatus>,
    /// Creation-time ordering.
    pub sort: SortOrder,
    /// Maximum number of watchers returned.
    pub limit: Option<i64>,
}

/// Deep-merge a partial status into `target`.
///
/// Nested objects merge, an explicit `null` removes the field, anything else
/// replaces the previous value.
pub fn apply_status_patch(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target_map), Value::Object(patch_map)) => {
            merge_objects(target_map, patch_map)
        }
        (target, patch) => *target = patch.clone(),
    }
}

fn merge_objects(target: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (key, value) in patch {
        match value {
            Value::Null => {
                target.remove(key);
            }
            Value::Object(patch_child) => match target.get_mut(key) {
                Some(Value::Object(target_child)) => merge_objects(target_child, patch_child),
                _ => {
                    let mut fresh = Map::new();
                    merge_objects(&mut fresh, patch_child);
                    target.insert(key.clone(), Value::Object(fresh));
                }
            },
            other => {
                target.insert(key.clone(), other.clone());
            }
        }
    }
}

/// Persistence interface for intentful-core.
#[async_trait::async_trait]
pub trait Persistence: Send + Sync {
    // ========================================================================
    // Providers
    // ========================================================================

    /// Store a provider definition, replacing the same prefix and version.
    async fn save_provider(&self, provider: &Provider) -> Result<(), CoreError>;

    /// All stored provider definitions.
    async fn list_providers(&self) -> Result<Vec<Provider>, CoreError>;

    /// Remove a provider definition. Returns whether it existed.
    async fn delete_provider(&self, prefix: &str, version: &str) -> Result<bool, CoreError>;

    // ========================================================================
    // Spec store
    // ========================================================================

    /// Insert a new entity.
    ///
    /// Fails with `GraveyardConflictingEntity` when the UUID was deleted at a
    /// version of at least `requested_version`, and with `ConflictingEntity`
    /// when a live entity already has the UUID.
    async fn create_entity(
        &self,
        entity: &Entity,
        requested_version: u64,
    ) -> Result<(), CoreError>;

    /// Metadata and spec of a live entity.
    async fn get_spec(
        &self,
        entity_ref: &EntityReference,
    ) -> Result<(Metadata, Value), CoreError>;

    /// Replace the spec if the stored version is `expected_version`.
    ///
    /// On success the version is incremented and the new metadata returned.
    /// On mismatch fails with `ConflictingEntity` carrying the current entity.
    async fn update_spec(
        &self,
        entity_ref: &EntityReference,
        expected_version: u64,
        spec: &Value,
    ) -> Result<Metadata, CoreError>;

    /// Soft-delete an entity into the graveyard.
    async fn delete_entity(
        &self,
        entity_ref: &EntityReference,
    ) -> Result<GraveyardRecord, CoreError>;

    /// Graveyard record of a deleted UUID.
    async fn get_graveyard_record(
        &self,
        uuid: Uuid,
    ) -> Result<Option<GraveyardRecord>, CoreError>;

    /// Metadata, spec and status of a live entity.
    async fn get_entity(&self, entity_ref: &EntityReference) -> Result<Entity, CoreError> {
        let (metadata, spec) = self.get_spec(entity_ref).await?;
        let (_, status) = self.get_status(entity_ref).await?;
        Ok(Entity {
            metadata,
            spec,
            status,
        })
    }

    // ========================================================================
    // Status store
    // ========================================================================

    /// Metadata and status of a live entity.
    async fn get_status(
        &self,
        entity_ref: &EntityReference,
    ) -> Result<(Metadata, Value), CoreError>;

    /// Merge a partial status (see [`apply_status_patch`]). Returns the new status.
    async fn update_status(
        &self,
        entity_ref: &EntityReference,
        patch: &Value,
    ) -> Result<Value, CoreError>;

    /// Replace the whole status.
    async fn replace_status(
        &self,
        entity_ref: &EntityReference,
        status: &Value,
    ) -> Result<(), CoreError>;

    /// Live entities' metadata and status matching `filter`.
    async fn list_status(
        &self,
        filter: &StatusFilter,
    ) -> Result<Vec<(Metadata, Value)>, CoreError>;

    // ========================================================================
    // Watchlist
    // ========================================================================

    /// The whole watchlist.
    async fn get_watchlist(&self) -> Result<Watchlist, CoreError>;

    /// Replace the whole watchlist.
    async fn update_watchlist(&self, watchlist: &Watchlist) -> Result<(), CoreError>;

    /// Add an entry unless the entity is already watched. Returns whether it was added.
    ///
    /// An existing entry keeps its diffs but has its revision bumped, so a
    /// reconcile attempt that read it earlier will not remove it.
    async fn insert_watchlist_entry_if_absent(
        &self,
        entity_ref: &EntityReference,
        diffs: &[Diff],
    ) -> Result<bool, CoreError>;

    /// Add or overwrite an entry, bumping its revision.
    async fn set_watchlist_entry(
        &self,
        entity_ref: &EntityReference,
        diffs: &[Diff],
    ) -> Result<(), CoreError>;

    /// Remove an entry. Returns whether it existed.
    async fn remove_watchlist_entry(
        &self,
        entity_ref: &EntityReference,
    ) -> Result<bool, CoreError>;

    /// Revision of an entry, or `None` when the entity is not watched.
    ///
    /// Every insert, overwrite or touch of the entry increments it.
    async fn get_watchlist_revision(
        &self,
        entity_ref: &EntityReference,
    ) -> Result<Option<u64>, CoreError>;

    /// Remove an entry only if its revision is still `revision`.
    /// Returns whether it was removed.
    async fn remove_watchlist_entry_if_unchanged(
        &self,
        entity_ref: &EntityReference,
        revision: u64,
    ) -> Result<bool, CoreError>;

    // ========================================================================
    // Intent watchers
    // ========================================================================

    /// Insert a new watcher.
    async fn save_watcher(&self, watcher: &IntentWatcher) -> Result<(), CoreError>;

    /// Load a watcher. Fails with `EntityNotFound` when missing.
    async fn get_watcher(&self, watcher_id: Uuid) -> Result<IntentWatcher, CoreError>;

    /// Persist the mutable fields of `watcher` (status, failures, diffs).
    ///
    /// Applied only while the stored watcher is active; returns whether it was.
    async fn update_watcher(&self, watcher: &IntentWatcher) -> Result<bool, CoreError>;

    /// Delete a watcher. Returns whether it existed.
    async fn delete_watcher(&self, watcher_id: Uuid) -> Result<bool, CoreError>;

    /// Watchers matching `filter`.
    async fn list_watchers(
        &self,
        filter: &WatcherFilter,
    ) -> Result<Vec<IntentWatcher>, CoreError>;

    // ========================================================================
    // Health
    // ========================================================================

    /// Check database connectivity.
    async fn health_check_db(&self) -> Result<bool, CoreError>;
}
