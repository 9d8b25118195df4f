// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Spec write and delete strategies.

use serde_json::Value;
use tracing::info;

use crate::differ::Differ;
use crate::error::Result;
use crate::graveyard::GraveyardRecord;
use crate::model::{EntityReference, IntentfulBehaviour, Metadata};
use crate::persistence::Persistence;
use crate::registry::RegisteredKind;
use crate::watcher::{ENTITY_DELETED, IntentWatcher, abandon_active_watchers};

/// Outcome of an accepted spec write.
#[derive(Debug, Clone, PartialEq)]
pub struct SpecUpdate {
    /// Metadata after the write.
    pub metadata: Metadata,
    /// The spec as written.
    pub spec: Value,
    /// Watcher started for the divergence the write introduced, if any.
    pub watcher: Option<IntentWatcher>,
}

/// How spec writes and deletes are applied to a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentfulStrategy {
    /// Status is kept equal to spec.
    SpecOnly,
    /// Spec is stored, nothing else happens.
    Basic,
    /// Spec is stored and a watcher tracks the resulting divergence.
    Differ,
}

impl IntentfulStrategy {
    /// The strategy for a behaviour.
    pub fn for_behaviour(behaviour: IntentfulBehaviour) -> Self {
        match behaviour {
            IntentfulBehaviour::SpecOnly => Self::SpecOnly,
            IntentfulBehaviour::Basic => Self::Basic,
            IntentfulBehaviour::Differ => Self::Differ,
        }
    }

    /// Write `spec` if the stored version is `expected_version`.
    ///
    /// A lost compare-and-swap fails with `ConflictingEntity` and leaves
    /// status, watchlist and watchers untouched.
    #[allow(clippy::too_many_arguments)]
    pub async fn update_spec(
        &self,
        persistence: &dyn Persistence,
        differ: &Differ,
        kind: &RegisteredKind,
        entity_ref: &EntityReference,
        expected_version: u64,
        spec: &Value,
        user_info: Option<Value>,
    ) -> Result<SpecUpdate> {
        let metadata = persistence
            .update_spec(entity_ref, expected_version, spec)
            .await?;

        let watcher = match self {
            Self::SpecOnly => {
                persistence.replace_status(entity_ref, spec).await?;
                None
            }
            Self::Basic => None,
            Self::Differ => {
                let (_, status) = persistence.get_status(entity_ref).await?;
                let diffs = differ.diffs(kind, spec, &status)?;
                if diffs.is_empty() {
                    None
                } else {
                    let watcher = IntentWatcher::new(
                        entity_ref.clone(),
                        metadata.spec_version,
                        diffs.clone(),
                        user_info,
                    );
                    persistence.save_watcher(&watcher).await?;
                    persistence.set_watchlist_entry(entity_ref, &diffs).await?;
                    info!(
                        entity = %entity_ref,
                        watcher_id = %watcher.uuid,
                        spec_version = metadata.spec_version,
                        diffs = diffs.len(),
                        "Intent watcher started"
                    );
                    Some(watcher)
                }
            }
        };

        Ok(SpecUpdate {
            metadata,
            spec: spec.clone(),
            watcher,
        })
    }

    /// Soft-delete an entity into the graveyard.
    pub async fn delete(
        &self,
        persistence: &dyn Persistence,
        entity_ref: &EntityReference,
    ) -> Result<GraveyardRecord> {
        let record = persistence.delete_entity(entity_ref).await?;
        let mut abandoned = 0;
        if *self == Self::Differ {
            persistence.remove_watchlist_entry(entity_ref).await?;
            abandoned = abandon_active_watchers(persistence, entity_ref, ENTITY_DELETED)
                .await?
                .len();
        }
        info!(
            entity = %entity_ref,
            highest_spec_version = record.highest_spec_version,
            abandoned_watchers = abandoned,
            "Entity deleted"
        );
        Ok(record)
    }
}
