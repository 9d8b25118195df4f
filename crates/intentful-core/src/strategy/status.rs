// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Status write strategies.

use serde_json::Value;
use tracing::debug;

use crate::differ::Differ;
use crate::error::{CoreError, Result};
use crate::model::{EntityReference, IntentfulBehaviour};
use crate::persistence::Persistence;
use crate::registry::RegisteredKind;

const SPEC_ONLY_MESSAGE: &str =
    "Cannot update status for spec-only entity. Verify the entity and entity type.";

/// How status writes are applied to a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusUpdateStrategy {
    /// Status is owned by the engine; writes are rejected.
    SpecOnly,
    /// Writes go straight to the status store.
    Basic,
    /// Writes go to the status store and put the entity on the watchlist.
    Differ,
}

impl StatusUpdateStrategy {
    /// The strategy for a behaviour.
    pub fn for_behaviour(behaviour: IntentfulBehaviour) -> Self {
        match behaviour {
            IntentfulBehaviour::SpecOnly => Self::SpecOnly,
            IntentfulBehaviour::Basic => Self::Basic,
            IntentfulBehaviour::Differ => Self::Differ,
        }
    }

    fn reject(entity_ref: &EntityReference) -> CoreError {
        CoreError::InvalidOperation {
            context: Some(entity_ref.into()),
            message: SPEC_ONLY_MESSAGE.to_string(),
        }
    }

    /// Merge a partial status. Returns the stored status.
    ///
    /// For differ kinds the merged status is stored first, then diffed against
    /// spec, and the entity is added to the watchlist with those diffs unless
    /// already there. An existing entry is touched so a concurrent settle
    /// keeps it.
    pub async fn update(
        &self,
        persistence: &dyn Persistence,
        differ: &Differ,
        kind: &RegisteredKind,
        entity_ref: &EntityReference,
        patch: &Value,
    ) -> Result<Value> {
        match self {
            Self::SpecOnly => Err(Self::reject(entity_ref)),
            Self::Basic => persistence.update_status(entity_ref, patch).await,
            Self::Differ => {
                let merged = persistence.update_status(entity_ref, patch).await?;
                let (_, spec) = persistence.get_spec(entity_ref).await?;

                let diffs = differ.diffs(kind, &spec, &merged)?;
                let added = persistence
                    .insert_watchlist_entry_if_absent(entity_ref, &diffs)
                    .await?;
                debug!(
                    entity = %entity_ref,
                    diffs = diffs.len(),
                    added_to_watchlist = added,
                    "Status update diffed"
                );

                Ok(merged)
            }
        }
    }

    /// Replace the whole status.
    pub async fn replace(
        &self,
        persistence: &dyn Persistence,
        entity_ref: &EntityReference,
        status: &Value,
    ) -> Result<()> {
        match self {
            Self::SpecOnly => Err(Self::reject(entity_ref)),
            Self::Basic | Self::Differ => persistence.replace_status(entity_ref, status).await,
        }
    }
}
