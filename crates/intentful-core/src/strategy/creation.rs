// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Entity creation strategies.

use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::model::{Entity, IntentfulBehaviour, Metadata, MetadataSeed};
use crate::persistence::Persistence;
use crate::registry::RegisteredKind;

/// How entities of a kind are created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityCreationStrategy {
    /// Store spec and status.
    Plain,
    /// Store spec and status, and put the entity on the watchlist.
    Watched,
}

impl EntityCreationStrategy {
    /// The strategy for a behaviour.
    pub fn for_behaviour(behaviour: IntentfulBehaviour) -> Self {
        match behaviour {
            IntentfulBehaviour::Differ => Self::Watched,
            IntentfulBehaviour::SpecOnly | IntentfulBehaviour::Basic => Self::Plain,
        }
    }

    /// Create an entity whose initial status is its spec.
    ///
    /// The seed's `spec_version` (0 when absent) is the version the creation
    /// is based on; the stored entity starts one above it, since the creation
    /// is itself a spec write.
    pub async fn create(
        &self,
        persistence: &dyn Persistence,
        kind: &RegisteredKind,
        seed: MetadataSeed,
        spec: Option<Value>,
    ) -> Result<Entity> {
        let spec = spec.ok_or_else(|| CoreError::ValidationError {
            context: Some(kind.context()),
            field: "spec".to_string(),
            message: "Spec is required to create an entity".to_string(),
        })?;

        let entity_ref = kind.reference(seed.uuid.unwrap_or_else(Uuid::new_v4));
        let requested_version = seed.spec_version.unwrap_or(0);

        let mut metadata = Metadata::new(&entity_ref, requested_version.saturating_add(1));
        metadata.extension = seed.extension;

        let entity = Entity {
            metadata,
            status: spec.clone(),
            spec,
        };
        persistence.create_entity(&entity, requested_version).await?;

        if *self == Self::Watched {
            persistence
                .insert_watchlist_entry_if_absent(&entity_ref, &[])
                .await?;
        }

        info!(
            entity = %entity_ref,
            spec_version = entity.metadata.spec_version,
            "Entity created"
        );
        Ok(entity)
    }
}
