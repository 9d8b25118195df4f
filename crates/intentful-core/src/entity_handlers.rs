// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Entity operation handlers for intentful-core.
//!
//! These handlers are the engine's public entry points: provider
//! registration, entity CRUD and intent watcher queries. A transport layer
//! maps its requests onto them and their [`CoreError`]s onto responses.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::differ::Differ;
use crate::error::{CoreError, Result};
use crate::graveyard::GraveyardRecord;
use crate::model::{Entity, EntityReference, Metadata, MetadataSeed, Provider};
use crate::persistence::{Persistence, StatusFilter, WatcherFilter};
use crate::registry::{KindRegistry, validate_provider};
use crate::strategy::SpecUpdate;
use crate::validation::{EntityValidator, PermissiveValidator};
use crate::watcher::IntentWatcher;

/// Shared state for entity handlers.
pub struct EntityHandlerState {
    /// Persistence implementation.
    pub persistence: Arc<dyn Persistence>,
    /// Registered kinds.
    pub registry: Arc<KindRegistry>,
    /// Differ sharing the registry's signature cache.
    pub differ: Differ,
    /// Gate for spec and status documents.
    pub validator: Arc<dyn EntityValidator>,
}

impl std::fmt::Debug for EntityHandlerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityHandlerState")
            .field("persistence", &"...")
            .field("registry", &self.registry)
            .finish()
    }
}

impl EntityHandlerState {
    /// Create handler state accepting every document.
    pub fn new(persistence: Arc<dyn Persistence>, registry: Arc<KindRegistry>) -> Self {
        let differ = Differ::new(registry.cache().clone());
        Self {
            persistence,
            registry,
            differ,
            validator: Arc::new(PermissiveValidator),
        }
    }

    /// Use `validator` for spec and status writes.
    pub fn with_validator(mut self, validator: Arc<dyn EntityValidator>) -> Self {
        self.validator = validator;
        self
    }
}

/// Create an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateEntityRequest {
    /// Provider prefix.
    pub provider_prefix: String,
    /// Provider version.
    pub provider_version: String,
    /// Kind name.
    pub kind: String,
    /// Caller-supplied metadata.
    #[serde(default)]
    pub metadata: MetadataSeed,
    /// Initial spec.
    #[serde(default)]
    pub spec: Option<Value>,
}

/// Write a new spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateSpecRequest {
    /// The entity.
    pub entity_ref: EntityReference,
    /// Version the caller last read.
    pub spec_version: u64,
    /// New spec.
    pub spec: Value,
    /// Caller identity, recorded on the watcher.
    #[serde(default)]
    pub user_info: Option<Value>,
}

/// Write status, partially or whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateStatusRequest {
    /// The entity.
    pub entity_ref: EntityReference,
    /// Status patch, or the whole new status for a replace.
    pub status: Value,
}

/// Metadata and status of one listed entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityStatus {
    /// Entity metadata.
    pub metadata: Metadata,
    /// Current status.
    pub status: Value,
}

/// Result of a provider registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterProviderResponse {
    /// Provider prefix.
    pub prefix: String,
    /// Provider version.
    pub version: String,
    /// Names of the kinds registered.
    pub kinds: Vec<String>,
}

// ============================================================================
// Providers
// ============================================================================

/// Persist a provider's definition and register it.
///
/// Fails with `ValidationError` when any signature is malformed; the
/// previous registration of the same version then stays in place. Nothing
/// is registered unless the definition was stored.
#[instrument(skip(state, provider), fields(provider_prefix = %provider.prefix, provider_version = %provider.version))]
pub async fn handle_register_provider(
    state: &EntityHandlerState,
    provider: Provider,
) -> Result<RegisterProviderResponse> {
    validate_provider(&provider)?;
    state.persistence.save_provider(&provider).await?;
    let registered = state.registry.register(&provider)?;

    Ok(RegisterProviderResponse {
        prefix: provider.prefix,
        version: provider.version,
        kinds: registered.iter().map(|k| k.name().to_string()).collect(),
    })
}

/// Remove a provider version. Returns whether it was known.
#[instrument(skip(state))]
pub async fn handle_deregister_provider(
    state: &EntityHandlerState,
    provider_prefix: &str,
    provider_version: &str,
) -> Result<bool> {
    let removed_kinds = state.registry.deregister(provider_prefix, provider_version);
    let removed = state
        .persistence
        .delete_provider(provider_prefix, provider_version)
        .await?;
    Ok(removed || removed_kinds > 0)
}

/// Register every persisted provider. Returns the number registered.
pub async fn restore_providers(state: &EntityHandlerState) -> Result<usize> {
    let providers = state.persistence.list_providers().await?;
    for provider in &providers {
        state.registry.register(provider)?;
    }
    info!(providers = providers.len(), "Providers restored");
    Ok(providers.len())
}

// ============================================================================
// Entities
// ============================================================================

/// Create an entity.
///
/// # Errors
///
/// - `ValidationError` when the spec is missing or rejected
/// - `GraveyardConflictingEntity` when the UUID was deleted at a version at
///   or above the requested one
/// - `ConflictingEntity` when the UUID is taken
#[instrument(skip(state, request), fields(provider_prefix = %request.provider_prefix, kind = %request.kind))]
pub async fn handle_create_entity(
    state: &EntityHandlerState,
    request: CreateEntityRequest,
) -> Result<Entity> {
    let kind = state.registry.get(
        &request.provider_prefix,
        &request.provider_version,
        &request.kind,
    )?;
    if let Some(spec) = &request.spec {
        state.validator.validate_spec(&kind, spec)?;
    }

    kind.creation_strategy
        .create(
            state.persistence.as_ref(),
            &kind,
            request.metadata,
            request.spec,
        )
        .await
}

/// Metadata, spec and status of an entity.
#[instrument(skip(state), fields(entity = %entity_ref))]
pub async fn handle_get_entity(
    state: &EntityHandlerState,
    entity_ref: &EntityReference,
) -> Result<Entity> {
    state.registry.lookup(entity_ref)?;
    state.persistence.get_entity(entity_ref).await
}

/// Write a new spec if the caller's version is current.
///
/// For differ kinds the returned update carries the watcher started for the
/// new divergence, if any.
#[instrument(skip(state, request), fields(entity = %request.entity_ref, spec_version = request.spec_version))]
pub async fn handle_update_spec(
    state: &EntityHandlerState,
    request: UpdateSpecRequest,
) -> Result<SpecUpdate> {
    let kind = state.registry.lookup(&request.entity_ref)?;
    state.validator.validate_spec(&kind, &request.spec)?;

    kind.intentful_strategy
        .update_spec(
            state.persistence.as_ref(),
            &state.differ,
            &kind,
            &request.entity_ref,
            request.spec_version,
            &request.spec,
            request.user_info,
        )
        .await
}

/// Merge a partial status. Returns the stored status.
#[instrument(skip(state, request), fields(entity = %request.entity_ref))]
pub async fn handle_update_status(
    state: &EntityHandlerState,
    request: UpdateStatusRequest,
) -> Result<Value> {
    let kind = state.registry.lookup(&request.entity_ref)?;
    state.validator.validate_status(&kind, &request.status)?;

    kind.status_strategy
        .update(
            state.persistence.as_ref(),
            &state.differ,
            &kind,
            &request.entity_ref,
            &request.status,
        )
        .await
}

/// Replace the whole status.
#[instrument(skip(state, request), fields(entity = %request.entity_ref))]
pub async fn handle_replace_status(
    state: &EntityHandlerState,
    request: UpdateStatusRequest,
) -> Result<()> {
    let kind = state.registry.lookup(&request.entity_ref)?;
    state.validator.validate_status(&kind, &request.status)?;

    kind.status_strategy
        .replace(state.persistence.as_ref(), &request.entity_ref, &request.status)
        .await
}

/// Soft-delete an entity.
#[instrument(skip(state), fields(entity = %entity_ref))]
pub async fn handle_delete_entity(
    state: &EntityHandlerState,
    entity_ref: &EntityReference,
) -> Result<GraveyardRecord> {
    let kind = state.registry.lookup(entity_ref)?;
    kind.intentful_strategy
        .delete(state.persistence.as_ref(), entity_ref)
        .await
}

/// Live entities matching `filter`, with their status.
#[instrument(skip(state, filter))]
pub async fn handle_list_entities(
    state: &EntityHandlerState,
    filter: StatusFilter,
) -> Result<Vec<EntityStatus>> {
    if let (Some(prefix), Some(version), Some(kind)) = (
        &filter.provider_prefix,
        &filter.provider_version,
        &filter.kind,
    ) {
        state.registry.get(prefix, version, kind)?;
    }

    Ok(state
        .persistence
        .list_status(&filter)
        .await?
        .into_iter()
        .map(|(metadata, status)| EntityStatus { metadata, status })
        .collect())
}

// ============================================================================
// Intent watchers
// ============================================================================

/// Load an intent watcher.
#[instrument(skip(state))]
pub async fn handle_get_intent_watcher(
    state: &EntityHandlerState,
    watcher_id: Uuid,
) -> Result<IntentWatcher> {
    state.persistence.get_watcher(watcher_id).await
}

/// Intent watchers matching `filter`.
#[instrument(skip(state, filter))]
pub async fn handle_list_intent_watchers(
    state: &EntityHandlerState,
    filter: WatcherFilter,
) -> Result<Vec<IntentWatcher>> {
    if filter.limit.is_some_and(|limit| limit < 0) {
        return Err(CoreError::ValidationError {
            context: None,
            field: "limit".to_string(),
            message: "must not be negative".to_string(),
        });
    }
    state.persistence.list_watchers(&filter).await
}
