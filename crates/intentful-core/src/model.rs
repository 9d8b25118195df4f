// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Entity, diff and provider data model.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Identifies one entity of one kind of one provider version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityReference {
    /// Provider prefix.
    pub provider_prefix: String,
    /// Provider version.
    pub provider_version: String,
    /// Kind name.
    pub kind: String,
    /// Entity UUID.
    pub uuid: Uuid,
}

impl EntityReference {
    /// Reference an entity of the given kind.
    pub fn new(
        provider_prefix: impl Into<String>,
        provider_version: impl Into<String>,
        kind: impl Into<String>,
        uuid: Uuid,
    ) -> Self {
        Self {
            provider_prefix: provider_prefix.into(),
            provider_version: provider_version.into(),
            kind: kind.into(),
            uuid,
        }
    }
}

impl fmt::Display for EntityReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.provider_prefix, self.provider_version, self.kind, self.uuid
        )
    }
}

/// Entity metadata as stored alongside spec and status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Entity UUID.
    pub uuid: Uuid,
    /// Kind name.
    pub kind: String,
    /// Provider prefix.
    pub provider_prefix: String,
    /// Provider version.
    pub provider_version: String,
    /// Incremented on every accepted spec write.
    pub spec_version: u64,
    /// When the entity was created.
    pub created_at: DateTime<Utc>,
    /// When the entity was soft-deleted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    /// Free-form caller-supplied metadata.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extension: Map<String, Value>,
}

impl Metadata {
    /// Fresh metadata for `entity_ref` at `spec_version`.
    pub fn new(entity_ref: &EntityReference, spec_version: u64) -> Self {
        Self {
            uuid: entity_ref.uuid,
            kind: entity_ref.kind.clone(),
            provider_prefix: entity_ref.provider_prefix.clone(),
            provider_version: entity_ref.provider_version.clone(),
            spec_version,
            created_at: Utc::now(),
            deleted_at: None,
            extension: Map::new(),
        }
    }

    /// The reference this metadata describes.
    pub fn reference(&self) -> EntityReference {
        EntityReference {
            provider_prefix: self.provider_prefix.clone(),
            provider_version: self.provider_version.clone(),
            kind: self.kind.clone(),
            uuid: self.uuid,
        }
    }
}

/// Caller-supplied metadata for entity creation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataSeed {
    /// UUID to create the entity under; generated when absent.
    #[serde(default)]
    pub uuid: Option<Uuid>,
    /// Version the creation is based on. Must exceed any graveyard version.
    #[serde(default)]
    pub spec_version: Option<u64>,
    /// Extension fields copied to the created metadata.
    #[serde(default)]
    pub extension: Map<String, Value>,
}

/// Metadata, spec and status of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Entity metadata.
    pub metadata: Metadata,
    /// Desired state.
    pub spec: Value,
    /// Observed state.
    pub status: Value,
}

/// One structural difference found by a signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffContent {
    /// Identity of the element the difference is in (vector indices, key fields).
    #[serde(default)]
    pub keys: Map<String, Value>,
    /// Dotted path of the differing value.
    pub key: String,
    /// Spec side: empty when absent from spec.
    pub spec: Vec<Value>,
    /// Status side: empty when absent from status.
    pub status: Vec<Value>,
}

/// Differences matched by one intentful signature, with the handler responsible for them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diff {
    /// The signature text, which identifies the diff.
    pub signature: String,
    /// Name of the procedure handling this signature.
    pub procedure: String,
    /// The differences found.
    pub content: Vec<DiffContent>,
}

/// How a kind's spec and status are kept in line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentfulBehaviour {
    /// Status mirrors spec; status writes are rejected.
    SpecOnly,
    /// Status is written by the provider; nothing is reconciled.
    Basic,
    /// Spec/status differences are computed and handed to handlers.
    Differ,
}

/// A field-selector signature and the handler bound to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentfulSignature {
    /// Signature text, e.g. `"x"` or `"hosts.+{name}"`.
    pub signature: String,
    /// Procedure name.
    pub name: String,
    /// URL the procedure is reachable at.
    #[serde(default)]
    pub procedure_callback: Option<String>,
}

/// A kind as declared by its provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kind {
    /// Kind name.
    pub name: String,
    /// Reconciliation behaviour.
    pub intentful_behaviour: IntentfulBehaviour,
    /// Signatures, in the order their diffs are reported.
    #[serde(default)]
    pub intentful_signatures: Vec<IntentfulSignature>,
    /// Structural schema of spec/status; status-only fields are marked here.
    #[serde(default)]
    pub structure: Value,
    /// Base delay in seconds added to the retry jitter.
    #[serde(default)]
    pub diff_delay: Option<u64>,
    /// Backoff exponent overriding the engine default.
    #[serde(default)]
    pub diff_retry_exponent: Option<f64>,
    /// Retry ceiling overriding the engine default.
    #[serde(default)]
    pub max_handler_retries: Option<u32>,
}

/// A provider: a named, versioned set of kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provider {
    /// Provider prefix.
    pub prefix: String,
    /// Provider version.
    pub version: String,
    /// Kinds served by this provider.
    pub kinds: Vec<Kind>,
}
