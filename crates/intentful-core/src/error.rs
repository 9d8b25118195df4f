// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for intentful-core.
//!
//! Every fallible operation in the crate returns [`CoreError`]. Each variant
//! carries a stable [`error_code`](CoreError::error_code) tag and, where an
//! entity is involved, an [`EntityContext`] naming the provider, kind and
//! entity the error is about.

use std::fmt;

use uuid::Uuid;

use crate::model::{Entity, EntityReference};

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Provider, kind and entity an error refers to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityContext {
    /// Provider prefix.
    pub provider_prefix: String,
    /// Provider version.
    pub provider_version: String,
    /// Kind name.
    pub kind: String,
    /// Entity UUID, when the error concerns a single entity.
    pub entity_uuid: Option<Uuid>,
}

impl EntityContext {
    /// Context for a kind, without a specific entity.
    pub fn for_kind(
        provider_prefix: impl Into<String>,
        provider_version: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            provider_prefix: provider_prefix.into(),
            provider_version: provider_version.into(),
            kind: kind.into(),
            entity_uuid: None,
        }
    }
}

impl From<&EntityReference> for EntityContext {
    fn from(entity_ref: &EntityReference) -> Self {
        Self {
            provider_prefix: entity_ref.provider_prefix.clone(),
            provider_version: entity_ref.provider_version.clone(),
            kind: entity_ref.kind.clone(),
            entity_uuid: Some(entity_ref.uuid),
        }
    }
}

impl fmt::Display for EntityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.provider_prefix, self.provider_version, self.kind
        )?;
        if let Some(uuid) = self.entity_uuid {
            write!(f, "/{}", uuid)?;
        }
        Ok(())
    }
}

/// Core errors that can occur while serving entity operations or reconciling.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// Input validation failed, including malformed signatures and missing spec.
    ValidationError {
        /// The entity or kind being validated, if any.
        context: Option<EntityContext>,
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// A spec write lost the compare-and-swap, or an entity with the same
    /// UUID already exists.
    ConflictingEntity {
        /// The entity written to.
        context: EntityContext,
        /// The version the writer expected.
        expected_spec_version: u64,
        /// Current metadata, spec and status as stored.
        current: Box<Entity>,
    },

    /// A soft-deleted entity with this UUID exists at or above the requested version.
    GraveyardConflictingEntity {
        /// The entity being recreated.
        context: EntityContext,
        /// Highest spec version recorded for the deleted entity.
        highest_spec_version: u64,
    },

    /// Entity, intent watcher, provider or kind was not found.
    EntityNotFound {
        /// What kind of record was looked up ("Entity", "IntentWatcher", ...).
        resource: &'static str,
        /// Identifier used for the lookup.
        id: String,
        /// Provider/kind context, when known.
        context: Option<EntityContext>,
    },

    /// The operation is not supported for this kind.
    InvalidOperation {
        /// The entity or kind the operation targeted.
        context: Option<EntityContext>,
        /// Human-readable reason.
        message: String,
    },

    /// An intent watcher is in a state that does not allow the transition.
    InvalidWatcherState {
        /// The watcher ID.
        watcher_id: Uuid,
        /// The expected status.
        expected: String,
        /// The actual status.
        actual: String,
    },

    /// A provider handler could not be invoked or reported a failure.
    HandlerInvocation {
        /// The entity being reconciled.
        context: EntityContext,
        /// Procedure (handler) name.
        procedure: String,
        /// Error message reported by the handler or transport.
        message: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::ConflictingEntity { .. } => "CONFLICTING_ENTITY",
            Self::GraveyardConflictingEntity { .. } => "GRAVEYARD_CONFLICTING_ENTITY",
            Self::EntityNotFound { .. } => "ENTITY_NOT_FOUND",
            Self::InvalidOperation { .. } => "INVALID_OPERATION",
            Self::InvalidWatcherState { .. } => "INVALID_WATCHER_STATE",
            Self::HandlerInvocation { .. } => "HANDLER_INVOCATION_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// Provider/kind/entity context attached to this error, if any.
    pub fn context(&self) -> Option<&EntityContext> {
        match self {
            Self::ValidationError { context, .. }
            | Self::EntityNotFound { context, .. }
            | Self::InvalidOperation { context, .. } => context.as_ref(),
            Self::ConflictingEntity { context, .. }
            | Self::GraveyardConflictingEntity { context, .. }
            | Self::HandlerInvocation { context, .. } => Some(context),
            Self::InvalidWatcherState { .. } | Self::DatabaseError { .. } => None,
        }
    }

    /// Shorthand for a missing entity.
    pub fn entity_not_found(entity_ref: &EntityReference) -> Self {
        Self::EntityNotFound {
            resource: "Entity",
            id: entity_ref.uuid.to_string(),
            context: Some(entity_ref.into()),
        }
    }

    /// Shorthand for a missing intent watcher.
    pub fn watcher_not_found(watcher_id: Uuid) -> Self {
        Self::EntityNotFound {
            resource: "IntentWatcher",
            id: watcher_id.to_string(),
            context: None,
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ValidationError {
                context,
                field,
                message,
            } => {
                write!(f, "Validation error for '{}': {}", field, message)?;
                if let Some(ctx) = context {
                    write!(f, " ({})", ctx)?;
                }
                Ok(())
            }
            Self::ConflictingEntity {
                context,
                expected_spec_version,
                current,
            } => {
                write!(
                    f,
                    "Conflicting entity '{}': expected spec version {}, current is {}",
                    context, expected_spec_version, current.metadata.spec_version
                )
            }
            Self::GraveyardConflictingEntity {
                context,
                highest_spec_version,
            } => {
                write!(
                    f,
                    "Deleted entity '{}' exists with spec version {}; recreate with a higher spec version",
                    context, highest_spec_version
                )
            }
            Self::EntityNotFound {
                resource,
                id,
                context,
            } => {
                write!(f, "{} '{}' not found", resource, id)?;
                if let Some(ctx) = context {
                    write!(f, " ({})", ctx)?;
                }
                Ok(())
            }
            Self::InvalidOperation { context, message } => {
                write!(f, "Invalid operation: {}", message)?;
                if let Some(ctx) = context {
                    write!(f, " ({})", ctx)?;
                }
                Ok(())
            }
            Self::InvalidWatcherState {
                watcher_id,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "Intent watcher '{}' is in invalid state: expected '{}', got '{}'",
                    watcher_id, expected, actual
                )
            }
            Self::HandlerInvocation {
                context,
                procedure,
                message,
            } => {
                write!(
                    f,
                    "Handler '{}' failed for '{}': {}",
                    procedure, context, message
                )
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::DatabaseError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}
