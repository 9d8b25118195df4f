// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Soft-deleted entities.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, EntityContext, Result};
use crate::model::Entity;

/// Last known state of a deleted entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraveyardRecord {
    /// Metadata (with `deleted_at` set), spec and status at deletion.
    pub entity: Entity,
    /// Highest spec version the UUID has reached across all its lives.
    pub highest_spec_version: u64,
}

/// Reject recreating a deleted UUID unless `requested_version` is above
/// every version it has had.
pub fn check_recreation(
    record: Option<&GraveyardRecord>,
    requested_version: u64,
    context: impl FnOnce() -> EntityContext,
) -> Result<()> {
    match record {
        Some(record) if requested_version <= record.highest_spec_version => {
            Err(CoreError::GraveyardConflictingEntity {
                context: context(),
                highest_spec_version: record.highest_spec_version,
            })
        }
        _ => Ok(()),
    }
}
