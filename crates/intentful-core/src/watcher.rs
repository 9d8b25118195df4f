// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Intent watchers.
//!
//! An intent watcher tracks one asynchronous attempt to bring an entity's
//! status in line with a spec version.
//!
//! ```text
//!            record_failure (times_failed < ceiling)
//!              ┌──────┐
//!              ▼      │
//!  new ──► Active ────┴──► Failed              (times_failed >= ceiling)
//!              │
//!              ├──► Active                      (progress, diffs remain)
//!              ├──► CompletedSuccessfully       (progress, no diffs left)
//!              └──► Failed                      (abandon, entity deleted)
//! ```
//!
//! Both terminal states reject every further transition.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::model::{Diff, EntityReference};
use crate::persistence::{Persistence, SortOrder, WatcherFilter};

/// Failure recorded on watchers whose entity was deleted.
pub const ENTITY_DELETED: &str = "entity deleted";

/// Lifecycle state of an intent watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentfulStatus {
    /// Reconciliation is ongoing.
    Active,
    /// Status matched spec after a handler ran.
    CompletedSuccessfully,
    /// The retry ceiling was reached, or the entity went away.
    Failed,
}

impl IntentfulStatus {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::CompletedSuccessfully => "completed_successfully",
            Self::Failed => "failed",
        }
    }

    /// Parse the storage representation.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "completed_successfully" => Some(Self::CompletedSuccessfully),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Whether no transition leaves this state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl fmt::Display for IntentfulStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A durable reconciliation task for one entity at one spec version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentWatcher {
    /// Watcher ID.
    pub uuid: Uuid,
    /// The entity being reconciled.
    pub entity_ref: EntityReference,
    /// Spec version the watcher was created for.
    pub spec_version: u64,
    /// Diffs still outstanding, as last observed.
    pub diffs: Vec<Diff>,
    /// Lifecycle state.
    pub status: IntentfulStatus,
    /// Handler failures so far.
    pub times_failed: u32,
    /// Message of the most recent handler failure.
    pub last_handler_error: Option<String>,
    /// When the watcher was created.
    pub created_at: DateTime<Utc>,
    /// When the watcher last changed.
    pub updated_at: DateTime<Utc>,
    /// Caller identity captured at creation.
    pub user_info: Option<Value>,
}

impl IntentWatcher {
    /// A new active watcher.
    pub fn new(
        entity_ref: EntityReference,
        spec_version: u64,
        diffs: Vec<Diff>,
        user_info: Option<Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            uuid: Uuid::new_v4(),
            entity_ref,
            spec_version,
            diffs,
            status: IntentfulStatus::Active,
            times_failed: 0,
            last_handler_error: None,
            created_at: now,
            updated_at: now,
            user_info,
        }
    }

    fn ensure_active(&self) -> Result<()> {
        if self.status.is_terminal() {
            return Err(CoreError::InvalidWatcherState {
                watcher_id: self.uuid,
                expected: IntentfulStatus::Active.to_string(),
                actual: self.status.to_string(),
            });
        }
        Ok(())
    }

    /// A handler attempt failed with `error`.
    ///
    /// The watcher fails permanently once `times_failed` reaches `retry_ceiling`.
    pub fn record_failure(
        &mut self,
        error: impl Into<String>,
        retry_ceiling: u32,
    ) -> Result<IntentfulStatus> {
        self.ensure_active()?;
        self.times_failed = self.times_failed.saturating_add(1);
        self.last_handler_error = Some(error.into());
        if self.times_failed >= retry_ceiling {
            self.status = IntentfulStatus::Failed;
        }
        self.updated_at = Utc::now();
        Ok(self.status)
    }

    /// A handler attempt succeeded and `remaining` diffs are still outstanding.
    pub fn record_progress(&mut self, remaining: Vec<Diff>) -> Result<IntentfulStatus> {
        self.ensure_active()?;
        if remaining.is_empty() {
            self.status = IntentfulStatus::CompletedSuccessfully;
        }
        self.diffs = remaining;
        self.updated_at = Utc::now();
        Ok(self.status)
    }

    /// Give up without another attempt. The failure count is left as is.
    pub fn abandon(&mut self, reason: impl Into<String>) -> Result<IntentfulStatus> {
        self.ensure_active()?;
        self.status = IntentfulStatus::Failed;
        self.last_handler_error = Some(reason.into());
        self.updated_at = Utc::now();
        Ok(self.status)
    }
}

/// Fail every active watcher of an entity with `reason`.
///
/// Returns the watchers that were moved to `Failed`.
pub async fn abandon_active_watchers(
    persistence: &dyn Persistence,
    entity_ref: &EntityReference,
    reason: &str,
) -> Result<Vec<Uuid>> {
    let active = persistence
        .list_watchers(&WatcherFilter {
            entity_uuid: Some(entity_ref.uuid),
            status: Some(IntentfulStatus::Active),
            sort: SortOrder::Desc,
            limit: None,
        })
        .await?;

    let mut abandoned = Vec::with_capacity(active.len());
    for mut watcher in active {
        watcher.abandon(reason)?;
        if persistence.update_watcher(&watcher).await? {
            abandoned.push(watcher.uuid);
        }
    }
    Ok(abandoned)
}
