// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Executor, Sqlite, SqlitePool, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::error::{CoreError, EntityContext};
use crate::graveyard::{GraveyardRecord, check_recreation};
use crate::migrations;
use crate::model::{Diff, Entity, EntityReference, Metadata, Provider};
use crate::watcher::{IntentWatcher, IntentfulStatus};
use crate::watchlist::Watchlist;

use super::{Persistence, StatusFilter, WatcherFilter, apply_status_patch};

const ENTITY_COLUMNS: &str = "uuid, provider_prefix, provider_version, kind, spec_version, \
                              extension, spec, status, created_at";

const UPSERT_WATCHLIST_ENTRY: &str = r#"
    INSERT INTO watchlist
        (entity_uuid, provider_prefix, provider_version, kind, diffs, updated_at)
    VALUES (?, ?, ?, ?, ?, ?)
    ON CONFLICT (entity_uuid) DO UPDATE SET
        diffs = excluded.diffs,
        revision = watchlist.revision + 1,
        updated_at = excluded.updated_at
"#;

const WATCHER_COLUMNS: &str = "uuid, entity_uuid, provider_prefix, provider_version, kind, \
                               spec_version, diffs, status, times_failed, last_handler_error, \
                               user_info, created_at, updated_at";

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to `url` and run migrations.
    ///
    /// In-memory URLs get a single connection, since every SQLite memory
    /// connection is a separate database.
    pub async fn connect(url: &str) -> Result<Self, CoreError> {
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {}: {}", url, e),
            })?;

        run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// Create and initialize a SQLite database at `path`.
    ///
    /// Parent directories and the database file are created when missing.
    ///
    /// ```ignore
    /// let persistence = SqlitePersistence::from_path(".data/intentful.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        Self::connect(&format!("sqlite:{}?mode=rwc", path.to_string_lossy())).await
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Begin a transaction holding the write lock from its first statement.
    ///
    /// A deferred transaction that reads and then writes cannot upgrade its
    /// lock while another connection is writing, and fails with `SQLITE_BUSY`
    /// instead of waiting.
    async fn begin_immediate(&self) -> Result<Transaction<'static, Sqlite>, CoreError> {
        Ok(self.pool.begin_with("BEGIN IMMEDIATE").await?)
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error().is_some_and(|e| e.is_unique_violation())
}

async fn run_migrations(pool: &SqlitePool) -> Result<(), CoreError> {
    migrations::run_sqlite(pool)
        .await
        .map_err(|e| CoreError::DatabaseError {
            operation: "migrate".to_string(),
            details: format!("Failed to run migrations: {}", e),
        })
}

// ============================================================================
// Row mapping
// ============================================================================

fn parse_uuid(value: &str) -> Result<Uuid, CoreError> {
    Uuid::parse_str(value).map_err(|e| CoreError::DatabaseError {
        operation: "decode_uuid".to_string(),
        details: format!("invalid UUID '{}': {}", value, e),
    })
}

fn to_db_version(version: u64) -> Result<i64, CoreError> {
    i64::try_from(version).map_err(|_| CoreError::ValidationError {
        context: None,
        field: "spec_version".to_string(),
        message: format!("{} is out of range", version),
    })
}

fn from_db_version(version: i64) -> Result<u64, CoreError> {
    u64::try_from(version).map_err(|_| CoreError::DatabaseError {
        operation: "decode_spec_version".to_string(),
        details: format!("negative spec version {}", version),
    })
}

#[derive(Debug, sqlx::FromRow)]
struct EntityRow {
    uuid: String,
    provider_prefix: String,
    provider_version: String,
    kind: String,
    spec_version: i64,
    extension: String,
    spec: String,
    status: String,
    created_at: DateTime<Utc>,
}

impl EntityRow {
    fn metadata(&self) -> Result<Metadata, CoreError> {
        Ok(Metadata {
            uuid: parse_uuid(&self.uuid)?,
            kind: self.kind.clone(),
            provider_prefix: self.provider_prefix.clone(),
            provider_version: self.provider_version.clone(),
            spec_version: from_db_version(self.spec_version)?,
            created_at: self.created_at,
            deleted_at: None,
            extension: serde_json::from_str(&self.extension)?,
        })
    }

    fn into_entity(self) -> Result<Entity, CoreError> {
        Ok(Entity {
            metadata: self.metadata()?,
            spec: serde_json::from_str(&self.spec)?,
            status: serde_json::from_str(&self.status)?,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct GraveyardRow {
    uuid: String,
    provider_prefix: String,
    provider_version: String,
    kind: String,
    spec_version: i64,
    highest_spec_version: i64,
    extension: String,
    spec: String,
    status: String,
    created_at: DateTime<Utc>,
    deleted_at: DateTime<Utc>,
}

impl GraveyardRow {
    fn into_record(self) -> Result<GraveyardRecord, CoreError> {
        Ok(GraveyardRecord {
            entity: Entity {
                metadata: Metadata {
                    uuid: parse_uuid(&self.uuid)?,
                    kind: self.kind,
                    provider_prefix: self.provider_prefix,
                    provider_version: self.provider_version,
                    spec_version: from_db_version(self.spec_version)?,
                    created_at: self.created_at,
                    deleted_at: Some(self.deleted_at),
                    extension: serde_json::from_str(&self.extension)?,
                },
                spec: serde_json::from_str(&self.spec)?,
                status: serde_json::from_str(&self.status)?,
            },
            highest_spec_version: from_db_version(self.highest_spec_version)?,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct WatcherRow {
    uuid: String,
    entity_uuid: String,
    provider_prefix: String,
    provider_version: String,
    kind: String,
    spec_version: i64,
    diffs: String,
    status: String,
    times_failed: i64,
    last_handler_error: Option<String>,
    user_info: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl WatcherRow {
    fn into_watcher(self) -> Result<IntentWatcher, CoreError> {
        let status =
            IntentfulStatus::parse(&self.status).ok_or_else(|| CoreError::DatabaseError {
                operation: "decode_watcher".to_string(),
                details: format!("unknown watcher status '{}'", self.status),
            })?;
        let user_info = self
            .user_info
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(IntentWatcher {
            uuid: parse_uuid(&self.uuid)?,
            entity_ref: EntityReference {
                provider_prefix: self.provider_prefix,
                provider_version: self.provider_version,
                kind: self.kind,
                uuid: parse_uuid(&self.entity_uuid)?,
            },
            spec_version: from_db_version(self.spec_version)?,
            diffs: serde_json::from_str(&self.diffs)?,
            status,
            times_failed: u32::try_from(self.times_failed).unwrap_or(u32::MAX),
            last_handler_error: self.last_handler_error,
            created_at: self.created_at,
            updated_at: self.updated_at,
            user_info,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct WatchlistRow {
    entity_uuid: String,
    provider_prefix: String,
    provider_version: String,
    kind: String,
    diffs: String,
}

async fn select_entity<'e, E>(
    executor: E,
    entity_ref: &EntityReference,
) -> Result<Option<EntityRow>, CoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        "SELECT {} FROM entities \
         WHERE uuid = ? AND provider_prefix = ? AND provider_version = ? AND kind = ?",
        ENTITY_COLUMNS
    );
    let row = sqlx::query_as::<_, EntityRow>(&sql)
        .bind(entity_ref.uuid.to_string())
        .bind(&entity_ref.provider_prefix)
        .bind(&entity_ref.provider_version)
        .bind(&entity_ref.kind)
        .fetch_optional(executor)
        .await?;
    Ok(row)
}

async fn select_entity_by_uuid<'e, E>(executor: E, uuid: Uuid) -> Result<Option<EntityRow>, CoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!("SELECT {} FROM entities WHERE uuid = ?", ENTITY_COLUMNS);
    let row = sqlx::query_as::<_, EntityRow>(&sql)
        .bind(uuid.to_string())
        .fetch_optional(executor)
        .await?;
    Ok(row)
}

async fn select_graveyard<'e, E>(executor: E, uuid: Uuid) -> Result<Option<GraveyardRow>, CoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query_as::<_, GraveyardRow>(
        r#"
        SELECT uuid, provider_prefix, provider_version, kind, spec_version,
               highest_spec_version, extension, spec, status, created_at, deleted_at
        FROM graveyard
        WHERE uuid = ?
        "#,
    )
    .bind(uuid.to_string())
    .fetch_optional(executor)
    .await?;
    Ok(row)
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    // ========================================================================
    // Providers
    // ========================================================================

    async fn save_provider(&self, provider: &Provider) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO providers (prefix, version, definition, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (prefix, version) DO UPDATE SET definition = excluded.definition
            "#,
        )
        .bind(&provider.prefix)
        .bind(&provider.version)
        .bind(serde_json::to_string(provider)?)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_providers(&self) -> Result<Vec<Provider>, CoreError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT definition FROM providers ORDER BY prefix, version")
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter()
            .map(|(definition,)| serde_json::from_str(&definition).map_err(CoreError::from))
            .collect()
    }

    async fn delete_provider(&self, prefix: &str, version: &str) -> Result<bool, CoreError> {
        let result = sqlx::query("DELETE FROM providers WHERE prefix = ? AND version = ?")
            .bind(prefix)
            .bind(version)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    // ========================================================================
    // Spec store
    // ========================================================================

    async fn create_entity(
        &self,
        entity: &Entity,
        requested_version: u64,
    ) -> Result<(), CoreError> {
        let metadata = &entity.metadata;
        let entity_ref = metadata.reference();
        let mut tx = self.begin_immediate().await?;

        let graveyard = select_graveyard(&mut *tx, metadata.uuid)
            .await?
            .map(GraveyardRow::into_record)
            .transpose()?;
        check_recreation(graveyard.as_ref(), requested_version, || {
            EntityContext::from(&entity_ref)
        })?;

        if let Some(existing) = select_entity_by_uuid(&mut *tx, metadata.uuid).await? {
            return Err(CoreError::ConflictingEntity {
                context: (&entity_ref).into(),
                expected_spec_version: requested_version,
                current: Box::new(existing.into_entity()?),
            });
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO entities
                (uuid, provider_prefix, provider_version, kind, spec_version,
                 extension, spec, status, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(metadata.uuid.to_string())
        .bind(&metadata.provider_prefix)
        .bind(&metadata.provider_version)
        .bind(&metadata.kind)
        .bind(to_db_version(metadata.spec_version)?)
        .bind(serde_json::to_string(&metadata.extension)?)
        .bind(serde_json::to_string(&entity.spec)?)
        .bind(serde_json::to_string(&entity.status)?)
        .bind(metadata.created_at)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {
                tx.commit().await?;
                Ok(())
            }
            Err(e) if is_unique_violation(&e) => {
                tx.rollback().await?;
                let existing = select_entity_by_uuid(&self.pool, metadata.uuid)
                    .await?
                    .ok_or_else(|| CoreError::from(e))?;
                Err(CoreError::ConflictingEntity {
                    context: (&entity_ref).into(),
                    expected_spec_version: requested_version,
                    current: Box::new(existing.into_entity()?),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_spec(
        &self,
        entity_ref: &EntityReference,
    ) -> Result<(Metadata, Value), CoreError> {
        let row = select_entity(&self.pool, entity_ref)
            .await?
            .ok_or_else(|| CoreError::entity_not_found(entity_ref))?;
        let metadata = row.metadata()?;
        Ok((metadata, serde_json::from_str(&row.spec)?))
    }

    async fn update_spec(
        &self,
        entity_ref: &EntityReference,
        expected_version: u64,
        spec: &Value,
    ) -> Result<Metadata, CoreError> {
        let sql = format!(
            "UPDATE entities SET spec = ?, spec_version = spec_version + 1 \
             WHERE uuid = ? AND provider_prefix = ? AND provider_version = ? AND kind = ? \
               AND spec_version = ? \
             RETURNING {}",
            ENTITY_COLUMNS
        );
        let updated = sqlx::query_as::<_, EntityRow>(&sql)
            .bind(serde_json::to_string(spec)?)
            .bind(entity_ref.uuid.to_string())
            .bind(&entity_ref.provider_prefix)
            .bind(&entity_ref.provider_version)
            .bind(&entity_ref.kind)
            .bind(to_db_version(expected_version)?)
            .fetch_optional(&self.pool)
            .await?;

        if let Some(row) = updated {
            return row.metadata();
        }

        match select_entity(&self.pool, entity_ref).await? {
            Some(current) => {
                debug!(
                    entity = %entity_ref,
                    expected_version,
                    current_version = current.spec_version,
                    "Spec compare-and-swap lost"
                );
                Err(CoreError::ConflictingEntity {
                    context: entity_ref.into(),
                    expected_spec_version: expected_version,
                    current: Box::new(current.into_entity()?),
                })
            }
            None => Err(CoreError::entity_not_found(entity_ref)),
        }
    }

    async fn delete_entity(
        &self,
        entity_ref: &EntityReference,
    ) -> Result<GraveyardRecord, CoreError> {
        let mut tx = self.begin_immediate().await?;

        let row = select_entity(&mut *tx, entity_ref)
            .await?
            .ok_or_else(|| CoreError::entity_not_found(entity_ref))?;
        let previous_highest = select_graveyard(&mut *tx, entity_ref.uuid)
            .await?
            .map(|g| g.highest_spec_version)
            .unwrap_or(0);
        let highest = previous_highest.max(row.spec_version);
        let deleted_at = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO graveyard
                (uuid, provider_prefix, provider_version, kind, spec_version,
                 highest_spec_version, extension, spec, status, created_at, deleted_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (uuid) DO UPDATE SET
                provider_prefix = excluded.provider_prefix,
                provider_version = excluded.provider_version,
                kind = excluded.kind,
                spec_version = excluded.spec_version,
                highest_spec_version = excluded.highest_spec_version,
                extension = excluded.extension,
                spec = excluded.spec,
                status = excluded.status,
                created_at = excluded.created_at,
                deleted_at = excluded.deleted_at
            "#,
        )
        .bind(&row.uuid)
        .bind(&row.provider_prefix)
        .bind(&row.provider_version)
        .bind(&row.kind)
        .bind(row.spec_version)
        .bind(highest)
        .bind(&row.extension)
        .bind(&row.spec)
        .bind(&row.status)
        .bind(row.created_at)
        .bind(deleted_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM entities WHERE uuid = ?")
            .bind(&row.uuid)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        let mut entity = row.into_entity()?;
        entity.metadata.deleted_at = Some(deleted_at);
        Ok(GraveyardRecord {
            entity,
            highest_spec_version: from_db_version(highest)?,
        })
    }

    async fn get_graveyard_record(
        &self,
        uuid: Uuid,
    ) -> Result<Option<GraveyardRecord>, CoreError> {
        select_graveyard(&self.pool, uuid)
            .await?
            .map(GraveyardRow::into_record)
            .transpose()
    }

    // ========================================================================
    // Status store
    // ========================================================================

    async fn get_status(
        &self,
        entity_ref: &EntityReference,
    ) -> Result<(Metadata, Value), CoreError> {
        let row = select_entity(&self.pool, entity_ref)
            .await?
            .ok_or_else(|| CoreError::entity_not_found(entity_ref))?;
        let metadata = row.metadata()?;
        Ok((metadata, serde_json::from_str(&row.status)?))
    }

    async fn update_status(
        &self,
        entity_ref: &EntityReference,
        patch: &Value,
    ) -> Result<Value, CoreError> {
        let mut tx = self.begin_immediate().await?;

        let row = select_entity(&mut *tx, entity_ref)
            .await?
            .ok_or_else(|| CoreError::entity_not_found(entity_ref))?;
        let mut status: Value = serde_json::from_str(&row.status)?;
        apply_status_patch(&mut status, patch);

        sqlx::query("UPDATE entities SET status = ? WHERE uuid = ?")
            .bind(serde_json::to_string(&status)?)
            .bind(&row.uuid)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(status)
    }

    async fn replace_status(
        &self,
        entity_ref: &EntityReference,
        status: &Value,
    ) -> Result<(), CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE entities SET status = ?
            WHERE uuid = ? AND provider_prefix = ? AND provider_version = ? AND kind = ?
            "#,
        )
        .bind(serde_json::to_string(status)?)
        .bind(entity_ref.uuid.to_string())
        .bind(&entity_ref.provider_prefix)
        .bind(&entity_ref.provider_version)
        .bind(&entity_ref.kind)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::entity_not_found(entity_ref));
        }
        Ok(())
    }

    async fn list_status(
        &self,
        filter: &StatusFilter,
    ) -> Result<Vec<(Metadata, Value)>, CoreError> {
        let sql = format!(
            "SELECT {} FROM entities \
             WHERE (? IS NULL OR provider_prefix = ?) \
               AND (? IS NULL OR provider_version = ?) \
               AND (? IS NULL OR kind = ?) \
             ORDER BY created_at {order}, rowid {order}",
            ENTITY_COLUMNS,
            order = filter.sort.as_sql()
        );
        let rows = sqlx::query_as::<_, EntityRow>(&sql)
            .bind(&filter.provider_prefix)
            .bind(&filter.provider_prefix)
            .bind(&filter.provider_version)
            .bind(&filter.provider_version)
            .bind(&filter.kind)
            .bind(&filter.kind)
            .fetch_all(&self.pool)
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let status: Value = serde_json::from_str(&row.status)?;
            if filter.matches_status(&status) {
                out.push((row.metadata()?, status));
            }
        }
        Ok(out)
    }

    // ========================================================================
    // Watchlist
    // ========================================================================

    async fn get_watchlist(&self) -> Result<Watchlist, CoreError> {
        let rows = sqlx::query_as::<_, WatchlistRow>(
            r#"
            SELECT entity_uuid, provider_prefix, provider_version, kind, diffs
            FROM watchlist
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let entity_ref = EntityReference {
                    provider_prefix: row.provider_prefix,
                    provider_version: row.provider_version,
                    kind: row.kind,
                    uuid: parse_uuid(&row.entity_uuid)?,
                };
                let diffs: Vec<Diff> = serde_json::from_str(&row.diffs)?;
                Ok((entity_ref, diffs))
            })
            .collect()
    }

    async fn update_watchlist(&self, watchlist: &Watchlist) -> Result<(), CoreError> {
        let mut tx = self.begin_immediate().await?;

        let stored: Vec<(String,)> = sqlx::query_as("SELECT entity_uuid FROM watchlist")
            .fetch_all(&mut *tx)
            .await?;
        for (entity_uuid,) in stored {
            let kept = watchlist
                .iter()
                .any(|(entity_ref, _)| entity_ref.uuid.to_string() == entity_uuid);
            if !kept {
                sqlx::query("DELETE FROM watchlist WHERE entity_uuid = ?")
                    .bind(&entity_uuid)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        for (entity_ref, diffs) in watchlist.iter() {
            sqlx::query(UPSERT_WATCHLIST_ENTRY)
                .bind(entity_ref.uuid.to_string())
                .bind(&entity_ref.provider_prefix)
                .bind(&entity_ref.provider_version)
                .bind(&entity_ref.kind)
                .bind(serde_json::to_string(diffs)?)
                .bind(Utc::now())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn insert_watchlist_entry_if_absent(
        &self,
        entity_ref: &EntityReference,
        diffs: &[Diff],
    ) -> Result<bool, CoreError> {
        let revision: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO watchlist
                (entity_uuid, provider_prefix, provider_version, kind, diffs, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (entity_uuid) DO UPDATE SET
                revision = watchlist.revision + 1,
                updated_at = excluded.updated_at
            RETURNING revision
            "#,
        )
        .bind(entity_ref.uuid.to_string())
        .bind(&entity_ref.provider_prefix)
        .bind(&entity_ref.provider_version)
        .bind(&entity_ref.kind)
        .bind(serde_json::to_string(diffs)?)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        Ok(revision == 0)
    }

    async fn set_watchlist_entry(
        &self,
        entity_ref: &EntityReference,
        diffs: &[Diff],
    ) -> Result<(), CoreError> {
        sqlx::query(UPSERT_WATCHLIST_ENTRY)
        .bind(entity_ref.uuid.to_string())
        .bind(&entity_ref.provider_prefix)
        .bind(&entity_ref.provider_version)
        .bind(&entity_ref.kind)
        .bind(serde_json::to_string(diffs)?)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn remove_watchlist_entry(
        &self,
        entity_ref: &EntityReference,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query("DELETE FROM watchlist WHERE entity_uuid = ?")
            .bind(entity_ref.uuid.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_watchlist_revision(
        &self,
        entity_ref: &EntityReference,
    ) -> Result<Option<u64>, CoreError> {
        let revision: Option<i64> =
            sqlx::query_scalar("SELECT revision FROM watchlist WHERE entity_uuid = ?")
                .bind(entity_ref.uuid.to_string())
                .fetch_optional(&self.pool)
                .await?;

        revision.map(from_db_version).transpose()
    }

    async fn remove_watchlist_entry_if_unchanged(
        &self,
        entity_ref: &EntityReference,
        revision: u64,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query("DELETE FROM watchlist WHERE entity_uuid = ? AND revision = ?")
            .bind(entity_ref.uuid.to_string())
            .bind(to_db_version(revision)?)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            debug!(
                entity = %entity_ref,
                revision,
                "Watchlist entry changed since it was read; kept"
            );
        }
        Ok(result.rows_affected() > 0)
    }

    // ========================================================================
    // Intent watchers
    // ========================================================================

    async fn save_watcher(&self, watcher: &IntentWatcher) -> Result<(), CoreError> {
        let user_info = watcher
            .user_info
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO intent_watchers
                (uuid, entity_uuid, provider_prefix, provider_version, kind, spec_version,
                 diffs, status, times_failed, last_handler_error, user_info,
                 created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(watcher.uuid.to_string())
        .bind(watcher.entity_ref.uuid.to_string())
        .bind(&watcher.entity_ref.provider_prefix)
        .bind(&watcher.entity_ref.provider_version)
        .bind(&watcher.entity_ref.kind)
        .bind(to_db_version(watcher.spec_version)?)
        .bind(serde_json::to_string(&watcher.diffs)?)
        .bind(watcher.status.as_str())
        .bind(i64::from(watcher.times_failed))
        .bind(&watcher.last_handler_error)
        .bind(user_info)
        .bind(watcher.created_at)
        .bind(watcher.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_watcher(&self, watcher_id: Uuid) -> Result<IntentWatcher, CoreError> {
        let sql = format!("SELECT {} FROM intent_watchers WHERE uuid = ?", WATCHER_COLUMNS);
        sqlx::query_as::<_, WatcherRow>(&sql)
            .bind(watcher_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoreError::watcher_not_found(watcher_id))?
            .into_watcher()
    }

    async fn update_watcher(&self, watcher: &IntentWatcher) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE intent_watchers
            SET diffs = ?, status = ?, times_failed = ?, last_handler_error = ?, updated_at = ?
            WHERE uuid = ? AND status = 'active'
            "#,
        )
        .bind(serde_json::to_string(&watcher.diffs)?)
        .bind(watcher.status.as_str())
        .bind(i64::from(watcher.times_failed))
        .bind(&watcher.last_handler_error)
        .bind(watcher.updated_at)
        .bind(watcher.uuid.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_watcher(&self, watcher_id: Uuid) -> Result<bool, CoreError> {
        let result = sqlx::query("DELETE FROM intent_watchers WHERE uuid = ?")
            .bind(watcher_id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_watchers(
        &self,
        filter: &WatcherFilter,
    ) -> Result<Vec<IntentWatcher>, CoreError> {
        let sql = format!(
            "SELECT {} FROM intent_watchers \
             WHERE (? IS NULL OR entity_uuid = ?) \
               AND (? IS NULL OR status = ?) \
             ORDER BY created_at {order}, rowid {order} \
             LIMIT ?",
            WATCHER_COLUMNS,
            order = filter.sort.as_sql()
        );
        let entity_uuid = filter.entity_uuid.map(|u| u.to_string());
        let status = filter.status.map(|s| s.as_str());

        let rows = sqlx::query_as::<_, WatcherRow>(&sql)
            .bind(&entity_uuid)
            .bind(&entity_uuid)
            .bind(status)
            .bind(status)
            .bind(filter.limit.unwrap_or(-1))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(WatcherRow::into_watcher).collect()
    }

    // ========================================================================
    // Health
    // ========================================================================

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        let row: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        Ok(row.0 == 1)
    }
}
