// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reconciliation loop.
//!
//! Every poll the watchlist is read and each entity whose retry timer is due
//! gets one attempt, concurrently with other entities:
//!
//! 1. load the entity and compute its diffs
//! 2. no diffs: complete the active watchers and drop the watchlist entry,
//!    unless a write touched the entry since it was read
//! 3. otherwise make sure an active watcher exists, unless the newest one
//!    already failed at the current spec version (the entity is then parked
//!    until the next spec write)
//! 4. invoke the handler of the first diff, apply the status patch it
//!    returns, and record progress or failure on the active watchers
//! 5. schedule the next attempt after the backoff delay
//!
//! At most one attempt per entity runs at a time, and handler calls are
//! bounded by a semaphore and a timeout.
//!
//! Writers store the entity and its watchers before touching the watchlist
//! entry, so the entry's revision is read first, then the active watchers,
//! then the entity. A removal against a stale revision is skipped and the
//! entry is picked up again on the next poll.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backoff::{BackoffPolicy, EntropyMode, EntropySource};
use crate::differ::Differ;
use crate::error::{CoreError, Result};
use crate::handler::{HandlerError, HandlerInvoker, HandlerRequest};
use crate::model::{Diff, Entity, EntityReference};
use crate::persistence::{Persistence, SortOrder, WatcherFilter};
use crate::registry::{KindRegistry, RegisteredKind};
use crate::watcher::{ENTITY_DELETED, IntentWatcher, IntentfulStatus, abandon_active_watchers};

/// Reconciler configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// How often the watchlist is scanned.
    pub poll_interval: Duration,
    /// Handler calls allowed to run at once.
    pub max_concurrent_handlers: usize,
    /// Failures after which a watcher fails, unless the kind overrides it.
    pub retry_ceiling: u32,
    /// Retry delays.
    pub backoff: BackoffPolicy,
    /// Jitter bounds.
    pub entropy: EntropyMode,
    /// Longest a handler call may take before it counts as failed.
    pub handler_timeout: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(3000),
            max_concurrent_handlers: 32,
            retry_ceiling: 10,
            backoff: BackoffPolicy::default(),
            entropy: EntropyMode::Production,
            handler_timeout: Duration::from_secs(60),
        }
    }
}

/// What one attempt did.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// The entity no longer exists; its watchers were abandoned and its
    /// watchlist entry dropped.
    EntityGone,
    /// Spec and status agree; these watchers completed.
    Settled {
        /// Watchers moved to `CompletedSuccessfully`.
        completed: Vec<Uuid>,
    },
    /// The newest watcher failed at the current spec version; nothing was invoked.
    Parked {
        /// The failed watcher.
        watcher_id: Uuid,
    },
    /// The handler succeeded.
    Progressed {
        /// Newest active watcher.
        watcher_id: Uuid,
        /// Its status afterwards.
        status: IntentfulStatus,
        /// Diffs still outstanding.
        remaining: usize,
        /// Its failure count.
        times_failed: u32,
    },
    /// The handler failed.
    HandlerFailed {
        /// Newest active watcher.
        watcher_id: Uuid,
        /// Its status afterwards.
        status: IntentfulStatus,
        /// Its failure count.
        times_failed: u32,
        /// The handler's message.
        error: String,
    },
}

struct Inner {
    persistence: Arc<dyn Persistence>,
    registry: Arc<KindRegistry>,
    differ: Differ,
    invoker: Arc<dyn HandlerInvoker>,
    config: ReconcilerConfig,
    entropy: Mutex<EntropySource>,
    in_flight: Mutex<HashSet<EntityReference>>,
    next_attempt: Mutex<HashMap<EntityReference, Instant>>,
    permits: Semaphore,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Marks an entity in flight until dropped.
struct InFlight {
    inner: Arc<Inner>,
    entity_ref: EntityReference,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        lock(&self.inner.in_flight).remove(&self.entity_ref);
    }
}

/// Drives watched entities toward their spec.
#[derive(Clone)]
pub struct Reconciler {
    inner: Arc<Inner>,
    shutdown: Arc<Notify>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("persistence", &"...")
            .field("config", &self.inner.config)
            .finish()
    }
}

impl Reconciler {
    /// Create a reconciler. Jitter is seeded from the OS.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        registry: Arc<KindRegistry>,
        invoker: Arc<dyn HandlerInvoker>,
        config: ReconcilerConfig,
    ) -> Self {
        let differ = Differ::new(registry.cache().clone());
        let entropy = EntropySource::random(config.entropy);
        let permits = Semaphore::new(config.max_concurrent_handlers.max(1));
        Self {
            inner: Arc::new(Inner {
                persistence,
                registry,
                differ,
                invoker,
                config,
                entropy: Mutex::new(entropy),
                in_flight: Mutex::new(HashSet::new()),
                next_attempt: Mutex::new(HashMap::new()),
                permits,
            }),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Replace the jitter source.
    pub fn with_entropy(self, entropy: EntropySource) -> Self {
        *lock(&self.inner.entropy) = entropy;
        self
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the loop until shutdown is signalled.
    ///
    /// Attempts are spawned and not awaited, so a slow handler never holds
    /// back the next scan.
    pub async fn run(&self) {
        info!(
            poll_interval_ms = self.inner.config.poll_interval.as_millis() as u64,
            max_concurrent_handlers = self.inner.config.max_concurrent_handlers,
            retry_ceiling = self.inner.config.retry_ceiling,
            "Reconciler started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("Reconciler shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.inner.config.poll_interval) => {
                    match self.claim_due().await {
                        Ok(claimed) => {
                            for guard in claimed {
                                tokio::spawn(attempt(guard));
                            }
                        }
                        Err(e) => error!(error = %e, "Failed to read watchlist"),
                    }
                }
            }
        }
    }

    /// Run one attempt for every due entity and wait for all of them.
    pub async fn run_once(
        &self,
    ) -> Result<Vec<(EntityReference, Result<ReconcileOutcome>)>> {
        let claimed = self.claim_due().await?;

        let mut tasks = JoinSet::new();
        for guard in claimed {
            tasks.spawn(async move {
                let entity_ref = guard.entity_ref.clone();
                (entity_ref, attempt(guard).await)
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!(error = %e, "Reconcile task panicked"),
            }
        }
        Ok(outcomes)
    }

    /// One attempt for one entity, ignoring its retry timer.
    ///
    /// Fails with `InvalidOperation` when an attempt for the entity is
    /// already running.
    pub async fn reconcile_entity(&self, entity_ref: &EntityReference) -> Result<ReconcileOutcome> {
        let claimed = claim(&self.inner, entity_ref).ok_or_else(|| CoreError::InvalidOperation {
            context: Some(entity_ref.into()),
            message: "a reconcile attempt is already running for this entity".to_string(),
        })?;
        self.inner.reconcile(&claimed.entity_ref).await
    }

    /// Watchlist entries whose timer is due, claimed for an attempt.
    async fn claim_due(&self) -> Result<Vec<InFlight>> {
        let watchlist = self.inner.persistence.get_watchlist().await?;
        let now = Instant::now();

        {
            let mut timers = lock(&self.inner.next_attempt);
            timers.retain(|entity_ref, _| watchlist.contains(entity_ref));
        }

        let mut claimed = Vec::new();
        for (entity_ref, _) in watchlist.iter() {
            let due = lock(&self.inner.next_attempt)
                .get(entity_ref)
                .is_none_or(|at| *at <= now);
            if !due {
                continue;
            }
            if let Some(guard) = claim(&self.inner, entity_ref) {
                claimed.push(guard);
            }
        }

        if !claimed.is_empty() {
            debug!(
                watched = watchlist.len(),
                due = claimed.len(),
                "Dispatching reconcile attempts"
            );
        }
        Ok(claimed)
    }
}

fn claim(inner: &Arc<Inner>, entity_ref: &EntityReference) -> Option<InFlight> {
    if !lock(&inner.in_flight).insert(entity_ref.clone()) {
        return None;
    }
    Some(InFlight {
        inner: inner.clone(),
        entity_ref: entity_ref.clone(),
    })
}

/// Run one attempt and schedule the next.
async fn attempt(guard: InFlight) -> Result<ReconcileOutcome> {
    let inner = guard.inner.clone();
    let entity_ref = &guard.entity_ref;
    let result = inner.reconcile(entity_ref).await;

    let retry_in = match &result {
        Ok(ReconcileOutcome::EntityGone) | Ok(ReconcileOutcome::Settled { .. }) => None,
        Ok(ReconcileOutcome::Parked { .. })
        | Ok(ReconcileOutcome::HandlerFailed {
            status: IntentfulStatus::Failed,
            ..
        }) => Some(inner.config.backoff.max_backoff),
        Ok(ReconcileOutcome::Progressed { times_failed, .. })
        | Ok(ReconcileOutcome::HandlerFailed { times_failed, .. }) => {
            Some(inner.delay(entity_ref, *times_failed))
        }
        Err(e) => {
            error!(entity = %entity_ref, error = %e, "Reconcile attempt failed");
            Some(inner.delay(entity_ref, 0))
        }
    };

    let mut timers = lock(&inner.next_attempt);
    match retry_in {
        Some(delay) => {
            debug!(
                entity = %entity_ref,
                delay_ms = delay.as_millis() as u64,
                "Next attempt scheduled"
            );
            timers.insert(entity_ref.clone(), Instant::now() + delay);
        }
        None => {
            timers.remove(entity_ref);
        }
    }
    drop(timers);

    result
}

impl Inner {
    fn delay(&self, entity_ref: &EntityReference, attempt: u32) -> Duration {
        let mut entropy = lock(&self.entropy);
        match self.registry.lookup(entity_ref) {
            Ok(kind) => self.config.backoff.delay(attempt, &kind.kind, &mut entropy),
            Err(_) => self.config.backoff.max_backoff,
        }
    }

    async fn reconcile(&self, entity_ref: &EntityReference) -> Result<ReconcileOutcome> {
        let kind = self.registry.lookup(entity_ref)?;

        let revision = self.persistence.get_watchlist_revision(entity_ref).await?;
        let mut active = self.active_watchers(entity_ref).await?;
        let entity = match self.persistence.get_entity(entity_ref).await {
            Ok(entity) => entity,
            Err(CoreError::EntityNotFound { .. }) => {
                return self.entity_gone(entity_ref, revision).await;
            }
            Err(e) => return Err(e),
        };

        let diffs = self.differ.diffs(&kind, &entity.spec, &entity.status)?;

        if diffs.is_empty() {
            let mut completed = Vec::with_capacity(active.len());
            for watcher in &mut active {
                watcher.record_progress(Vec::new())?;
                self.store_watcher(watcher).await?;
                completed.push(watcher.uuid);
            }
            self.unwatch(entity_ref, revision).await?;
            if !completed.is_empty() {
                info!(entity = %entity_ref, watchers = completed.len(), "Entity settled");
            }
            return Ok(ReconcileOutcome::Settled { completed });
        }

        if active.is_empty() {
            let newest = self
                .persistence
                .list_watchers(&WatcherFilter {
                    entity_uuid: Some(entity_ref.uuid),
                    sort: SortOrder::Desc,
                    limit: Some(1),
                    ..Default::default()
                })
                .await?
                .into_iter()
                .next();

            if let Some(failed) = newest.filter(|w| {
                w.status == IntentfulStatus::Failed
                    && w.spec_version == entity.metadata.spec_version
            }) {
                self.persistence
                    .set_watchlist_entry(entity_ref, &diffs)
                    .await?;
                debug!(
                    entity = %entity_ref,
                    watcher_id = %failed.uuid,
                    "Divergence already failed at this spec version"
                );
                return Ok(ReconcileOutcome::Parked {
                    watcher_id: failed.uuid,
                });
            }

            let watcher = IntentWatcher::new(
                entity_ref.clone(),
                entity.metadata.spec_version,
                diffs.clone(),
                None,
            );
            self.persistence.save_watcher(&watcher).await?;
            info!(
                entity = %entity_ref,
                watcher_id = %watcher.uuid,
                spec_version = watcher.spec_version,
                "Intent watcher started for drift"
            );
            active.push(watcher);
        }

        self.persistence
            .set_watchlist_entry(entity_ref, &diffs)
            .await?;

        let diff = diffs[0].clone();
        let procedure = diff.procedure.clone();
        let outcome = self.invoke(&kind, entity, diff).await?;

        match outcome {
            Ok(patch) => {
                if let Some(patch) = patch {
                    kind.status_strategy
                        .update(
                            self.persistence.as_ref(),
                            &self.differ,
                            &kind,
                            entity_ref,
                            &patch,
                        )
                        .await?;
                }
                self.after_success(&kind, entity_ref, active).await
            }
            Err(handler_error) => {
                self.after_failure(&kind, entity_ref, &procedure, active, handler_error)
                    .await
            }
        }
    }

    async fn active_watchers(&self, entity_ref: &EntityReference) -> Result<Vec<IntentWatcher>> {
        self.persistence
            .list_watchers(&WatcherFilter {
                entity_uuid: Some(entity_ref.uuid),
                status: Some(IntentfulStatus::Active),
                sort: SortOrder::Desc,
                limit: None,
            })
            .await
    }

    /// Drop the watchlist entry if it is still at `revision`.
    async fn unwatch(&self, entity_ref: &EntityReference, revision: Option<u64>) -> Result<()> {
        if let Some(revision) = revision {
            self.persistence
                .remove_watchlist_entry_if_unchanged(entity_ref, revision)
                .await?;
        }
        Ok(())
    }

    async fn entity_gone(
        &self,
        entity_ref: &EntityReference,
        revision: Option<u64>,
    ) -> Result<ReconcileOutcome> {
        let abandoned =
            abandon_active_watchers(self.persistence.as_ref(), entity_ref, ENTITY_DELETED).await?;
        self.unwatch(entity_ref, revision).await?;
        debug!(
            entity = %entity_ref,
            abandoned_watchers = abandoned.len(),
            "Watched entity is gone"
        );
        Ok(ReconcileOutcome::EntityGone)
    }

    async fn store_watcher(&self, watcher: &IntentWatcher) -> Result<()> {
        if !self.persistence.update_watcher(watcher).await? {
            debug!(
                watcher_id = %watcher.uuid,
                "Watcher was no longer active; update skipped"
            );
        }
        Ok(())
    }

    /// Call the handler of `diff`. The outer error is a storage or lookup
    /// failure, the inner one the handler's.
    async fn invoke(
        &self,
        kind: &RegisteredKind,
        entity: Entity,
        diff: Diff,
    ) -> Result<std::result::Result<Option<Value>, HandlerError>> {
        let entity_ref = entity.metadata.reference();
        let callback = kind
            .signature(&diff.signature)
            .and_then(|s| s.procedure_callback.clone());
        let request = HandlerRequest {
            entity_ref,
            procedure: diff.procedure.clone(),
            callback,
            entity,
            diff,
        };

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| CoreError::InvalidOperation {
                context: Some((&request.entity_ref).into()),
                message: "handler pool is closed".to_string(),
            })?;

        debug!(
            entity = %request.entity_ref,
            procedure = %request.procedure,
            "Invoking handler"
        );

        let timeout = self.config.handler_timeout;
        Ok(
            match tokio::time::timeout(timeout, self.invoker.invoke(&request)).await {
                Ok(result) => result,
                Err(_) => Err(HandlerError::Timeout(timeout)),
            },
        )
    }

    async fn after_success(
        &self,
        kind: &RegisteredKind,
        entity_ref: &EntityReference,
        mut active: Vec<IntentWatcher>,
    ) -> Result<ReconcileOutcome> {
        let revision = self.persistence.get_watchlist_revision(entity_ref).await?;
        let remaining = match self.persistence.get_entity(entity_ref).await {
            Ok(entity) => self.differ.diffs(kind, &entity.spec, &entity.status)?,
            Err(CoreError::EntityNotFound { .. }) => {
                return self.entity_gone(entity_ref, revision).await;
            }
            Err(e) => return Err(e),
        };

        for watcher in &mut active {
            watcher.record_progress(remaining.clone())?;
            self.store_watcher(watcher).await?;
        }

        if remaining.is_empty() {
            self.unwatch(entity_ref, revision).await?;
        } else {
            self.persistence
                .set_watchlist_entry(entity_ref, &remaining)
                .await?;
        }

        let newest = &active[0];
        info!(
            entity = %entity_ref,
            watcher_id = %newest.uuid,
            status = %newest.status,
            remaining = remaining.len(),
            "Handler succeeded"
        );
        Ok(ReconcileOutcome::Progressed {
            watcher_id: newest.uuid,
            status: newest.status,
            remaining: remaining.len(),
            times_failed: newest.times_failed,
        })
    }

    async fn after_failure(
        &self,
        kind: &RegisteredKind,
        entity_ref: &EntityReference,
        procedure: &str,
        mut active: Vec<IntentWatcher>,
        handler_error: HandlerError,
    ) -> Result<ReconcileOutcome> {
        let message = handler_error.to_string();
        let failure = CoreError::HandlerInvocation {
            context: entity_ref.into(),
            procedure: procedure.to_string(),
            message: message.clone(),
        };
        let ceiling = kind
            .kind
            .max_handler_retries
            .unwrap_or(self.config.retry_ceiling);

        for watcher in &mut active {
            watcher.record_failure(message.clone(), ceiling)?;
            self.store_watcher(watcher).await?;
        }

        let newest = &active[0];
        if newest.status == IntentfulStatus::Failed {
            error!(
                entity = %entity_ref,
                watcher_id = %newest.uuid,
                times_failed = newest.times_failed,
                error = %failure,
                "Intent watcher failed"
            );
        } else {
            warn!(
                entity = %entity_ref,
                watcher_id = %newest.uuid,
                times_failed = newest.times_failed,
                error = %failure,
                error_code = failure.error_code(),
                "Handler failed"
            );
        }

        Ok(ReconcileOutcome::HandlerFailed {
            watcher_id: newest.uuid,
            status: newest.status,
            times_failed: newest.times_failed,
            error: message,
        })
    }
}
