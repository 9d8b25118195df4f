// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for intentful-core integration tests.
//!
//! Provides TestContext wiring an in-memory database, a registry with the
//! location provider, a scripted handler invoker and a reconciler whose
//! retries are always immediately due. HookedPersistence wraps the database
//! to run a write in the middle of a reconcile or to fail provider saves.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{Map, Value, json};
use uuid::Uuid;

use intentful_core::backoff::{BackoffPolicy, EntropyMode, EntropySource};
use intentful_core::entity_handlers::{self, CreateEntityRequest, EntityHandlerState};
use intentful_core::error::CoreError;
use intentful_core::graveyard::GraveyardRecord;
use intentful_core::handler::{HandlerError, HandlerInvoker, HandlerRequest};
use intentful_core::model::{
    Diff, Entity, EntityReference, IntentfulBehaviour, IntentfulSignature, Kind, Metadata,
    MetadataSeed, Provider,
};
use intentful_core::persistence::{Persistence, SqlitePersistence, StatusFilter, WatcherFilter};
use intentful_core::watcher::IntentWatcher;
use intentful_core::watchlist::Watchlist;
use intentful_core::reconciler::{Reconciler, ReconcilerConfig};
use intentful_core::registry::KindRegistry;
use intentful_core::sfs::SignatureCache;

pub const PROVIDER_PREFIX: &str = "location_provider";
pub const PROVIDER_VERSION: &str = "0.1.0";
pub const RETRY_CEILING: u32 = 3;

/// What the mock handler does when invoked.
#[derive(Debug, Clone)]
pub enum MockBehaviour {
    /// Return a status patch copying the spec side of every diff content.
    ApplySpec,
    /// Fail with this message.
    Fail(String),
    /// Succeed without a patch.
    NoPatch,
}

/// Scripted handler invoker recording every call.
#[derive(Debug)]
pub struct MockInvoker {
    behaviour: Mutex<MockBehaviour>,
    calls: Mutex<Vec<HandlerRequest>>,
}

impl MockInvoker {
    pub fn new(behaviour: MockBehaviour) -> Self {
        Self {
            behaviour: Mutex::new(behaviour),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn set_behaviour(&self, behaviour: MockBehaviour) {
        *self.behaviour.lock().unwrap() = behaviour;
    }

    pub fn calls(&self) -> Vec<HandlerRequest> {
        self.calls.lock().unwrap().clone()
    }
}

/// `{"a": {"b": value}}` for key `"a.b"`, merged into `target`.
fn insert_path(target: &mut Map<String, Value>, key: &str, value: Value) {
    match key.split_once('.') {
        None => {
            target.insert(key.to_string(), value);
        }
        Some((head, rest)) => {
            let child = target
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(child) = child {
                insert_path(child, rest, value);
            }
        }
    }
}

#[async_trait]
impl HandlerInvoker for MockInvoker {
    async fn invoke(&self, request: &HandlerRequest) -> Result<Option<Value>, HandlerError> {
        self.calls.lock().unwrap().push(request.clone());
        let behaviour = self.behaviour.lock().unwrap().clone();

        match behaviour {
            MockBehaviour::Fail(message) => Err(HandlerError::Failed(message)),
            MockBehaviour::NoPatch => Ok(None),
            MockBehaviour::ApplySpec => {
                let mut patch = Map::new();
                for content in &request.diff.content {
                    let value = content.spec.first().cloned().unwrap_or(Value::Null);
                    insert_path(&mut patch, &content.key, value);
                }
                Ok(Some(Value::Object(patch)))
            }
        }
    }
}

/// A kind with `x`/`y` coordinates.
pub fn location_kind(name: &str, behaviour: IntentfulBehaviour) -> Kind {
    Kind {
        name: name.to_string(),
        intentful_behaviour: behaviour,
        intentful_signatures: vec![IntentfulSignature {
            signature: "x".to_string(),
            name: "moveX".to_string(),
            procedure_callback: Some("http://127.0.0.1:9/moveX".to_string()),
        }],
        structure: json!({
            "type": "object",
            "required": ["x", "y"],
            "properties": {
                "x": {"type": "number"},
                "y": {"type": "number"},
                "last_seen": {"type": "string", "x-intentful": "status-only"}
            }
        }),
        diff_delay: None,
        diff_retry_exponent: None,
        max_handler_retries: None,
    }
}

/// A differ kind whose `x` and `y` are moved by separate handlers.
pub fn position_kind() -> Kind {
    let mut kind = location_kind("Position", IntentfulBehaviour::Differ);
    kind.intentful_signatures.push(IntentfulSignature {
        signature: "y".to_string(),
        name: "moveY".to_string(),
        procedure_callback: Some("http://127.0.0.1:9/moveY".to_string()),
    });
    kind
}

/// The location provider: differ, basic and spec-only flavours of one kind,
/// plus a two-signature kind.
pub fn location_provider() -> Provider {
    let mut fragile = location_kind("FragileLocation", IntentfulBehaviour::Differ);
    fragile.max_handler_retries = Some(1);

    Provider {
        prefix: PROVIDER_PREFIX.to_string(),
        version: PROVIDER_VERSION.to_string(),
        kinds: vec![
            location_kind("Location", IntentfulBehaviour::Differ),
            location_kind("BasicLocation", IntentfulBehaviour::Basic),
            location_kind("SpecOnlyLocation", IntentfulBehaviour::SpecOnly),
            fragile,
            position_kind(),
        ],
    }
}

/// Reconciler settings for tests: no backoff, no jitter.
pub fn test_reconciler_config() -> ReconcilerConfig {
    ReconcilerConfig {
        poll_interval: Duration::from_millis(20),
        max_concurrent_handlers: 4,
        retry_ceiling: RETRY_CEILING,
        backoff: BackoffPolicy {
            retry_exponent: 2.0,
            max_backoff: Duration::ZERO,
        },
        entropy: EntropyMode::Debug,
        handler_timeout: Duration::from_secs(5),
    }
}

/// Everything a test needs.
pub struct TestContext {
    pub persistence: Arc<dyn Persistence>,
    pub registry: Arc<KindRegistry>,
    pub state: EntityHandlerState,
    pub invoker: Arc<MockInvoker>,
    pub reconciler: Reconciler,
}

impl TestContext {
    pub async fn new(behaviour: MockBehaviour) -> Self {
        let persistence = Arc::new(
            SqlitePersistence::connect("sqlite::memory:")
                .await
                .expect("in-memory database"),
        );
        Self::with_persistence(persistence, behaviour).await
    }

    pub async fn with_persistence(
        persistence: Arc<dyn Persistence>,
        behaviour: MockBehaviour,
    ) -> Self {
        let registry = Arc::new(KindRegistry::new(Arc::new(SignatureCache::new())));
        let state = EntityHandlerState::new(persistence.clone(), registry.clone());
        entity_handlers::handle_register_provider(&state, location_provider())
            .await
            .expect("location provider registers");

        let invoker = Arc::new(MockInvoker::new(behaviour));
        let reconciler = Reconciler::new(
            persistence.clone(),
            registry.clone(),
            invoker.clone(),
            test_reconciler_config(),
        )
        .with_entropy(EntropySource::fixed(Duration::ZERO));

        Self {
            persistence,
            registry,
            state,
            invoker,
            reconciler,
        }
    }

    /// Create an entity of `kind` with the given spec.
    pub async fn create(&self, kind: &str, spec: Value) -> Entity {
        self.create_with_seed(kind, MetadataSeed::default(), spec)
            .await
            .expect("entity is created")
    }

    pub async fn create_with_seed(
        &self,
        kind: &str,
        metadata: MetadataSeed,
        spec: Value,
    ) -> intentful_core::error::Result<Entity> {
        entity_handlers::handle_create_entity(
            &self.state,
            CreateEntityRequest {
                provider_prefix: PROVIDER_PREFIX.to_string(),
                provider_version: PROVIDER_VERSION.to_string(),
                kind: kind.to_string(),
                metadata,
                spec: Some(spec),
            },
        )
        .await
    }
}

type Hook = BoxFuture<'static, ()>;

/// Database wrapper that can run a write just before a conditional watchlist
/// removal, and can be told to fail provider saves.
pub struct HookedPersistence {
    inner: Arc<SqlitePersistence>,
    before_conditional_remove: Mutex<Option<Hook>>,
    fail_provider_saves: AtomicBool,
}

impl HookedPersistence {
    pub async fn in_memory() -> Arc<Self> {
        let inner = SqlitePersistence::connect("sqlite::memory:")
            .await
            .expect("in-memory database");
        Arc::new(Self {
            inner: Arc::new(inner),
            before_conditional_remove: Mutex::new(None),
            fail_provider_saves: AtomicBool::new(false),
        })
    }

    /// Run `hook` once, before the next conditional watchlist removal.
    pub fn before_conditional_remove(&self, hook: Hook) {
        *self.before_conditional_remove.lock().unwrap() = Some(hook);
    }

    pub fn fail_provider_saves(&self, fail: bool) {
        self.fail_provider_saves.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Persistence for HookedPersistence {
    async fn save_provider(&self, provider: &Provider) -> Result<(), CoreError> {
        if self.fail_provider_saves.load(Ordering::SeqCst) {
            return Err(CoreError::DatabaseError {
                operation: "save_provider".to_string(),
                details: "disk full".to_string(),
            });
        }
        self.inner.save_provider(provider).await
    }

    async fn list_providers(&self) -> Result<Vec<Provider>, CoreError> {
        self.inner.list_providers().await
    }

    async fn delete_provider(&self, prefix: &str, version: &str) -> Result<bool, CoreError> {
        self.inner.delete_provider(prefix, version).await
    }

    async fn create_entity(&self, entity: &Entity, requested_version: u64) -> Result<(), CoreError> {
        self.inner.create_entity(entity, requested_version).await
    }

    async fn get_spec(&self, entity_ref: &EntityReference) -> Result<(Metadata, Value), CoreError> {
        self.inner.get_spec(entity_ref).await
    }

    async fn update_spec(
        &self,
        entity_ref: &EntityReference,
        expected_version: u64,
        spec: &Value,
    ) -> Result<Metadata, CoreError> {
        self.inner.update_spec(entity_ref, expected_version, spec).await
    }

    async fn delete_entity(&self, entity_ref: &EntityReference) -> Result<GraveyardRecord, CoreError> {
        self.inner.delete_entity(entity_ref).await
    }

    async fn get_graveyard_record(&self, uuid: Uuid) -> Result<Option<GraveyardRecord>, CoreError> {
        self.inner.get_graveyard_record(uuid).await
    }

    async fn get_status(&self, entity_ref: &EntityReference) -> Result<(Metadata, Value), CoreError> {
        self.inner.get_status(entity_ref).await
    }

    async fn update_status(&self, entity_ref: &EntityReference, patch: &Value) -> Result<Value, CoreError> {
        self.inner.update_status(entity_ref, patch).await
    }

    async fn replace_status(&self, entity_ref: &EntityReference, status: &Value) -> Result<(), CoreError> {
        self.inner.replace_status(entity_ref, status).await
    }

    async fn list_status(&self, filter: &StatusFilter) -> Result<Vec<(Metadata, Value)>, CoreError> {
        self.inner.list_status(filter).await
    }

    async fn get_watchlist(&self) -> Result<Watchlist, CoreError> {
        self.inner.get_watchlist().await
    }

    async fn update_watchlist(&self, watchlist: &Watchlist) -> Result<(), CoreError> {
        self.inner.update_watchlist(watchlist).await
    }

    async fn insert_watchlist_entry_if_absent(
        &self,
        entity_ref: &EntityReference,
        diffs: &[Diff],
    ) -> Result<bool, CoreError> {
        self.inner.insert_watchlist_entry_if_absent(entity_ref, diffs).await
    }

    async fn set_watchlist_entry(&self, entity_ref: &EntityReference, diffs: &[Diff]) -> Result<(), CoreError> {
        self.inner.set_watchlist_entry(entity_ref, diffs).await
    }

    async fn remove_watchlist_entry(&self, entity_ref: &EntityReference) -> Result<bool, CoreError> {
        self.inner.remove_watchlist_entry(entity_ref).await
    }

    async fn get_watchlist_revision(&self, entity_ref: &EntityReference) -> Result<Option<u64>, CoreError> {
        self.inner.get_watchlist_revision(entity_ref).await
    }

    async fn remove_watchlist_entry_if_unchanged(
        &self,
        entity_ref: &EntityReference,
        revision: u64,
    ) -> Result<bool, CoreError> {
        let hook = self.before_conditional_remove.lock().unwrap().take();
        if let Some(hook) = hook {
            hook.await;
        }
        self.inner
            .remove_watchlist_entry_if_unchanged(entity_ref, revision)
            .await
    }

    async fn save_watcher(&self, watcher: &IntentWatcher) -> Result<(), CoreError> {
        self.inner.save_watcher(watcher).await
    }

    async fn get_watcher(&self, watcher_id: Uuid) -> Result<IntentWatcher, CoreError> {
        self.inner.get_watcher(watcher_id).await
    }

    async fn update_watcher(&self, watcher: &IntentWatcher) -> Result<bool, CoreError> {
        self.inner.update_watcher(watcher).await
    }

    async fn delete_watcher(&self, watcher_id: Uuid) -> Result<bool, CoreError> {
        self.inner.delete_watcher(watcher_id).await
    }

    async fn list_watchers(&self, filter: &WatcherFilter) -> Result<Vec<IntentWatcher>, CoreError> {
        self.inner.list_watchers(filter).await
    }

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        self.inner.health_check_db().await
    }
}
