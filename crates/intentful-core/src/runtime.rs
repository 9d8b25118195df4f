// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for intentful-core.
//!
//! This module provides [`EngineRuntime`] which allows embedding the engine
//! into an existing tokio application instead of running it as a standalone
//! process.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use intentful_core::runtime::EngineRuntime;
//! use intentful_core::persistence::SqlitePersistence;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let persistence = Arc::new(SqlitePersistence::from_path(".data/intentful.db").await?);
//!
//!     let runtime = EngineRuntime::builder()
//!         .persistence(persistence)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... serve entity operations through runtime.state() ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::backoff::EntropySource;
use crate::entity_handlers::{self, EntityHandlerState};
use crate::handler::{HandlerInvoker, HttpHandlerInvoker};
use crate::model::Provider;
use crate::persistence::Persistence;
use crate::reconciler::{Reconciler, ReconcilerConfig};
use crate::registry::KindRegistry;
use crate::sfs::SignatureCache;
use crate::validation::EntityValidator;

/// Builder for creating an [`EngineRuntime`].
#[derive(Default)]
pub struct EngineRuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    invoker: Option<Arc<dyn HandlerInvoker>>,
    validator: Option<Arc<dyn EntityValidator>>,
    entropy: Option<EntropySource>,
    providers: Vec<Provider>,
    reconciler: ReconcilerConfig,
}

impl std::fmt::Debug for EngineRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRuntimeBuilder")
            .field("persistence", &self.persistence.as_ref().map(|_| "..."))
            .field("invoker", &self.invoker.as_ref().map(|_| "..."))
            .field("providers", &self.providers.len())
            .field("reconciler", &self.reconciler)
            .finish()
    }
}

impl EngineRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the persistence layer (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the handler invoker.
    ///
    /// Default: [`HttpHandlerInvoker`] with the reconciler's handler timeout.
    pub fn invoker(mut self, invoker: Arc<dyn HandlerInvoker>) -> Self {
        self.invoker = Some(invoker);
        self
    }

    /// Set the validation gate. Default: accept everything.
    pub fn validator(mut self, validator: Arc<dyn EntityValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Set the retry jitter source. Default: OS-seeded random jitter.
    pub fn entropy(mut self, entropy: EntropySource) -> Self {
        self.entropy = Some(entropy);
        self
    }

    /// Register `provider` at start, after the persisted ones.
    pub fn provider(mut self, provider: Provider) -> Self {
        self.providers.push(provider);
        self
    }

    /// Set the reconciler configuration.
    pub fn reconciler_config(mut self, config: ReconcilerConfig) -> Self {
        self.reconciler = config;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<EngineRuntimeConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;

        let invoker = match self.invoker {
            Some(invoker) => invoker,
            None => Arc::new(HttpHandlerInvoker::new(self.reconciler.handler_timeout)?),
        };

        Ok(EngineRuntimeConfig {
            persistence,
            invoker,
            validator: self.validator,
            entropy: self.entropy,
            providers: self.providers,
            reconciler: self.reconciler,
        })
    }
}

/// Configuration for an [`EngineRuntime`].
pub struct EngineRuntimeConfig {
    persistence: Arc<dyn Persistence>,
    invoker: Arc<dyn HandlerInvoker>,
    validator: Option<Arc<dyn EntityValidator>>,
    entropy: Option<EntropySource>,
    providers: Vec<Provider>,
    reconciler: ReconcilerConfig,
}

impl std::fmt::Debug for EngineRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRuntimeConfig")
            .field("persistence", &"...")
            .field("providers", &self.providers.len())
            .field("reconciler", &self.reconciler)
            .finish()
    }
}

impl EngineRuntimeConfig {
    /// Start the runtime: restore providers and spawn the reconciliation loop.
    pub async fn start(self) -> Result<EngineRuntime> {
        let registry = Arc::new(KindRegistry::new(Arc::new(SignatureCache::new())));

        let mut state = EntityHandlerState::new(self.persistence.clone(), registry.clone());
        if let Some(validator) = self.validator {
            state = state.with_validator(validator);
        }
        let state = Arc::new(state);

        entity_handlers::restore_providers(&state).await?;
        for provider in self.providers {
            entity_handlers::handle_register_provider(&state, provider).await?;
        }

        let mut reconciler =
            Reconciler::new(self.persistence, registry, self.invoker, self.reconciler);
        if let Some(entropy) = self.entropy {
            reconciler = reconciler.with_entropy(entropy);
        }

        let shutdown = reconciler.shutdown_handle();
        let loop_reconciler = reconciler.clone();
        let reconciler_handle = tokio::spawn(async move { loop_reconciler.run().await });

        info!(kinds = state.registry.kinds().len(), "EngineRuntime started");

        Ok(EngineRuntime {
            reconciler_handle,
            shutdown,
            state,
            reconciler,
        })
    }
}

/// A running engine that can be embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct EngineRuntime {
    reconciler_handle: JoinHandle<()>,
    shutdown: Arc<Notify>,
    state: Arc<EntityHandlerState>,
    reconciler: Reconciler,
}

impl EngineRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> EngineRuntimeBuilder {
        EngineRuntimeBuilder::new()
    }

    /// Shared entity handler state, for serving entity operations.
    pub fn state(&self) -> &Arc<EntityHandlerState> {
        &self.state
    }

    /// Get a reference to the persistence layer.
    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.state.persistence
    }

    /// The running reconciler.
    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Gracefully shut down the runtime.
    ///
    /// Handler calls already in flight finish on their own tasks.
    pub async fn shutdown(self) -> Result<()> {
        info!("EngineRuntime shutting down...");

        self.shutdown.notify_one();

        match self.reconciler_handle.await {
            Ok(()) => {
                info!("EngineRuntime shutdown complete");
                Ok(())
            }
            Err(e) => {
                error!("Reconciler task panicked: {}", e);
                Err(anyhow::anyhow!("reconciler task panicked: {}", e))
            }
        }
    }

    /// Check if the reconciliation loop is still running.
    pub fn is_running(&self) -> bool {
        !self.reconciler_handle.is_finished()
    }
}
