// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Intentful Core - standalone engine process.
//!
//! Loads configuration from the environment, restores registered providers,
//! and runs the reconciliation loop until interrupted.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};

use intentful_core::config::Config;
use intentful_core::model::Provider;
use intentful_core::persistence::{Persistence, SqlitePersistence};
use intentful_core::runtime::EngineRuntime;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("intentful_core=info".parse()?),
        )
        .init();

    info!("Starting Intentful Core");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        max_handler_retries = config.max_handler_retries,
        max_concurrent_handlers = config.max_concurrent_handlers,
        debug = config.debug,
        "Configuration loaded"
    );

    info!("Connecting to database...");
    let persistence = Arc::new(SqlitePersistence::connect(&config.database_url).await?);
    let healthy = persistence.health_check_db().await?;
    info!(healthy, "Database connection established, migrations applied");

    let mut builder = EngineRuntime::builder()
        .persistence(persistence)
        .reconciler_config(config.reconciler_config());

    if let Some(path) = &config.providers_file {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading providers file {}", path.display()))?;
        let providers: Vec<Provider> = serde_json::from_str(&raw)
            .with_context(|| format!("parsing providers file {}", path.display()))?;
        info!(count = providers.len(), path = %path.display(), "Providers file loaded");
        for provider in providers {
            builder = builder.provider(provider);
        }
    }

    let runtime = builder.build()?.start().await?;

    info!("Intentful Core initialized successfully");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    runtime.shutdown().await?;
    info!("Shutdown complete");

    Ok(())
}
