// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Intentful Core - Intent-Driven Reconciliation Engine
//!
//! Providers register resource kinds whose entities carry a *spec* (desired
//! state) and a *status* (observed state). Clients write spec; the engine
//! drives status toward it by invoking provider handlers asynchronously.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Clients / transport layer                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          entity_handlers                                 │
//! │     register provider · create · update spec/status · delete · list     │
//! └─────────────────────────────────────────────────────────────────────────┘
//!           │ strategies per kind                          ▲ status patches
//!           ▼                                              │
//! ┌───────────────────────┐                    ┌─────────────────────────────┐
//! │  Spec / status store  │◄───────────────────│        Reconciler           │
//! │  Watchlist            │   diffs, watchers  │  watchlist scan → handler   │
//! │  Intent watchers      │                    │  → watcher transition       │
//! │  Graveyard            │                    └─────────────────────────────┘
//! └───────────────────────┘                                  │
//!           │                                                ▼
//!           ▼                                    ┌───────────────────────┐
//! ┌───────────────────────┐                      │   Provider handlers   │
//! │        SQLite         │                      │   (HTTP callbacks)    │
//! └───────────────────────┘                      └───────────────────────┘
//! ```
//!
//! # Behaviours
//!
//! | Behaviour | Status writes | Spec writes |
//! |-----------|---------------|-------------|
//! | `spec_only` | rejected | status replaced with spec |
//! | `basic` | stored | stored |
//! | `differ` | stored, entity watched | diffed, watcher started |
//!
//! # Intent Watcher State Machine
//!
//! ```text
//!                 ┌────────┐
//!        failure  │        │  failure (times_failed < ceiling)
//!    ┌────────────│ ACTIVE │◄───────────┐
//!    │            │        │────────────┘
//!    │            └───┬────┘
//!    │ ceiling        │ handler succeeded, no diffs left
//!    ▼                ▼
//! ┌────────┐   ┌────────────────────────┐
//! │ FAILED │   │ COMPLETED_SUCCESSFULLY │
//! └────────┘   └────────────────────────┘
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `INTENTFUL_DATABASE_URL` | Yes | - | SQLite connection string |
//! | `INTENTFUL_DEBUG` | No | `false` | Short retry jitter |
//! | `INTENTFUL_POLL_INTERVAL_MS` | No | `3000` | Watchlist scan period |
//! | `INTENTFUL_RETRY_EXPONENT` | No | `2` | Backoff exponent |
//! | `INTENTFUL_MAX_BACKOFF_SECS` | No | `300` | Backoff clamp |
//! | `INTENTFUL_MAX_HANDLER_RETRIES` | No | `10` | Failures before a watcher fails |
//! | `INTENTFUL_HANDLER_TIMEOUT_SECS` | No | `60` | Handler call timeout |
//! | `INTENTFUL_MAX_CONCURRENT_HANDLERS` | No | `32` | Parallel handler calls |
//! | `INTENTFUL_PROVIDERS_FILE` | No | - | Providers to register at startup |

#![deny(missing_docs)]

/// Retry backoff and jitter.
pub mod backoff;

/// Configuration loaded from environment variables.
pub mod config;

/// Spec/status cleaning and diffing.
pub mod differ;

/// Entity operation handlers (providers, entities, intent watchers).
pub mod entity_handlers;

/// Error types with stable error codes and entity context.
pub mod error;

/// Soft-deleted entity records.
pub mod graveyard;

/// Provider handler invocation.
pub mod handler;

/// Embedded database migrations.
pub mod migrations;

/// Entities, diffs, kinds and providers.
pub mod model;

/// Persistence trait and SQLite backend.
pub mod persistence;

/// Reconciliation loop.
pub mod reconciler;

/// Provider and kind registry.
pub mod registry;

/// Embeddable runtime.
pub mod runtime;

/// Structural field signatures.
pub mod sfs;

/// Per-behaviour write strategies.
pub mod strategy;

/// Validation gate for written documents.
pub mod validation;

/// Intent watchers.
pub mod watcher;

/// Entities with outstanding differences.
pub mod watchlist;
