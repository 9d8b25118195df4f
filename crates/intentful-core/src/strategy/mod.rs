// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-behaviour write strategies.
//!
//! Each kind gets one variant of every strategy, chosen from its
//! [`IntentfulBehaviour`](crate::model::IntentfulBehaviour) at registration:
//!
//! | Behaviour | Status writes | Spec writes | Creation |
//! |-----------|---------------|-------------|----------|
//! | `spec_only` | rejected | CAS, status replaced with spec | plain |
//! | `basic` | stored | CAS | plain |
//! | `differ` | stored, entity watched | CAS, diffs start a watcher | watched |

mod creation;
mod intentful;
mod status;

pub use creation::EntityCreationStrategy;
pub use intentful::{IntentfulStrategy, SpecUpdate};
pub use status::StatusUpdateStrategy;
