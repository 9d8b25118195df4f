// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Structural field signatures (SFS).
//!
//! A signature selects the part of an entity a handler is responsible for.
//! Compiling a signature yields a [`CompiledSignature`] that, given a spec and
//! a status document, returns the differences between them inside that part.
//!
//! # Syntax
//!
//! | Form | Meaning |
//! |------|---------|
//! | `a.b.c` | compare the value at that path |
//! | `a.{x, y.z}` | differences of each member selector |
//! | `a.[sel]` | pair array elements by index, apply `sel` to each pair |
//! | `a.+{k1, k2}` | elements in spec with no status element of the same key |
//! | `a.-{k1, k2}` | elements in status with no spec element of the same key |
//!
//! Whitespace between tokens is ignored. Field names are ASCII letters,
//! digits, `_` and `-`.

mod cache;
mod matcher;
mod parser;

pub use cache::{SignatureCache, SignatureKey};
pub use matcher::{CompiledSignature, compile};
pub use parser::{Selector, SignatureSyntaxError};
