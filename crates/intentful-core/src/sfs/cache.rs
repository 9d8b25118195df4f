// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Compiled-signature cache.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use super::matcher::{CompiledSignature, compile};
use super::parser::SignatureSyntaxError;

/// Cache key: a signature is only shared within one kind of one provider version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SignatureKey {
    /// Provider prefix.
    pub provider_prefix: String,
    /// Provider version.
    pub provider_version: String,
    /// Kind name.
    pub kind: String,
    /// Signature text.
    pub signature: String,
}

/// Compiled signatures keyed by provider, version, kind and signature text.
///
/// Entries for a provider version are dropped with
/// [`invalidate_provider`](Self::invalidate_provider) when it is registered again.
#[derive(Debug, Default)]
pub struct SignatureCache {
    entries: RwLock<HashMap<SignatureKey, Arc<CompiledSignature>>>,
}

impl SignatureCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached compilation of `key`, compiling and caching it on a miss.
    pub fn get_or_compile(
        &self,
        key: &SignatureKey,
    ) -> Result<Arc<CompiledSignature>, SignatureSyntaxError> {
        if let Some(compiled) = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
        {
            return Ok(compiled.clone());
        }

        let compiled = Arc::new(compile(&key.signature)?);
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.entry(key.clone()).or_insert(compiled).clone())
    }

    /// Drop every entry of one provider version. Returns the number removed.
    pub fn invalidate_provider(&self, provider_prefix: &str, provider_version: &str) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|key, _| {
            key.provider_prefix != provider_prefix || key.provider_version != provider_version
        });
        before - entries.len()
    }

    /// Number of cached signatures.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
