// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provider and kind registry.
//!
//! Registering a provider checks every signature of its kinds, drops the
//! compiled-signature cache entries of any earlier registration of the same
//! provider version, and binds the strategies of each kind once.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info};
use uuid::Uuid;

use crate::differ::SchemaNode;
use crate::error::{CoreError, EntityContext, Result};
use crate::model::{EntityReference, IntentfulSignature, Kind, Provider};
use crate::sfs::{self, SignatureCache, SignatureKey};
use crate::strategy::{EntityCreationStrategy, IntentfulStrategy, StatusUpdateStrategy};

/// A kind bound to its provider, with its schema tree and strategies.
#[derive(Debug, Clone)]
pub struct RegisteredKind {
    /// Provider prefix.
    pub provider_prefix: String,
    /// Provider version.
    pub provider_version: String,
    /// Kind definition.
    pub kind: Kind,
    /// Schema tree built from `kind.structure`.
    pub schema: SchemaNode,
    /// How status writes are applied.
    pub status_strategy: StatusUpdateStrategy,
    /// How spec writes and deletes are applied.
    pub intentful_strategy: IntentfulStrategy,
    /// How entities are created.
    pub creation_strategy: EntityCreationStrategy,
}

impl RegisteredKind {
    /// Bind `kind` to a provider version.
    pub fn new(
        provider_prefix: impl Into<String>,
        provider_version: impl Into<String>,
        kind: Kind,
    ) -> Self {
        let behaviour = kind.intentful_behaviour;
        Self {
            provider_prefix: provider_prefix.into(),
            provider_version: provider_version.into(),
            schema: SchemaNode::from_json(&kind.structure),
            status_strategy: StatusUpdateStrategy::for_behaviour(behaviour),
            intentful_strategy: IntentfulStrategy::for_behaviour(behaviour),
            creation_strategy: EntityCreationStrategy::for_behaviour(behaviour),
            kind,
        }
    }

    /// Kind name.
    pub fn name(&self) -> &str {
        &self.kind.name
    }

    /// Error context for this kind.
    pub fn context(&self) -> EntityContext {
        EntityContext::for_kind(&self.provider_prefix, &self.provider_version, &self.kind.name)
    }

    /// Reference to an entity of this kind.
    pub fn reference(&self, uuid: Uuid) -> EntityReference {
        EntityReference::new(
            &self.provider_prefix,
            &self.provider_version,
            &self.kind.name,
            uuid,
        )
    }

    /// Cache key of one of this kind's signatures.
    pub fn signature_key(&self, signature: &str) -> SignatureKey {
        SignatureKey {
            provider_prefix: self.provider_prefix.clone(),
            provider_version: self.provider_version.clone(),
            kind: self.kind.name.clone(),
            signature: signature.to_string(),
        }
    }

    /// The declared signature with this text.
    pub fn signature(&self, signature: &str) -> Option<&IntentfulSignature> {
        self.kind
            .intentful_signatures
            .iter()
            .find(|s| s.signature == signature)
    }
}

type KindKey = (String, String, String);

/// Registered kinds of every provider version.
#[derive(Debug)]
pub struct KindRegistry {
    kinds: RwLock<HashMap<KindKey, Arc<RegisteredKind>>>,
    cache: Arc<SignatureCache>,
}

impl KindRegistry {
    /// Create an empty registry sharing `cache` with the differ.
    pub fn new(cache: Arc<SignatureCache>) -> Self {
        Self {
            kinds: RwLock::new(HashMap::new()),
            cache,
        }
    }

    /// The compiled-signature cache.
    pub fn cache(&self) -> &Arc<SignatureCache> {
        &self.cache
    }

    /// Register (or re-register) a provider version.
    ///
    /// Nothing is changed when any kind is invalid.
    pub fn register(&self, provider: &Provider) -> Result<Vec<Arc<RegisteredKind>>> {
        validate_provider(provider)?;

        let registered: Vec<Arc<RegisteredKind>> = provider
            .kinds
            .iter()
            .map(|kind| {
                Arc::new(RegisteredKind::new(
                    &provider.prefix,
                    &provider.version,
                    kind.clone(),
                ))
            })
            .collect();

        let invalidated = self
            .cache
            .invalidate_provider(&provider.prefix, &provider.version);

        {
            let mut kinds = self.kinds.write().unwrap_or_else(PoisonError::into_inner);
            kinds.retain(|(prefix, version, _), _| {
                prefix != &provider.prefix || version != &provider.version
            });
            for kind in &registered {
                kinds.insert(
                    (
                        kind.provider_prefix.clone(),
                        kind.provider_version.clone(),
                        kind.kind.name.clone(),
                    ),
                    kind.clone(),
                );
            }
        }

        // Warm the cache; every signature already parsed above.
        for kind in &registered {
            for signature in &kind.kind.intentful_signatures {
                if let Err(e) = self
                    .cache
                    .get_or_compile(&kind.signature_key(&signature.signature))
                {
                    debug!(signature = %signature.signature, error = %e, "Signature not cached");
                }
            }
        }

        info!(
            provider_prefix = %provider.prefix,
            provider_version = %provider.version,
            kinds = registered.len(),
            invalidated_signatures = invalidated,
            "Provider registered"
        );

        Ok(registered)
    }

    /// Remove a provider version. Returns the number of kinds removed.
    pub fn deregister(&self, provider_prefix: &str, provider_version: &str) -> usize {
        let removed = {
            let mut kinds = self.kinds.write().unwrap_or_else(PoisonError::into_inner);
            let before = kinds.len();
            kinds.retain(|(prefix, version, _), _| {
                prefix != provider_prefix || version != provider_version
            });
            before - kinds.len()
        };
        self.cache
            .invalidate_provider(provider_prefix, provider_version);

        info!(
            provider_prefix,
            provider_version,
            kinds = removed,
            "Provider deregistered"
        );
        removed
    }

    /// Look up a kind.
    pub fn get(
        &self,
        provider_prefix: &str,
        provider_version: &str,
        kind: &str,
    ) -> Result<Arc<RegisteredKind>> {
        let key = (
            provider_prefix.to_string(),
            provider_version.to_string(),
            kind.to_string(),
        );
        self.kinds
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned()
            .ok_or_else(|| CoreError::EntityNotFound {
                resource: "Kind",
                id: kind.to_string(),
                context: Some(EntityContext::for_kind(
                    provider_prefix,
                    provider_version,
                    kind,
                )),
            })
    }

    /// The kind of a referenced entity.
    pub fn lookup(&self, entity_ref: &EntityReference) -> Result<Arc<RegisteredKind>> {
        self.get(
            &entity_ref.provider_prefix,
            &entity_ref.provider_version,
            &entity_ref.kind,
        )
    }

    /// Every registered kind.
    pub fn kinds(&self) -> Vec<Arc<RegisteredKind>> {
        self.kinds
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

/// Check a provider definition without registering it.
///
/// Fails with `ValidationError` on an empty prefix or version, a duplicate
/// kind name, an invalid retry setting or a malformed signature.
pub fn validate_provider(provider: &Provider) -> Result<()> {
    let invalid = |context: Option<EntityContext>, field: &str, message: String| {
        CoreError::ValidationError {
            context,
            field: field.to_string(),
            message,
        }
    };

    if provider.prefix.trim().is_empty() {
        return Err(invalid(None, "prefix", "must not be empty".to_string()));
    }
    if provider.version.trim().is_empty() {
        return Err(invalid(None, "version", "must not be empty".to_string()));
    }

    let mut names = HashSet::new();
    for kind in &provider.kinds {
        let context = || {
            Some(EntityContext::for_kind(
                &provider.prefix,
                &provider.version,
                &kind.name,
            ))
        };

        if !names.insert(kind.name.as_str()) {
            return Err(invalid(
                context(),
                "kinds",
                format!("kind '{}' is declared more than once", kind.name),
            ));
        }
        if let Some(exponent) = kind.diff_retry_exponent
            && !(exponent >= 1.0 && exponent.is_finite())
        {
            return Err(invalid(
                context(),
                "diff_retry_exponent",
                format!("must be a finite number of at least 1, got {}", exponent),
            ));
        }
        if kind.max_handler_retries == Some(0) {
            return Err(invalid(
                context(),
                "max_handler_retries",
                "must be at least 1".to_string(),
            ));
        }
        for signature in &kind.intentful_signatures {
            sfs::compile(&signature.signature)
                .map_err(|e| invalid(context(), "intentful_signatures", e.to_string()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::IntentfulBehaviour;
    use serde_json::json;

    fn kind(name: &str, signatures: &[&str]) -> Kind {
        Kind {
            name: name.to_string(),
            intentful_behaviour: IntentfulBehaviour::Differ,
            intentful_signatures: signatures
                .iter()
                .map(|s| IntentfulSignature {
                    signature: s.to_string(),
                    name: format!("handle_{}", s),
                    procedure_callback: None,
                })
                .collect(),
            structure: json!({"type": "object"}),
            diff_delay: None,
            diff_retry_exponent: None,
            max_handler_retries: None,
        }
    }

    fn provider(kinds: Vec<Kind>) -> Provider {
        Provider {
            prefix: "location_provider".to_string(),
            version: "0.1.0".to_string(),
            kinds,
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = KindRegistry::new(Arc::new(SignatureCache::new()));
        let registered = registry
            .register(&provider(vec![kind("Location", &["x", "y"])]))
            .unwrap();
        assert_eq!(registered.len(), 1);
        assert_eq!(registry.cache().len(), 2);

        let location = registry.get("location_provider", "0.1.0", "Location").unwrap();
        assert_eq!(location.status_strategy, StatusUpdateStrategy::Differ);
        assert_eq!(location.signature("y").map(|s| s.name.as_str()), Some("handle_y"));

        let entity_ref = location.reference(Uuid::nil());
        assert_eq!(registry.lookup(&entity_ref).unwrap().name(), "Location");
    }

    #[test]
    fn test_unknown_kind_is_not_found() {
        let registry = KindRegistry::new(Arc::new(SignatureCache::new()));
        let err = registry.get("location_provider", "0.1.0", "Nope").unwrap_err();
        assert_eq!(err.error_code(), "ENTITY_NOT_FOUND");
        assert_eq!(err.context().map(|c| c.kind.as_str()), Some("Nope"));
    }

    #[test]
    fn test_malformed_signature_rejects_provider() {
        let registry = KindRegistry::new(Arc::new(SignatureCache::new()));
        let err = registry
            .register(&provider(vec![
                kind("Location", &["x"]),
                kind("Broken", &["x.{y"]),
            ]))
            .unwrap_err();

        match err {
            CoreError::ValidationError { context, field, .. } => {
                assert_eq!(field, "intentful_signatures");
                assert_eq!(context.map(|c| c.kind), Some("Broken".to_string()));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(registry.kinds().is_empty());
        assert!(registry.cache().is_empty());
    }

    #[test]
    fn test_invalid_overrides_and_duplicates_rejected() {
        let registry = KindRegistry::new(Arc::new(SignatureCache::new()));

        let mut slow = kind("Location", &["x"]);
        slow.diff_retry_exponent = Some(0.5);
        assert!(registry.register(&provider(vec![slow])).is_err());

        let mut never = kind("Location", &["x"]);
        never.max_handler_retries = Some(0);
        assert!(registry.register(&provider(vec![never])).is_err());

        let dup = provider(vec![kind("Location", &["x"]), kind("Location", &["y"])]);
        assert!(registry.register(&dup).is_err());
    }

    #[test]
    fn test_reregistration_replaces_kinds_and_cache() {
        let registry = KindRegistry::new(Arc::new(SignatureCache::new()));
        registry
            .register(&provider(vec![kind("Location", &["x"]), kind("Old", &["a"])]))
            .unwrap();
        assert_eq!(registry.cache().len(), 2);

        registry
            .register(&provider(vec![kind("Location", &["y"])]))
            .unwrap();
        assert_eq!(registry.kinds().len(), 1);
        assert!(registry.get("location_provider", "0.1.0", "Old").is_err());
        assert_eq!(registry.cache().len(), 1);

        assert_eq!(registry.deregister("location_provider", "0.1.0"), 1);
        assert!(registry.kinds().is_empty());
        assert!(registry.cache().is_empty());
    }
}
