// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Spec/status differ.
//!
//! Before signatures are run both spec and status are cleaned the same way:
//!
//! 1. null fields are removed recursively; inside arrays, null elements and
//!    objects left empty by the cleaning are dropped
//! 2. fields the kind schema marks `"x-intentful": "status-only"` are removed
//!
//! Step 2 applies to spec as well. A status-only value written into spec is
//! not intent and never produces a diff, so a spec carrying one still
//! converges with a status that lacks it or holds another value.
//!
//! Each signature of the kind then runs over the cleaned pair, in
//! declaration order, and every signature with a non-empty result yields one
//! [`Diff`].

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::{CoreError, Result};
use crate::model::Diff;
use crate::registry::RegisteredKind;
use crate::sfs::SignatureCache;

/// Schema extension key carrying field annotations.
pub const SCHEMA_ANNOTATION_KEY: &str = "x-intentful";

/// Annotation value marking a field as status-only.
pub const STATUS_ONLY: &str = "status-only";

/// Structural view of a kind schema, as far as cleaning needs it.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaNode {
    /// Object with known properties. Unknown properties are kept as-is.
    Object {
        /// Property schemas.
        properties: BTreeMap<String, SchemaNode>,
        /// Whether the whole object is status-only.
        status_only: bool,
    },
    /// Array whose elements follow `items`.
    Array {
        /// Element schema.
        items: Box<SchemaNode>,
        /// Whether the whole array is status-only.
        status_only: bool,
    },
    /// Anything else.
    Scalar {
        /// Whether the value is status-only.
        status_only: bool,
    },
}

impl SchemaNode {
    /// Build the tree from a JSON-schema-like document.
    ///
    /// Only `type`, `properties`, `items` and the annotation key are read;
    /// anything unrecognised becomes a plain scalar.
    pub fn from_json(schema: &Value) -> Self {
        let status_only =
            schema.get(SCHEMA_ANNOTATION_KEY).and_then(Value::as_str) == Some(STATUS_ONLY);
        let declared_type = schema.get("type").and_then(Value::as_str);

        match (declared_type, schema.get("properties"), schema.get("items")) {
            (Some("object"), properties, _) | (None, properties @ Some(_), _) => {
                let properties = properties
                    .and_then(Value::as_object)
                    .map(|props| {
                        props
                            .iter()
                            .map(|(name, child)| (name.clone(), SchemaNode::from_json(child)))
                            .collect()
                    })
                    .unwrap_or_default();
                SchemaNode::Object {
                    properties,
                    status_only,
                }
            }
            (Some("array"), _, items) => SchemaNode::Array {
                items: Box::new(SchemaNode::from_json(items.unwrap_or(&Value::Null))),
                status_only,
            },
            _ => SchemaNode::Scalar { status_only },
        }
    }

    /// Whether this node is marked status-only.
    pub fn is_status_only(&self) -> bool {
        match self {
            SchemaNode::Object { status_only, .. }
            | SchemaNode::Array { status_only, .. }
            | SchemaNode::Scalar { status_only } => *status_only,
        }
    }
}

/// A non-empty object that cleaning reduced to nothing.
fn emptied(original: &Value, cleaned: &Value) -> bool {
    matches!(original, Value::Object(map) if !map.is_empty())
        && matches!(cleaned, Value::Object(map) if map.is_empty())
}

/// Remove null fields recursively.
pub fn remove_null_fields(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), remove_null_fields(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .filter(|item| !item.is_null())
                .filter_map(|item| {
                    let cleaned = remove_null_fields(item);
                    (!emptied(item, &cleaned)).then_some(cleaned)
                })
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Remove the fields `schema` marks status-only. `None` when `value` itself is.
pub fn remove_status_only_fields(schema: &SchemaNode, value: &Value) -> Option<Value> {
    if schema.is_status_only() {
        return None;
    }

    match (schema, value) {
        (SchemaNode::Object { properties, .. }, Value::Object(map)) => {
            let mut out = Map::new();
            for (name, child) in map {
                match properties.get(name) {
                    Some(child_schema) => {
                        if let Some(cleaned) = remove_status_only_fields(child_schema, child) {
                            out.insert(name.clone(), cleaned);
                        }
                    }
                    None => {
                        out.insert(name.clone(), child.clone());
                    }
                }
            }
            Some(Value::Object(out))
        }
        (SchemaNode::Array { items, .. }, Value::Array(elements)) => Some(Value::Array(
            elements
                .iter()
                .filter_map(|element| {
                    let cleaned = remove_status_only_fields(items, element)?;
                    (!emptied(element, &cleaned)).then_some(cleaned)
                })
                .collect(),
        )),
        _ => Some(value.clone()),
    }
}

/// Computes the diffs of an entity against its kind's signatures.
#[derive(Debug, Clone)]
pub struct Differ {
    cache: Arc<SignatureCache>,
}

impl Differ {
    /// Create a differ sharing `cache` with the kind registry.
    pub fn new(cache: Arc<SignatureCache>) -> Self {
        Self { cache }
    }

    /// Clean a spec or status document for comparison under `kind`'s schema:
    /// nulls first, then status-only fields.
    pub fn clean(&self, kind: &RegisteredKind, value: &Value) -> Value {
        remove_status_only_fields(&kind.schema, &remove_null_fields(value)).unwrap_or(Value::Null)
    }

    /// Diffs between `spec` and `status`, one per signature with differences,
    /// in signature declaration order.
    pub fn diffs(
        &self,
        kind: &RegisteredKind,
        spec: &Value,
        status: &Value,
    ) -> Result<Vec<Diff>> {
        let spec = self.clean(kind, spec);
        let status = self.clean(kind, status);

        let mut diffs = Vec::new();
        for signature in &kind.kind.intentful_signatures {
            let compiled = self
                .cache
                .get_or_compile(&kind.signature_key(&signature.signature))
                .map_err(|e| CoreError::ValidationError {
                    context: Some(kind.context()),
                    field: "intentful_signatures".to_string(),
                    message: e.to_string(),
                })?;

            let content = compiled.run(&spec, &status);
            if !content.is_empty() {
                diffs.push(Diff {
                    signature: signature.signature.clone(),
                    procedure: signature.name.clone(),
                    content,
                });
            }
        }
        Ok(diffs)
    }
}
