// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Validation gate consulted before spec and status writes.

use serde_json::Value;

use crate::error::{CoreError, Result};
use crate::registry::RegisteredKind;

/// Pass/fail check of documents written to a kind.
pub trait EntityValidator: Send + Sync {
    /// Check a full spec.
    fn validate_spec(&self, kind: &RegisteredKind, spec: &Value) -> Result<()>;

    /// Check a status document or a partial status patch.
    fn validate_status(&self, kind: &RegisteredKind, status: &Value) -> Result<()>;
}

/// Accepts everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct PermissiveValidator;

impl EntityValidator for PermissiveValidator {
    fn validate_spec(&self, _kind: &RegisteredKind, _spec: &Value) -> Result<()> {
        Ok(())
    }

    fn validate_status(&self, _kind: &RegisteredKind, _status: &Value) -> Result<()> {
        Ok(())
    }
}

/// Checks `type` and `required` of the kind structure.
///
/// Only the structural keywords are understood; anything else in the schema
/// is ignored. Status patches are checked for types but not for required
/// fields, and `null` is accepted anywhere in a status since it unsets.
#[derive(Debug, Clone, Copy, Default)]
pub struct StructureValidator;

impl EntityValidator for StructureValidator {
    fn validate_spec(&self, kind: &RegisteredKind, spec: &Value) -> Result<()> {
        check(&kind.kind.structure, spec, "spec", true, false).map_err(|(field, message)| {
            CoreError::ValidationError {
                context: Some(kind.context()),
                field,
                message,
            }
        })
    }

    fn validate_status(&self, kind: &RegisteredKind, status: &Value) -> Result<()> {
        check(&kind.kind.structure, status, "status", false, true).map_err(|(field, message)| {
            CoreError::ValidationError {
                context: Some(kind.context()),
                field,
                message,
            }
        })
    }
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn check(
    schema: &Value,
    value: &Value,
    path: &str,
    enforce_required: bool,
    allow_null: bool,
) -> std::result::Result<(), (String, String)> {
    if value.is_null() && allow_null {
        return Ok(());
    }

    if let Some(expected) = schema.get("type").and_then(Value::as_str)
        && !type_matches(expected, value)
    {
        return Err((path.to_string(), format!("expected {}", expected)));
    }

    match value {
        Value::Object(map) => {
            if enforce_required
                && let Some(required) = schema.get("required").and_then(Value::as_array)
            {
                for name in required.iter().filter_map(Value::as_str) {
                    if !map.contains_key(name) {
                        return Err((format!("{}.{}", path, name), "is required".to_string()));
                    }
                }
            }
            if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
                for (name, child) in map {
                    if let Some(child_schema) = properties.get(name) {
                        check(
                            child_schema,
                            child,
                            &format!("{}.{}", path, name),
                            enforce_required,
                            allow_null,
                        )?;
                    }
                }
            }
        }
        Value::Array(items) => {
            if let Some(item_schema) = schema.get("items") {
                for (index, item) in items.iter().enumerate() {
                    check(
                        item_schema,
                        item,
                        &format!("{}.{}", path, index),
                        enforce_required,
                        allow_null,
                    )?;
                }
            }
        }
        _ => {}
    }
    Ok(())
}
