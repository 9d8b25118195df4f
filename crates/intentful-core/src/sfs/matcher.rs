// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Evaluation of compiled signatures over a spec/status pair.

use serde_json::{Map, Value};

use super::parser::{self, Selector, SignatureSyntaxError};
use crate::model::DiffContent;

/// A parsed signature, ready to be run against entities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledSignature {
    text: String,
    root: Selector,
}

/// Compile signature text.
pub fn compile(signature: &str) -> Result<CompiledSignature, SignatureSyntaxError> {
    let root = parser::parse(signature)?;
    Ok(CompiledSignature {
        text: signature.to_string(),
        root,
    })
}

impl CompiledSignature {
    /// The signature text this was compiled from.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Parsed selector tree.
    pub fn selector(&self) -> &Selector {
        &self.root
    }

    /// Differences between `spec` and `status` visible through this signature.
    ///
    /// The result depends only on the two inputs and is ordered by position
    /// in the documents.
    pub fn run(&self, spec: &Value, status: &Value) -> Vec<DiffContent> {
        let mut cursor = Cursor::default();
        let mut out = Vec::new();
        eval(&self.root, Some(spec), Some(status), &mut cursor, &mut out);
        out
    }
}

#[derive(Default)]
struct Cursor {
    path: Vec<String>,
    keys: Map<String, Value>,
}

impl Cursor {
    fn key(&self) -> String {
        self.path.join(".")
    }
}

fn eval(
    selector: &Selector,
    spec: Option<&Value>,
    status: Option<&Value>,
    cursor: &mut Cursor,
    out: &mut Vec<DiffContent>,
) {
    match selector {
        Selector::Leaf => compare(spec, status, cursor, out),
        Selector::Path { fields, then } => {
            let mut spec = spec;
            let mut status = status;
            for field in fields {
                spec = spec.and_then(|v| v.get(field.as_str()));
                status = status.and_then(|v| v.get(field.as_str()));
            }
            let depth = cursor.path.len();
            cursor.path.extend(fields.iter().cloned());
            eval(then, spec, status, cursor, out);
            cursor.path.truncate(depth);
        }
        Selector::Group(members) => {
            for member in members {
                eval(member, spec, status, cursor, out);
            }
        }
        Selector::Vector(inner) => {
            let (Some(spec_items), Some(status_items)) = (as_items(spec), as_items(status))
            else {
                // One side is not an array; the value as a whole differs.
                compare(spec, status, cursor, out);
                return;
            };

            let key_name = cursor.key();
            let len = spec_items.len().max(status_items.len());
            for index in 0..len {
                let previous = cursor.keys.insert(key_name.clone(), Value::from(index));
                cursor.path.push(index.to_string());
                eval(
                    inner,
                    spec_items.get(index),
                    status_items.get(index),
                    cursor,
                    out,
                );
                cursor.path.pop();
                match previous {
                    Some(value) => cursor.keys.insert(key_name.clone(), value),
                    None => cursor.keys.remove(&key_name),
                };
            }
        }
        Selector::Added(key_fields) => {
            for element in missing_from(spec, status, key_fields) {
                out.push(DiffContent {
                    keys: identity_map(element, key_fields, &cursor.keys),
                    key: cursor.key(),
                    spec: vec![element.clone()],
                    status: Vec::new(),
                });
            }
        }
        Selector::Removed(key_fields) => {
            for element in missing_from(status, spec, key_fields) {
                out.push(DiffContent {
                    keys: identity_map(element, key_fields, &cursor.keys),
                    key: cursor.key(),
                    spec: Vec::new(),
                    status: vec![element.clone()],
                });
            }
        }
    }
}

fn compare(
    spec: Option<&Value>,
    status: Option<&Value>,
    cursor: &Cursor,
    out: &mut Vec<DiffContent>,
) {
    if spec == status {
        return;
    }
    out.push(DiffContent {
        keys: cursor.keys.clone(),
        key: cursor.key(),
        spec: spec.into_iter().cloned().collect(),
        status: status.into_iter().cloned().collect(),
    });
}

/// Array elements at this position; an absent value counts as an empty array.
fn as_items(value: Option<&Value>) -> Option<&[Value]> {
    match value {
        None => Some(&[]),
        Some(Value::Array(items)) => Some(items.as_slice()),
        Some(_) => None,
    }
}

fn identity(element: &Value, key_fields: &[String]) -> Vec<Value> {
    key_fields
        .iter()
        .map(|k| element.get(k.as_str()).cloned().unwrap_or(Value::Null))
        .collect()
}

fn identity_map(
    element: &Value,
    key_fields: &[String],
    outer: &Map<String, Value>,
) -> Map<String, Value> {
    let mut keys = outer.clone();
    for (field, value) in key_fields.iter().zip(identity(element, key_fields)) {
        keys.insert(field.clone(), value);
    }
    keys
}

/// Elements of `from` whose identity does not occur in `against`.
fn missing_from<'a>(
    from: Option<&'a Value>,
    against: Option<&Value>,
    key_fields: &[String],
) -> Vec<&'a Value> {
    let from = from.and_then(Value::as_array).map(Vec::as_slice).unwrap_or(&[]);
    let known: Vec<Vec<Value>> = against
        .and_then(Value::as_array)
        .map(|items| items.iter().map(|e| identity(e, key_fields)).collect())
        .unwrap_or_default();

    from.iter()
        .filter(|element| !known.contains(&identity(element, key_fields)))
        .collect()
}
