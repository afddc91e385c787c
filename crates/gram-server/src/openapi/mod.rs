// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! OpenAPI v3 tool extraction.
//!
//! Documents are parsed into a JSON tree, upgraded from 3.0 to 3.1 when
//! needed, and every supported operation becomes one HTTP tool:
//!
//! ```text
//! asset ──► Document::parse ──► upgrade ──► operation::build ──► http_tool_definitions
//!                                   │
//!                                   └──► security::extract ──► http_security
//! ```

mod extract;
pub mod naming;
pub mod operation;
pub mod security;
pub mod upgrade;

use serde_json::{Map, Value};

pub use extract::{OpenApiExtractor, OpenApiOutcome};

/// Deepest `$ref` chain followed while inlining a schema.
const MAX_REF_DEPTH: usize = 64;

/// Failure while inlining a schema.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RefError {
    /// A `$ref` points back into its own expansion.
    #[error("circular reference detected: {0}")]
    Circular(String),
    /// A `$ref` is remote or points at nothing.
    #[error("unresolved reference: {0}")]
    Unresolved(String),
}

/// A parsed OpenAPI document.
#[derive(Debug, Clone)]
pub struct Document {
    root: Value,
}

impl Document {
    /// Parse a YAML or JSON document.
    ///
    /// Returns every problem found when the input is not a usable OpenAPI
    /// v3 document.
    pub fn parse(bytes: &[u8]) -> Result<Self, Vec<String>> {
        let looks_like_json = bytes
            .iter()
            .find(|b| !b.is_ascii_whitespace())
            .is_some_and(|b| *b == b'{');

        let mut root: Value = if looks_like_json {
            serde_json::from_slice(bytes).map_err(|e| vec![format!("invalid JSON: {}", e)])?
        } else {
            serde_yaml::from_slice(bytes).map_err(|e| vec![format!("invalid YAML: {}", e)])?
        };

        // Unquoted YAML `openapi: 3.0` arrives as a number.
        let numeric_version = root
            .get("openapi")
            .and_then(Value::as_number)
            .map(|n| n.to_string());
        if let Some(version) = numeric_version {
            root["openapi"] = Value::String(version);
        }

        let mut errors = Vec::new();
        if !root.is_object() {
            errors.push("document root must be an object".to_string());
        } else {
            match root.get("openapi").and_then(Value::as_str) {
                None => errors.push("missing openapi version".to_string()),
                Some(v) if !v.starts_with("3.") => {
                    errors.push(format!("unsupported openapi version: {}", v))
                }
                Some(_) => {}
            }
            if root.get("paths").is_some_and(|p| !p.is_object()) {
                errors.push("paths must be an object".to_string());
            }
        }

        if errors.is_empty() {
            Ok(Self { root })
        } else {
            Err(errors)
        }
    }

    /// Declared `openapi` version.
    pub fn version(&self) -> &str {
        self.root
            .get("openapi")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// Document tree.
    pub fn root(&self) -> &Value {
        &self.root
    }

    pub(crate) fn root_mut(&mut self) -> &mut Value {
        &mut self.root
    }

    /// Top-level `paths` in declaration order.
    pub fn paths(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.root
            .get("paths")
            .and_then(Value::as_object)
            .into_iter()
            .flat_map(|m| m.iter())
    }

    /// Follow `$ref` until a concrete node is reached.
    pub fn resolve<'a>(&'a self, node: &'a Value) -> Result<&'a Value, RefError> {
        let mut current = node;
        let mut seen = Vec::new();
        while let Some(reference) = ref_of(current) {
            if seen.contains(&reference) {
                return Err(RefError::Circular(reference.to_string()));
            }
            seen.push(reference);
            current = self.lookup(reference)?;
        }
        Ok(current)
    }

    /// Copy `schema` with every `$ref` replaced by its target.
    pub fn inline(&self, schema: &Value) -> Result<Value, RefError> {
        let mut stack = Vec::new();
        self.inline_node(schema, &mut stack)
    }

    fn inline_node<'a>(&'a self, node: &'a Value, stack: &mut Vec<&'a str>) -> Result<Value, RefError> {
        match node {
            Value::Object(map) => {
                if let Some(reference) = ref_of(node) {
                    if stack.contains(&reference) || stack.len() >= MAX_REF_DEPTH {
                        return Err(RefError::Circular(reference.to_string()));
                    }
                    let target = self.lookup(reference)?;
                    stack.push(reference);
                    let inlined = self.inline_node(target, stack);
                    stack.pop();

                    let mut inlined = inlined?;
                    if let Value::Object(out) = &mut inlined {
                        for (k, v) in map.iter().filter(|(k, _)| k.as_str() != "$ref") {
                            out.insert(k.clone(), self.inline_node(v, stack)?);
                        }
                    }
                    return Ok(inlined);
                }

                let mut out = Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.inline_node(v, stack)?);
                }
                Ok(Value::Object(out))
            }
            Value::Array(items) => items
                .iter()
                .map(|v| self.inline_node(v, stack))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            other => Ok(other.clone()),
        }
    }

    fn lookup(&self, reference: &str) -> Result<&Value, RefError> {
        reference
            .strip_prefix('#')
            .and_then(|pointer| self.root.pointer(pointer))
            .ok_or_else(|| RefError::Unresolved(reference.to_string()))
    }
}

fn ref_of(node: &Value) -> Option<&str> {
    node.get("$ref").and_then(Value::as_str)
}
