// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Functions manifest parsing and validation.
//!
//! Manifests are tagged by `version`; only `0.0.0` exists today. Dynamic
//! fields (`variables`, `meta`, `authInput`) are kept as opaque JSON.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A parsed manifest.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "version")]
pub enum Manifest {
    /// Version `0.0.0`
    #[serde(rename = "0.0.0")]
    V0(ManifestV0),
}

impl Manifest {
    /// Parse manifest bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Declared version.
    pub fn version(&self) -> &'static str {
        match self {
            Manifest::V0(_) => "0.0.0",
        }
    }
}

/// Manifest version `0.0.0`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ManifestV0 {
    /// Declared tools
    #[serde(default)]
    pub tools: Vec<ToolV0>,
    /// Declared resources
    #[serde(default)]
    pub resources: Vec<ResourceV0>,
}

/// Description of a variable a tool or resource reads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariableV0 {
    /// What the variable holds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A tool entry.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolV0 {
    /// Tool name, unique within the bundle
    #[serde(default)]
    pub name: String,
    /// What the tool does
    #[serde(default)]
    pub description: String,
    /// JSON Schema of the tool input
    #[serde(default)]
    pub input_schema: Value,
    /// Variables the tool reads
    #[serde(default)]
    pub variables: Option<BTreeMap<String, VariableV0>>,
    /// Free-form metadata
    #[serde(default)]
    pub meta: Option<Value>,
    /// Authentication input descriptor
    #[serde(default)]
    pub auth_input: Option<Value>,
}

/// A resource entry.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceV0 {
    /// Resource name
    #[serde(default)]
    pub name: String,
    /// What the resource holds
    #[serde(default)]
    pub description: String,
    /// Resource URI
    #[serde(default)]
    pub uri: String,
    /// Display title
    #[serde(default)]
    pub title: Option<String>,
    /// MIME type of the resource content
    #[serde(default)]
    pub mime_type: Option<String>,
    /// Variables the resource reads
    #[serde(default)]
    pub variables: Option<BTreeMap<String, VariableV0>>,
    /// Free-form metadata
    #[serde(default)]
    pub meta: Option<Value>,
}

/// Why a manifest entry was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EntryError {
    /// Name does not match the slug pattern.
    #[error("invalid name {0:?}: must match ^[a-z](?:[a-z0-9_-]*[a-z0-9])?$")]
    InvalidName(String),
    /// Description is empty.
    #[error("description is required")]
    MissingDescription,
    /// Input schema is not a valid JSON Schema.
    #[error("invalid input schema: {0}")]
    InvalidSchema(String),
    /// Resource URI is empty.
    #[error("uri is required")]
    MissingUri,
}

impl EntryError {
    /// Metric label.
    pub fn reason(&self) -> &'static str {
        "invalid-manifest"
    }
}

fn name_pattern() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z](?:[a-z0-9_-]*[a-z0-9])?$").ok())
        .as_ref()
}

fn check_name(name: &str) -> Result<(), EntryError> {
    match name_pattern() {
        Some(re) if re.is_match(name) && name.len() <= crate::urn::MAX_SEGMENT_LENGTH => Ok(()),
        _ => Err(EntryError::InvalidName(name.to_string())),
    }
}

impl ToolV0 {
    /// Check name, description and input schema.
    pub fn validate(&self) -> Result<(), EntryError> {
        check_name(&self.name)?;
        if self.description.trim().is_empty() {
            return Err(EntryError::MissingDescription);
        }
        let schema = self.input_schema();
        jsonschema::validator_for(&schema)
            .map(|_| ())
            .map_err(|e| EntryError::InvalidSchema(e.to_string()))
    }

    /// Input schema, with an absent schema read as `{}`.
    pub fn input_schema(&self) -> Value {
        match &self.input_schema {
            Value::Null => Value::Object(Default::default()),
            other => other.clone(),
        }
    }
}

impl ResourceV0 {
    /// Check name, description and URI.
    pub fn validate(&self) -> Result<(), EntryError> {
        check_name(&self.name)?;
        if self.description.trim().is_empty() {
            return Err(EntryError::MissingDescription);
        }
        if self.uri.trim().is_empty() {
            return Err(EntryError::MissingUri);
        }
        Ok(())
    }
}

/// Serialize variables, reading an absent map as `{}`.
pub fn variables_json(variables: &Option<BTreeMap<String, VariableV0>>) -> Value {
    match variables {
        Some(v) => serde_json::to_value(v).unwrap_or_else(|_| Value::Object(Default::default())),
        None => Value::Object(Default::default()),
    }
}
