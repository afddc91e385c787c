// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Turning one OpenAPI operation into an HTTP tool.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{json, Map, Value};

use super::naming::{self, snake_case, sanitize, tool_name, truncate_with_hash};
use super::{security, Document, RefError};
use crate::urn::{ToolKind, ToolUrn};

/// Methods turned into tools, in processing order.
pub const METHODS: &[&str] = &["get", "post", "put", "delete", "head", "patch"];

/// Longest path accepted.
pub const MAX_PATH_LENGTH: usize = 2000;

/// Most tags kept in a tool definition.
const MAX_TAGS: usize = 10;

/// `kind` of every HTTP tool definition.
pub const TOOL_DEFINITION_KIND: &str = "oas3p1_operation";

/// Why an operation did not become a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Operation declares its own `servers`
    OperationServers,
    /// Operation is marked deprecated
    Deprecated,
    /// No request body content type can be handled
    UnsupportedRequest,
    /// A schema refers to itself
    CircularRef,
    /// A `$ref` cannot be resolved
    UnresolvedRef,
    /// Another operation already claimed the ID
    DuplicateOperationId,
    /// Path exceeds [`MAX_PATH_LENGTH`]
    PathTooLong,
    /// Operation is malformed
    InvalidOperation,
}

impl SkipReason {
    /// Metric and event label.
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::OperationServers => "operation_servers",
            SkipReason::Deprecated => "deprecated_operation",
            SkipReason::UnsupportedRequest => "unsupported_request",
            SkipReason::CircularRef => "circular_ref",
            SkipReason::UnresolvedRef => "unresolved_ref",
            SkipReason::DuplicateOperationId => "duplicate_operation_id",
            SkipReason::PathTooLong => "path_too_long",
            SkipReason::InvalidOperation => "invalid_operation",
        }
    }
}

/// An operation that was not turned into a tool.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct Skip {
    /// Classification
    pub reason: SkipReason,
    /// Human-readable detail
    pub message: String,
}

impl Skip {
    pub(crate) fn new(reason: SkipReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

impl From<RefError> for Skip {
    fn from(e: RefError) -> Self {
        let reason = match e {
            RefError::Circular(_) => SkipReason::CircularRef,
            RefError::Unresolved(_) => SkipReason::UnresolvedRef,
        };
        Skip::new(reason, e.to_string())
    }
}

/// Document-wide inputs shared by every operation.
#[derive(Debug)]
pub struct DocumentContext<'a> {
    /// Parsed document
    pub doc: &'a Document,
    /// Attachment slug
    pub slug: &'a str,
    /// Top-level security requirements
    pub global_security: Option<Value>,
    /// Environment variable holding the server URL
    pub server_env_var: String,
    /// Default server URL
    pub default_server_url: Option<String>,
}

/// One operation to convert.
#[derive(Debug)]
pub struct OperationInput<'a> {
    /// Lowercase method
    pub method: &'a str,
    /// Path template
    pub path: &'a str,
    /// Declared or derived operation ID
    pub operation_id: String,
    /// Operation object
    pub operation: &'a Value,
    /// Path-level parameters
    pub shared_parameters: &'a [Value],
}

/// An HTTP tool ready to persist.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpTool {
    /// `tool:http:<slug>:<operation>`
    pub urn: ToolUrn,
    /// Tool name shown to clients
    pub name: String,
    /// Name before truncation
    pub untruncated_name: String,
    /// Operation ID, truncated for storage
    pub operation: String,
    /// Operation summary
    pub summary: String,
    /// Operation description
    pub description: String,
    /// Operation tags as declared
    pub tags: Vec<String>,
    /// Uppercase method
    pub method: String,
    /// Path template
    pub path: String,
    /// Effective security requirements
    pub security: Option<Value>,
    /// Environment variable holding the server URL
    pub server_env_var: String,
    /// Default server URL
    pub default_server_url: Option<String>,
    /// Chosen request body content type
    pub request_content_type: Option<String>,
    /// Merged JSON Schema of all inputs
    pub input_schema: Option<Value>,
    /// Wire-level tool definition
    pub definition: Value,
    /// Whether an `x-gram` or `x-speakeasy-mcp` extension was applied
    pub x_gram: bool,
    /// Name before the extension override
    pub original_name: Option<String>,
    /// Summary before the extension override
    pub original_summary: Option<String>,
    /// Description before the extension override
    pub original_description: Option<String>,
    /// Non-fatal notes about the conversion
    pub warnings: Vec<String>,
}

fn preferred_request_types() -> &'static [Regex] {
    static TYPES: OnceLock<Vec<Regex>> = OnceLock::new();
    TYPES.get_or_init(|| {
        [
            r"\bjson\b",
            r"^application/x-www-form-urlencoded\b",
            r"^multipart/form-data\b",
            r"^text/",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

fn tag_pattern() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z](?:[a-z0-9_-]*[a-z0-9])?$").ok())
        .as_ref()
}

/// Convert one operation into a tool.
pub fn build(ctx: &DocumentContext<'_>, input: OperationInput<'_>) -> Result<HttpTool, Skip> {
    let op = input
        .operation
        .as_object()
        .ok_or_else(|| Skip::new(SkipReason::InvalidOperation, "operation is not an object"))?;

    if op
        .get("servers")
        .and_then(Value::as_array)
        .is_some_and(|s| !s.is_empty())
    {
        return Err(Skip::new(
            SkipReason::OperationServers,
            "per-operation servers are not currently supported",
        ));
    }
    if op.get("deprecated").and_then(Value::as_bool) == Some(true) {
        return Err(Skip::new(SkipReason::Deprecated, "operation is deprecated"));
    }
    if input.path.len() > MAX_PATH_LENGTH {
        return Err(Skip::new(
            SkipReason::PathTooLong,
            format!("path exceeds {} characters", MAX_PATH_LENGTH),
        ));
    }

    let mut warnings = Vec::new();
    let doc = ctx.doc;

    let body = capture_body(doc, op.get("requestBody"), &mut warnings)?;

    let mut params: Vec<(String, String, &Value)> = Vec::new();
    let op_params = op
        .get("parameters")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    for raw in input.shared_parameters.iter().chain(op_params) {
        let param = doc.resolve(raw)?;
        let (Some(name), Some(location)) = (
            param.get("name").and_then(Value::as_str),
            param.get("in").and_then(Value::as_str),
        ) else {
            return Err(Skip::new(
                SkipReason::InvalidOperation,
                "parameter without name or location",
            ));
        };
        match params
            .iter_mut()
            .find(|(n, l, _)| n == name && l == location)
        {
            Some(existing) => existing.2 = param,
            None => params.push((name.to_string(), location.to_string(), param)),
        }
    }

    let path_params = capture_parameters(doc, &by_location(&params, "path"))?;
    let header_params = capture_parameters(doc, &by_location(&params, "header"))?;
    let query_params = capture_parameters(doc, &by_location(&params, "query"))?;

    let mut properties = Map::new();
    let mut required = Vec::new();
    for (key, captured) in [
        ("pathParameters", &path_params),
        ("headerParameters", &header_params),
        ("queryParameters", &query_params),
    ] {
        let Some(schema) = &captured.schema else {
            continue;
        };
        if schema["required"].as_array().is_some_and(|r| !r.is_empty()) {
            required.push(key);
        }
        properties.insert(key.to_string(), schema.clone());
    }
    if let Some(body) = &body {
        properties.insert("body".to_string(), body.schema.clone());
        if body.required {
            required.push("body");
        }
    }

    let input_schema = if properties.is_empty() {
        None
    } else {
        let mut schema = Map::new();
        schema.insert("type".to_string(), json!("object"));
        if !required.is_empty() {
            schema.insert("required".to_string(), json!(required));
        }
        schema.insert("properties".to_string(), Value::Object(properties));
        schema.insert("additionalProperties".to_string(), json!(false));
        Some(Value::Object(schema))
    };

    let descriptor = describe(ctx.slug, &input.operation_id, op, &mut warnings);

    let security = security::requirements(op.get("security")).or_else(|| ctx.global_security.clone());

    let tags: Vec<String> = op
        .get("tags")
        .and_then(Value::as_array)
        .map(|t| t.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default();
    let definition_tags: Vec<String> = tags
        .iter()
        .map(|t| snake_case(&sanitize(t)))
        .filter(|t| tag_pattern().is_some_and(|re| re.is_match(t)))
        .take(MAX_TAGS)
        .collect();

    let method = input.method.to_ascii_uppercase();
    let urn = ToolUrn::new(ToolKind::Http, ctx.slug, naming::urn_name(&input.operation_id))
        .map_err(|e| Skip::new(SkipReason::InvalidOperation, e.to_string()))?;

    let definition_description = if descriptor.description.is_empty() {
        &descriptor.summary
    } else {
        &descriptor.description
    };
    let mut definition = json!({
        "kind": TOOL_DEFINITION_KIND,
        "name": descriptor.name,
        "description": definition_description,
        "tags": definition_tags,
        "method": method,
        "path": input.path,
        "path_parameters": path_params.specs,
        "header_parameters": header_params.specs,
        "query_parameters": query_params.specs,
    });
    if let Some(body) = &body {
        definition["body"] = json!({
            "content_type": body.content_type,
            "required": body.required,
            "schema": body.schema,
        });
    }

    Ok(HttpTool {
        urn,
        name: descriptor.name,
        untruncated_name: descriptor.untruncated_name,
        operation: truncate_with_hash(&input.operation_id, naming::MAX_OPERATION_LENGTH),
        summary: descriptor.summary,
        description: descriptor.description,
        tags,
        method,
        path: input.path.to_string(),
        security,
        server_env_var: ctx.server_env_var.clone(),
        default_server_url: ctx.default_server_url.clone(),
        request_content_type: body.map(|b| b.content_type),
        input_schema,
        definition,
        x_gram: descriptor.x_gram,
        original_name: descriptor.original_name,
        original_summary: descriptor.original_summary,
        original_description: descriptor.original_description,
        warnings,
    })
}

fn by_location<'v>(params: &[(String, String, &'v Value)], location: &str) -> Vec<&'v Value> {
    params
        .iter()
        .filter(|(_, l, _)| l == location)
        .map(|(_, _, p)| *p)
        .collect()
}

#[derive(Debug)]
struct CapturedBody {
    content_type: String,
    schema: Value,
    required: bool,
}

fn capture_body(
    doc: &Document,
    body: Option<&Value>,
    warnings: &mut Vec<String>,
) -> Result<Option<CapturedBody>, Skip> {
    let Some(body) = body else {
        return Ok(None);
    };
    let body = doc.resolve(body)?;
    let Some(content) = body.get("content").and_then(Value::as_object) else {
        return Ok(None);
    };
    if content.is_empty() {
        return Ok(None);
    }
    if content.len() > 1 {
        warnings.push("only one request body content type processed for operation".to_string());
    }

    let required = body.get("required").and_then(Value::as_bool).unwrap_or(false);
    let chosen = content.iter().find(|(media_type, _)| {
        preferred_request_types()
            .iter()
            .any(|re| re.is_match(media_type))
    });

    let Some((content_type, media)) = chosen else {
        let types: Vec<&str> = content.keys().map(String::as_str).collect();
        return Err(Skip::new(
            SkipReason::UnsupportedRequest,
            format!(
                "no supported request body content type found: {}",
                types.join(", ")
            ),
        ));
    };

    let schema = match media.get("schema") {
        Some(schema) => doc.inline(schema)?,
        None => json!({"type": "object", "additionalProperties": true}),
    };

    Ok(Some(CapturedBody {
        content_type: content_type.clone(),
        schema,
        required,
    }))
}

#[derive(Debug, Default)]
struct CapturedParameters {
    schema: Option<Value>,
    specs: Vec<Value>,
}

fn capture_parameters(doc: &Document, params: &[&Value]) -> Result<CapturedParameters, Skip> {
    if params.is_empty() {
        return Ok(CapturedParameters::default());
    }

    let mut properties = Map::new();
    let mut required = Vec::new();
    let mut specs = Vec::with_capacity(params.len());

    for param in params {
        let name = param.get("name").and_then(Value::as_str).unwrap_or_default();
        let location = param.get("in").and_then(Value::as_str).unwrap_or_default();
        let description = param.get("description").and_then(Value::as_str);
        let is_required = param.get("required").and_then(Value::as_bool).unwrap_or(false);

        let schema = match param.get("schema") {
            None => json!({"type": "string"}),
            Some(schema) => {
                let mut schema = doc.inline(schema)?;
                if let (Some(obj), Some(description)) = (schema.as_object_mut(), description) {
                    if !obj.contains_key("description") && !description.is_empty() {
                        obj.insert("description".to_string(), json!(description));
                    }
                }
                schema
            }
        };

        let mut spec = Map::new();
        spec.insert("name".to_string(), json!(name));
        spec.insert("in".to_string(), json!(location));
        spec.insert("required".to_string(), json!(is_required));
        for key in ["style", "explode", "allowReserved"] {
            if let Some(v) = param.get(key) {
                spec.insert(key.to_string(), v.clone());
            }
        }
        spec.insert("schema".to_string(), schema.clone());
        spec.insert(
            "deprecated".to_string(),
            json!(param.get("deprecated").and_then(Value::as_bool).unwrap_or(false)),
        );
        for key in ["example", "examples"] {
            if let Some(v) = param.get(key) {
                spec.insert(key.to_string(), v.clone());
            }
        }
        if let Some(description) = description {
            spec.insert("description".to_string(), json!(description));
        }
        specs.push(Value::Object(spec));

        properties.insert(name.to_string(), schema);
        if is_required {
            required.push(name);
        }
    }

    let mut schema = Map::new();
    schema.insert("type".to_string(), json!("object"));
    if !required.is_empty() {
        schema.insert("required".to_string(), json!(required));
    }
    schema.insert("properties".to_string(), Value::Object(properties));
    schema.insert("additionalProperties".to_string(), json!(false));

    Ok(CapturedParameters {
        schema: Some(Value::Object(schema)),
        specs,
    })
}

#[derive(Debug)]
struct Descriptor {
    name: String,
    untruncated_name: String,
    summary: String,
    description: String,
    x_gram: bool,
    original_name: Option<String>,
    original_summary: Option<String>,
    original_description: Option<String>,
}

fn describe(
    slug: &str,
    operation_id: &str,
    op: &Map<String, Value>,
    warnings: &mut Vec<String>,
) -> Descriptor {
    let (name, untruncated_name) = tool_name(slug, operation_id);
    let text = |v: Option<&Value>| v.and_then(Value::as_str).unwrap_or_default().to_string();
    let summary = text(op.get("summary"));
    let description = text(op.get("description"));

    let extension = |key: &str, warnings: &mut Vec<String>| match op.get(key) {
        Some(Value::Object(ext)) => Some(ext.clone()),
        Some(_) => {
            warnings.push(format!("error parsing {} extension: expected an object", key));
            None
        }
        None => None,
    };

    let (custom_name, custom_summary, custom_description) =
        if let Some(ext) = extension("x-gram", &mut *warnings) {
            let field = |k: &str| ext.get(k).and_then(Value::as_str).map(str::to_string);
            (field("name"), field("summary"), field("description"))
        } else if let Some(ext) = extension("x-speakeasy-mcp", &mut *warnings) {
            let field = |k: &str| ext.get(k).and_then(Value::as_str).map(str::to_string);
            let (n, d) = (field("name"), field("description"));
            if n.is_none() && d.is_none() {
                return plain(name, untruncated_name, summary, description);
            }
            (n, None, d)
        } else {
            return plain(name, untruncated_name, summary, description);
        };

    let custom_name = custom_name
        .map(|n| snake_case(&sanitize(&n)))
        .filter(|n| !n.is_empty())
        .map(|n| truncate_with_hash(&n, naming::MAX_TOOL_NAME_LENGTH));
    let non_empty = |s: &String| (!s.is_empty()).then(|| s.clone());

    Descriptor {
        original_name: Some(name.clone()),
        original_summary: non_empty(&summary),
        original_description: non_empty(&description),
        name: custom_name.unwrap_or(name),
        untruncated_name,
        summary: custom_summary.unwrap_or(summary),
        description: custom_description.unwrap_or(description),
        x_gram: true,
    }
}

fn plain(name: String, untruncated_name: String, summary: String, description: String) -> Descriptor {
    Descriptor {
        name,
        untruncated_name,
        summary,
        description,
        x_gram: false,
        original_name: None,
        original_summary: None,
        original_description: None,
    }
}

/// First `https` server without variables.
///
/// Returns the URL and notes about servers that were passed over.
pub fn default_server(servers: Option<&Value>) -> (Option<String>, Vec<String>) {
    let mut notes = Vec::new();
    let Some(servers) = servers.and_then(Value::as_array) else {
        return (None, notes);
    };

    for server in servers {
        let Some(raw) = server.get("url").and_then(Value::as_str) else {
            continue;
        };
        if server
            .get("variables")
            .and_then(Value::as_object)
            .is_some_and(|v| !v.is_empty())
        {
            continue;
        }
        match url::Url::parse(raw) {
            Ok(u) if u.scheme() == "https" => return (Some(raw.to_string()), notes),
            Ok(_) => notes.push(format!("{}: skipping non-https server url", raw)),
            Err(e) => notes.push(format!("{}: skipping server due to malformed url: {}", raw, e)),
        }
    }

    (None, notes)
}
