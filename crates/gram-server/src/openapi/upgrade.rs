// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-place upgrade of OpenAPI 3.0 documents to 3.1.

use serde_json::{json, Map, Value};

use super::Document;

/// Version written into upgraded documents.
pub const TARGET_VERSION: &str = "3.1.0";

/// Result of an upgrade pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpgradeReport {
    /// Version the document declared before the pass
    pub from_version: String,
    /// Whether the document was rewritten
    pub upgraded: bool,
    /// Non-fatal problems, one per schema that could not be converted
    pub issues: Vec<String>,
}

/// Upgrade a 3.0.x document to 3.1.
///
/// Converts `nullable` into a `null` type member and boolean
/// `exclusiveMinimum`/`exclusiveMaximum` into their numeric form, in every
/// schema reachable from components, parameters and request bodies.
/// Documents that are not 3.0.x are left untouched.
pub fn upgrade(doc: &mut Document) -> UpgradeReport {
    let from_version = doc.version().to_string();
    if !from_version.starts_with("3.0") {
        return UpgradeReport {
            from_version,
            ..Default::default()
        };
    }

    let mut issues = Vec::new();
    let root = doc.root_mut();
    root["openapi"] = Value::String(TARGET_VERSION.to_string());

    if let Some(components) = root.get_mut("components").and_then(Value::as_object_mut) {
        if let Some(schemas) = components.get_mut("schemas").and_then(Value::as_object_mut) {
            for (name, schema) in schemas.iter_mut() {
                upgrade_schema(schema, &format!("components.schemas.{}", name), &mut issues);
            }
        }
        if let Some(params) = components.get_mut("parameters").and_then(Value::as_object_mut) {
            for (name, param) in params.iter_mut() {
                upgrade_parameter(param, &format!("components.parameters.{}", name), &mut issues);
            }
        }
        if let Some(bodies) = components.get_mut("requestBodies").and_then(Value::as_object_mut) {
            for (name, body) in bodies.iter_mut() {
                upgrade_content(body, &format!("components.requestBodies.{}", name), &mut issues);
            }
        }
    }

    if let Some(paths) = root.get_mut("paths").and_then(Value::as_object_mut) {
        for (path, item) in paths.iter_mut() {
            let Some(item) = item.as_object_mut() else {
                continue;
            };
            for (key, value) in item.iter_mut() {
                if key == "parameters" {
                    upgrade_parameters(value, &format!("{} parameters", path), &mut issues);
                } else if is_method(key) {
                    let loc = format!("{} {}", key.to_ascii_uppercase(), path);
                    if let Some(params) = value.get_mut("parameters") {
                        upgrade_parameters(params, &loc, &mut issues);
                    }
                    if let Some(body) = value.get_mut("requestBody") {
                        upgrade_content(body, &loc, &mut issues);
                    }
                }
            }
        }
    }

    UpgradeReport {
        from_version,
        upgraded: true,
        issues,
    }
}

fn is_method(key: &str) -> bool {
    matches!(
        key,
        "get" | "put" | "post" | "delete" | "options" | "head" | "patch" | "trace"
    )
}

fn upgrade_parameters(params: &mut Value, loc: &str, issues: &mut Vec<String>) {
    if let Some(params) = params.as_array_mut() {
        for param in params {
            upgrade_parameter(param, loc, issues);
        }
    }
}

fn upgrade_parameter(param: &mut Value, loc: &str, issues: &mut Vec<String>) {
    if let Some(schema) = param.get_mut("schema") {
        upgrade_schema(schema, loc, issues);
    }
}

fn upgrade_content(body: &mut Value, loc: &str, issues: &mut Vec<String>) {
    if let Some(content) = body.get_mut("content").and_then(Value::as_object_mut) {
        for (media_type, media) in content.iter_mut() {
            if let Some(schema) = media.get_mut("schema") {
                upgrade_schema(schema, &format!("{} {}", loc, media_type), issues);
            }
        }
    }
}

fn upgrade_schema(schema: &mut Value, loc: &str, issues: &mut Vec<String>) {
    let Some(obj) = schema.as_object_mut() else {
        return;
    };
    if obj.contains_key("$ref") {
        return;
    }

    upgrade_exclusive_bound(obj, "exclusiveMinimum", "minimum");
    upgrade_exclusive_bound(obj, "exclusiveMaximum", "maximum");
    if let Err(e) = upgrade_nullable(obj) {
        issues.push(format!("{}: {}", loc, e));
    }

    for key in ["allOf", "anyOf", "oneOf"] {
        if let Some(subs) = obj.get_mut(key).and_then(Value::as_array_mut) {
            for (i, sub) in subs.iter_mut().enumerate() {
                upgrade_schema(sub, &format!("{}.{}[{}]", loc, key, i), issues);
            }
        }
    }
    for key in ["items", "not", "additionalProperties"] {
        if let Some(sub) = obj.get_mut(key) {
            upgrade_schema(sub, &format!("{}.{}", loc, key), issues);
        }
    }
    if let Some(props) = obj.get_mut("properties").and_then(Value::as_object_mut) {
        for (name, sub) in props.iter_mut() {
            upgrade_schema(sub, &format!("{}.{}", loc, name), issues);
        }
    }
}

fn upgrade_exclusive_bound(obj: &mut Map<String, Value>, exclusive: &str, bound: &str) {
    match obj.get(exclusive).and_then(Value::as_bool) {
        Some(true) => match obj.remove(bound) {
            Some(limit) => {
                obj.insert(exclusive.to_string(), limit);
            }
            None => {
                obj.remove(exclusive);
            }
        },
        Some(false) => {
            obj.remove(exclusive);
        }
        None => {}
    }
}

fn upgrade_nullable(obj: &mut Map<String, Value>) -> Result<(), String> {
    let nullable = obj.remove("nullable").and_then(|v| v.as_bool()).unwrap_or(false);
    if !nullable {
        return Ok(());
    }

    let types = infer_types(obj);
    if !types.is_empty() {
        let mut types = types;
        if !types.iter().any(|t| t == "null") {
            types.push("null".to_string());
        }
        obj.insert("type".to_string(), json!(types));
        if let Some(members) = obj.get_mut("enum").and_then(Value::as_array_mut) {
            if !members.iter().any(Value::is_null) {
                members.push(Value::Null);
            }
        }
        return Ok(());
    }

    let null_schema = json!({"type": "null"});
    if let Some(any_of) = obj.get_mut("anyOf").and_then(Value::as_array_mut) {
        any_of.push(null_schema);
        return Ok(());
    }
    if let Some(one_of) = obj.get_mut("oneOf").and_then(Value::as_array_mut) {
        one_of.push(null_schema);
        return Ok(());
    }
    if let Some(all_of) = obj.remove("allOf") {
        obj.insert(
            "oneOf".to_string(),
            json!([null_schema, {"allOf": all_of}]),
        );
        return Ok(());
    }

    Err("unable to infer type for nullable schema".to_string())
}

fn infer_types(obj: &Map<String, Value>) -> Vec<String> {
    match obj.get("type") {
        Some(Value::String(t)) => return vec![t.clone()],
        Some(Value::Array(ts)) if !ts.is_empty() => {
            return ts
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect();
        }
        _ => {}
    }

    if let Some(Value::Array(members)) = obj.get("enum") {
        if !members.is_empty() {
            let mut types: Vec<String> = members.iter().filter_map(value_type).collect();
            types.sort();
            types.dedup();
            return types;
        }
    }

    const OBJECT_KEYS: &[&str] = &[
        "properties",
        "patternProperties",
        "propertyNames",
        "additionalProperties",
        "unevaluatedProperties",
        "minProperties",
        "maxProperties",
    ];
    if OBJECT_KEYS.iter().any(|k| obj.contains_key(*k)) {
        return vec!["object".to_string()];
    }

    const ARRAY_KEYS: &[&str] = &[
        "items",
        "prefixItems",
        "contains",
        "minItems",
        "maxItems",
        "unevaluatedItems",
    ];
    if ARRAY_KEYS.iter().any(|k| obj.contains_key(*k)) {
        return vec!["array".to_string()];
    }

    obj.get("const")
        .or_else(|| obj.get("default"))
        .and_then(value_type)
        .into_iter()
        .collect()
}

fn value_type(v: &Value) -> Option<String> {
    match v {
        Value::Number(_) => Some("number".to_string()),
        Value::Bool(_) => Some("boolean".to_string()),
        Value::String(_) => Some("string".to_string()),
        Value::Null => Some("null".to_string()),
        _ => None,
    }
}
