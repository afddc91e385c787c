// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Security schemes and requirements.

use serde_json::Value;

use super::naming::env_var;
use super::Document;

/// A security scheme declared in `components.securitySchemes`, with the
/// environment variables a caller sets to satisfy it.
#[derive(Debug, Clone, PartialEq)]
pub struct SecurityScheme {
    /// Key under `securitySchemes`
    pub key: String,
    /// `apiKey`, `http` or `oauth2`
    pub kind: String,
    /// Header, query or cookie name (`apiKey`)
    pub name: Option<String>,
    /// Placement of the key (`apiKey`)
    pub in_placement: Option<String>,
    /// HTTP auth scheme (`http`)
    pub scheme: Option<String>,
    /// Environment variables holding the credentials
    pub env_variables: Vec<String>,
    /// Supported OAuth2 flow kinds
    pub oauth_types: Vec<String>,
    /// Raw OAuth2 flows object
    pub oauth_flows: Option<Value>,
}

/// Collect supported security schemes.
///
/// Unsupported schemes are reported and left out.
pub fn extract(doc: &Document, slug: &str) -> (Vec<SecurityScheme>, Vec<String>) {
    let mut schemes = Vec::new();
    let mut errors = Vec::new();

    let Some(declared) = doc
        .root()
        .pointer("/components/securitySchemes")
        .and_then(Value::as_object)
    else {
        return (schemes, errors);
    };

    for (key, raw) in declared {
        let sec = match doc.resolve(raw) {
            Ok(sec) => sec,
            Err(e) => {
                errors.push(format!("{}: {}", key, e));
                continue;
            }
        };
        let field = |name: &str| sec.get(name).and_then(Value::as_str).map(str::to_string);
        let kind = field("type").unwrap_or_default();

        let mut env_variables = Vec::new();
        let mut oauth_types = Vec::new();
        let mut oauth_flows = None;

        match kind.as_str() {
            "apiKey" => env_variables.push(env_var(&format!("{}_{}", slug, key))),
            "http" => match field("scheme").map(|s| s.to_ascii_lowercase()).as_deref() {
                Some("bearer") => env_variables.push(env_var(&format!("{}_{}", slug, key))),
                Some("basic") => {
                    env_variables.push(env_var(&format!("{}_{}_USERNAME", slug, key)));
                    env_variables.push(env_var(&format!("{}_{}_PASSWORD", slug, key)));
                }
                other => {
                    errors.push(format!(
                        "{}: unsupported http security scheme: {}",
                        key,
                        other.unwrap_or("<none>")
                    ));
                    continue;
                }
            },
            "oauth2" => {
                let flows = sec.get("flows").filter(|f| f.is_object());
                let has = |flow: &str| flows.is_some_and(|f| f.get(flow).is_some());
                let client_credentials = has("clientCredentials");
                let authorization_code = has("authorizationCode");

                if client_credentials || authorization_code {
                    env_variables.push(env_var(&format!("{}_ACCESS_TOKEN", slug)));
                }
                if client_credentials {
                    oauth_types.push("client_credentials".to_string());
                    env_variables.push(env_var(&format!("{}_CLIENT_SECRET", slug)));
                    env_variables.push(env_var(&format!("{}_CLIENT_ID", slug)));
                    env_variables.push(env_var(&format!("{}_TOKEN_URL", slug)));
                }
                if authorization_code {
                    oauth_types.push("authorization_code".to_string());
                }
                if oauth_types.is_empty() {
                    errors.push(format!(
                        "{}: unsupported oauth2 security scheme: no supported flows found",
                        key
                    ));
                    continue;
                }
                oauth_flows = flows.cloned();
            }
            other => {
                errors.push(format!("{}: unsupported security scheme type: {}", key, other));
                continue;
            }
        }

        schemes.push(SecurityScheme {
            key: key.clone(),
            name: field("name").filter(|s| !s.is_empty()),
            in_placement: field("in").filter(|s| !s.is_empty()),
            scheme: field("scheme").filter(|s| !s.is_empty()),
            kind,
            env_variables,
            oauth_types,
            oauth_flows,
        });
    }

    (schemes, errors)
}

/// Normalize a `security` array: a list of requirement objects mapping
/// scheme keys to scopes. Returns `None` when absent or empty.
pub fn requirements(security: Option<&Value>) -> Option<Value> {
    let groups = security?.as_array()?;
    if groups.is_empty() {
        return None;
    }

    let normalized = groups
        .iter()
        .map(|group| {
            let mut out = serde_json::Map::new();
            if let Some(group) = group.as_object() {
                for (key, scopes) in group {
                    let scopes: Vec<Value> = scopes
                        .as_array()
                        .map(|s| s.iter().filter(|v| v.is_string()).cloned().collect())
                        .unwrap_or_default();
                    out.insert(key.clone(), Value::Array(scopes));
                }
            }
            Value::Object(out)
        })
        .collect();

    Some(Value::Array(normalized))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const DOC: &str = r#"
openapi: 3.1.0
paths: {}
components:
  securitySchemes:
    apiKey:
      type: apiKey
      name: X-API-Key
      in: header
    bearerAuth:
      type: http
      scheme: bearer
    basicAuth:
      type: http
      scheme: basic
    oauth:
      type: oauth2
      flows:
        clientCredentials:
          tokenUrl: https://auth.example.com/token
          scopes: {}
    digest:
      type: http
      scheme: digest
    oidc:
      type: openIdConnect
      openIdConnectUrl: https://example.com/.well-known
"#;

    #[test]
    fn test_extract_schemes() {
        let doc = Document::parse(DOC.as_bytes()).unwrap();
        let (schemes, errors) = extract(&doc, "petstore");

        let keys: Vec<&str> = schemes.iter().map(|s| s.key.as_str()).collect();
        assert_eq!(keys, vec!["apiKey", "bearerAuth", "basicAuth", "oauth"]);
        assert_eq!(errors.len(), 2);

        assert_eq!(schemes[0].env_variables, vec!["PETSTORE_API_KEY"]);
        assert_eq!(schemes[0].name.as_deref(), Some("X-API-Key"));
        assert_eq!(schemes[0].in_placement.as_deref(), Some("header"));
        assert_eq!(schemes[1].env_variables, vec!["PETSTORE_BEARER_AUTH"]);
        assert_eq!(
            schemes[2].env_variables,
            vec!["PETSTORE_BASIC_AUTH_USERNAME", "PETSTORE_BASIC_AUTH_PASSWORD"]
        );
        assert_eq!(
            schemes[3].env_variables,
            vec![
                "PETSTORE_ACCESS_TOKEN",
                "PETSTORE_CLIENT_SECRET",
                "PETSTORE_CLIENT_ID",
                "PETSTORE_TOKEN_URL"
            ]
        );
        assert_eq!(schemes[3].oauth_types, vec!["client_credentials"]);
        assert!(schemes[3].oauth_flows.is_some());
    }

    #[test]
    fn test_requirements() {
        assert_eq!(requirements(None), None);
        assert_eq!(requirements(Some(&json!([]))), None);

        let normalized = requirements(Some(&json!([{"oauth": ["read", 1]}, {}]))).unwrap();
        assert_eq!(normalized, json!([{"oauth": ["read"]}, {}]));
    }
}
