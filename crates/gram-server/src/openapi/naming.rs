// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tool and environment variable naming.

use sha2::{Digest, Sha256};

use crate::urn::MAX_SEGMENT_LENGTH;

/// Longest tool name handed to MCP clients.
pub const MAX_TOOL_NAME_LENGTH: usize = 50;
/// Longest stored operation ID.
pub const MAX_OPERATION_LENGTH: usize = 255;

/// Cut `s` to `max` bytes, replacing the tail with 8 hex digits of its SHA-256.
///
/// Strings that already fit are returned unchanged.
pub fn truncate_with_hash(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }

    let digest = hex::encode(Sha256::digest(s.as_bytes()));
    let hash = &digest[..8];
    let Some(keep) = max.checked_sub(hash.len()) else {
        return hash.to_string();
    };

    let mut cut = keep;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{}", &s[..cut], hash)
}

/// Replace every character outside `[A-Za-z0-9_-]` with `_`.
pub fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Lowercase snake case: word boundaries at case changes, `-`, `_` and any
/// non-alphanumeric character; runs of separators collapse.
pub fn snake_case(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len() + 4);

    for (i, &c) in chars.iter().enumerate() {
        if !c.is_ascii_alphanumeric() {
            if !out.is_empty() && !out.ends_with('_') {
                out.push('_');
            }
            continue;
        }

        if c.is_ascii_uppercase() && i > 0 {
            let prev = chars[i - 1];
            let next_lower = chars.get(i + 1).is_some_and(|n| n.is_ascii_lowercase());
            let boundary = prev.is_ascii_lowercase()
                || prev.is_ascii_digit()
                || (prev.is_ascii_uppercase() && next_lower);
            if boundary && !out.is_empty() && !out.ends_with('_') {
                out.push('_');
            }
        }

        out.push(c.to_ascii_lowercase());
    }

    out.trim_end_matches('_').to_string()
}

/// Upper snake case, used for environment variable names.
pub fn env_var(s: &str) -> String {
    snake_case(s).to_ascii_uppercase()
}

/// Operation ID for an operation that does not declare one.
pub fn derive_operation_id(method: &str, path: &str) -> String {
    let raw = format!("{}_{}", method.to_ascii_lowercase(), path);
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        let c = if c.is_ascii_alphanumeric() { c } else { '_' };
        if c == '_' && out.ends_with('_') {
            continue;
        }
        out.push(c);
    }
    out.trim_end_matches('_').to_string()
}

/// Tool name for an operation: snake case of `<slug>_<operation_id>`, cut
/// to [`MAX_TOOL_NAME_LENGTH`].
///
/// Returns the name and its untruncated form.
pub fn tool_name(slug: &str, operation_id: &str) -> (String, String) {
    let untruncated = snake_case(&sanitize(&format!("{}_{}", slug, operation_id)));
    let name = truncate_with_hash(&untruncated, MAX_TOOL_NAME_LENGTH);
    (name, untruncated)
}

/// URN name segment for an operation ID.
pub fn urn_name(operation_id: &str) -> String {
    truncate_with_hash(&sanitize(operation_id), MAX_SEGMENT_LENGTH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_with_hash() {
        assert_eq!(truncate_with_hash("short", 10), "short");

        let long = "a".repeat(60);
        let cut = truncate_with_hash(&long, 50);
        assert_eq!(cut.len(), 50);
        assert!(cut.starts_with(&"a".repeat(42)));
        assert_eq!(cut, truncate_with_hash(&long, 50));
        assert_ne!(cut, truncate_with_hash(&"a".repeat(61), 50));

        assert_eq!(truncate_with_hash(&long, 4).len(), 8);
    }

    #[test]
    fn test_snake_case() {
        assert_eq!(snake_case("listPets"), "list_pets");
        assert_eq!(snake_case("petstore_getPetById"), "petstore_get_pet_by_id");
        assert_eq!(snake_case("HTTPServer"), "http_server");
        assert_eq!(snake_case("my-api__v2"), "my_api_v2");
        assert_eq!(snake_case("already_snake"), "already_snake");
    }

    #[test]
    fn test_env_var() {
        assert_eq!(env_var("petstore_SERVER_URL"), "PETSTORE_SERVER_URL");
        assert_eq!(env_var("my-api_apiKey"), "MY_API_API_KEY");
        assert_eq!(env_var("petstore_basicAuth_USERNAME"), "PETSTORE_BASIC_AUTH_USERNAME");
    }

    #[test]
    fn test_derive_operation_id() {
        assert_eq!(derive_operation_id("GET", "/pets/{petId}"), "get_pets_petId");
        assert_eq!(derive_operation_id("post", "/"), "post");
    }

    #[test]
    fn test_tool_name() {
        let (name, untruncated) = tool_name("petstore", "listPets");
        assert_eq!(name, "petstore_list_pets");
        assert_eq!(untruncated, name);

        let (name, untruncated) = tool_name("petstore", "pets.find-by.status");
        assert_eq!(name, "petstore_pets_find_by_status");
        assert_eq!(untruncated, name);

        let op = "thisIsAnExtremelyLongOperationIdentifierThatKeepsGoing";
        let (name, untruncated) = tool_name("petstore", op);
        assert_eq!(name.len(), MAX_TOOL_NAME_LENGTH);
        assert!(untruncated.len() > MAX_TOOL_NAME_LENGTH);
    }

    #[test]
    fn test_urn_name() {
        assert_eq!(urn_name("pets.list"), "pets_list");
        assert_eq!(urn_name(&"x".repeat(200)).len(), MAX_SEGMENT_LENGTH);
    }
}
