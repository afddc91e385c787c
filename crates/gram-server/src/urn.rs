// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Uniform resource names for tools, resources and runners.
//!
//! | URN | Format |
//! |-----|--------|
//! | Tool | `tool:<kind>:<source-slug>:<name>` |
//! | Resource | `resource:<kind>:<source-slug>:<uri-slug>` |
//! | Runner | `runner:<kind>:<org>:<app>` |
//!
//! Every segment is non-empty, at most 128 characters, and limited to
//! `[A-Za-z0-9_-]`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Maximum length of a single URN segment.
pub const MAX_SEGMENT_LENGTH: usize = 128;

/// URN construction or parsing failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid urn: {0}")]
pub struct UrnError(String);

fn validate_segment(label: &str, value: &str) -> Result<(), UrnError> {
    if value.is_empty() {
        return Err(UrnError(format!("{} is empty", label)));
    }
    if value.len() > MAX_SEGMENT_LENGTH {
        return Err(UrnError(format!(
            "{} exceeds {} characters",
            label, MAX_SEGMENT_LENGTH
        )));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(UrnError(format!(
            "{} contains invalid characters: {}",
            label, value
        )));
    }
    Ok(())
}

/// Check that `slug` can be used as a URN source segment.
pub fn validate_slug(slug: &str) -> Result<(), UrnError> {
    validate_segment("slug", slug)
}

fn split4<'a>(s: &'a str, prefix: &str) -> Result<[&'a str; 3], UrnError> {
    let parts: Vec<&str> = s.split(':').collect();
    match parts.as_slice() {
        [p, kind, source, name] if *p == prefix => Ok([*kind, *source, *name]),
        [p, ..] if *p != prefix => Err(UrnError(format!("expected {} prefix: {}", prefix, s))),
        _ => Err(UrnError(format!("expected 4 segments: {}", s))),
    }
}

/// Turn an arbitrary URI into a URN-safe slug.
///
/// Lowercases, replaces every character outside `[a-z0-9_-]` with `-`,
/// collapses runs of dashes and trims them from both ends.
pub fn uri_to_slug(uri: &str) -> String {
    let mut out = String::with_capacity(uri.len());
    for c in uri.chars().flat_map(char::to_lowercase) {
        let c = if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
            c
        } else {
            '-'
        };
        if c == '-' && out.ends_with('-') {
            continue;
        }
        out.push(c);
    }
    let trimmed = out.trim_matches('-');
    let truncated = &trimmed[..trimmed.len().min(MAX_SEGMENT_LENGTH)];
    truncated.trim_end_matches('-').to_string()
}

macro_rules! string_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

/// Source of a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolKind {
    /// Derived from an OpenAPI operation
    Http,
    /// Declared in a functions manifest
    Function,
}

impl ToolKind {
    /// Segment value.
    pub fn as_str(self) -> &'static str {
        match self {
            ToolKind::Http => "http",
            ToolKind::Function => "function",
        }
    }
}

impl std::str::FromStr for ToolKind {
    type Err = UrnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(ToolKind::Http),
            "function" => Ok(ToolKind::Function),
            _ => Err(UrnError(format!("unknown tool kind: {}", s))),
        }
    }
}

/// `tool:<kind>:<source>:<name>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ToolUrn {
    /// Tool kind
    pub kind: ToolKind,
    /// Slug of the attachment that produced the tool
    pub source: String,
    /// Tool name within the source
    pub name: String,
}

impl ToolUrn {
    /// Build a validated tool URN.
    pub fn new(
        kind: ToolKind,
        source: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<Self, UrnError> {
        let source = source.into();
        let name = name.into();
        validate_segment("source", &source)?;
        validate_segment("name", &name)?;
        Ok(Self { kind, source, name })
    }
}

impl std::fmt::Display for ToolUrn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tool:{}:{}:{}", self.kind.as_str(), self.source, self.name)
    }
}

impl std::str::FromStr for ToolUrn {
    type Err = UrnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let [kind, source, name] = split4(s, "tool")?;
        ToolUrn::new(kind.parse()?, source, name)
    }
}

string_serde!(ToolUrn);

/// Source of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Declared in a functions manifest
    Function,
}

impl ResourceKind {
    /// Segment value.
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Function => "function",
        }
    }
}

/// `resource:<kind>:<source>:<uri-slug>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceUrn {
    /// Resource kind
    pub kind: ResourceKind,
    /// Slug of the attachment that produced the resource
    pub source: String,
    /// Slug form of the resource URI
    pub uri: String,
}

impl ResourceUrn {
    /// Build a validated resource URN from a raw URI.
    pub fn new(
        kind: ResourceKind,
        source: impl Into<String>,
        uri: &str,
    ) -> Result<Self, UrnError> {
        let source = source.into();
        validate_segment("source", &source)?;
        let uri = uri_to_slug(uri);
        validate_segment("uri", &uri)?;
        Ok(Self { kind, source, uri })
    }
}

impl std::fmt::Display for ResourceUrn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "resource:{}:{}:{}", self.kind.as_str(), self.source, self.uri)
    }
}

impl std::str::FromStr for ResourceUrn {
    type Err = UrnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let [kind, source, uri] = split4(s, "resource")?;
        if kind != ResourceKind::Function.as_str() {
            return Err(UrnError(format!("unknown resource kind: {}", kind)));
        }
        validate_segment("source", source)?;
        validate_segment("uri", uri)?;
        Ok(Self {
            kind: ResourceKind::Function,
            source: source.to_string(),
            uri: uri.to_string(),
        })
    }
}

string_serde!(ResourceUrn);

/// Platform hosting a function runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunnerKind {
    /// In-process or local development runner
    Local,
    /// Fly.io app
    Fly,
}

impl RunnerKind {
    /// Segment value.
    pub fn as_str(self) -> &'static str {
        match self {
            RunnerKind::Local => "local",
            RunnerKind::Fly => "fly",
        }
    }
}

impl std::str::FromStr for RunnerKind {
    type Err = UrnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(RunnerKind::Local),
            "fly" => Ok(RunnerKind::Fly),
            _ => Err(UrnError(format!("unknown runner kind: {}", s))),
        }
    }
}

/// `runner:<kind>:<org>:<app>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunnerUrn {
    /// Hosting platform
    pub kind: RunnerKind,
    /// Provider organization slug
    pub org: String,
    /// Provider app name
    pub app: String,
}

impl RunnerUrn {
    /// Build a validated runner URN.
    pub fn new(
        kind: RunnerKind,
        org: impl Into<String>,
        app: impl Into<String>,
    ) -> Result<Self, UrnError> {
        let org = org.into();
        let app = app.into();
        validate_segment("org", &org)?;
        validate_segment("app", &app)?;
        Ok(Self { kind, org, app })
    }
}

impl std::fmt::Display for RunnerUrn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "runner:{}:{}:{}", self.kind.as_str(), self.org, self.app)
    }
}

impl std::str::FromStr for RunnerUrn {
    type Err = UrnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let [kind, org, app] = split4(s, "runner")?;
        RunnerUrn::new(kind.parse()?, org, app)
    }
}

string_serde!(RunnerUrn);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_urn_display_and_parse() {
        let urn = ToolUrn::new(ToolKind::Http, "petstore-doc", "listPets").unwrap();
        assert_eq!(urn.to_string(), "tool:http:petstore-doc:listPets");

        let parsed: ToolUrn = "tool:function:my_source-v2:my_tool-name".parse().unwrap();
        assert_eq!(parsed.kind, ToolKind::Function);
        assert_eq!(parsed.source, "my_source-v2");
        assert_eq!(parsed.name, "my_tool-name");
    }

    #[test]
    fn test_tool_urn_rejects_bad_segments() {
        assert!(ToolUrn::new(ToolKind::Http, "", "x").is_err());
        assert!(ToolUrn::new(ToolKind::Http, "src", "").is_err());
        assert!(ToolUrn::new(ToolKind::Http, "my source!", "x").is_err());
        assert!(ToolUrn::new(ToolKind::Http, "src", "a".repeat(129)).is_err());
        assert!(ToolUrn::new(ToolKind::Http, "src", "a".repeat(128)).is_ok());
        // Leading and trailing dashes are allowed.
        assert!(ToolUrn::new(ToolKind::Function, "-src", "tool-").is_ok());
    }

    #[test]
    fn test_tool_urn_parse_errors() {
        assert!("".parse::<ToolUrn>().is_err());
        assert!("tool:http:src".parse::<ToolUrn>().is_err());
        assert!("tool:mcp:src:name".parse::<ToolUrn>().is_err());
        assert!("tools:http:src:name".parse::<ToolUrn>().is_err());
        assert!("tool:http:src:name:extra".parse::<ToolUrn>().is_err());
    }

    #[test]
    fn test_tool_urn_serde() {
        let urn = ToolUrn::new(ToolKind::Function, "fns", "lookup_weather").unwrap();
        let json = serde_json::to_string(&urn).unwrap();
        assert_eq!(json, "\"tool:function:fns:lookup_weather\"");
        let back: ToolUrn = serde_json::from_str(&json).unwrap();
        assert_eq!(back, urn);
        assert!(serde_json::from_str::<ToolUrn>("123").is_err());
    }

    #[test]
    fn test_uri_to_slug() {
        assert_eq!(uri_to_slug("file:///docs/api.md"), "file-docs-api-md");
        assert_eq!(
            uri_to_slug("https://api.example.com/data"),
            "https-api-example-com-data"
        );
        assert_eq!(
            uri_to_slug("postgres://database/customers"),
            "postgres-database-customers"
        );
        assert_eq!(uri_to_slug("///"), "");
        assert!(uri_to_slug(&format!("x://{}", "a".repeat(300))).len() <= MAX_SEGMENT_LENGTH);
    }

    #[test]
    fn test_resource_urn() {
        let urn = ResourceUrn::new(ResourceKind::Function, "my-source", "file:///docs/api.md")
            .unwrap();
        assert_eq!(urn.to_string(), "resource:function:my-source:file-docs-api-md");
        assert_eq!(urn.to_string().parse::<ResourceUrn>().unwrap(), urn);

        assert!(ResourceUrn::new(ResourceKind::Function, "", "file:///a").is_err());
        assert!(ResourceUrn::new(ResourceKind::Function, "src", "").is_err());
        assert!("invalid:resource:string".parse::<ResourceUrn>().is_err());
    }

    #[test]
    fn test_runner_urn() {
        let urn = RunnerUrn::new(RunnerKind::Fly, "speakeasy", "gram-worker").unwrap();
        assert_eq!(urn.to_string(), "runner:fly:speakeasy:gram-worker");
        assert_eq!("runner:local:my-org:my-app".parse::<RunnerUrn>().unwrap().kind, RunnerKind::Local);

        assert!(RunnerUrn::new(RunnerKind::Local, "", "app").is_err());
        assert!(RunnerUrn::new(RunnerKind::Local, "org", "my app").is_err());
        assert!("runner:local:my-org".parse::<RunnerUrn>().is_err());
        assert!("runner:k8s:org:app".parse::<RunnerUrn>().is_err());
    }
}
