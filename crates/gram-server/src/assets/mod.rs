// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Content-addressed assets.
//!
//! Every upload is hashed with SHA-256 and stored once per project. The
//! [`AssetRegistry`] owns the upload pipeline, project-scoped serving and
//! signed chat-attachment URLs.
//!
//! | Kind | Limit | Content types |
//! |------|-------|---------------|
//! | `openapiv3` | 8 MiB | `application/{yaml,x-yaml,json}`, `text/{yaml,x-yaml,json}` |
//! | `image` | 4 MiB | `image/{png,jpeg,gif,webp}` |
//! | `chat_attachment` | 10 MiB | `audio/{mpeg,wav}`, `image/{png,jpeg}`, `text/{plain,csv}`, `application/{json,yaml}` |
//! | `functions` | 15 MiB | `application/{zip,x-zip,x-zip-compressed}` |

mod registry;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use registry::{AssetRegistry, SERVE_CHAT_ATTACHMENT_SIGNED_PATH, ServedAsset, SignedUrl};

const MIB: u64 = 1024 * 1024;

/// Upload limit for OpenAPI documents.
pub const MAX_FILE_SIZE_OPENAPI: u64 = 8 * MIB;
/// Upload limit for images.
pub const MAX_FILE_SIZE_IMAGE: u64 = 4 * MIB;
/// Upload limit for chat attachments.
pub const MAX_FILE_SIZE_CHAT_ATTACHMENT: u64 = 10 * MIB;
/// Upload limit for functions bundles.
pub const MAX_FILE_SIZE_FUNCTIONS: u64 = 15 * MIB;

/// Kind of asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    /// OpenAPI v3 document
    #[serde(rename = "openapiv3")]
    OpenApiV3,
    /// Logo or other image
    Image,
    /// File attached to a chat
    ChatAttachment,
    /// Zipped functions bundle
    Functions,
}

impl AssetKind {
    /// Database and wire form.
    pub fn as_str(self) -> &'static str {
        match self {
            AssetKind::OpenApiV3 => "openapiv3",
            AssetKind::Image => "image",
            AssetKind::ChatAttachment => "chat_attachment",
            AssetKind::Functions => "functions",
        }
    }

    /// Maximum accepted content length in bytes.
    pub fn max_size(self) -> u64 {
        match self {
            AssetKind::OpenApiV3 => MAX_FILE_SIZE_OPENAPI,
            AssetKind::Image => MAX_FILE_SIZE_IMAGE,
            AssetKind::ChatAttachment => MAX_FILE_SIZE_CHAT_ATTACHMENT,
            AssetKind::Functions => MAX_FILE_SIZE_FUNCTIONS,
        }
    }

    /// Accepted media types.
    pub fn allowed_types(self) -> &'static [&'static str] {
        match self {
            AssetKind::OpenApiV3 => &[
                "application/yaml",
                "application/x-yaml",
                "application/json",
                "text/yaml",
                "text/x-yaml",
                "text/json",
            ],
            AssetKind::Image => &["image/png", "image/jpeg", "image/gif", "image/webp"],
            AssetKind::ChatAttachment => &[
                "audio/mpeg",
                "audio/wav",
                "image/png",
                "image/jpeg",
                "text/plain",
                "text/csv",
                "application/json",
                "application/yaml",
            ],
            AssetKind::Functions => &[
                "application/zip",
                "application/x-zip",
                "application/x-zip-compressed",
            ],
        }
    }

    /// Storage file name for content with digest `sha256`.
    pub fn file_name(self, sha256: &str, media_type: &str) -> String {
        match self {
            AssetKind::OpenApiV3 => {
                let ext = if media_type.ends_with("json") { "json" } else { "yaml" };
                format!("openapi-{}.{}", sha256, ext)
            }
            AssetKind::Image => format!("image-{}{}", sha256, extension(media_type)),
            AssetKind::ChatAttachment => {
                format!("attachment-{}{}", sha256, extension(media_type))
            }
            AssetKind::Functions => format!("functions-{}.zip", sha256),
        }
    }
}

impl std::fmt::Display for AssetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AssetKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "openapiv3" => Ok(AssetKind::OpenApiV3),
            "image" => Ok(AssetKind::Image),
            "chat_attachment" => Ok(AssetKind::ChatAttachment),
            "functions" => Ok(AssetKind::Functions),
            _ => Err(format!("Unknown asset kind: {}", s)),
        }
    }
}

fn extension(media_type: &str) -> &'static str {
    match media_type {
        "image/png" => ".png",
        "image/jpeg" => ".jpg",
        "image/gif" => ".gif",
        "image/webp" => ".webp",
        "audio/mpeg" => ".mp3",
        "audio/wav" => ".wav",
        "text/plain" => ".txt",
        "text/csv" => ".csv",
        "application/json" => ".json",
        "application/yaml" => ".yaml",
        _ => "",
    }
}

/// Strip parameters from a `Content-Type` value and lowercase it.
pub fn media_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// A stored asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    /// Asset ID
    pub id: Uuid,
    /// Owning project
    #[serde(skip)]
    pub project_id: Uuid,
    /// Canonical blob URL
    pub url: String,
    /// Kind of asset
    pub kind: AssetKind,
    /// Hex SHA-256 of the content
    pub sha256: String,
    /// Media type as uploaded
    pub content_type: String,
    /// Size in bytes
    pub content_length: i64,
    /// When the asset was first stored
    pub created_at: DateTime<Utc>,
    /// When the asset was last re-uploaded
    pub updated_at: DateTime<Utc>,
}
