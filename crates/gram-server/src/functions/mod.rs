// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Functions bundles.
//!
//! A functions bundle is a ZIP archive holding an entry point for one runtime
//! and a `manifest.json` that declares tools and resources. This module
//! validates bundles, extracts their manifest into tool and resource rows,
//! issues per-function bearer secrets, and authenticates runners that call
//! back with JWTs signed by those secrets.

pub mod archive;
pub mod credentials;
pub mod extract;
pub mod manifest;
pub mod runner_auth;

use serde::{Deserialize, Serialize};

/// Name of the manifest file at the archive root.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Bearer secret format written alongside every sealed function secret.
pub const BEARER_FORMAT: &str = "GramV1";

/// Entry points for Node.js bundles.
pub const NODE_ENTRYPOINTS: &[&str] = &[
    "functions.js",
    "functions.mjs",
    "functions.cjs",
    "functions.mts",
    "functions.cts",
    "functions.ts",
];

/// Entry points for Python bundles.
pub const PYTHON_ENTRYPOINTS: &[&str] = &["functions.py"];

/// Every accepted entry point, used when the runtime is not yet known.
pub const ALL_ENTRYPOINTS: &[&str] = &[
    "functions.js",
    "functions.mjs",
    "functions.cjs",
    "functions.mts",
    "functions.cts",
    "functions.ts",
    "functions.py",
];

/// Supported function runtimes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Runtime {
    /// Node.js 22
    #[serde(rename = "nodejs:22")]
    NodeJs22,
    /// Python 3.12
    #[serde(rename = "python:3.12")]
    Python312,
}

impl Runtime {
    /// All supported runtimes.
    pub const ALL: [Runtime; 2] = [Runtime::NodeJs22, Runtime::Python312];

    /// Wire form, e.g. `nodejs:22`.
    pub fn as_str(self) -> &'static str {
        match self {
            Runtime::NodeJs22 => "nodejs:22",
            Runtime::Python312 => "python:3.12",
        }
    }

    /// Image-safe form, e.g. `nodejs22`.
    pub fn image_tag(self) -> &'static str {
        match self {
            Runtime::NodeJs22 => "nodejs22",
            Runtime::Python312 => "python312",
        }
    }

    /// Entry point file names for this runtime family.
    pub fn entrypoints(self) -> &'static [&'static str] {
        match self {
            Runtime::NodeJs22 => NODE_ENTRYPOINTS,
            Runtime::Python312 => PYTHON_ENTRYPOINTS,
        }
    }

    /// Comma-separated list of supported runtimes for error messages.
    pub fn supported_list() -> String {
        Self::ALL
            .iter()
            .map(|r| r.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl std::fmt::Display for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Runtime {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "nodejs:22" => Ok(Runtime::NodeJs22),
            "python:3.12" => Ok(Runtime::Python312),
            _ => Err(format!(
                "unsupported functions runtime: {} (allowed: {})",
                s,
                Runtime::supported_list()
            )),
        }
    }
}
