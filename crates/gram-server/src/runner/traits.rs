// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runner platform trait definitions.
//!
//! A platform hosts function runners as apps made of machines. Platforms are
//! pure provider clients: they never touch the database. Bookkeeping of
//! runner rows is done by the orchestrator.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::urn::RunnerKind;

/// Errors from runner platform operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RunnerError {
    /// The request can never succeed, e.g. an oversize bundle.
    #[error("{0}")]
    Invalid(String),

    /// Waiting on the provider timed out.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Provider answered with an error status.
    #[error("Provider returned {status}: {message}")]
    Api {
        /// HTTP status
        status: u16,
        /// Response body, truncated
        message: String,
    },

    /// Transport failure talking to the provider.
    #[error("HTTP error: {0}")]
    Http(String),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other error.
    #[error("Other: {0}")]
    Other(String),
}

impl RunnerError {
    /// Timeouts, transport failures, throttling and provider 5xx are
    /// retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            RunnerError::Timeout(_) | RunnerError::Http(_) => true,
            RunnerError::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for RunnerError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RunnerError::Timeout(e.to_string())
        } else {
            RunnerError::Http(e.to_string())
        }
    }
}

/// Result type for runner operations.
pub type Result<T> = std::result::Result<T, RunnerError>;

/// A file written into the machine filesystem at boot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineFile {
    /// Absolute path inside the guest
    pub guest_path: String,
    /// Base64 file content
    pub raw_value: String,
    /// Unix permission bits
    pub mode: u32,
}

/// HTTP health check run against each machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Request path
    pub path: String,
    /// Interval between checks
    pub interval: Duration,
    /// Per-check timeout
    pub timeout: Duration,
}

/// Machine definition shared by every machine of a runner app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineSpec {
    /// Container image
    pub image: String,
    /// Environment variables
    pub env: BTreeMap<String, String>,
    /// Labels attached to the machine
    pub metadata: BTreeMap<String, String>,
    /// Files written at boot
    pub files: Vec<MachineFile>,
    /// Port the runner listens on
    pub internal_port: u16,
    /// Health check
    pub check: HealthCheck,
    /// Stop the machine when idle
    pub autostop: bool,
    /// Restart attempts after a crash
    pub max_restarts: u32,
    /// Shared vCPUs
    pub cpus: u32,
    /// Memory in megabytes
    pub memory_mb: u32,
}

/// Capability interface of a runner hosting platform.
#[async_trait]
pub trait RunnerPlatform: Send + Sync {
    /// Provider name stored with runner rows (`fly`, `local`).
    fn provider(&self) -> &'static str;

    /// Kind segment of runner URNs.
    fn kind(&self) -> RunnerKind;

    /// Public URL of an app.
    fn public_url(&self, app_name: &str) -> String;

    /// Create an app and return its name.
    async fn create_app(&self, org_slug: &str, region: &str, network: &str) -> Result<String>;

    /// Set an app secret and return the secrets version that includes it.
    async fn set_secret(&self, app_name: &str, key: &str, value: &str) -> Result<u64>;

    /// Launch one machine and return its ID.
    async fn launch_machine(
        &self,
        app_name: &str,
        region: &str,
        spec: &MachineSpec,
        min_secrets_version: Option<u64>,
    ) -> Result<String>;

    /// Wait until the machine is started.
    async fn wait_started(&self, app_name: &str, machine_id: &str, timeout: Duration) -> Result<()>;

    /// Give the app a shared public IP.
    async fn allocate_shared_ip(&self, app_name: &str) -> Result<()>;

    /// Delete the app. Returns `false` when it did not exist.
    async fn delete_app(&self, app_name: &str) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(RunnerError::Timeout("wait".into()).is_retryable());
        assert!(RunnerError::Http("reset".into()).is_retryable());
        assert!(
            RunnerError::Api {
                status: 503,
                message: String::new()
            }
            .is_retryable()
        );
        assert!(
            RunnerError::Api {
                status: 429,
                message: String::new()
            }
            .is_retryable()
        );
        assert!(
            !RunnerError::Api {
                status: 422,
                message: String::new()
            }
            .is_retryable()
        );
        assert!(!RunnerError::Invalid("too big".into()).is_retryable());
    }
}
