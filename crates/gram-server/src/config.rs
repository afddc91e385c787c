// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for gram-server.

use std::net::SocketAddr;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection string
    pub database_url: String,
    /// HTTP listen address
    pub http_addr: SocketAddr,
    /// Public base URL of this server (signed URLs, runner callbacks)
    pub server_url: String,
    /// HMAC secret for signed asset tokens
    pub jwt_secret: String,
    /// Base64-encoded 32-byte key used to seal secrets at rest
    pub encryption_key: String,
    /// Blob store root (`file://`, `s3://` or `gs://`)
    pub assets_uri: String,
    /// Object storage client settings
    pub object_storage: ObjectStorageConfig,
    /// Function runner settings
    pub functions: FunctionsConfig,
}

/// Object storage client settings for the S3 and GCS backends.
#[derive(Debug, Clone, Default)]
pub struct ObjectStorageConfig {
    /// Custom S3 endpoint (MinIO, localstack)
    pub endpoint_url: Option<String>,
    /// S3 region
    pub region: String,
    /// Use path-style addressing
    pub force_path_style: bool,
    /// HMAC access key for the GCS interoperability endpoint
    pub gcs_hmac_access_key: Option<String>,
    /// HMAC secret for the GCS interoperability endpoint
    pub gcs_hmac_secret: Option<String>,
}

/// Runner platform selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionsProvider {
    /// In-process platform that records calls (development and tests)
    Mock,
    /// Fly.io Machines
    Fly,
}

impl std::str::FromStr for FunctionsProvider {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mock" | "local" => Ok(FunctionsProvider::Mock),
            "fly" => Ok(FunctionsProvider::Fly),
            _ => Err(format!("Unknown functions provider: {}", s)),
        }
    }
}

/// Function runner settings.
#[derive(Debug, Clone)]
pub struct FunctionsConfig {
    /// Which runner platform to deploy to
    pub provider: FunctionsProvider,
    /// Runner image version deployed with every function
    pub runner_version: String,
    /// Image template; `{runtime}` and `{version}` are substituted
    pub image_template: String,
    /// Fly.io settings (present when `provider` is `Fly`)
    pub fly: Option<FlyConfig>,
}

/// Fly.io API settings.
#[derive(Debug, Clone)]
pub struct FlyConfig {
    /// API token used for both the GraphQL and Machines APIs
    pub api_token: String,
    /// Organization slug that owns runner apps
    pub org: String,
    /// Primary region for runner machines
    pub region: String,
    /// Platform API base URL
    pub api_base: String,
    /// Machines API base URL
    pub machines_api_base: String,
}

/// Default runner image template.
pub const DEFAULT_IMAGE_TEMPLATE: &str = "ghcr.io/speakeasy-api/gram-runner-{runtime}:{version}";

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = required("GRAM_DATABASE_URL")?;

        let port: u16 = std::env::var("GRAM_HTTP_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let http_addr = SocketAddr::from(([0, 0, 0, 0], port));

        let server_url = std::env::var("GRAM_SERVER_URL")
            .unwrap_or_else(|_| format!("http://localhost:{}", port));

        let jwt_secret = required("GRAM_JWT_SECRET")?;
        let encryption_key = required("GRAM_ENCRYPTION_KEY")?;

        let assets_uri =
            std::env::var("GRAM_ASSETS_URI").unwrap_or_else(|_| "file://.data/assets".to_string());

        let object_storage = ObjectStorageConfig {
            endpoint_url: std::env::var("GRAM_S3_ENDPOINT_URL").ok(),
            region: std::env::var("GRAM_S3_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
            force_path_style: std::env::var("GRAM_S3_FORCE_PATH_STYLE")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            gcs_hmac_access_key: std::env::var("GRAM_GCS_HMAC_ACCESS_KEY").ok(),
            gcs_hmac_secret: std::env::var("GRAM_GCS_HMAC_SECRET").ok(),
        };

        let functions = FunctionsConfig::from_env()?;

        Ok(Self {
            database_url,
            http_addr,
            server_url,
            jwt_secret,
            encryption_key,
            assets_uri,
            object_storage,
            functions,
        })
    }
}

impl FunctionsConfig {
    /// Load runner settings from environment variables.
    ///
    /// Fly.io variables are only required when `GRAM_FUNCTIONS_PROVIDER=fly`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let provider = std::env::var("GRAM_FUNCTIONS_PROVIDER")
            .unwrap_or_else(|_| "mock".to_string())
            .parse::<FunctionsProvider>()
            .map_err(|reason| ConfigError::InvalidValue {
                var: "GRAM_FUNCTIONS_PROVIDER",
                reason,
            })?;

        let fly = match provider {
            FunctionsProvider::Fly => Some(FlyConfig {
                api_token: required("FLY_API_TOKEN")?,
                org: required("GRAM_FLY_ORG")?,
                region: std::env::var("GRAM_FLY_REGION").unwrap_or_else(|_| "iad".to_string()),
                api_base: std::env::var("GRAM_FLY_API_BASE")
                    .unwrap_or_else(|_| "https://api.fly.io".to_string()),
                machines_api_base: std::env::var("GRAM_FLY_MACHINES_API_BASE")
                    .unwrap_or_else(|_| "https://api.machines.dev".to_string()),
            }),
            FunctionsProvider::Mock => None,
        };

        Ok(Self {
            provider,
            runner_version: std::env::var("GRAM_FUNCTIONS_RUNNER_VERSION")
                .unwrap_or_else(|_| "main".to_string()),
            image_template: std::env::var("GRAM_FUNCTIONS_RUNNER_IMAGE")
                .unwrap_or_else(|_| DEFAULT_IMAGE_TEMPLATE.to_string()),
            fly,
        })
    }
}

impl Default for FunctionsConfig {
    fn default() -> Self {
        Self {
            provider: FunctionsProvider::Mock,
            runner_version: "main".to_string(),
            image_template: DEFAULT_IMAGE_TEMPLATE.to_string(),
            fly: None,
        }
    }
}

fn required(var: &'static str) -> Result<String, ConfigError> {
    std::env::var(var).map_err(|_| ConfigError::MissingEnvVar(var))
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// The port number is invalid.
    #[error("Invalid port number")]
    InvalidPort,
    /// A variable has a value outside its accepted set.
    #[error("Invalid value for {var}: {reason}")]
    InvalidValue {
        /// Offending variable
        var: &'static str,
        /// What was wrong with it
        reason: String,
    },
}
