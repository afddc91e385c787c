// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for gram-server.
//!
//! [`GramRuntime`] wires the HTTP server, the deployment workflow worker and
//! the runner reaper onto a shared pool, blob store and runner platform.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use gram_server::runtime::GramRuntime;
//! use gram_server::runner::MockPlatform;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = gram_server::Config::from_env()?;
//!     let pool = sqlx::PgPool::connect(&config.database_url).await?;
//!     let blobs = gram_server::blob_store::from_uri(&config.assets_uri, &config.object_storage).await?;
//!
//!     let runtime = GramRuntime::builder()
//!         .pool(pool)
//!         .blob_store(blobs)
//!         .platform(Arc::new(MockPlatform::new()))
//!         .config(config)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusHandle;
use sqlx::PgPool;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::assets::AssetRegistry;
use crate::blob_store::BlobStore;
use crate::config::Config;
use crate::deployments::DeploymentStore;
use crate::encryption::Encryption;
use crate::functions::credentials::FunctionCredentials;
use crate::functions::runner_auth::RunnerAuth;
use crate::runner::{OrchestratorConfig, RunnerOrchestrator, RunnerPlatform};
use crate::runner_reaper::{RunnerReaper, RunnerReaperConfig};
use crate::server::{self, AppState};
use crate::tokens::AssetTokens;
use crate::workflow::{
    DeploymentWorkflow, WorkflowQueue, WorkflowSettings, WorkflowWorker, WorkflowWorkerConfig,
};

/// Builder for creating a [`GramRuntime`].
#[derive(Default)]
pub struct GramRuntimeBuilder {
    pool: Option<PgPool>,
    blob_store: Option<Arc<dyn BlobStore>>,
    platform: Option<Arc<dyn RunnerPlatform>>,
    config: Option<Config>,
    encryption: Option<Encryption>,
    workflow_config: Option<WorkflowWorkerConfig>,
    reaper_config: Option<RunnerReaperConfig>,
    metrics: Option<PrometheusHandle>,
}

impl GramRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the PostgreSQL connection pool (required).
    pub fn pool(mut self, pool: PgPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Set the blob store holding asset content (required).
    pub fn blob_store(mut self, store: Arc<dyn BlobStore>) -> Self {
        self.blob_store = Some(store);
        self
    }

    /// Set the platform runners are deployed on (required).
    pub fn platform(mut self, platform: Arc<dyn RunnerPlatform>) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Set the server configuration (required).
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the encryption client for function secrets.
    ///
    /// Default: built from `config.encryption_key`
    pub fn encryption(mut self, encryption: Encryption) -> Self {
        self.encryption = Some(encryption);
        self
    }

    /// Set the workflow worker configuration.
    ///
    /// Default: [`WorkflowWorkerConfig::from_env()`]
    pub fn workflow_config(mut self, config: WorkflowWorkerConfig) -> Self {
        self.workflow_config = Some(config);
        self
    }

    /// Set the runner reaper configuration.
    ///
    /// Default: [`RunnerReaperConfig::from_env()`]
    pub fn reaper_config(mut self, config: RunnerReaperConfig) -> Self {
        self.reaper_config = Some(config);
        self
    }

    /// Set the Prometheus handle rendered by `GET /metrics`.
    ///
    /// Default: `None` (the endpoint answers 404)
    pub fn metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<GramRuntimeConfig> {
        let pool = self
            .pool
            .ok_or_else(|| anyhow::anyhow!("pool is required"))?;
        let blob_store = self
            .blob_store
            .ok_or_else(|| anyhow::anyhow!("blob_store is required"))?;
        let platform = self
            .platform
            .ok_or_else(|| anyhow::anyhow!("platform is required"))?;
        let config = self
            .config
            .ok_or_else(|| anyhow::anyhow!("config is required"))?;
        let encryption = match self.encryption {
            Some(encryption) => encryption,
            None => Encryption::from_base64_key(&config.encryption_key)?,
        };

        Ok(GramRuntimeConfig {
            pool,
            blob_store,
            platform,
            encryption,
            workflow_config: self
                .workflow_config
                .unwrap_or_else(WorkflowWorkerConfig::from_env),
            reaper_config: self.reaper_config.unwrap_or_else(RunnerReaperConfig::from_env),
            metrics: self.metrics,
            config,
        })
    }
}

/// Configuration for a [`GramRuntime`].
pub struct GramRuntimeConfig {
    pool: PgPool,
    blob_store: Arc<dyn BlobStore>,
    platform: Arc<dyn RunnerPlatform>,
    encryption: Encryption,
    config: Config,
    workflow_config: WorkflowWorkerConfig,
    reaper_config: RunnerReaperConfig,
    metrics: Option<PrometheusHandle>,
}

impl GramRuntimeConfig {
    /// Start the runtime, spawning the HTTP server, workflow worker and runner reaper.
    pub async fn start(self) -> Result<GramRuntime> {
        let orchestrator = RunnerOrchestrator::new(
            self.pool.clone(),
            self.platform.clone(),
            self.blob_store.clone(),
            OrchestratorConfig::from_config(&self.config),
        );

        let settings = WorkflowSettings {
            runner_version: self.config.functions.runner_version.clone(),
            keep_count: self.reaper_config.keep_count,
            reap_batch_size: self.reaper_config.batch_size,
            ..Default::default()
        };
        let workflow = DeploymentWorkflow::new(
            self.pool.clone(),
            self.blob_store.clone(),
            self.encryption.clone(),
            orchestrator.clone(),
            settings,
        );

        let max_attempts = self.workflow_config.max_attempts;
        let worker = WorkflowWorker::new(
            WorkflowQueue::new(self.pool.clone()),
            workflow,
            self.workflow_config,
        );
        let worker_shutdown = worker.shutdown_handle();
        let workflow_wake = worker.wake_handle();

        let worker_handle = tokio::spawn(async move {
            worker.run().await;
        });

        let reaper = RunnerReaper::new(orchestrator, self.reaper_config);
        let reaper_shutdown = reaper.shutdown_handle();

        let reaper_handle = tokio::spawn(async move {
            reaper.run().await;
        });

        let credentials = FunctionCredentials::new(self.pool.clone(), self.encryption.clone());
        let state = AppState {
            pool: self.pool.clone(),
            deployments: DeploymentStore::new(self.pool.clone())
                .with_workflow_max_attempts(max_attempts),
            assets: AssetRegistry::new(
                self.pool.clone(),
                self.blob_store.clone(),
                AssetTokens::new(&self.config.jwt_secret),
                self.config.server_url.clone(),
            ),
            runner_auth: RunnerAuth::new(self.pool.clone(), credentials, self.blob_store.clone()),
            workflow_wake,
            metrics: self.metrics,
        };

        let bind_addr = self.config.http_addr;
        let server_shutdown = Arc::new(Notify::new());
        let server_handle = tokio::spawn({
            let shutdown = server_shutdown.clone();
            async move {
                server::serve(bind_addr, state, shutdown)
                    .await
                    .map_err(anyhow::Error::from)
            }
        });

        info!(
            bind_addr = %bind_addr,
            provider = self.platform.provider(),
            "GramRuntime started"
        );

        Ok(GramRuntime {
            server_handle,
            worker_handle,
            reaper_handle,
            server_shutdown,
            worker_shutdown,
            reaper_shutdown,
            bind_addr,
        })
    }
}

/// A running gram-server instance that can be embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct GramRuntime {
    server_handle: JoinHandle<Result<()>>,
    worker_handle: JoinHandle<()>,
    reaper_handle: JoinHandle<()>,
    server_shutdown: Arc<Notify>,
    worker_shutdown: Arc<Notify>,
    reaper_shutdown: Arc<Notify>,
    bind_addr: SocketAddr,
}

impl GramRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> GramRuntimeBuilder {
        GramRuntimeBuilder::new()
    }

    /// Get the bind address of the HTTP server.
    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    /// Gracefully shut down the runtime.
    ///
    /// In-flight workflows finish their current step; anything interrupted is
    /// reclaimed after its lease expires.
    pub async fn shutdown(self) -> Result<()> {
        info!("GramRuntime shutting down...");

        self.server_shutdown.notify_one();
        self.worker_shutdown.notify_one();
        self.reaper_shutdown.notify_one();

        if let Err(e) = self.worker_handle.await {
            error!("Workflow worker task panicked: {}", e);
        }

        if let Err(e) = self.reaper_handle.await {
            error!("Runner reaper task panicked: {}", e);
        }

        match self.server_handle.await {
            Ok(Ok(())) => {
                info!("GramRuntime shutdown complete");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("GramRuntime server error during shutdown: {}", e);
                Err(e)
            }
            Err(e) => {
                error!("GramRuntime server task panicked: {}", e);
                Err(anyhow::anyhow!("server task panicked: {}", e))
            }
        }
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.server_handle.is_finished()
            && !self.worker_handle.is_finished()
            && !self.reaper_handle.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_requires_pool() {
        let err = GramRuntime::builder().build().err().unwrap();
        assert!(err.to_string().contains("pool is required"));
    }

    #[tokio::test]
    async fn test_build_requires_platform() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = crate::blob_store::FsBlobStore::new(dir.path()).await.unwrap();
        let err = GramRuntime::builder()
            .pool(PgPool::connect_lazy("postgres://localhost/dummy").unwrap())
            .blob_store(Arc::new(store))
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("platform is required"));
    }
}
