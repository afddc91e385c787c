// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that deletes superseded runner apps.
//!
//! Every deployment of a function leaves a runner app behind. For each
//! `(project, function slug)` the newest `keep_count` live runners are kept;
//! older ones are deleted from the provider and marked reaped. Rows still
//! `initializing` belong to in-flight deploys and are left alone.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{error, info};

use crate::runner::{ReapOutcome, RunnerOrchestrator};

/// Configuration for the runner reaper.
#[derive(Debug, Clone)]
pub struct RunnerReaperConfig {
    /// Whether the reaper runs at all.
    pub enabled: bool,
    /// How often to run a pass.
    pub poll_interval: Duration,
    /// Live runners kept per function.
    pub keep_count: usize,
    /// Maximum rows reaped per pass.
    pub batch_size: usize,
}

impl Default for RunnerReaperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: Duration::from_secs(600), // 10 minutes
            keep_count: 3,
            batch_size: 50,
        }
    }
}

impl RunnerReaperConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `GRAM_RUNNER_REAPER_ENABLED`: "false" or "0" to disable (default: true)
    /// - `GRAM_RUNNER_REAPER_POLL_INTERVAL_SECS`: seconds between passes (default: 600)
    /// - `GRAM_RUNNER_REAPER_KEEP_COUNT`: runners kept per function (default: 3)
    /// - `GRAM_RUNNER_REAPER_BATCH_SIZE`: max rows per pass (default: 50)
    pub fn from_env() -> Self {
        let enabled = std::env::var("GRAM_RUNNER_REAPER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let poll_interval_secs = std::env::var("GRAM_RUNNER_REAPER_POLL_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(600);

        let keep_count = std::env::var("GRAM_RUNNER_REAPER_KEEP_COUNT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3);

        let batch_size = std::env::var("GRAM_RUNNER_REAPER_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(50);

        Self {
            enabled,
            poll_interval: Duration::from_secs(poll_interval_secs),
            keep_count,
            batch_size,
        }
    }
}

/// Background worker that reaps superseded runner apps.
pub struct RunnerReaper {
    orchestrator: RunnerOrchestrator,
    config: RunnerReaperConfig,
    shutdown: Arc<Notify>,
}

impl RunnerReaper {
    /// Create a new runner reaper.
    pub fn new(orchestrator: RunnerOrchestrator, config: RunnerReaperConfig) -> Self {
        Self {
            orchestrator,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the reaper loop until the shutdown signal is received.
    pub async fn run(&self) {
        if !self.config.enabled {
            info!("Runner reaper disabled");
            return;
        }

        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            keep_count = self.config.keep_count,
            batch_size = self.config.batch_size,
            "Runner reaper started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Runner reaper received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.reap_once().await {
                        error!(error = %e, "Runner reaper pass failed");
                    }
                }
            }
        }

        info!("Runner reaper stopped");
    }

    /// Run one global pass.
    pub async fn reap_once(&self) -> crate::error::Result<ReapOutcome> {
        self.orchestrator
            .reap(None, self.config.keep_count, self.config.batch_size)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::{BlobStore, FsBlobStore};
    use crate::runner::{MockPlatform, OrchestratorConfig};
    use sqlx::PgPool;
    use tempfile::TempDir;

    async fn reaper(config: RunnerReaperConfig) -> (RunnerReaper, TempDir) {
        let dir = TempDir::new().unwrap();
        let pool = PgPool::connect_lazy("postgres://localhost/dummy").unwrap();
        let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(dir.path()).await.unwrap());
        let orchestrator = RunnerOrchestrator::new(
            pool,
            Arc::new(MockPlatform::new()),
            blobs,
            OrchestratorConfig::default(),
        );
        (RunnerReaper::new(orchestrator, config), dir)
    }

    #[test]
    fn test_config_default() {
        let config = RunnerReaperConfig::default();
        assert!(config.enabled);
        assert_eq!(config.poll_interval, Duration::from_secs(600));
        assert_eq!(config.keep_count, 3);
        assert_eq!(config.batch_size, 50);
    }

    #[tokio::test]
    async fn test_shutdown_handle() {
        let (reaper, _dir) = reaper(RunnerReaperConfig::default()).await;
        let handle = reaper.shutdown_handle();
        assert!(Arc::strong_count(&handle) >= 2);
    }

    #[tokio::test]
    async fn test_run_exits_immediately_when_disabled() {
        let (reaper, _dir) = reaper(RunnerReaperConfig {
            enabled: false,
            ..Default::default()
        })
        .await;

        tokio::time::timeout(Duration::from_secs(1), reaper.run())
            .await
            .expect("run() should exit immediately when disabled");
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (reaper, _dir) = reaper(RunnerReaperConfig {
            poll_interval: Duration::from_secs(3600),
            ..Default::default()
        })
        .await;
        let reaper = Arc::new(reaper);
        let handle = reaper.shutdown_handle();

        let task = tokio::spawn({
            let reaper = reaper.clone();
            async move { reaper.run().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.notify_one();

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("reaper should stop after shutdown")
            .unwrap();
    }
}
