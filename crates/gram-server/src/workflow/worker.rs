// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that drains the workflow queue.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{error, info, warn};

use super::activities::DeploymentWorkflow;
use super::queue::{DEFAULT_MAX_ATTEMPTS, WorkflowJob, WorkflowQueue, backoff};
use crate::error::Result;

/// Configuration for the workflow worker.
#[derive(Debug, Clone)]
pub struct WorkflowWorkerConfig {
    /// Whether the worker runs at all.
    pub enabled: bool,
    /// How often to poll for due workflows.
    pub poll_interval: Duration,
    /// How long a claimed workflow is leased before another worker may take it.
    pub lease: Duration,
    /// Maximum workflows claimed per poll.
    pub batch_size: i64,
    /// Attempts allowed per workflow.
    pub max_attempts: i32,
    /// Delay before the first retry.
    pub backoff_base: Duration,
    /// Longest delay between retries.
    pub backoff_max: Duration,
}

impl Default for WorkflowWorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: Duration::from_secs(2),
            lease: Duration::from_secs(600), // 10 minutes
            batch_size: 4,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(300),
        }
    }
}

impl WorkflowWorkerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `GRAM_WORKFLOW_ENABLED`: "false" or "0" to disable (default: true)
    /// - `GRAM_WORKFLOW_POLL_INTERVAL_MS`: milliseconds between polls (default: 2000)
    /// - `GRAM_WORKFLOW_LEASE_SECS`: lease on a claimed workflow (default: 600)
    /// - `GRAM_WORKFLOW_BATCH_SIZE`: max workflows per poll (default: 4)
    /// - `GRAM_WORKFLOW_MAX_ATTEMPTS`: attempts per workflow (default: 5)
    /// - `GRAM_WORKFLOW_BACKOFF_BASE_SECS`: first retry delay (default: 5)
    /// - `GRAM_WORKFLOW_BACKOFF_MAX_SECS`: retry delay cap (default: 300)
    pub fn from_env() -> Self {
        fn parsed<T: std::str::FromStr>(var: &str, default: T) -> T {
            std::env::var(var)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        }

        let enabled = std::env::var("GRAM_WORKFLOW_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        Self {
            enabled,
            poll_interval: Duration::from_millis(parsed("GRAM_WORKFLOW_POLL_INTERVAL_MS", 2000)),
            lease: Duration::from_secs(parsed("GRAM_WORKFLOW_LEASE_SECS", 600)),
            batch_size: parsed("GRAM_WORKFLOW_BATCH_SIZE", 4),
            max_attempts: parsed("GRAM_WORKFLOW_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS).max(1),
            backoff_base: Duration::from_secs(parsed("GRAM_WORKFLOW_BACKOFF_BASE_SECS", 5)),
            backoff_max: Duration::from_secs(parsed("GRAM_WORKFLOW_BACKOFF_MAX_SECS", 300)),
        }
    }
}

/// Background worker that claims and runs deployment workflows.
pub struct WorkflowWorker {
    queue: WorkflowQueue,
    workflow: DeploymentWorkflow,
    config: WorkflowWorkerConfig,
    shutdown: Arc<Notify>,
    wake: Arc<Notify>,
}

impl WorkflowWorker {
    /// Create a new workflow worker.
    pub fn new(
        queue: WorkflowQueue,
        workflow: DeploymentWorkflow,
        config: WorkflowWorkerConfig,
    ) -> Self {
        Self {
            queue,
            workflow,
            config,
            shutdown: Arc::new(Notify::new()),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Get a handle that makes the worker poll immediately.
    pub fn wake_handle(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Run the worker loop until the shutdown signal is received.
    pub async fn run(&self) {
        if !self.config.enabled {
            info!("Workflow worker disabled");
            return;
        }

        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            lease_secs = self.config.lease.as_secs(),
            batch_size = self.config.batch_size,
            max_attempts = self.config.max_attempts,
            "Workflow worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Workflow worker received shutdown signal");
                    break;
                }

                _ = self.wake.notified() => {
                    if let Err(e) = self.poll_once().await {
                        error!(error = %e, "Failed to process deployment workflows");
                    }
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.poll_once().await {
                        error!(error = %e, "Failed to process deployment workflows");
                    }
                }
            }
        }

        info!("Workflow worker stopped");
    }

    /// Claim due workflows and run them. Returns how many were claimed.
    pub async fn poll_once(&self) -> Result<usize> {
        let jobs = self
            .queue
            .claim(self.config.lease, self.config.batch_size)
            .await?;
        let claimed = jobs.len();

        futures::future::join_all(jobs.iter().map(|job| self.process(job))).await;
        Ok(claimed)
    }

    async fn process(&self, job: &WorkflowJob) {
        let result = self
            .workflow
            .run(job.project_id, job.deployment_id)
            .await;

        let bookkeeping = match result {
            Ok(status) => {
                info!(
                    deployment_id = %job.deployment_id,
                    status = %status,
                    attempt = job.attempts,
                    "Deployment workflow finished"
                );
                self.queue.complete(job.deployment_id).await
            }
            Err(e) if e.is_retryable() && !job.is_last_attempt() => {
                let delay = backoff(job.attempts, self.config.backoff_base, self.config.backoff_max);
                warn!(
                    deployment_id = %job.deployment_id,
                    attempt = job.attempts,
                    max_attempts = job.max_attempts,
                    retry_in_secs = delay.as_secs(),
                    error = %e,
                    "Deployment workflow failed, retrying"
                );
                self.queue.retry(job.deployment_id, delay, &e.to_string()).await
            }
            Err(e) => {
                error!(
                    deployment_id = %job.deployment_id,
                    attempt = job.attempts,
                    kind = %e.kind(),
                    error = %e,
                    "Deployment workflow failed"
                );
                if let Err(fail_err) = self
                    .workflow
                    .fail(job.project_id, job.deployment_id, &e)
                    .await
                {
                    error!(
                        deployment_id = %job.deployment_id,
                        error = %fail_err,
                        "Failed to mark deployment failed"
                    );
                }
                self.queue.fail(job.deployment_id, &e.to_string()).await
            }
        };

        if let Err(e) = bookkeeping {
            error!(deployment_id = %job.deployment_id, error = %e, "Failed to update workflow row");
        }
    }
}
