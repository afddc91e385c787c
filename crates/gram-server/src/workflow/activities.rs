// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The deployment workflow: the steps that take a deployment from `pending`
//! to `completed` or `failed`.
//!
//! Every step can run again after a crash or a retry. Extractors replace
//! their previous rows, credentials are insert-if-missing, and runner deploys
//! reap whatever an earlier attempt left behind.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sqlx::PgPool;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::blob_store::BlobStore;
use crate::deployments::events::{self, EventBuffer};
use crate::deployments::{DeploymentStatus, DeploymentStore};
use crate::encryption::Encryption;
use crate::error::{Error, Result};
use crate::functions::Runtime;
use crate::functions::credentials::FunctionCredentials;
use crate::functions::extract::FunctionsExtractor;
use crate::metrics;
use crate::openapi::OpenApiExtractor;
use crate::runner::{BUNDLE_GUEST_PATH, DeployRequest, RunnerAsset, RunnerOrchestrator};
use crate::tenancy;

type Job<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// Tunables of the deployment workflow.
#[derive(Debug, Clone)]
pub struct WorkflowSettings {
    /// Runner image version deployed with every function
    pub runner_version: String,
    /// Extractors run at once
    pub extractor_concurrency: usize,
    /// Runner deploys run at once
    pub deploy_concurrency: usize,
    /// Live runners kept per function by the post-success reap
    pub keep_count: usize,
    /// Rows reaped per post-success reap
    pub reap_batch_size: usize,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            runner_version: "main".to_string(),
            extractor_concurrency: 2,
            deploy_concurrency: num_cpus::get(),
            keep_count: 3,
            reap_batch_size: 50,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RunnerSource {
    function_id: Uuid,
    slug: String,
    runtime: String,
    asset_id: Option<Uuid>,
    url: Option<String>,
    sha256: Option<String>,
    content_length: Option<i64>,
    content_type: Option<String>,
}

/// Runs the steps of one deployment.
#[derive(Clone)]
pub struct DeploymentWorkflow {
    pool: PgPool,
    store: DeploymentStore,
    openapi: OpenApiExtractor,
    functions: FunctionsExtractor,
    credentials: FunctionCredentials,
    orchestrator: RunnerOrchestrator,
    settings: WorkflowSettings,
}

impl DeploymentWorkflow {
    /// Create a new workflow.
    pub fn new(
        pool: PgPool,
        blobs: Arc<dyn BlobStore>,
        encryption: Encryption,
        orchestrator: RunnerOrchestrator,
        settings: WorkflowSettings,
    ) -> Self {
        Self {
            store: DeploymentStore::new(pool.clone()),
            openapi: OpenApiExtractor::new(pool.clone(), blobs.clone()),
            functions: FunctionsExtractor::new(pool.clone(), blobs),
            credentials: FunctionCredentials::new(pool.clone(), encryption),
            pool,
            orchestrator,
            settings,
        }
    }

    /// Run every step and complete the deployment.
    ///
    /// A deployment that is already terminal is returned as is. Errors leave
    /// the deployment `running`; the caller decides between a retry and
    /// [`fail`](Self::fail).
    pub async fn run(&self, project_id: Uuid, deployment_id: Uuid) -> Result<DeploymentStatus> {
        let (owner, status) = self.store.status(deployment_id).await?.ok_or_else(|| {
            Error::InvariantViolation(format!("workflow for missing deployment {}", deployment_id))
        })?;
        if owner != project_id {
            return Err(Error::InvariantViolation(format!(
                "workflow project does not own deployment {}",
                deployment_id
            )));
        }
        if status.is_terminal() {
            return Ok(status);
        }

        self.store
            .transition(project_id, deployment_id, DeploymentStatus::Running, "Deployment started")
            .await?;

        self.validate(project_id, deployment_id).await?;
        let sources = self.process(project_id, deployment_id).await?;
        self.credentials.provision(project_id, deployment_id).await?;
        self.deploy_runners(project_id, deployment_id).await?;
        self.check_outputs(project_id, deployment_id, sources).await?;

        let (status, moved) = self
            .store
            .transition(
                project_id,
                deployment_id,
                DeploymentStatus::Completed,
                "Deployment completed",
            )
            .await?;
        if moved {
            metrics::deployment_finished(status.as_str());
            info!(deployment_id = %deployment_id, "Deployment completed");
        }

        if let Err(e) = self
            .orchestrator
            .reap(
                Some(project_id),
                self.settings.keep_count,
                self.settings.reap_batch_size,
            )
            .await
        {
            warn!(project_id = %project_id, error = %e, "Post-deployment runner reap failed");
        }

        Ok(status)
    }

    /// Record `cause` in the event log and fail the deployment.
    pub async fn fail(
        &self,
        project_id: Uuid,
        deployment_id: Uuid,
        cause: &Error,
    ) -> Result<DeploymentStatus> {
        let mut buffer = EventBuffer::new(deployment_id, project_id);
        buffer.error(
            events::LOG_ERROR,
            format!("deployment failed: {}", cause.public_message()),
        );
        buffer.flush(&self.pool).await?;

        let (status, moved) = self
            .store
            .transition(project_id, deployment_id, DeploymentStatus::Failed, "Deployment failed")
            .await?;
        if moved {
            metrics::deployment_finished(status.as_str());
        }
        Ok(status)
    }

    /// Check the deployment against the organization's tier.
    async fn validate(&self, project_id: Uuid, deployment_id: Uuid) -> Result<()> {
        let tier = tenancy::project_tier(&self.pool, project_id).await?;
        let functions = self.store.functions_attachments(deployment_id).await?;

        if let Err(e) = tier.check_functions(functions.len()) {
            let mut buffer = EventBuffer::new(deployment_id, project_id);
            buffer.error(events::LOG_ERROR, e.public_message());
            buffer.flush(&self.pool).await?;
            return Err(e);
        }
        Ok(())
    }

    /// Run the extractors, two at a time. Returns the number of attachments.
    async fn process(&self, project_id: Uuid, deployment_id: Uuid) -> Result<usize> {
        let openapi = self.store.openapi_attachments(deployment_id).await?;
        let functions = self.store.functions_attachments(deployment_id).await?;
        let semaphore = Arc::new(Semaphore::new(self.settings.extractor_concurrency.max(1)));

        let mut jobs: Vec<Job<'_>> = Vec::with_capacity(openapi.len() + functions.len());
        for attachment in &openapi {
            let semaphore = semaphore.clone();
            jobs.push(Box::pin(async move {
                let _permit = acquire(&semaphore).await?;
                self.openapi
                    .extract(project_id, deployment_id, attachment)
                    .await
                    .map(|_| ())
            }));
        }
        for attachment in &functions {
            let semaphore = semaphore.clone();
            jobs.push(Box::pin(async move {
                let _permit = acquire(&semaphore).await?;
                self.functions
                    .extract(project_id, deployment_id, attachment)
                    .await
                    .map(|_| ())
            }));
        }

        let results = futures::future::join_all(jobs).await;
        first_failure(results)?;
        Ok(openapi.len() + functions.len())
    }

    /// Preflight every function, then deploy their runners.
    async fn deploy_runners(&self, project_id: Uuid, deployment_id: Uuid) -> Result<()> {
        let sources: Vec<RunnerSource> = sqlx::query_as(
            r#"
            SELECT f.id AS function_id, f.slug, f.runtime,
                   a.id AS asset_id, a.url, a.sha256, a.content_length, a.content_type
            FROM deployments_functions f
            LEFT JOIN assets a ON a.id = f.asset_id AND a.project_id = $2
            WHERE f.deployment_id = $1
            ORDER BY f.slug
            "#,
        )
        .bind(deployment_id)
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;

        if sources.is_empty() {
            return Ok(());
        }

        let mut buffer = EventBuffer::new(deployment_id, project_id);
        let mut requests = Vec::with_capacity(sources.len());
        let mut failed = false;
        for source in sources {
            match self.preflight(project_id, deployment_id, &source).await {
                Ok(req) => requests.push(req),
                Err(e) => {
                    error!(
                        deployment_id = %deployment_id,
                        function_id = %source.function_id,
                        error = %e,
                        "Function failed preflight check"
                    );
                    buffer.error(
                        events::LOG_ERROR,
                        format!("{}: function failed preflight checks", source.slug),
                    );
                    failed = true;
                }
            }
        }
        buffer.flush(&self.pool).await?;

        if failed {
            return Err(Error::Invalid(
                "one or more functions failed preflight checks".to_string(),
            ));
        }

        let semaphore = Arc::new(Semaphore::new(self.settings.deploy_concurrency.max(1)));
        let jobs: Vec<Job<'_>> = requests
            .iter()
            .map(|req| {
                let semaphore = semaphore.clone();
                Box::pin(async move {
                    let _permit = acquire(&semaphore).await?;
                    self.orchestrator.deploy(req).await.map(|_| ())
                }) as Job<'_>
            })
            .collect();

        let results = futures::future::join_all(jobs).await;
        first_failure(results)
    }

    async fn preflight(
        &self,
        project_id: Uuid,
        deployment_id: Uuid,
        source: &RunnerSource,
    ) -> Result<DeployRequest> {
        let function_id = source.function_id;
        let violation = |what: &str| {
            Error::InvariantViolation(format!("function {}: {}", function_id, what))
        };

        let runtime: Runtime = source
            .runtime
            .parse()
            .map_err(|e: String| violation(&e))?;
        let asset_id = source.asset_id.ok_or_else(|| violation("asset not found"))?;

        let raw_url = source.url.as_deref().unwrap_or_default();
        if raw_url.is_empty() {
            return Err(violation("asset url is empty"));
        }
        let sha256 = source.sha256.clone().unwrap_or_default();
        if sha256.is_empty() {
            return Err(violation("asset sha256 is empty"));
        }
        let url = Url::parse(raw_url).map_err(|e| violation(&format!("invalid asset url: {}", e)))?;

        let secret = self
            .credentials
            .secret(project_id, deployment_id, function_id)
            .await?;

        let version = if self.settings.runner_version.is_empty() {
            "main".to_string()
        } else {
            self.settings.runner_version.clone()
        };

        Ok(DeployRequest {
            version,
            project_id,
            deployment_id,
            function_id,
            function_slug: source.slug.clone(),
            access_id: secret.access_id,
            runtime,
            assets: vec![RunnerAsset {
                asset_id,
                url,
                guest_path: BUNDLE_GUEST_PATH.to_string(),
                mode: 0o444,
                sha256,
                size: source.content_length.unwrap_or_default(),
                content_type: source.content_type.clone().unwrap_or_default(),
            }],
            bearer_secret: STANDARD.encode(&secret.secret),
        })
    }

    /// Fail a deployment whose attachments produced nothing.
    async fn check_outputs(&self, project_id: Uuid, deployment_id: Uuid, sources: usize) -> Result<()> {
        if sources == 0 {
            return Ok(());
        }
        let (tools, resources) = self.store.output_counts(deployment_id).await?;
        if tools == 0 && resources == 0 {
            let message = "no tools were created for deployment";
            let mut buffer = EventBuffer::new(deployment_id, project_id);
            buffer.error(events::LOG_ERROR, message);
            buffer.flush(&self.pool).await?;
            return Err(Error::Invalid(message.to_string()));
        }
        Ok(())
    }
}

async fn acquire(semaphore: &Arc<Semaphore>) -> Result<tokio::sync::OwnedSemaphorePermit> {
    semaphore
        .clone()
        .acquire_owned()
        .await
        .map_err(|e| Error::Unexpected(format!("semaphore closed: {}", e)))
}

/// The error a batch of steps fails with: the first permanent error, else the
/// first error.
fn first_failure(results: Vec<Result<()>>) -> Result<()> {
    let mut first = None;
    for result in results {
        if let Err(e) = result {
            if !e.is_retryable() {
                return Err(e);
            }
            first.get_or_insert(e);
        }
    }
    match first {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
