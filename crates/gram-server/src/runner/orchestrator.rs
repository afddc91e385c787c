// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runner deployment and reaping.
//!
//! Everything that can be checked is checked before the provider app is
//! created. Once it exists, any failure deletes the app again and marks the
//! row `failed`, so a failed deploy never leaves a live app behind.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use sqlx::PgPool;
use tokio::io::AsyncReadExt;
use tracing::{error, info, warn};
use url::Url;
use uuid::Uuid;

use super::store::{NewRunner, RunnerRecord, RunnerStatus, RunnerStore};
use super::traits::*;
use crate::blob_store::BlobStore;
use crate::config::{Config, FunctionsConfig};
use crate::deployments::events::{self, EventBuffer};
use crate::error::{Error, Result};
use crate::functions::Runtime;
use crate::metrics;
use crate::urn::RunnerUrn;

/// Secret variable holding the function's bearer secret.
pub const FUNCTION_AUTH_SECRET_VAR: &str = "GRAM_FUNCTION_AUTH_SECRET";

/// Guest path of the function bundle.
pub const BUNDLE_GUEST_PATH: &str = "/data/code.zip";

/// Largest total size of inlined assets.
pub const MAX_BUNDLE_BYTES: u64 = 1024 * 1024;

/// Runner deployment settings.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Provider organization
    pub org_slug: String,
    /// Primary region
    pub region: String,
    /// Image template with `{runtime}` and `{version}` placeholders
    pub image_template: String,
    /// Public URL of this server, handed to runners
    pub server_url: String,
    /// Machines per app
    pub machine_count: u8,
    /// How long to wait for each machine to start
    pub start_timeout: Duration,
    /// Largest total size of inlined assets
    pub max_bundle_bytes: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            org_slug: "local".to_string(),
            region: "local".to_string(),
            image_template: crate::config::DEFAULT_IMAGE_TEMPLATE.to_string(),
            server_url: "http://localhost:8080".to_string(),
            machine_count: 2,
            start_timeout: Duration::from_secs(30),
            max_bundle_bytes: MAX_BUNDLE_BYTES,
        }
    }
}

impl OrchestratorConfig {
    /// Settings derived from the server configuration.
    pub fn from_config(config: &Config) -> Self {
        let mut out = Self::from_functions(&config.functions);
        out.server_url = config.server_url.clone();
        out
    }

    fn from_functions(functions: &FunctionsConfig) -> Self {
        let mut out = Self {
            image_template: functions.image_template.clone(),
            ..Self::default()
        };
        if let Some(fly) = &functions.fly {
            out.org_slug = fly.org.clone();
            out.region = fly.region.clone();
        }
        out
    }

    /// Image for `runtime` at `version`.
    pub fn image(&self, runtime: Runtime, version: &str) -> String {
        self.image_template
            .replace("{runtime}", runtime.image_tag())
            .replace("{version}", version)
    }
}

/// An asset mounted into runner machines.
#[derive(Debug, Clone)]
pub struct RunnerAsset {
    /// Asset ID
    pub asset_id: Uuid,
    /// Blob URL
    pub url: Url,
    /// Guest path
    pub guest_path: String,
    /// Unix permission bits
    pub mode: u32,
    /// Hex SHA-256 of the content
    pub sha256: String,
    /// Content length
    pub size: i64,
    /// Content type
    pub content_type: String,
}

/// Everything needed to deploy one function runner.
#[derive(Clone)]
pub struct DeployRequest {
    /// Runner image version
    pub version: String,
    /// Project
    pub project_id: Uuid,
    /// Deployment
    pub deployment_id: Uuid,
    /// Function (attachment)
    pub function_id: Uuid,
    /// Function slug
    pub function_slug: String,
    /// Credentials row
    pub access_id: Uuid,
    /// Function runtime
    pub runtime: Runtime,
    /// Mounted assets
    pub assets: Vec<RunnerAsset>,
    /// Base64 bearer secret
    pub bearer_secret: String,
}

impl std::fmt::Debug for DeployRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeployRequest")
            .field("version", &self.version)
            .field("project_id", &self.project_id)
            .field("deployment_id", &self.deployment_id)
            .field("function_id", &self.function_id)
            .field("function_slug", &self.function_slug)
            .field("runtime", &self.runtime)
            .field("assets", &self.assets)
            .finish_non_exhaustive()
    }
}

/// A deployed runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployResult {
    /// Runner URN
    pub urn: RunnerUrn,
    /// Public URL
    pub public_url: String,
    /// Runner image version
    pub version: String,
    /// Provider name
    pub provider: String,
    /// Primary region
    pub region: String,
    /// Machines launched
    pub scale: usize,
}

/// Outcome of a reaper pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapOutcome {
    /// Apps deleted and marked reaped
    pub reaped: usize,
    /// Rows that could not be reaped
    pub errors: usize,
}

/// State of a deploy after the provider app was created.
#[derive(Debug)]
struct PartialDeploy {
    internal_id: Option<Uuid>,
    app_name: String,
    org_slug: String,
}

/// Deploys and reaps function runners.
#[derive(Clone)]
pub struct RunnerOrchestrator {
    pool: PgPool,
    platform: Arc<dyn RunnerPlatform>,
    blobs: Arc<dyn BlobStore>,
    store: RunnerStore,
    config: OrchestratorConfig,
}

impl RunnerOrchestrator {
    /// Create a new orchestrator.
    pub fn new(
        pool: PgPool,
        platform: Arc<dyn RunnerPlatform>,
        blobs: Arc<dyn BlobStore>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store: RunnerStore::new(pool.clone()),
            pool,
            platform,
            blobs,
            config,
        }
    }

    /// Runner registry.
    pub fn store(&self) -> &RunnerStore {
        &self.store
    }

    /// Deploy a runner for one function.
    ///
    /// Any live runner previously recorded for the same function of the same
    /// deployment is reaped first.
    pub async fn deploy(&self, req: &DeployRequest) -> Result<DeployResult> {
        let started = Instant::now();
        let mut buffer = EventBuffer::new(req.deployment_id, req.project_id);

        let result = self.deploy_inner(req, &mut buffer).await;

        match &result {
            Ok(res) => {
                metrics::runner_deployed("success");
                buffer.info(
                    events::LOG_INFO,
                    format!(
                        "{}: deployed function runner app (app={}, scale={}) in {:.1}s",
                        req.function_slug,
                        res.urn.app,
                        res.scale,
                        started.elapsed().as_secs_f64()
                    ),
                );
            }
            Err(e) => {
                metrics::runner_deployed("failure");
                buffer.error(
                    events::LOG_ERROR,
                    format!(
                        "{}: failed to deploy function runner: {}",
                        req.function_slug,
                        e.public_message()
                    ),
                );
            }
        }

        if let Err(e) = buffer.flush(&self.pool).await {
            error!(deployment_id = %req.deployment_id, error = %e, "Failed to flush runner events");
        }
        result
    }

    async fn deploy_inner(&self, req: &DeployRequest, buffer: &mut EventBuffer) -> Result<DeployResult> {
        if req.project_id.is_nil() || req.deployment_id.is_nil() || req.function_id.is_nil() {
            return Err(Error::Invalid("invalid function runner deploy request".to_string()));
        }
        if req.version.is_empty() {
            return Err(Error::Invalid("runner version cannot be empty".to_string()));
        }

        match self
            .reap_function(req.project_id, req.deployment_id, req.function_id)
            .await
        {
            Ok(n) if n > 0 => buffer.info(
                events::LOG_INFO,
                format!("{}: reaped {} previous runner app(s)", req.function_slug, n),
            ),
            Ok(_) => {}
            Err(e) => error!(
                function_id = %req.function_id,
                error = %e,
                "Failed to reap existing app before deploy"
            ),
        }

        let files = self.inline_assets(&req.assets).await?;
        let image = self.config.image(req.runtime, &req.version);
        let spec = self.machine_spec(req, image, files);

        let org_slug = self.config.org_slug.clone();
        let region = self.config.region.clone();
        let network = format!("gram-fn-{}", req.function_id);

        let app_name = self
            .platform
            .create_app(&org_slug, &region, &network)
            .await?;
        info!(
            function_id = %req.function_id,
            app_name = %app_name,
            org_slug = %org_slug,
            "Deploying functions runner app"
        );

        let mut partial = PartialDeploy {
            internal_id: None,
            app_name,
            org_slug,
        };

        match self.configure(req, &spec, &region, &mut partial).await {
            Ok(result) => Ok(result),
            Err(e) => {
                self.compensate(&partial).await;
                Err(e)
            }
        }
    }

    async fn configure(
        &self,
        req: &DeployRequest,
        spec: &MachineSpec,
        region: &str,
        partial: &mut PartialDeploy,
    ) -> Result<DeployResult> {
        let public_url = self.platform.public_url(&partial.app_name);

        let internal_id = self
            .store
            .insert_initializing(&NewRunner {
                project_id: req.project_id,
                deployment_id: req.deployment_id,
                function_id: req.function_id,
                function_slug: &req.function_slug,
                app_name: &partial.app_name,
                org_slug: &partial.org_slug,
                public_url: &public_url,
                runner_version: &req.version,
                primary_region: region,
                provider: self.platform.provider(),
            })
            .await?;
        partial.internal_id = Some(internal_id);

        let secrets_version = self
            .platform
            .set_secret(&partial.app_name, FUNCTION_AUTH_SECRET_VAR, &req.bearer_secret)
            .await?;

        let mut machines = Vec::with_capacity(self.config.machine_count as usize);
        for _ in 0..self.config.machine_count {
            let id = self
                .platform
                .launch_machine(&partial.app_name, region, spec, Some(secrets_version))
                .await?;
            self.platform
                .wait_started(&partial.app_name, &id, self.config.start_timeout)
                .await?;
            machines.push(id);
        }

        self.platform.allocate_shared_ip(&partial.app_name).await?;

        let urn = RunnerUrn::new(self.platform.kind(), &partial.org_slug, &partial.app_name)
            .map_err(|e| Error::Unexpected(format!("invalid runner urn: {}", e)))?;
        self.store
            .finalize(internal_id, RunnerStatus::Ready, Some(&urn.to_string()), None)
            .await?;

        info!(
            app_name = %partial.app_name,
            machines = ?machines,
            "Deployed function runner app"
        );

        Ok(DeployResult {
            urn,
            public_url,
            version: req.version.clone(),
            provider: self.platform.provider().to_string(),
            region: region.to_string(),
            scale: machines.len(),
        })
    }

    async fn compensate(&self, partial: &PartialDeploy) {
        let reaped_at = match self.platform.delete_app(&partial.app_name).await {
            Ok(_) => Some(Utc::now()),
            Err(e) => {
                error!(
                    app_name = %partial.app_name,
                    org_slug = %partial.org_slug,
                    error = %e,
                    "Failed to delete app after deployment failure"
                );
                None
            }
        };

        if let Some(id) = partial.internal_id {
            if let Err(e) = self
                .store
                .finalize(id, RunnerStatus::Failed, None, reaped_at)
                .await
            {
                error!(app_name = %partial.app_name, error = %e, "Failed to mark runner app as failed");
            }
        }
    }

    async fn inline_assets(&self, assets: &[RunnerAsset]) -> Result<Vec<MachineFile>> {
        let declared: i64 = assets.iter().map(|a| a.size.max(0)).sum();
        self.check_bundle_size(declared as u64)?;

        let limit = self.config.max_bundle_bytes;
        let mut total = 0u64;
        let mut files = Vec::with_capacity(assets.len());
        for asset in assets {
            let reader = self.blobs.read(&asset.url).await?;
            let mut data = Vec::new();
            reader
                .take(limit.saturating_sub(total) + 1)
                .read_to_end(&mut data)
                .await?;
            total += data.len() as u64;
            self.check_bundle_size(total)?;

            files.push(MachineFile {
                guest_path: asset.guest_path.clone(),
                raw_value: STANDARD.encode(&data),
                mode: if asset.mode == 0 { 0o444 } else { asset.mode },
            });
        }
        Ok(files)
    }

    fn check_bundle_size(&self, total: u64) -> Result<()> {
        let limit = self.config.max_bundle_bytes;
        if total > limit {
            return Err(RunnerError::Invalid(format!(
                "Function bundle too large: {:.2} MB exceeds the {} MB limit",
                total as f64 / (1024.0 * 1024.0),
                limit / (1024 * 1024)
            ))
            .into());
        }
        Ok(())
    }

    fn machine_spec(&self, req: &DeployRequest, image: String, files: Vec<MachineFile>) -> MachineSpec {
        let env = BTreeMap::from([
            ("GRAM_SERVER_URL".to_string(), self.config.server_url.clone()),
            ("GRAM_PROJECT_ID".to_string(), req.project_id.to_string()),
            ("GRAM_DEPLOYMENT_ID".to_string(), req.deployment_id.to_string()),
            ("GRAM_FUNCTION_ID".to_string(), req.function_id.to_string()),
        ]);
        let metadata = BTreeMap::from([
            ("gram_project_id".to_string(), req.project_id.to_string()),
            ("gram_deployment_id".to_string(), req.deployment_id.to_string()),
            ("gram_function_id".to_string(), req.function_id.to_string()),
            ("gram_role".to_string(), "functions_runner".to_string()),
        ]);

        MachineSpec {
            image,
            env,
            metadata,
            files,
            internal_port: 8888,
            check: HealthCheck {
                path: "/healthz".to_string(),
                interval: Duration::from_secs(30),
                timeout: Duration::from_secs(5),
            },
            autostop: true,
            max_restarts: 5,
            cpus: 2,
            memory_mb: 512,
        }
    }

    /// Reap every live runner of one function of one deployment.
    pub async fn reap_function(
        &self,
        project_id: Uuid,
        deployment_id: Uuid,
        function_id: Uuid,
    ) -> Result<usize> {
        let rows = self
            .store
            .live_for_function(project_id, deployment_id, function_id)
            .await?;
        let mut reaped = 0;
        for row in &rows {
            self.reap_one(row).await?;
            reaped += 1;
        }
        Ok(reaped)
    }

    /// Reap runners beyond the newest `keep` per `(project, function slug)`.
    ///
    /// `project_id` scopes the pass to one project. Per-row failures are
    /// counted and logged, never fatal.
    pub async fn reap(&self, project_id: Option<Uuid>, keep: usize, batch_size: usize) -> Result<ReapOutcome> {
        let rows = self
            .store
            .reap_candidates(project_id, keep as i64, batch_size as i64)
            .await?;

        let mut outcome = ReapOutcome::default();
        for row in &rows {
            match self.reap_one(row).await {
                Ok(true) => outcome.reaped += 1,
                Ok(false) => outcome.errors += 1,
                Err(e) => {
                    warn!(
                        runner_id = %row.id,
                        app_name = %row.app_name,
                        error = %e,
                        "Failed to reap runner app"
                    );
                    outcome.errors += 1;
                }
            }
        }

        metrics::runners_reaped(outcome.reaped, outcome.errors);
        if outcome.reaped > 0 || outcome.errors > 0 {
            info!(
                project_id = ?project_id,
                reaped = outcome.reaped,
                errors = outcome.errors,
                "Runner reaper pass finished"
            );
        }
        Ok(outcome)
    }

    /// Delete one app and mark its row reaped.
    ///
    /// A provider error response still marks the row, recording the error;
    /// `Ok(false)` reports that case. Transport failures leave the row live.
    async fn reap_one(&self, row: &RunnerRecord) -> Result<bool> {
        if row.app_name.is_empty() {
            self.store.mark_reaped(row.id, None).await?;
            return Ok(true);
        }

        match self.platform.delete_app(&row.app_name).await {
            Ok(_) => {
                self.store.mark_reaped(row.id, None).await?;
                info!(app_name = %row.app_name, "Reaped runner app");
                Ok(true)
            }
            Err(e @ RunnerError::Api { .. }) => {
                let message = e.to_string();
                self.store.mark_reaped(row.id, Some(&message)).await?;
                warn!(app_name = %row.app_name, error = %message, "Runner app delete returned an error");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}
