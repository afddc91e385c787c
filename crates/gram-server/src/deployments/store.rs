// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deployment persistence and the status state machine.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::{PgConnection, PgPool};
use tracing::{info, warn};
use uuid::Uuid;

use super::{
    Deployment, DeploymentEvent, DeploymentStatus, DeploymentSummary, FunctionsAttachment,
    OpenApiV3Attachment, PackageAttachment,
};
use crate::assets::AssetKind;
use crate::error::{Error, Result};
use crate::functions::Runtime;
use crate::urn;
use crate::workflow;

/// Largest page returned by listing endpoints.
pub const MAX_PAGE_SIZE: i64 = 100;
/// Page size when the caller does not ask for one.
pub const DEFAULT_PAGE_SIZE: i64 = 50;

/// OpenAPI document to attach.
#[derive(Debug, Clone, Deserialize)]
pub struct NewOpenApiV3Attachment {
    /// Asset holding the document
    pub asset_id: Uuid,
    /// Display name
    pub name: String,
    /// Slug, unique within the deployment
    pub slug: String,
}

/// Functions bundle to attach.
#[derive(Debug, Clone, Deserialize)]
pub struct NewFunctionsAttachment {
    /// Asset holding the bundle
    pub asset_id: Uuid,
    /// Display name
    pub name: String,
    /// Slug, unique within the deployment
    pub slug: String,
    /// Runtime, e.g. `nodejs:22`
    pub runtime: String,
}

/// Package reference to attach.
#[derive(Debug, Clone, Deserialize)]
pub struct NewPackageAttachment {
    /// Package name
    pub name: String,
    /// Version; `latest` when omitted
    #[serde(default)]
    pub version: Option<String>,
}

/// Request to create a deployment.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewDeployment {
    /// Deduplication key, unique per project
    pub idempotency_key: String,
    /// OpenAPI documents
    #[serde(default)]
    pub openapiv3_assets: Vec<NewOpenApiV3Attachment>,
    /// Functions bundles
    #[serde(default)]
    pub functions: Vec<NewFunctionsAttachment>,
    /// Package references
    #[serde(default)]
    pub packages: Vec<NewPackageAttachment>,
    /// External reference
    #[serde(default)]
    pub external_id: Option<String>,
    /// External link
    #[serde(default)]
    pub external_url: Option<String>,
    /// Source repository
    #[serde(default)]
    pub github_repo: Option<String>,
    /// Source pull request
    #[serde(default)]
    pub github_pr: Option<String>,
    /// Source commit
    #[serde(default)]
    pub github_sha: Option<String>,
}

impl NewDeployment {
    /// Check the request and resolve functions runtimes.
    fn validate(&self) -> Result<Vec<Runtime>> {
        if self.idempotency_key.trim().is_empty() {
            return Err(Error::BadRequest("idempotency key is required".to_string()));
        }
        if self.openapiv3_assets.is_empty() && self.functions.is_empty() && self.packages.is_empty()
        {
            return Err(Error::Invalid(
                "at least one asset or package is required".to_string(),
            ));
        }

        let mut openapi_slugs = HashSet::new();
        for a in &self.openapiv3_assets {
            check_attachment(&a.name, &a.slug)?;
            if !openapi_slugs.insert(a.slug.as_str()) {
                return Err(Error::BadRequest(format!("duplicate openapi slug: {}", a.slug)));
            }
        }

        let mut function_slugs = HashSet::new();
        let mut runtimes = Vec::with_capacity(self.functions.len());
        for f in &self.functions {
            check_attachment(&f.name, &f.slug)?;
            if !function_slugs.insert(f.slug.as_str()) {
                return Err(Error::BadRequest(format!("duplicate functions slug: {}", f.slug)));
            }
            let runtime: Runtime = f
                .runtime
                .parse()
                .map_err(|e| Error::BadRequest(format!("{}: {}", f.slug, e)))?;
            runtimes.push(runtime);
        }

        let mut package_names = HashSet::new();
        for p in &self.packages {
            if p.name.trim().is_empty() {
                return Err(Error::BadRequest("package name is required".to_string()));
            }
            if !package_names.insert(p.name.as_str()) {
                return Err(Error::BadRequest(format!("duplicate package: {}", p.name)));
            }
        }

        Ok(runtimes)
    }
}

fn check_attachment(name: &str, slug: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::BadRequest("attachment name is required".to_string()));
    }
    urn::validate_slug(slug).map_err(|e| Error::BadRequest(format!("{}: {}", slug, e)))
}

/// Deployment store.
#[derive(Debug, Clone)]
pub struct DeploymentStore {
    pool: PgPool,
    workflow_max_attempts: i32,
}

impl DeploymentStore {
    /// Create a new deployment store.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            workflow_max_attempts: workflow::DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Attempts allowed for workflows enqueued by [`create`](Self::create).
    pub fn with_workflow_max_attempts(mut self, attempts: i32) -> Self {
        self.workflow_max_attempts = attempts.max(1);
        self
    }

    /// Create a deployment and enqueue its workflow.
    ///
    /// Returns the deployment and whether it was newly created. A repeated
    /// idempotency key returns the existing deployment untouched and enqueues
    /// nothing.
    pub async fn create(
        &self,
        organization_id: &str,
        project_id: Uuid,
        user_id: &str,
        req: &NewDeployment,
    ) -> Result<(Deployment, bool)> {
        let runtimes = req.validate()?;

        let mut tx = self.pool.begin().await?;

        let inserted: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO deployments (
                id, organization_id, project_id, user_id, idempotency_key, status,
                external_id, external_url, github_repo, github_pr, github_sha
            ) VALUES ($1, $2, $3, $4, $5, 'created', $6, $7, $8, $9, $10)
            ON CONFLICT (project_id, idempotency_key) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(organization_id)
        .bind(project_id)
        .bind(user_id)
        .bind(&req.idempotency_key)
        .bind(&req.external_id)
        .bind(&req.external_url)
        .bind(&req.github_repo)
        .bind(&req.github_pr)
        .bind(&req.github_sha)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(deployment_id) = inserted else {
            tx.rollback().await?;
            let existing: Uuid = sqlx::query_scalar(
                "SELECT id FROM deployments WHERE project_id = $1 AND idempotency_key = $2",
            )
            .bind(project_id)
            .bind(&req.idempotency_key)
            .fetch_one(&self.pool)
            .await?;

            info!(
                deployment_id = %existing,
                idempotency_key = %req.idempotency_key,
                "Deployment already exists for idempotency key"
            );
            let deployment = self.require(project_id, existing).await?;
            return Ok((deployment, false));
        };

        for a in &req.openapiv3_assets {
            check_asset(&mut tx, project_id, a.asset_id, AssetKind::OpenApiV3).await?;
            sqlx::query(
                r#"
                INSERT INTO deployments_openapiv3_assets (id, deployment_id, asset_id, name, slug)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(deployment_id)
            .bind(a.asset_id)
            .bind(&a.name)
            .bind(&a.slug)
            .execute(&mut *tx)
            .await?;
        }

        for (f, runtime) in req.functions.iter().zip(&runtimes) {
            check_asset(&mut tx, project_id, f.asset_id, AssetKind::Functions).await?;
            sqlx::query(
                r#"
                INSERT INTO deployments_functions (id, deployment_id, asset_id, name, slug, runtime)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(deployment_id)
            .bind(f.asset_id)
            .bind(&f.name)
            .bind(&f.slug)
            .bind(runtime.as_str())
            .execute(&mut *tx)
            .await?;
        }

        for p in &req.packages {
            sqlx::query(
                r#"
                INSERT INTO deployments_packages (id, deployment_id, name, version)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(deployment_id)
            .bind(&p.name)
            .bind(p.version.as_deref().unwrap_or("latest"))
            .execute(&mut *tx)
            .await?;
        }

        workflow::enqueue(&mut tx, deployment_id, project_id, self.workflow_max_attempts).await?;
        transition_in(
            &mut tx,
            project_id,
            deployment_id,
            DeploymentStatus::Pending,
            "Deployment pending",
        )
        .await?;

        tx.commit().await?;

        info!(
            deployment_id = %deployment_id,
            project_id = %project_id,
            openapiv3_assets = req.openapiv3_assets.len(),
            functions = req.functions.len(),
            packages = req.packages.len(),
            "Created deployment"
        );

        let deployment = self.require(project_id, deployment_id).await?;
        Ok((deployment, true))
    }

    /// Get a deployment with its attachments and tools.
    pub async fn get(&self, project_id: Uuid, deployment_id: Uuid) -> Result<Option<Deployment>> {
        let row: Option<DeploymentRow> = sqlx::query_as(
            r#"
            SELECT id, organization_id, project_id, user_id, idempotency_key, status,
                   external_id, external_url, github_repo, github_pr, github_sha, created_at
            FROM deployments
            WHERE id = $1 AND project_id = $2
            "#,
        )
        .bind(deployment_id)
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let openapiv3_assets = self.openapi_attachments(deployment_id).await?;
        let functions_assets = self.functions_attachments(deployment_id).await?;

        let packages: Vec<PackageAttachment> = sqlx::query_as(
            r#"
            SELECT id, name, version
            FROM deployments_packages
            WHERE deployment_id = $1
            ORDER BY name
            "#,
        )
        .bind(deployment_id)
        .fetch_all(&self.pool)
        .await?;

        let openapi_3p1_tools: Vec<serde_json::Value> = sqlx::query_scalar(
            r#"
            SELECT definition
            FROM http_tool_definitions
            WHERE deployment_id = $1
            ORDER BY created_at, name
            "#,
        )
        .bind(deployment_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(Deployment {
            id: row.id,
            organization_id: row.organization_id,
            project_id: row.project_id,
            workspace_id: row.project_id,
            user_id: row.user_id,
            created_at: row.created_at,
            status: row.status.parse().map_err(Error::InvariantViolation)?,
            idempotency_key: row.idempotency_key,
            external_id: row.external_id,
            external_url: row.external_url,
            github_repo: row.github_repo,
            github_pr: row.github_pr,
            github_sha: row.github_sha,
            openapiv3_assets,
            functions_assets,
            packages,
            openapi_3p1_tools,
        }))
    }

    async fn require(&self, project_id: Uuid, deployment_id: Uuid) -> Result<Deployment> {
        self.get(project_id, deployment_id).await?.ok_or_else(|| {
            Error::InvariantViolation(format!("deployment {} vanished", deployment_id))
        })
    }

    /// List a project's deployments, newest first.
    ///
    /// `cursor` is the ID of the first deployment of the page. Returns the
    /// page and the cursor of the next page.
    pub async fn list(
        &self,
        project_id: Uuid,
        cursor: Option<Uuid>,
        limit: i64,
    ) -> Result<(Vec<DeploymentSummary>, Option<Uuid>)> {
        let limit = limit.clamp(1, MAX_PAGE_SIZE);

        let rows: Vec<SummaryRow> = sqlx::query_as(
            r#"
            SELECT d.id, d.user_id, d.created_at, d.status,
                   (SELECT COUNT(*) FROM deployments_openapiv3_assets a
                     WHERE a.deployment_id = d.id) AS openapiv3_asset_count,
                   (SELECT COUNT(*) FROM deployments_functions f
                     WHERE f.deployment_id = d.id) AS functions_asset_count
            FROM deployments d
            WHERE d.project_id = $1
              AND ($2::uuid IS NULL
                   OR d.seq <= (SELECT seq FROM deployments WHERE id = $2 AND project_id = $1))
            ORDER BY d.seq DESC
            LIMIT $3
            "#,
        )
        .bind(project_id)
        .bind(cursor)
        .bind(limit + 1)
        .fetch_all(&self.pool)
        .await?;

        let mut items = rows
            .into_iter()
            .map(DeploymentSummary::try_from)
            .collect::<Result<Vec<_>>>()?;

        let next = if items.len() as i64 > limit {
            items.pop().map(|d| d.id)
        } else {
            None
        };

        Ok((items, next))
    }

    /// Page through a deployment's event log in insertion order.
    pub async fn logs(
        &self,
        project_id: Uuid,
        deployment_id: Uuid,
        cursor: Option<Uuid>,
        limit: i64,
    ) -> Result<(Vec<DeploymentEvent>, Option<Uuid>)> {
        let limit = limit.clamp(1, MAX_PAGE_SIZE);

        let exists: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM deployments WHERE id = $1 AND project_id = $2")
                .bind(deployment_id)
                .bind(project_id)
                .fetch_optional(&self.pool)
                .await?;
        if exists.is_none() {
            return Err(Error::NotFound("deployment not found".to_string()));
        }

        let mut events: Vec<DeploymentEvent> = sqlx::query_as(
            r#"
            SELECT id, event, message, attachment_id, attachment_type, created_at
            FROM deployment_logs
            WHERE deployment_id = $1
              AND ($2::uuid IS NULL
                   OR (created_at, seq) >= (SELECT created_at, seq FROM deployment_logs
                                            WHERE id = $2 AND deployment_id = $1))
            ORDER BY created_at, seq
            LIMIT $3
            "#,
        )
        .bind(deployment_id)
        .bind(cursor)
        .bind(limit + 1)
        .fetch_all(&self.pool)
        .await?;

        let next = if events.len() as i64 > limit {
            events.pop().map(|e| e.id)
        } else {
            None
        };

        Ok((events, next))
    }

    /// Current status and owning project of a deployment.
    pub async fn status(&self, deployment_id: Uuid) -> Result<Option<(Uuid, DeploymentStatus)>> {
        let row: Option<(Uuid, String)> =
            sqlx::query_as("SELECT project_id, status FROM deployments WHERE id = $1")
                .bind(deployment_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(project_id, status)| {
            status
                .parse()
                .map(|s| (project_id, s))
                .map_err(Error::InvariantViolation)
        })
        .transpose()
    }

    /// OpenAPI documents attached to a deployment.
    pub async fn openapi_attachments(&self, deployment_id: Uuid) -> Result<Vec<OpenApiV3Attachment>> {
        let rows: Vec<OpenApiV3Attachment> = sqlx::query_as(
            r#"
            SELECT id, asset_id, name, slug
            FROM deployments_openapiv3_assets
            WHERE deployment_id = $1
            ORDER BY slug
            "#,
        )
        .bind(deployment_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Functions bundles attached to a deployment.
    pub async fn functions_attachments(
        &self,
        deployment_id: Uuid,
    ) -> Result<Vec<FunctionsAttachment>> {
        let rows: Vec<FunctionsRow> = sqlx::query_as(
            r#"
            SELECT id, asset_id, name, slug, runtime
            FROM deployments_functions
            WHERE deployment_id = $1
            ORDER BY slug
            "#,
        )
        .bind(deployment_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(FunctionsAttachment::try_from).collect()
    }

    /// Move a deployment to `target`.
    ///
    /// Returns the resulting status and whether it moved. Re-applying the
    /// current status, or asking for a backward move, changes nothing.
    pub async fn transition(
        &self,
        project_id: Uuid,
        deployment_id: Uuid,
        target: DeploymentStatus,
        message: &str,
    ) -> Result<(DeploymentStatus, bool)> {
        let mut tx = self.pool.begin().await?;
        let result = transition_in(&mut tx, project_id, deployment_id, target, message).await?;
        tx.commit().await?;
        Ok(result)
    }

    /// Number of tools and resources a deployment produced.
    pub async fn output_counts(&self, deployment_id: Uuid) -> Result<(i64, i64)> {
        let counts: (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                (SELECT COUNT(*) FROM http_tool_definitions WHERE deployment_id = $1)
                + (SELECT COUNT(*) FROM function_tool_definitions WHERE deployment_id = $1),
                (SELECT COUNT(*) FROM function_resource_definitions WHERE deployment_id = $1)
            "#,
        )
        .bind(deployment_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(counts)
    }
}

async fn check_asset(
    conn: &mut PgConnection,
    project_id: Uuid,
    asset_id: Uuid,
    kind: AssetKind,
) -> Result<()> {
    let found: Option<String> =
        sqlx::query_scalar("SELECT kind FROM assets WHERE id = $1 AND project_id = $2")
            .bind(asset_id)
            .bind(project_id)
            .fetch_optional(&mut *conn)
            .await?;

    match found {
        Some(k) if k == kind.as_str() => Ok(()),
        Some(k) => Err(Error::BadRequest(format!(
            "asset {} is a {} asset, expected {}",
            asset_id, k, kind
        ))),
        None => Err(Error::BadRequest(format!("asset {} not found", asset_id))),
    }
}

/// Apply a transition inside an open transaction, writing its event.
pub(crate) async fn transition_in(
    conn: &mut PgConnection,
    project_id: Uuid,
    deployment_id: Uuid,
    target: DeploymentStatus,
    message: &str,
) -> Result<(DeploymentStatus, bool)> {
    let current: Option<String> = sqlx::query_scalar(
        "SELECT status FROM deployments WHERE id = $1 AND project_id = $2 FOR UPDATE",
    )
    .bind(deployment_id)
    .bind(project_id)
    .fetch_optional(&mut *conn)
    .await?;

    let current: DeploymentStatus = current
        .ok_or_else(|| Error::NotFound("deployment not found".to_string()))?
        .parse()
        .map_err(Error::InvariantViolation)?;

    if current == target {
        return Ok((current, false));
    }
    if !current.can_transition_to(target) {
        warn!(
            deployment_id = %deployment_id,
            from = %current,
            to = %target,
            "Ignoring non-forward deployment transition"
        );
        return Ok((current, false));
    }

    sqlx::query("UPDATE deployments SET status = $1, updated_at = NOW() WHERE id = $2")
        .bind(target.as_str())
        .bind(deployment_id)
        .execute(&mut *conn)
        .await?;

    sqlx::query(
        r#"
        INSERT INTO deployment_logs (id, deployment_id, project_id, event, message)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(deployment_id)
    .bind(project_id)
    .bind(target.event())
    .bind(message)
    .execute(&mut *conn)
    .await?;

    info!(deployment_id = %deployment_id, from = %current, to = %target, "Deployment transitioned");

    Ok((target, true))
}

#[derive(sqlx::FromRow)]
struct DeploymentRow {
    id: Uuid,
    organization_id: String,
    project_id: Uuid,
    user_id: String,
    idempotency_key: String,
    status: String,
    external_id: Option<String>,
    external_url: Option<String>,
    github_repo: Option<String>,
    github_pr: Option<String>,
    github_sha: Option<String>,
    created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct SummaryRow {
    id: Uuid,
    user_id: String,
    created_at: DateTime<Utc>,
    status: String,
    openapiv3_asset_count: i64,
    functions_asset_count: i64,
}

impl TryFrom<SummaryRow> for DeploymentSummary {
    type Error = Error;

    fn try_from(row: SummaryRow) -> Result<Self> {
        Ok(DeploymentSummary {
            id: row.id,
            user_id: row.user_id,
            created_at: row.created_at,
            status: row.status.parse().map_err(Error::InvariantViolation)?,
            openapiv3_asset_count: row.openapiv3_asset_count,
            functions_asset_count: row.functions_asset_count,
        })
    }
}

#[derive(sqlx::FromRow)]
struct FunctionsRow {
    id: Uuid,
    asset_id: Uuid,
    name: String,
    slug: String,
    runtime: String,
}

impl TryFrom<FunctionsRow> for FunctionsAttachment {
    type Error = Error;

    fn try_from(row: FunctionsRow) -> Result<Self> {
        Ok(FunctionsAttachment {
            runtime: row.runtime.parse().map_err(Error::InvariantViolation)?,
            id: row.id,
            asset_id: row.asset_id,
            name: row.name,
            slug: row.slug,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> NewDeployment {
        serde_json::from_value(serde_json::json!({
            "idempotency_key": "deploy-1",
            "openapiv3_assets": [
                {"asset_id": Uuid::new_v4(), "name": "Petstore", "slug": "petstore-doc"}
            ],
            "functions": [
                {"asset_id": Uuid::new_v4(), "name": "Weather", "slug": "weather", "runtime": "nodejs:22"}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_validate_accepts_request() {
        let runtimes = request().validate().unwrap();
        assert_eq!(runtimes, vec![Runtime::NodeJs22]);
    }

    #[test]
    fn test_validate_requires_key_and_attachments() {
        let mut req = request();
        req.idempotency_key = " ".to_string();
        assert!(matches!(req.validate(), Err(Error::BadRequest(_))));

        let mut req = request();
        req.openapiv3_assets.clear();
        req.functions.clear();
        assert!(matches!(req.validate(), Err(Error::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_bad_slugs_and_runtimes() {
        let mut req = request();
        req.openapiv3_assets[0].slug = "has spaces".to_string();
        assert!(matches!(req.validate(), Err(Error::BadRequest(_))));

        let mut req = request();
        req.openapiv3_assets.push(req.openapiv3_assets[0].clone());
        assert!(matches!(req.validate(), Err(Error::BadRequest(_))));

        let mut req = request();
        req.functions[0].runtime = "ruby:3".to_string();
        let err = req.validate().unwrap_err();
        assert!(err.to_string().contains("unsupported functions runtime"));
    }

    #[test]
    fn test_packages_only_is_valid() {
        let req: NewDeployment = serde_json::from_value(serde_json::json!({
            "idempotency_key": "k",
            "packages": [{"name": "petstore"}]
        }))
        .unwrap();
        assert!(req.validate().unwrap().is_empty());
    }
}
