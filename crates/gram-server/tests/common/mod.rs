// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for gram-server integration tests.
//!
//! Provides TestContext wiring a real database, a temp-dir blob store and the
//! mock runner platform.

#![allow(dead_code)]

use std::io::{Cursor, Write};
use std::sync::Arc;

use sqlx::PgPool;
use uuid::Uuid;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use gram_server::assets::{Asset, AssetKind, AssetRegistry};
use gram_server::blob_store::{BlobStore, FsBlobStore};
use gram_server::deployments::{
    Deployment, DeploymentStatus, DeploymentStore, NewDeployment, NewFunctionsAttachment,
    NewOpenApiV3Attachment,
};
use gram_server::encryption::Encryption;
use gram_server::runner::{MockPlatform, OrchestratorConfig, RunnerOrchestrator};
use gram_server::tokens::AssetTokens;
use gram_server::workflow::{DeploymentWorkflow, WorkflowSettings};

pub const SERVER_URL: &str = "http://localhost:8080";

/// Small OpenAPI 3.0 document with three operations.
pub const PETSTORE: &str = r##"
openapi: 3.0.3
info:
  title: Petstore
  version: 1.0.0
servers:
  - url: https://petstore.example.com/v1
paths:
  /pets:
    get:
      operationId: listPets
      summary: List all pets
      tags: [pets]
      parameters:
        - name: limit
          in: query
          required: false
          schema:
            type: integer
            nullable: true
      responses:
        "200":
          description: A list of pets
    post:
      operationId: createPet
      summary: Create a pet
      tags: [pets]
      requestBody:
        required: true
        content:
          application/json:
            schema:
              $ref: "#/components/schemas/Pet"
      responses:
        "201":
          description: Created
  /pets/{petId}:
    get:
      operationId: showPetById
      summary: Info for a specific pet
      tags: [pets]
      parameters:
        - name: petId
          in: path
          required: true
          schema:
            type: string
      responses:
        "200":
          description: Expected response to a valid request
components:
  schemas:
    Pet:
      type: object
      required: [id, name]
      properties:
        id:
          type: integer
        name:
          type: string
  securitySchemes:
    api_key:
      type: apiKey
      in: header
      name: X-API-Key
"##;

/// Functions manifest declaring one tool and one resource.
pub const MANIFEST: &str = r#"{
    "version": "0.0.0",
    "tools": [{
        "name": "get_weather",
        "description": "Current weather",
        "inputSchema": {"type": "object", "properties": {"city": {"type": "string"}}}
    }],
    "resources": [{
        "name": "forecast",
        "description": "Weekly forecast",
        "uri": "weather://forecast",
        "mimeType": "application/json"
    }]
}"#;

/// Build an in-memory ZIP from `(name, contents)` pairs.
pub fn zip_bytes(files: &[(&str, &str)]) -> Vec<u8> {
    let mut buffer = Cursor::new(Vec::new());
    {
        let mut zip = ZipWriter::new(&mut buffer);
        for (name, contents) in files {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(contents.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }
    buffer.into_inner()
}

/// Node.js functions bundle with a manifest.
pub fn node_bundle() -> Vec<u8> {
    zip_bytes(&[
        ("functions.js", "export async function handleToolCall() {}"),
        ("manifest.json", MANIFEST),
    ])
}

/// Test context that manages database, blob store and workflow for integration tests.
pub struct TestContext {
    pub pool: PgPool,
    pub blobs: Arc<dyn BlobStore>,
    pub platform: Arc<MockPlatform>,
    pub assets: AssetRegistry,
    pub deployments: DeploymentStore,
    pub orchestrator: RunnerOrchestrator,
    pub workflow: DeploymentWorkflow,
    organizations: Vec<String>,
    _temp_dir: tempfile::TempDir,
}

impl TestContext {
    /// Create a new test context.
    pub async fn new() -> Result<Self, String> {
        let database_url = std::env::var("TEST_GRAM_DATABASE_URL")
            .map_err(|_| "TEST_GRAM_DATABASE_URL not set")?;

        let pool = PgPool::connect(&database_url)
            .await
            .map_err(|e| format!("Failed to connect to database: {}", e))?;

        gram_server::migrations::run(&pool)
            .await
            .map_err(|e| format!("Failed to run migrations: {}", e))?;

        let temp_dir =
            tempfile::TempDir::new().map_err(|e| format!("Failed to create temp dir: {}", e))?;
        let blobs: Arc<dyn BlobStore> = Arc::new(
            FsBlobStore::new(temp_dir.path())
                .await
                .map_err(|e| format!("Failed to create blob store: {}", e))?,
        );

        let platform = Arc::new(MockPlatform::new());
        let orchestrator = RunnerOrchestrator::new(
            pool.clone(),
            platform.clone(),
            blobs.clone(),
            OrchestratorConfig::default(),
        );
        let workflow = DeploymentWorkflow::new(
            pool.clone(),
            blobs.clone(),
            Encryption::new([7u8; 32]),
            orchestrator.clone(),
            WorkflowSettings::default(),
        );

        Ok(Self {
            assets: AssetRegistry::new(
                pool.clone(),
                blobs.clone(),
                AssetTokens::new("integration-secret"),
                SERVER_URL,
            ),
            deployments: DeploymentStore::new(pool.clone()),
            pool,
            blobs,
            platform,
            orchestrator,
            workflow,
            organizations: Vec::new(),
            _temp_dir: temp_dir,
        })
    }

    /// Create an organization with one project. Returns `(organization_id, project_id)`.
    pub async fn create_project(&mut self, tier: &str) -> (String, Uuid) {
        let organization_id = format!("org-{}", Uuid::new_v4().simple());
        let project_id = Uuid::new_v4();

        sqlx::query("INSERT INTO organizations (id, name, tier) VALUES ($1, 'Test Org', $2)")
            .bind(&organization_id)
            .bind(tier)
            .execute(&self.pool)
            .await
            .expect("Failed to create organization");
        sqlx::query(
            "INSERT INTO projects (id, organization_id, slug, name) VALUES ($1, $2, 'default', 'Default')",
        )
        .bind(project_id)
        .bind(&organization_id)
        .execute(&self.pool)
        .await
        .expect("Failed to create project");

        self.organizations.push(organization_id.clone());
        (organization_id, project_id)
    }

    /// Upload `body` as an asset of `kind`.
    pub async fn upload(
        &self,
        project_id: Uuid,
        kind: AssetKind,
        content_type: &str,
        body: &[u8],
    ) -> gram_server::error::Result<Asset> {
        self.assets
            .upload(project_id, kind, content_type, body.len() as u64, body)
            .await
    }

    /// Upload the petstore document.
    pub async fn upload_petstore(&self, project_id: Uuid) -> Asset {
        self.upload(project_id, AssetKind::OpenApiV3, "application/yaml", PETSTORE.as_bytes())
            .await
            .expect("Failed to upload petstore")
    }

    /// Upload a Node.js functions bundle.
    pub async fn upload_node_bundle(&self, project_id: Uuid) -> Asset {
        self.upload(project_id, AssetKind::Functions, "application/zip", &node_bundle())
            .await
            .expect("Failed to upload functions bundle")
    }

    /// Create a deployment with the given attachments.
    pub async fn create_deployment(
        &self,
        organization_id: &str,
        project_id: Uuid,
        openapi: &[(&Asset, &str)],
        functions: &[(&Asset, &str, &str)],
    ) -> Deployment {
        let req = NewDeployment {
            idempotency_key: Uuid::new_v4().to_string(),
            openapiv3_assets: openapi
                .iter()
                .map(|(asset, slug)| NewOpenApiV3Attachment {
                    asset_id: asset.id,
                    name: slug.to_string(),
                    slug: slug.to_string(),
                })
                .collect(),
            functions: functions
                .iter()
                .map(|(asset, slug, runtime)| NewFunctionsAttachment {
                    asset_id: asset.id,
                    name: slug.to_string(),
                    slug: slug.to_string(),
                    runtime: runtime.to_string(),
                })
                .collect(),
            ..Default::default()
        };

        let (deployment, created) = self
            .deployments
            .create(organization_id, project_id, "user-1", &req)
            .await
            .expect("Failed to create deployment");
        assert!(created);
        deployment
    }

    /// Run the workflow the way the worker does, failing the deployment on error.
    pub async fn run_workflow(&self, project_id: Uuid, deployment_id: Uuid) -> DeploymentStatus {
        match self.workflow.run(project_id, deployment_id).await {
            Ok(status) => status,
            Err(e) => self
                .workflow
                .fail(project_id, deployment_id, &e)
                .await
                .expect("Failed to fail deployment"),
        }
    }

    /// Event names logged for a deployment, in order.
    pub async fn event_names(&self, deployment_id: Uuid) -> Vec<String> {
        sqlx::query_scalar(
            "SELECT event FROM deployment_logs WHERE deployment_id = $1 ORDER BY created_at, seq",
        )
        .bind(deployment_id)
        .fetch_all(&self.pool)
        .await
        .expect("Failed to read events")
    }

    /// Event messages logged for a deployment, in order.
    pub async fn event_messages(&self, deployment_id: Uuid) -> Vec<String> {
        sqlx::query_scalar(
            "SELECT message FROM deployment_logs WHERE deployment_id = $1 ORDER BY created_at, seq",
        )
        .bind(deployment_id)
        .fetch_all(&self.pool)
        .await
        .expect("Failed to read events")
    }

    /// Count rows of `table` belonging to a deployment.
    pub async fn count(&self, table: &str, deployment_id: Uuid) -> i64 {
        sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {} WHERE deployment_id = $1",
            table
        ))
        .bind(deployment_id)
        .fetch_one(&self.pool)
        .await
        .expect("Failed to count rows")
    }

    /// Clean up all data created through this context.
    pub async fn cleanup(&self) {
        for organization_id in &self.organizations {
            sqlx::query(
                "DELETE FROM function_runners WHERE project_id IN (SELECT id FROM projects WHERE organization_id = $1)",
            )
            .bind(organization_id)
            .execute(&self.pool)
            .await
            .ok();
            sqlx::query("DELETE FROM organizations WHERE id = $1")
                .bind(organization_id)
                .execute(&self.pool)
                .await
                .ok();
        }
    }
}

/// Helper macro to skip tests if database URL is not set.
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_GRAM_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_GRAM_DATABASE_URL not set");
            return;
        }
    };
}
