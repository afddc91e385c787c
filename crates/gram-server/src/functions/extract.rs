// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Turning a functions bundle into tool and resource rows.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use sqlx::{PgConnection, PgPool};
use tracing::error;
use url::Url;
use uuid::Uuid;

use super::archive::{self, ArchiveError};
use super::manifest::{self, Manifest, ResourceV0, ToolV0};
use super::Runtime;
use crate::blob_store::BlobStore;
use crate::deployments::events::{self, EventBuffer};
use crate::deployments::{AttachmentType, FunctionsAttachment};
use crate::error::{Error, Result};
use crate::metrics;
use crate::urn::{ResourceKind, ResourceUrn, ToolKind, ToolUrn};

/// Summary of one processed bundle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionsOutcome {
    /// Manifest version
    pub manifest_version: String,
    /// Tools written
    pub tools: usize,
    /// Resources written
    pub resources: usize,
    /// Entries skipped as invalid
    pub skipped: usize,
}

/// Extracts function tools and resources from functions attachments.
#[derive(Clone)]
pub struct FunctionsExtractor {
    pool: PgPool,
    store: Arc<dyn BlobStore>,
}

impl FunctionsExtractor {
    /// Create a new extractor.
    pub fn new(pool: PgPool, store: Arc<dyn BlobStore>) -> Self {
        Self { pool, store }
    }

    /// Extract the manifest of one attachment in a single transaction.
    ///
    /// Invalid manifest entries are skipped; a bundle without an entry point
    /// or manifest fails with `BadRequest`.
    pub async fn extract(
        &self,
        project_id: Uuid,
        deployment_id: Uuid,
        attachment: &FunctionsAttachment,
    ) -> Result<FunctionsOutcome> {
        let started = Instant::now();
        let mut buffer = EventBuffer::for_attachment(
            deployment_id,
            project_id,
            attachment.id,
            AttachmentType::Functions,
        );

        let result = self
            .run(project_id, deployment_id, attachment, &mut buffer)
            .await;

        if let Err(e) = buffer.flush(&self.pool).await {
            error!(
                deployment_id = %deployment_id,
                attachment_id = %attachment.id,
                error = %e,
                "Failed to flush functions events"
            );
        }

        match &result {
            Ok(outcome) => metrics::functions_processed("success", started.elapsed(), outcome.tools),
            Err(_) => metrics::functions_processed("failure", started.elapsed(), 0),
        }

        result
    }

    async fn run(
        &self,
        project_id: Uuid,
        deployment_id: Uuid,
        attachment: &FunctionsAttachment,
        buffer: &mut EventBuffer,
    ) -> Result<FunctionsOutcome> {
        let slug = attachment.slug.as_str();
        let raw = self.read_manifest(project_id, attachment).await;
        let raw = match raw {
            Ok(raw) => raw,
            Err(Error::BadRequest(msg)) => {
                buffer.error(events::FUNCTIONS_ERROR, format!("{}: {}", slug, msg));
                return Err(Error::BadRequest(msg));
            }
            Err(e) => return Err(e),
        };

        let manifest = Manifest::parse(&raw).map_err(|e| {
            let msg = format!("{}: error parsing manifest.json: {}", slug, e);
            buffer.error(events::FUNCTIONS_ERROR, msg.clone());
            Error::BadRequest(msg)
        })?;
        let manifest_version = manifest.version().to_string();
        let Manifest::V0(v0) = manifest;

        let mut skipped = 0;
        let mut seen_urns = HashSet::new();
        let mut tools = Vec::new();
        for (idx, tool) in v0.tools.iter().enumerate() {
            let checked = tool
                .validate()
                .map_err(|e| e.to_string())
                .and_then(|_| {
                    ToolUrn::new(ToolKind::Function, slug, tool.name.as_str())
                        .map_err(|e| e.to_string())
                });
            match checked {
                Ok(urn) if !seen_urns.insert(urn.to_string()) => {
                    skipped += 1;
                    metrics::functions_tool_skipped("duplicate");
                    buffer.warn(
                        events::FUNCTIONS_TOOL_SKIPPED,
                        format!(
                            "{}: skipping tool {} ({}): tool urn {} already used by an earlier tool",
                            slug, idx, tool.name, urn
                        ),
                    );
                }
                Ok(urn) => tools.push((urn, tool)),
                Err(e) => {
                    skipped += 1;
                    metrics::functions_tool_skipped("invalid-manifest");
                    buffer.warn(
                        events::FUNCTIONS_TOOL_SKIPPED,
                        format!("{}: skipping tool {} ({}): {}", slug, idx, tool.name, e),
                    );
                }
            }
        }

        let mut resources = Vec::new();
        for (idx, resource) in v0.resources.iter().enumerate() {
            let checked = resource
                .validate()
                .map_err(|e| e.to_string())
                .and_then(|_| {
                    ResourceUrn::new(ResourceKind::Function, slug, &resource.uri)
                        .map_err(|e| e.to_string())
                });
            match checked {
                Ok(urn) if !seen_urns.insert(urn.to_string()) => {
                    skipped += 1;
                    metrics::functions_tool_skipped("duplicate");
                    buffer.warn(
                        events::FUNCTIONS_TOOL_SKIPPED,
                        format!(
                            "{}: skipping resource {} ({}): resource urn {} already used by an earlier resource",
                            slug, idx, resource.name, urn
                        ),
                    );
                }
                Ok(urn) => resources.push((urn, resource)),
                Err(e) => {
                    skipped += 1;
                    metrics::functions_tool_skipped("invalid-manifest");
                    buffer.warn(
                        events::FUNCTIONS_TOOL_SKIPPED,
                        format!(
                            "{}: skipping resource {} ({}): {}",
                            slug, idx, resource.name, e
                        ),
                    );
                }
            }
        }

        let mut tx = self.pool.begin().await?;
        clear_previous(&mut tx, deployment_id, attachment.id).await?;
        for (urn, tool) in &tools {
            insert_tool(&mut tx, project_id, deployment_id, attachment, urn, tool).await?;
        }
        for (urn, resource) in &resources {
            insert_resource(&mut tx, project_id, deployment_id, attachment, urn, resource).await?;
        }
        tx.commit().await?;

        buffer.info(
            events::FUNCTIONS_PROCESSED,
            format!(
                "{}: processed {} tools and {} resources ({} skipped)",
                slug,
                tools.len(),
                resources.len(),
                skipped
            ),
        );

        Ok(FunctionsOutcome {
            manifest_version,
            tools: tools.len(),
            resources: resources.len(),
            skipped,
        })
    }

    async fn read_manifest(&self, project_id: Uuid, attachment: &FunctionsAttachment) -> Result<Vec<u8>> {
        let raw: Option<String> =
            sqlx::query_scalar("SELECT url FROM assets WHERE id = $1 AND project_id = $2")
                .bind(attachment.asset_id)
                .bind(project_id)
                .fetch_optional(&self.pool)
                .await?;
        let raw = raw.ok_or_else(|| {
            Error::InvariantViolation(format!("functions asset {} is missing", attachment.asset_id))
        })?;
        let url = Url::parse(&raw)
            .map_err(|e| Error::Unexpected(format!("malformed asset url {}: {}", raw, e)))?;

        let (reader, _size) = self.store.read_at(&url).await?;
        let runtime = attachment.runtime;
        tokio::task::spawn_blocking(move || inspect_bundle(reader, runtime))
            .await
            .map_err(|e| Error::Unexpected(format!("bundle inspection task failed: {}", e)))?
    }
}

/// Check the entry point for `runtime` and read the manifest.
fn inspect_bundle<R: std::io::Read + std::io::Seek>(reader: R, runtime: Runtime) -> Result<Vec<u8>> {
    let mut archive = archive::open(reader)
        .map_err(|e| Error::BadRequest(format!("error opening functions zip file: {}", e)))?;
    archive::find_entrypoint(&archive, runtime.entrypoints()).map_err(bundle_error)?;
    archive::read_manifest(&mut archive).map_err(bundle_error)
}

fn bundle_error(e: ArchiveError) -> Error {
    match e {
        ArchiveError::Read(..) => Error::Unexpected(e.to_string()),
        other => Error::BadRequest(other.to_string()),
    }
}

async fn clear_previous(conn: &mut PgConnection, deployment_id: Uuid, function_id: Uuid) -> Result<()> {
    sqlx::query("DELETE FROM function_tool_definitions WHERE deployment_id = $1 AND function_id = $2")
        .bind(deployment_id)
        .bind(function_id)
        .execute(&mut *conn)
        .await?;
    sqlx::query(
        "DELETE FROM function_resource_definitions WHERE deployment_id = $1 AND function_id = $2",
    )
    .bind(deployment_id)
    .bind(function_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_tool(
    conn: &mut PgConnection,
    project_id: Uuid,
    deployment_id: Uuid,
    attachment: &FunctionsAttachment,
    urn: &ToolUrn,
    tool: &ToolV0,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO function_tool_definitions (
            id, project_id, deployment_id, function_id, tool_urn, name, description,
            runtime, input_schema, variables, auth_input, meta,
            read_only_hint, destructive_hint, idempotent_hint, open_world_hint
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, false, true, false, true)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(project_id)
    .bind(deployment_id)
    .bind(attachment.id)
    .bind(urn.to_string())
    .bind(&tool.name)
    .bind(&tool.description)
    .bind(attachment.runtime.as_str())
    .bind(tool.input_schema())
    .bind(manifest::variables_json(&tool.variables))
    .bind(&tool.auth_input)
    .bind(&tool.meta)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_resource(
    conn: &mut PgConnection,
    project_id: Uuid,
    deployment_id: Uuid,
    attachment: &FunctionsAttachment,
    urn: &ResourceUrn,
    resource: &ResourceV0,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO function_resource_definitions (
            id, project_id, deployment_id, function_id, resource_urn, name, description,
            uri, title, mime_type, runtime, variables, meta
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(project_id)
    .bind(deployment_id)
    .bind(attachment.id)
    .bind(urn.to_string())
    .bind(&resource.name)
    .bind(&resource.description)
    .bind(&resource.uri)
    .bind(&resource.title)
    .bind(&resource.mime_type)
    .bind(attachment.runtime.as_str())
    .bind(manifest::variables_json(&resource.variables))
    .bind(&resource.meta)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::archive::tests::zip_bytes;
    use std::io::Cursor;

    #[test]
    fn test_inspect_bundle_reads_manifest() {
        let bytes = zip_bytes(&[
            ("functions.ts", "export {}"),
            ("manifest.json", r#"{"version":"0.0.0","tools":[]}"#),
        ]);
        let raw = inspect_bundle(Cursor::new(bytes), Runtime::NodeJs22).unwrap();
        assert!(Manifest::parse(&raw).is_ok());
    }

    #[test]
    fn test_inspect_bundle_checks_runtime_family() {
        let bytes = zip_bytes(&[("functions.py", ""), ("manifest.json", "{}")]);
        let err = inspect_bundle(Cursor::new(bytes), Runtime::NodeJs22).unwrap_err();
        assert!(matches!(err, Error::BadRequest(ref m) if m.starts_with("no entry point found")));
    }

    #[test]
    fn test_inspect_bundle_requires_manifest() {
        let bytes = zip_bytes(&[("functions.py", "")]);
        let err = inspect_bundle(Cursor::new(bytes), Runtime::Python312).unwrap_err();
        assert!(matches!(err, Error::BadRequest(ref m) if m.contains("manifest.json not found")));
    }

    #[test]
    fn test_inspect_bundle_rejects_non_zip() {
        let err = inspect_bundle(Cursor::new(b"nope".to_vec()), Runtime::Python312).unwrap_err();
        assert!(matches!(err, Error::BadRequest(ref m) if m.starts_with("error opening functions zip file")));
    }
}
