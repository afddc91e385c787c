// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persisting the tools of one OpenAPI attachment.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use sqlx::{PgConnection, PgPool};
use tokio::io::AsyncReadExt;
use tracing::error;
use url::Url;
use uuid::Uuid;

use super::naming::{derive_operation_id, env_var};
use super::operation::{self, DocumentContext, HttpTool, OperationInput, Skip, SkipReason};
use super::security::{self, SecurityScheme};
use super::upgrade::upgrade;
use super::Document;
use crate::assets::MAX_FILE_SIZE_OPENAPI;
use crate::blob_store::BlobStore;
use crate::deployments::events::{self, EventBuffer};
use crate::deployments::{AttachmentType, OpenApiV3Attachment};
use crate::error::{Error, Result};
use crate::metrics;

/// Most upgrade issues written to the event log.
const MAX_UPGRADE_ISSUES: usize = 30;

/// Summary of one processed document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenApiOutcome {
    /// Declared document version
    pub version: String,
    /// Tools written
    pub tools: usize,
    /// Operations skipped
    pub skipped: usize,
}

/// Extracts HTTP tools from OpenAPI attachments.
#[derive(Clone)]
pub struct OpenApiExtractor {
    pool: PgPool,
    store: Arc<dyn BlobStore>,
}

impl OpenApiExtractor {
    /// Create a new extractor.
    pub fn new(pool: PgPool, store: Arc<dyn BlobStore>) -> Self {
        Self { pool, store }
    }

    /// Extract the tools of one attachment in a single transaction.
    ///
    /// Rows a previous attempt wrote for the same attachment are replaced.
    /// Events are written whether or not extraction succeeds.
    pub async fn extract(
        &self,
        project_id: Uuid,
        deployment_id: Uuid,
        attachment: &OpenApiV3Attachment,
    ) -> Result<OpenApiOutcome> {
        let started = Instant::now();
        let mut buffer = EventBuffer::for_attachment(
            deployment_id,
            project_id,
            attachment.id,
            AttachmentType::OpenApiV3,
        );

        let mut version = String::new();
        let result = self
            .run(project_id, deployment_id, attachment, &mut buffer, &mut version)
            .await;

        if let Err(e) = buffer.flush(&self.pool).await {
            error!(
                deployment_id = %deployment_id,
                attachment_id = %attachment.id,
                error = %e,
                "Failed to flush openapi events"
            );
        }

        let outcome = if result.is_ok() { "success" } else { "failure" };
        metrics::openapi_processed(outcome, &version, started.elapsed());

        result
    }

    async fn run(
        &self,
        project_id: Uuid,
        deployment_id: Uuid,
        attachment: &OpenApiV3Attachment,
        buffer: &mut EventBuffer,
        version: &mut String,
    ) -> Result<OpenApiOutcome> {
        let name = attachment.name.as_str();
        let bytes = self.read_document(project_id, attachment.asset_id).await?;

        let mut doc = match Document::parse(&bytes) {
            Ok(doc) => doc,
            Err(problems) => {
                for problem in &problems {
                    buffer.error(events::OPENAPI_ERROR, format!("{}: {}", name, problem));
                }
                return Err(Error::BadRequest(format!(
                    "openapi v3 document '{}' had {} errors",
                    name,
                    problems.len()
                )));
            }
        };
        *version = doc.version().to_string();

        let upgrade_started = Instant::now();
        let report = upgrade(&mut doc);
        if report.upgraded {
            metrics::openapi_upgraded("success", &report.from_version, upgrade_started.elapsed());
        }
        if !report.issues.is_empty() {
            buffer.error(
                events::OPENAPI_UPGRADE_ERROR,
                format!(
                    "Found {} issues upgrading OpenAPI v3.0 document to v3.1",
                    report.issues.len()
                ),
            );
            for issue in report.issues.iter().take(MAX_UPGRADE_ISSUES) {
                buffer.error(events::OPENAPI_UPGRADE_ERROR, issue.clone());
            }
        }

        let (schemes, scheme_errors) = security::extract(&doc, &attachment.slug);
        for e in scheme_errors {
            buffer.warn(
                events::LOG_WARN,
                format!("{}: error parsing security schemes: {}", name, e),
            );
        }

        let (default_server_url, server_notes) = operation::default_server(doc.root().get("servers"));
        for note in server_notes {
            buffer.warn(events::LOG_WARN, format!("{}: {}", name, note));
        }

        let ctx = DocumentContext {
            doc: &doc,
            slug: &attachment.slug,
            global_security: security::requirements(doc.root().get("security")),
            server_env_var: env_var(&format!("{}_SERVER_URL", attachment.slug)),
            default_server_url,
        };

        let mut tools = Vec::new();
        let mut skipped = 0;
        let mut seen_ids = HashSet::new();
        let mut seen_urns = HashSet::new();

        for (path, item) in doc.paths() {
            let shared = item
                .get("parameters")
                .and_then(serde_json::Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();

            for &method in operation::METHODS {
                let Some(op) = item.get(method) else {
                    continue;
                };
                let operation_id = op
                    .get("operationId")
                    .and_then(serde_json::Value::as_str)
                    .filter(|id| !id.is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(|| derive_operation_id(method, path));

                let built = if seen_ids.contains(&operation_id) {
                    Err(Skip::new(
                        SkipReason::DuplicateOperationId,
                        "operation id already used by an earlier operation",
                    ))
                } else {
                    seen_ids.insert(operation_id.clone());
                    operation::build(
                        &ctx,
                        OperationInput {
                            method,
                            path,
                            operation_id: operation_id.clone(),
                            operation: op,
                            shared_parameters: shared,
                        },
                    )
                    .and_then(|tool| {
                        if seen_urns.insert(tool.urn.to_string()) {
                            Ok(tool)
                        } else {
                            Err(Skip::new(
                                SkipReason::DuplicateOperationId,
                                format!("tool urn {} already used by an earlier operation", tool.urn),
                            ))
                        }
                    })
                };

                match built {
                    Ok(tool) => {
                        for warning in &tool.warnings {
                            buffer.warn(
                                events::WARNING,
                                format!("{}: {}: {}", name, operation_id, warning),
                            );
                        }
                        tools.push(tool);
                    }
                    Err(skip) => {
                        skipped += 1;
                        metrics::openapi_operation_skipped(skip.reason.as_str());
                        buffer.warn(
                            events::OPENAPI_OPERATION_SKIPPED,
                            format!(
                                "{}: {}: skipped operation due to error ({}): {}",
                                name,
                                operation_id,
                                skip.reason.as_str(),
                                skip.message
                            ),
                        );
                    }
                }
            }
        }

        let mut tx = self.pool.begin().await?;
        clear_previous(&mut tx, deployment_id, attachment.id).await?;
        for scheme in &schemes {
            insert_security(&mut tx, project_id, deployment_id, attachment.id, scheme).await?;
        }
        for tool in &tools {
            insert_tool(&mut tx, project_id, deployment_id, attachment.id, tool).await?;
        }
        tx.commit().await?;

        buffer.info(
            events::OPENAPI_PROCESSED,
            format!(
                "{}: processed {} tools ({} operations skipped)",
                name,
                tools.len(),
                skipped
            ),
        );

        Ok(OpenApiOutcome {
            version: version.clone(),
            tools: tools.len(),
            skipped,
        })
    }

    async fn read_document(&self, project_id: Uuid, asset_id: Uuid) -> Result<Vec<u8>> {
        let raw: Option<String> =
            sqlx::query_scalar("SELECT url FROM assets WHERE id = $1 AND project_id = $2")
                .bind(asset_id)
                .bind(project_id)
                .fetch_optional(&self.pool)
                .await?;
        let raw = raw.ok_or_else(|| {
            Error::InvariantViolation(format!("openapi asset {} is missing", asset_id))
        })?;
        let url = Url::parse(&raw)
            .map_err(|e| Error::Unexpected(format!("malformed asset url {}: {}", raw, e)))?;

        let reader = self.store.read(&url).await?;
        let mut bytes = Vec::new();
        reader
            .take(MAX_FILE_SIZE_OPENAPI + 1)
            .read_to_end(&mut bytes)
            .await?;
        if bytes.len() as u64 > MAX_FILE_SIZE_OPENAPI {
            return Err(Error::BadRequest(format!(
                "openapi document exceeds {} bytes",
                MAX_FILE_SIZE_OPENAPI
            )));
        }
        Ok(bytes)
    }
}

async fn clear_previous(conn: &mut PgConnection, deployment_id: Uuid, document_id: Uuid) -> Result<()> {
    sqlx::query(
        "DELETE FROM http_tool_definitions WHERE deployment_id = $1 AND openapiv3_document_id = $2",
    )
    .bind(deployment_id)
    .bind(document_id)
    .execute(&mut *conn)
    .await?;

    sqlx::query("DELETE FROM http_security WHERE deployment_id = $1 AND openapiv3_document_id = $2")
        .bind(deployment_id)
        .bind(document_id)
        .execute(&mut *conn)
        .await?;

    Ok(())
}

async fn insert_security(
    conn: &mut PgConnection,
    project_id: Uuid,
    deployment_id: Uuid,
    document_id: Uuid,
    scheme: &SecurityScheme,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO http_security (
            id, project_id, deployment_id, openapiv3_document_id, key, type, name,
            in_placement, scheme, env_variables, oauth_types, oauth_flows
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(project_id)
    .bind(deployment_id)
    .bind(document_id)
    .bind(&scheme.key)
    .bind(&scheme.kind)
    .bind(&scheme.name)
    .bind(&scheme.in_placement)
    .bind(&scheme.scheme)
    .bind(&scheme.env_variables)
    .bind(&scheme.oauth_types)
    .bind(&scheme.oauth_flows)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_tool(
    conn: &mut PgConnection,
    project_id: Uuid,
    deployment_id: Uuid,
    document_id: Uuid,
    tool: &HttpTool,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO http_tool_definitions (
            id, project_id, deployment_id, openapiv3_document_id, tool_urn, name,
            untruncated_name, openapiv3_operation, summary, description, tags,
            http_method, path, security, server_env_var, default_server_url,
            request_content_type, input_schema, definition, x_gram,
            original_name, original_summary, original_description
        ) VALUES (
            $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
            $17, $18, $19, $20, $21, $22, $23
        )
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(project_id)
    .bind(deployment_id)
    .bind(document_id)
    .bind(tool.urn.to_string())
    .bind(&tool.name)
    .bind(&tool.untruncated_name)
    .bind(&tool.operation)
    .bind(&tool.summary)
    .bind(&tool.description)
    .bind(&tool.tags)
    .bind(&tool.method)
    .bind(&tool.path)
    .bind(&tool.security)
    .bind(&tool.server_env_var)
    .bind(&tool.default_server_url)
    .bind(&tool.request_content_type)
    .bind(&tool.input_schema)
    .bind(&tool.definition)
    .bind(tool.x_gram)
    .bind(&tool.original_name)
    .bind(&tool.original_summary)
    .bind(&tool.original_description)
    .execute(&mut *conn)
    .await?;
    Ok(())
}
