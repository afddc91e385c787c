// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deployment event names and the buffered event writer used by extractors.

use sqlx::PgPool;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::AttachmentType;
use crate::error::Result;

/// Deployment moved to `pending`.
pub const STATUS_CHANGE: &str = "deployment:status_change";
/// Deployment moved to `running`.
pub const STARTED: &str = "deployment:started";
/// Deployment moved to `completed`.
pub const COMPLETED: &str = "deployment:completed";
/// Deployment moved to `failed`.
pub const FAILED: &str = "deployment:failed";
/// Non-fatal problem with a deployment input.
pub const WARNING: &str = "deployment:warning";
/// Informational log line.
pub const LOG_INFO: &str = "log:info";
/// Warning log line.
pub const LOG_WARN: &str = "log:warn";
/// Error log line.
pub const LOG_ERROR: &str = "log:error";
/// An OpenAPI document was processed.
pub const OPENAPI_PROCESSED: &str = "openapiv3_processed";
/// An OpenAPI document could not be processed.
pub const OPENAPI_ERROR: &str = "openapi:error";
/// An OpenAPI operation was not turned into a tool.
pub const OPENAPI_OPERATION_SKIPPED: &str = "openapi:operation_skipped";
/// A non-fatal issue while upgrading a 3.0 document.
pub const OPENAPI_UPGRADE_ERROR: &str = "openapi-upgrade:error";
/// A functions bundle or manifest entry was rejected.
pub const FUNCTIONS_ERROR: &str = "functions:error";
/// A manifest tool or resource was skipped.
pub const FUNCTIONS_TOOL_SKIPPED: &str = "functions:tool_skipped";
/// A functions bundle was processed.
pub const FUNCTIONS_PROCESSED: &str = "functions_processed";

#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingEvent {
    event: &'static str,
    message: String,
}

/// Collects events for one attachment and writes them in one batch.
///
/// Extractors buffer events while they work inside their own transaction and
/// flush on the pool afterwards, so events survive a rollback.
#[derive(Debug)]
pub struct EventBuffer {
    deployment_id: Uuid,
    project_id: Uuid,
    attachment: Option<(Uuid, AttachmentType)>,
    events: Vec<PendingEvent>,
}

impl EventBuffer {
    /// Buffer for deployment-level events.
    pub fn new(deployment_id: Uuid, project_id: Uuid) -> Self {
        Self {
            deployment_id,
            project_id,
            attachment: None,
            events: Vec::new(),
        }
    }

    /// Buffer whose events reference an attachment.
    pub fn for_attachment(
        deployment_id: Uuid,
        project_id: Uuid,
        attachment_id: Uuid,
        attachment_type: AttachmentType,
    ) -> Self {
        Self {
            attachment: Some((attachment_id, attachment_type)),
            ..Self::new(deployment_id, project_id)
        }
    }

    /// Record an informational event.
    pub fn info(&mut self, event: &'static str, message: impl Into<String>) {
        let message = message.into();
        info!(deployment_id = %self.deployment_id, event, "{}", message);
        self.events.push(PendingEvent { event, message });
    }

    /// Record a warning event.
    pub fn warn(&mut self, event: &'static str, message: impl Into<String>) {
        let message = message.into();
        warn!(deployment_id = %self.deployment_id, event, "{}", message);
        self.events.push(PendingEvent { event, message });
    }

    /// Record an error event.
    pub fn error(&mut self, event: &'static str, message: impl Into<String>) {
        let message = message.into();
        error!(deployment_id = %self.deployment_id, event, "{}", message);
        self.events.push(PendingEvent { event, message });
    }

    /// Number of buffered events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Whether an event with this name is buffered.
    pub fn contains(&self, event: &str) -> bool {
        self.events.iter().any(|e| e.event == event)
    }

    /// Write all buffered events and clear the buffer.
    pub async fn flush(&mut self, pool: &PgPool) -> Result<usize> {
        if self.events.is_empty() {
            return Ok(0);
        }

        let (attachment_id, attachment_type) = match self.attachment {
            Some((id, kind)) => (Some(id), Some(kind.as_str())),
            None => (None, None),
        };

        let mut tx = pool.begin().await?;
        for event in &self.events {
            sqlx::query(
                r#"
                INSERT INTO deployment_logs (
                    id, deployment_id, project_id, event, message, attachment_id, attachment_type
                ) VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(self.deployment_id)
            .bind(self.project_id)
            .bind(event.event)
            .bind(&event.message)
            .bind(attachment_id)
            .bind(attachment_type)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        let written = self.events.len();
        self.events.clear();
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_collects_events() {
        let mut buffer = EventBuffer::for_attachment(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            AttachmentType::OpenApiV3,
        );
        assert!(buffer.is_empty());

        buffer.warn(OPENAPI_OPERATION_SKIPPED, "skipped");
        buffer.error(OPENAPI_ERROR, "bad doc");
        assert_eq!(buffer.len(), 2);
        assert!(buffer.contains(OPENAPI_ERROR));
        assert!(!buffer.contains(LOG_INFO));
    }

    #[tokio::test]
    async fn test_flush_empty_buffer_skips_database() {
        let pool = PgPool::connect_lazy("postgres://localhost/dummy").unwrap();
        let mut buffer = EventBuffer::new(Uuid::new_v4(), Uuid::new_v4());
        assert_eq!(buffer.flush(&pool).await.unwrap(), 0);
    }
}
