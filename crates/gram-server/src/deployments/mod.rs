// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deployments: the unit of ingestion.
//!
//! A deployment bundles OpenAPI documents, functions bundles and package
//! references. Its status only moves forward:
//!
//! ```text
//! created ──► pending ──► running ──► completed
//!                │           │
//!                └───────────┴──────► failed
//! ```
//!
//! `created` is internal; callers first observe `pending`. Every transition
//! appends a row to the deployment event log.

pub mod events;
mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use store::{
    DeploymentStore, NewDeployment, NewFunctionsAttachment, NewOpenApiV3Attachment,
    NewPackageAttachment, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE,
};
pub(crate) use store::transition_in;

use crate::functions::Runtime;

/// Deployment status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    /// Row inserted, attachments not yet committed
    Created,
    /// Waiting for the workflow to pick it up
    Pending,
    /// Workflow is processing it
    Running,
    /// Tools are frozen and addressable
    Completed,
    /// Processing failed; the event log explains why
    Failed,
}

impl DeploymentStatus {
    /// Database and wire form.
    pub fn as_str(self) -> &'static str {
        match self {
            DeploymentStatus::Created => "created",
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Completed => "completed",
            DeploymentStatus::Failed => "failed",
        }
    }

    /// Whether no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, DeploymentStatus::Completed | DeploymentStatus::Failed)
    }

    /// Whether moving from `self` to `target` is a forward transition.
    pub fn can_transition_to(self, target: DeploymentStatus) -> bool {
        use DeploymentStatus::*;
        matches!(
            (self, target),
            (Created, Pending)
                | (Pending, Running)
                | (Pending, Failed)
                | (Running, Completed)
                | (Running, Failed)
        )
    }

    /// Event written when a deployment enters this status.
    pub fn event(self) -> &'static str {
        match self {
            DeploymentStatus::Running => events::STARTED,
            DeploymentStatus::Completed => events::COMPLETED,
            DeploymentStatus::Failed => events::FAILED,
            DeploymentStatus::Created | DeploymentStatus::Pending => events::STATUS_CHANGE,
        }
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "created" => Ok(DeploymentStatus::Created),
            "pending" => Ok(DeploymentStatus::Pending),
            "running" => Ok(DeploymentStatus::Running),
            "completed" => Ok(DeploymentStatus::Completed),
            "failed" => Ok(DeploymentStatus::Failed),
            _ => Err(format!("Unknown deployment status: {}", s)),
        }
    }
}

/// Attachment kind referenced by event rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentType {
    /// OpenAPI v3 document
    OpenApiV3,
    /// Functions bundle
    Functions,
}

impl AttachmentType {
    /// Database form.
    pub fn as_str(self) -> &'static str {
        match self {
            AttachmentType::OpenApiV3 => "openapiv3",
            AttachmentType::Functions => "functions",
        }
    }
}

/// OpenAPI document attached to a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct OpenApiV3Attachment {
    /// Attachment ID
    pub id: Uuid,
    /// Asset holding the document
    pub asset_id: Uuid,
    /// Display name
    pub name: String,
    /// Slug, unique within the deployment
    pub slug: String,
}

/// Functions bundle attached to a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionsAttachment {
    /// Attachment ID, also the function ID of its tools and runners
    pub id: Uuid,
    /// Asset holding the bundle
    pub asset_id: Uuid,
    /// Display name
    pub name: String,
    /// Slug, unique within the deployment
    pub slug: String,
    /// Runtime the bundle targets
    pub runtime: Runtime,
}

/// Package reference attached to a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PackageAttachment {
    /// Attachment ID
    pub id: Uuid,
    /// Package name in the external registry
    pub name: String,
    /// Requested version
    pub version: String,
}

/// A deployment with its attachments.
#[derive(Debug, Clone, Serialize)]
pub struct Deployment {
    /// Deployment ID
    pub id: Uuid,
    /// Owning organization
    pub organization_id: String,
    /// Owning project
    pub project_id: Uuid,
    /// Alias of `project_id`
    pub workspace_id: Uuid,
    /// User who created the deployment
    pub user_id: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Current status
    pub status: DeploymentStatus,
    /// Caller-supplied deduplication key
    pub idempotency_key: String,
    /// External reference
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    /// External link
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_url: Option<String>,
    /// Source repository
    #[serde(skip_serializing_if = "Option::is_none")]
    pub github_repo: Option<String>,
    /// Source pull request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub github_pr: Option<String>,
    /// Source commit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub github_sha: Option<String>,
    /// Attached OpenAPI documents
    pub openapiv3_assets: Vec<OpenApiV3Attachment>,
    /// Attached functions bundles
    pub functions_assets: Vec<FunctionsAttachment>,
    /// Attached package references
    pub packages: Vec<PackageAttachment>,
    /// HTTP tool definitions produced by the deployment
    pub openapi_3p1_tools: Vec<serde_json::Value>,
}

/// Row in a deployment listing.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentSummary {
    /// Deployment ID
    pub id: Uuid,
    /// User who created the deployment
    pub user_id: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Current status
    pub status: DeploymentStatus,
    /// Number of attached OpenAPI documents
    pub openapiv3_asset_count: i64,
    /// Number of attached functions bundles
    pub functions_asset_count: i64,
}

/// Row of the deployment event log.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DeploymentEvent {
    /// Event ID
    pub id: Uuid,
    /// Event name, e.g. `deployment:started`
    pub event: String,
    /// Human-readable message
    pub message: String,
    /// Attachment the event refers to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment_id: Option<Uuid>,
    /// Kind of that attachment
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment_type: Option<String>,
    /// When the event was written
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use DeploymentStatus::*;

    #[test]
    fn test_forward_transitions() {
        assert!(Created.can_transition_to(Pending));
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Failed));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
    }

    #[test]
    fn test_backward_and_terminal_transitions_rejected() {
        assert!(!Running.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Completed));
        assert!(!Created.can_transition_to(Running));
        assert!(!Pending.can_transition_to(Completed));
        for s in [Created, Pending, Running, Completed, Failed] {
            assert!(!s.can_transition_to(s));
        }
    }

    #[test]
    fn test_status_events() {
        assert_eq!(Running.event(), "deployment:started");
        assert_eq!(Completed.event(), "deployment:completed");
        assert_eq!(Failed.event(), "deployment:failed");
        assert_eq!(Pending.event(), "deployment:status_change");
    }

    #[test]
    fn test_status_roundtrip() {
        for s in [Created, Pending, Running, Completed, Failed] {
            assert_eq!(s.as_str().parse::<DeploymentStatus>(), Ok(s));
        }
        assert!(Completed.is_terminal());
        assert!(!Running.is_terminal());
    }
}
