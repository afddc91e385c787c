// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Organizations, projects and account tiers.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Account tier of an organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Free tier
    Free,
    /// Paid tier
    Pro,
    /// Contract tier
    Enterprise,
}

impl Tier {
    /// Database form.
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Pro => "pro",
            Tier::Enterprise => "enterprise",
        }
    }

    /// Functions bundles allowed in a single deployment.
    pub fn max_functions(self) -> usize {
        match self {
            Tier::Free => 5,
            Tier::Pro => 10,
            Tier::Enterprise => 25,
        }
    }

    /// Check a deployment's functions count against the tier.
    pub fn check_functions(self, count: usize) -> Result<()> {
        if count > self.max_functions() {
            return Err(Error::Forbidden(format!(
                "{} tier allows at most {} functions per deployment, got {}",
                self.as_str(),
                self.max_functions(),
                count
            )));
        }
        Ok(())
    }
}

impl std::str::FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "free" => Ok(Tier::Free),
            "pro" => Ok(Tier::Pro),
            "enterprise" => Ok(Tier::Enterprise),
            _ => Err(format!("Unknown tier: {}", s)),
        }
    }
}

/// Check that `project_id` belongs to `organization_id`.
pub async fn ensure_project(pool: &PgPool, organization_id: &str, project_id: Uuid) -> Result<()> {
    let found: Option<Uuid> =
        sqlx::query_scalar("SELECT id FROM projects WHERE id = $1 AND organization_id = $2")
            .bind(project_id)
            .bind(organization_id)
            .fetch_optional(pool)
            .await?;

    match found {
        Some(_) => Ok(()),
        None => Err(Error::Forbidden(
            "project does not belong to the active organization".to_string(),
        )),
    }
}

/// Tier of the organization that owns `project_id`.
pub async fn project_tier(pool: &PgPool, project_id: Uuid) -> Result<Tier> {
    let tier: Option<String> = sqlx::query_scalar(
        r#"
        SELECT o.tier
        FROM projects p
        JOIN organizations o ON o.id = p.organization_id
        WHERE p.id = $1
        "#,
    )
    .bind(project_id)
    .fetch_optional(pool)
    .await?;

    tier.ok_or_else(|| Error::NotFound("project not found".to_string()))?
        .parse()
        .map_err(Error::InvariantViolation)
}
