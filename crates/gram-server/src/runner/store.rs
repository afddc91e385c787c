// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runner registry
//!
//! PostgreSQL bookkeeping of deployed runner apps. A row is inserted as
//! `initializing` right after the provider app exists and finalized as
//! `ready` or `failed`; `reaped_at` marks apps deleted from the provider.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::Result;

/// Lifecycle state of a runner row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerStatus {
    /// App created, machines not yet confirmed
    Initializing,
    /// App serving
    Ready,
    /// Deployment failed after the app was created
    Failed,
}

impl RunnerStatus {
    /// Database form.
    pub fn as_str(self) -> &'static str {
        match self {
            RunnerStatus::Initializing => "initializing",
            RunnerStatus::Ready => "ready",
            RunnerStatus::Failed => "failed",
        }
    }
}

/// Row written before a runner app is configured.
#[derive(Debug, Clone)]
pub struct NewRunner<'a> {
    /// Project
    pub project_id: Uuid,
    /// Deployment
    pub deployment_id: Uuid,
    /// Function (attachment)
    pub function_id: Uuid,
    /// Function slug, the retention key together with the project
    pub function_slug: &'a str,
    /// Provider app name
    pub app_name: &'a str,
    /// Provider organization
    pub org_slug: &'a str,
    /// Public URL
    pub public_url: &'a str,
    /// Runner image version
    pub runner_version: &'a str,
    /// Primary region
    pub primary_region: &'a str,
    /// Provider name
    pub provider: &'a str,
}

/// A runner row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct RunnerRecord {
    /// Row ID
    pub id: Uuid,
    /// Project
    pub project_id: Uuid,
    /// Deployment
    pub deployment_id: Uuid,
    /// Function (attachment)
    pub function_id: Uuid,
    /// Function slug
    pub function_slug: String,
    /// Provider app name
    pub app_name: String,
    /// Provider organization
    pub org_slug: String,
    /// `initializing`, `ready` or `failed`
    pub status: String,
    /// When the row was created
    pub created_at: DateTime<Utc>,
}

/// Runner registry client for PostgreSQL operations
#[derive(Clone)]
pub struct RunnerStore {
    pool: PgPool,
}

impl RunnerStore {
    /// Create a new registry client
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert an `initializing` row and return its ID.
    pub async fn insert_initializing(&self, runner: &NewRunner<'_>) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO function_runners (
                id, project_id, deployment_id, function_id, function_slug, app_name,
                org_slug, public_url, runner_version, primary_region, provider, status
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, 'initializing')
            "#,
        )
        .bind(id)
        .bind(runner.project_id)
        .bind(runner.deployment_id)
        .bind(runner.function_id)
        .bind(runner.function_slug)
        .bind(runner.app_name)
        .bind(runner.org_slug)
        .bind(runner.public_url)
        .bind(runner.runner_version)
        .bind(runner.primary_region)
        .bind(runner.provider)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    /// Move a row to its final status.
    pub async fn finalize(
        &self,
        id: Uuid,
        status: RunnerStatus,
        runner_urn: Option<&str>,
        reaped_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE function_runners
            SET status = $2,
                runner_urn = COALESCE($3, runner_urn),
                reaped_at = COALESCE($4, reaped_at),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(runner_urn)
        .bind(reaped_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record that the app behind a row was deleted, with the provider error
    /// if deletion reported one.
    pub async fn mark_reaped(&self, id: Uuid, reap_error: Option<&str>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE function_runners
            SET reaped_at = NOW(), reap_error = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(reap_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Live rows recorded for one function of one deployment.
    pub async fn live_for_function(
        &self,
        project_id: Uuid,
        deployment_id: Uuid,
        function_id: Uuid,
    ) -> Result<Vec<RunnerRecord>> {
        let rows = sqlx::query_as::<_, RunnerRecord>(
            r#"
            SELECT id, project_id, deployment_id, function_id, function_slug,
                   app_name, org_slug, status, created_at
            FROM function_runners
            WHERE project_id = $1 AND deployment_id = $2 AND function_id = $3
              AND reaped_at IS NULL
            ORDER BY created_at
            "#,
        )
        .bind(project_id)
        .bind(deployment_id)
        .bind(function_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Live rows beyond the newest `keep` per `(project, function slug)`,
    /// oldest first.
    ///
    /// Rows still `initializing` are never returned so an in-flight deploy
    /// is not torn down under its feet.
    pub async fn reap_candidates(
        &self,
        project_id: Option<Uuid>,
        keep: i64,
        limit: i64,
    ) -> Result<Vec<RunnerRecord>> {
        let rows = sqlx::query_as::<_, RunnerRecord>(
            r#"
            SELECT id, project_id, deployment_id, function_id, function_slug,
                   app_name, org_slug, status, created_at
            FROM (
                SELECT *,
                       ROW_NUMBER() OVER (
                           PARTITION BY project_id, function_slug
                           ORDER BY created_at DESC, id DESC
                       ) AS rank
                FROM function_runners
                WHERE reaped_at IS NULL
                  AND ($1::uuid IS NULL OR project_id = $1)
            ) ranked
            WHERE rank > $2 AND status <> 'initializing'
            ORDER BY created_at
            LIMIT $3
            "#,
        )
        .bind(project_id)
        .bind(keep)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Number of live rows per function slug in a project.
    pub async fn live_counts(&self, project_id: Uuid) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            r#"
            SELECT function_slug, COUNT(*)
            FROM function_runners
            WHERE project_id = $1 AND reaped_at IS NULL
            GROUP BY function_slug
            ORDER BY function_slug
            "#,
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_strings() {
        assert_eq!(RunnerStatus::Initializing.as_str(), "initializing");
        assert_eq!(RunnerStatus::Ready.as_str(), "ready");
        assert_eq!(RunnerStatus::Failed.as_str(), "failed");
    }
}
