// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable workflow queue backed by `deployment_workflows`.
//!
//! Rows move `queued -> running -> completed | retrying | failed`. A claimed
//! row holds a lease (`locked_until`); a worker that dies mid-run loses the
//! lease and the row is claimed again, so every step runs at least once.

use std::time::Duration;

use sqlx::{PgConnection, PgPool};
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;

/// Attempts allowed per workflow when not configured.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 5;

/// Longest error message kept on a workflow row.
const MAX_ERROR_LEN: usize = 1000;

/// A claimed workflow.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct WorkflowJob {
    /// Deployment to process
    pub deployment_id: Uuid,
    /// Owning project
    pub project_id: Uuid,
    /// Attempt number, starting at 1
    pub attempts: i32,
    /// Attempts allowed
    pub max_attempts: i32,
}

impl WorkflowJob {
    /// Whether a failure of this attempt should not be retried.
    pub fn is_last_attempt(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// Enqueue the workflow of a new deployment inside the creating transaction.
///
/// A second enqueue for the same deployment is a no-op.
pub async fn enqueue(
    conn: &mut PgConnection,
    deployment_id: Uuid,
    project_id: Uuid,
    max_attempts: i32,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO deployment_workflows (deployment_id, project_id, status, max_attempts)
        VALUES ($1, $2, 'queued', $3)
        ON CONFLICT (deployment_id) DO NOTHING
        "#,
    )
    .bind(deployment_id)
    .bind(project_id)
    .bind(max_attempts)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Delay before attempt `attempts + 1`: `base * 2^(attempts - 1)`, capped.
pub fn backoff(attempts: i32, base: Duration, max: Duration) -> Duration {
    let exp = attempts.saturating_sub(1).clamp(0, 20) as u32;
    base.saturating_mul(2u32.saturating_pow(exp)).min(max)
}

/// Queue operations on `deployment_workflows`.
#[derive(Debug, Clone)]
pub struct WorkflowQueue {
    pool: PgPool,
}

impl WorkflowQueue {
    /// Create a new queue client.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Claim up to `limit` due workflows, leasing each for `lease`.
    ///
    /// Due means queued or retrying with `next_attempt_at` in the past, or
    /// running with an expired lease. Rows locked by another worker are
    /// skipped.
    pub async fn claim(&self, lease: Duration, limit: i64) -> Result<Vec<WorkflowJob>> {
        let jobs = sqlx::query_as::<_, WorkflowJob>(
            r#"
            UPDATE deployment_workflows
            SET status = 'running',
                attempts = attempts + 1,
                locked_until = NOW() + make_interval(secs => $1),
                updated_at = NOW()
            WHERE deployment_id IN (
                SELECT deployment_id
                FROM deployment_workflows
                WHERE (status IN ('queued', 'retrying') AND next_attempt_at <= NOW())
                   OR (status = 'running' AND locked_until < NOW())
                ORDER BY next_attempt_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING deployment_id, project_id, attempts, max_attempts
            "#,
        )
        .bind(lease.as_secs_f64())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        if !jobs.is_empty() {
            debug!(count = jobs.len(), "Claimed deployment workflows");
        }
        Ok(jobs)
    }

    /// Mark a workflow finished.
    pub async fn complete(&self, deployment_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE deployment_workflows
            SET status = 'completed', locked_until = NULL, updated_at = NOW()
            WHERE deployment_id = $1
            "#,
        )
        .bind(deployment_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Schedule another attempt after `delay`.
    pub async fn retry(&self, deployment_id: Uuid, delay: Duration, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE deployment_workflows
            SET status = 'retrying',
                next_attempt_at = NOW() + make_interval(secs => $2),
                locked_until = NULL,
                last_error = $3,
                updated_at = NOW()
            WHERE deployment_id = $1
            "#,
        )
        .bind(deployment_id)
        .bind(delay.as_secs_f64())
        .bind(truncate(error))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark a workflow permanently failed.
    pub async fn fail(&self, deployment_id: Uuid, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE deployment_workflows
            SET status = 'failed', locked_until = NULL, last_error = $2, updated_at = NOW()
            WHERE deployment_id = $1
            "#,
        )
        .bind(deployment_id)
        .bind(truncate(error))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Number of workflows per status.
    pub async fn counts(&self) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM deployment_workflows GROUP BY status ORDER BY status",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

fn truncate(error: &str) -> &str {
    match error.char_indices().nth(MAX_ERROR_LEN) {
        Some((idx, _)) => &error[..idx],
        None => error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::from_secs(5);
        let max = Duration::from_secs(300);
        assert_eq!(backoff(1, base, max), Duration::from_secs(5));
        assert_eq!(backoff(2, base, max), Duration::from_secs(10));
        assert_eq!(backoff(3, base, max), Duration::from_secs(20));
        assert_eq!(backoff(10, base, max), max);
        assert_eq!(backoff(0, base, max), base);
        assert_eq!(backoff(i32::MAX, base, max), max);
    }

    #[test]
    fn test_last_attempt() {
        let job = WorkflowJob {
            deployment_id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            attempts: 4,
            max_attempts: 5,
        };
        assert!(!job.is_last_attempt());
        assert!(WorkflowJob { attempts: 5, ..job }.is_last_attempt());
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short"), "short");
        let long = "é".repeat(MAX_ERROR_LEN + 10);
        assert_eq!(truncate(&long).chars().count(), MAX_ERROR_LEN);
    }
}
