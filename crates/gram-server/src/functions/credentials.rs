// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-function bearer secrets.
//!
//! Every function of a deployment gets one random 32-byte secret, sealed with
//! the process key and stored in `functions_access`. Runners receive the
//! secret in base64 and sign their callbacks with it.

use rand::RngCore;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use super::BEARER_FORMAT;
use crate::encryption::Encryption;
use crate::error::{Error, Result};

/// Length of a function secret in bytes.
pub const SECRET_LEN: usize = 32;

/// A function's unsealed credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct FunctionSecret {
    /// `functions_access` row ID
    pub access_id: Uuid,
    /// Raw secret bytes
    pub secret: Vec<u8>,
}

impl std::fmt::Debug for FunctionSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionSecret")
            .field("access_id", &self.access_id)
            .finish_non_exhaustive()
    }
}

/// Issues and unseals per-function secrets.
#[derive(Clone)]
pub struct FunctionCredentials {
    pool: PgPool,
    encryption: Encryption,
}

impl FunctionCredentials {
    /// Create a new credentials provider.
    pub fn new(pool: PgPool, encryption: Encryption) -> Self {
        Self { pool, encryption }
    }

    /// Issue secrets for every function of the deployment that has none.
    ///
    /// Runs in one transaction and returns how many secrets were created.
    /// Re-running is a no-op once every function has a row.
    pub async fn provision(&self, project_id: Uuid, deployment_id: Uuid) -> Result<usize> {
        let mut tx = self.pool.begin().await?;

        let missing: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT df.id
            FROM deployments_functions df
            WHERE df.deployment_id = $1
              AND NOT EXISTS (
                  SELECT 1 FROM functions_access fa
                  WHERE fa.project_id = $2
                    AND fa.deployment_id = df.deployment_id
                    AND fa.function_id = df.id
              )
            ORDER BY df.slug
            "#,
        )
        .bind(deployment_id)
        .bind(project_id)
        .fetch_all(&mut *tx)
        .await?;

        let mut created = 0;
        for function_id in &missing {
            let sealed = self.encryption.seal(&generate_secret())?;
            let result = sqlx::query(
                r#"
                INSERT INTO functions_access (
                    id, project_id, deployment_id, function_id, encryption_key, bearer_format
                ) VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (project_id, deployment_id, function_id) DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(project_id)
            .bind(deployment_id)
            .bind(function_id)
            .bind(&sealed)
            .bind(BEARER_FORMAT)
            .execute(&mut *tx)
            .await?;
            created += result.rows_affected() as usize;
        }

        tx.commit().await?;

        if created > 0 {
            info!(
                project_id = %project_id,
                deployment_id = %deployment_id,
                created,
                "Provisioned function credentials"
            );
        }

        Ok(created)
    }

    /// Unseal the secret of one function.
    ///
    /// Missing or malformed rows are invariant violations: credentials are
    /// always provisioned before anything reads them.
    pub async fn secret(
        &self,
        project_id: Uuid,
        deployment_id: Uuid,
        function_id: Uuid,
    ) -> Result<FunctionSecret> {
        let row: Option<(Uuid, String, String)> = sqlx::query_as(
            r#"
            SELECT id, encryption_key, bearer_format
            FROM functions_access
            WHERE project_id = $1 AND deployment_id = $2 AND function_id = $3
            "#,
        )
        .bind(project_id)
        .bind(deployment_id)
        .bind(function_id)
        .fetch_optional(&self.pool)
        .await?;

        let (access_id, sealed, format) = row.ok_or_else(|| {
            Error::InvariantViolation(format!("function {} is missing credentials", function_id))
        })?;
        self.unseal(function_id, access_id, &sealed, &format)
    }

    fn unseal(
        &self,
        function_id: Uuid,
        access_id: Uuid,
        sealed: &str,
        format: &str,
    ) -> Result<FunctionSecret> {
        if sealed.is_empty() || format.is_empty() {
            return Err(Error::InvariantViolation(format!(
                "malformed credentials generated for function {}",
                function_id
            )));
        }
        let secret = self.encryption.open(sealed).map_err(|e| {
            Error::InvariantViolation(format!(
                "failed to unseal credentials for function {}: {}",
                function_id, e
            ))
        })?;
        if secret.is_empty() {
            return Err(Error::InvariantViolation(format!(
                "function {} has empty credentials",
                function_id
            )));
        }
        Ok(FunctionSecret { access_id, secret })
    }
}

fn generate_secret() -> [u8; SECRET_LEN] {
    let mut secret = [0u8; SECRET_LEN];
    rand::thread_rng().fill_bytes(&mut secret);
    secret
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::postgres::PgPool;

    fn credentials() -> FunctionCredentials {
        let pool = PgPool::connect_lazy("postgres://localhost/dummy").unwrap();
        FunctionCredentials::new(pool, Encryption::new([9u8; 32]))
    }

    #[test]
    fn test_generated_secrets_differ() {
        assert_ne!(generate_secret(), generate_secret());
    }

    #[tokio::test]
    async fn test_unseal_roundtrip() {
        let creds = credentials();
        let secret = generate_secret();
        let sealed = creds.encryption.seal(&secret).unwrap();
        let access_id = Uuid::new_v4();

        let opened = creds
            .unseal(Uuid::new_v4(), access_id, &sealed, BEARER_FORMAT)
            .unwrap();
        assert_eq!(opened.access_id, access_id);
        assert_eq!(opened.secret, secret.to_vec());
    }

    #[tokio::test]
    async fn test_unseal_rejects_malformed_rows() {
        let creds = credentials();
        let sealed = creds.encryption.seal(b"x").unwrap();

        assert!(matches!(
            creds.unseal(Uuid::new_v4(), Uuid::new_v4(), &sealed, ""),
            Err(Error::InvariantViolation(_))
        ));
        assert!(matches!(
            creds.unseal(Uuid::new_v4(), Uuid::new_v4(), "", BEARER_FORMAT),
            Err(Error::InvariantViolation(_))
        ));

        let foreign = Encryption::new([1u8; 32]).seal(b"x").unwrap();
        assert!(matches!(
            creds.unseal(Uuid::new_v4(), Uuid::new_v4(), &foreign, BEARER_FORMAT),
            Err(Error::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_debug_hides_secret() {
        let s = FunctionSecret {
            access_id: Uuid::nil(),
            secret: b"hunter2".to_vec(),
        };
        assert!(!format!("{:?}", s).contains("hunter2"));
    }
}
