// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Authentication of calls made by function runners.
//!
//! Runners sign HS256 JWTs with their per-function secret. The subject names
//! the function as `<project>:<deployment>:<function>`, which is also how the
//! verifying key is found.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::warn;
use url::Url;
use uuid::Uuid;

use super::credentials::FunctionCredentials;
use crate::blob_store::BlobStore;
use crate::error::{Error, ErrorKind, Result};

/// Lifetime of URLs returned by [`RunnerAuth::signed_asset_url`].
pub const SIGNED_ASSET_URL_TTL: Duration = Duration::from_secs(10 * 60);

/// Longest expiry accepted without a warning.
const MAX_QUIET_LIFETIME_SECS: i64 = 60 * 60;

/// Claims of a runner JWT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerClaims {
    /// `<project>:<deployment>:<function>`
    pub sub: String,
    /// Expiry, seconds since the epoch
    pub exp: i64,
    /// Token id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
}

/// Function identity established by a valid runner JWT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerAuthContext {
    /// Project of the function
    pub project_id: Uuid,
    /// Deployment of the function
    pub deployment_id: Uuid,
    /// Function (attachment) ID
    pub function_id: Uuid,
}

impl RunnerAuthContext {
    /// JWT subject for this function.
    pub fn subject(&self) -> String {
        format!("{}:{}:{}", self.project_id, self.deployment_id, self.function_id)
    }

    fn parse_subject(sub: &str) -> Option<Self> {
        let mut parts = sub.split(':');
        let project_id = parts.next()?.parse().ok()?;
        let deployment_id = parts.next()?.parse().ok()?;
        let function_id = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            project_id,
            deployment_id,
            function_id,
        })
    }

    fn is_complete(&self) -> bool {
        !self.project_id.is_nil() && !self.deployment_id.is_nil() && !self.function_id.is_nil()
    }
}

/// Sign a runner JWT for `ctx` with `secret`, valid for `ttl`.
pub fn issue_token(secret: &[u8], ctx: &RunnerAuthContext, ttl: chrono::Duration) -> Result<String> {
    let claims = RunnerClaims {
        sub: ctx.subject(),
        exp: (Utc::now() + ttl).timestamp(),
        jti: Some(Uuid::new_v4().to_string()),
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret),
    )
    .map_err(|e| Error::Unexpected(format!("failed to sign runner token: {}", e)))
}

/// Verify `token` against `secret`.
pub fn verify_token(secret: &[u8], token: &str) -> Result<RunnerClaims> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_required_spec_claims(&["exp", "sub"]);
    validation.leeway = 0;

    let data = decode::<RunnerClaims>(token, &DecodingKey::from_secret(secret), &validation)
        .map_err(|_| unauthorized())?;

    // jsonwebtoken only rejects `exp < now`.
    if data.claims.exp <= Utc::now().timestamp() {
        return Err(unauthorized());
    }
    if data.claims.exp - Utc::now().timestamp() > MAX_QUIET_LIFETIME_SECS {
        warn!(subject = %data.claims.sub, exp = data.claims.exp, "Runner token expires more than one hour out");
    }
    Ok(data.claims)
}

/// Read the subject without checking the signature.
fn peek_subject(token: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct Subject {
        sub: String,
    }

    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    serde_json::from_slice::<Subject>(&bytes).ok().map(|s| s.sub)
}

fn unauthorized() -> Error {
    Error::Unauthorized("invalid runner token".to_string())
}

/// Authenticates runners and serves their asset requests.
#[derive(Clone)]
pub struct RunnerAuth {
    pool: PgPool,
    credentials: FunctionCredentials,
    store: Arc<dyn BlobStore>,
}

impl RunnerAuth {
    /// Create a new authenticator.
    pub fn new(pool: PgPool, credentials: FunctionCredentials, store: Arc<dyn BlobStore>) -> Self {
        Self {
            pool,
            credentials,
            store,
        }
    }

    /// Validate a bearer token and return the function it speaks for.
    pub async fn authenticate(&self, token: &str) -> Result<RunnerAuthContext> {
        let subject = peek_subject(token).ok_or_else(unauthorized)?;
        let ctx = RunnerAuthContext::parse_subject(&subject)
            .filter(RunnerAuthContext::is_complete)
            .ok_or_else(unauthorized)?;

        let secret = match self
            .credentials
            .secret(ctx.project_id, ctx.deployment_id, ctx.function_id)
            .await
        {
            Ok(secret) => secret,
            Err(e) if e.kind() == ErrorKind::InvariantViolation => {
                warn!(subject = %subject, error = %e, "Runner token for function without credentials");
                return Err(unauthorized());
            }
            Err(e) => return Err(e),
        };

        let claims = verify_token(&secret.secret, token)?;
        if claims.sub != subject {
            return Err(unauthorized());
        }
        Ok(ctx)
    }

    /// Presigned read URL for `asset_id`, valid for ten minutes.
    ///
    /// Only the asset of the authenticated function is reachable; anything
    /// else is reported as not found.
    pub async fn signed_asset_url(&self, ctx: &RunnerAuthContext, asset_id: Uuid) -> Result<Url> {
        if !ctx.is_complete() {
            return Err(Error::Unauthorized("missing runner identity".to_string()));
        }
        if asset_id.is_nil() {
            return Err(Error::Invalid("asset id cannot be nil".to_string()));
        }

        let raw: Option<String> = sqlx::query_scalar(
            r#"
            SELECT a.url
            FROM deployments_functions df
            JOIN deployments d ON d.id = df.deployment_id
            JOIN assets a ON a.id = df.asset_id
            WHERE d.project_id = $1
              AND d.id = $2
              AND df.id = $3
              AND a.id = $4
              AND a.project_id = $1
            "#,
        )
        .bind(ctx.project_id)
        .bind(ctx.deployment_id)
        .bind(ctx.function_id)
        .bind(asset_id)
        .fetch_optional(&self.pool)
        .await?;

        let raw = raw.ok_or_else(|| Error::NotFound("asset not found".to_string()))?;
        let url = Url::parse(&raw)
            .map_err(|e| Error::InvariantViolation(format!("malformed asset url {}: {}", raw, e)))?;
        Ok(self.store.presign_read(&url, SIGNED_ASSET_URL_TTL).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RunnerAuthContext {
        RunnerAuthContext {
            project_id: Uuid::new_v4(),
            deployment_id: Uuid::new_v4(),
            function_id: Uuid::new_v4(),
        }
    }

    #[test]
    fn test_token_roundtrip() {
        let ctx = ctx();
        let token = issue_token(b"secret", &ctx, chrono::Duration::minutes(5)).unwrap();

        assert_eq!(peek_subject(&token), Some(ctx.subject()));
        let claims = verify_token(b"secret", &token).unwrap();
        assert_eq!(claims.sub, ctx.subject());
        assert_eq!(RunnerAuthContext::parse_subject(&claims.sub), Some(ctx));
    }

    #[test]
    fn test_different_key_fails() {
        let token = issue_token(b"secret", &ctx(), chrono::Duration::minutes(5)).unwrap();
        assert!(matches!(verify_token(b"other", &token), Err(Error::Unauthorized(_))));
    }

    #[test]
    fn test_expired_fails() {
        let token = issue_token(b"secret", &ctx(), chrono::Duration::seconds(-30)).unwrap();
        assert!(matches!(verify_token(b"secret", &token), Err(Error::Unauthorized(_))));
    }

    #[test]
    fn test_expiring_this_second_fails() {
        let claims = RunnerClaims {
            sub: ctx().subject(),
            exp: Utc::now().timestamp(),
            jti: None,
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap();
        assert!(matches!(verify_token(b"secret", &token), Err(Error::Unauthorized(_))));
    }

    #[test]
    fn test_missing_exp_fails() {
        #[derive(Serialize)]
        struct NoExp {
            sub: String,
        }
        let token = encode(
            &Header::new(Algorithm::HS256),
            &NoExp { sub: ctx().subject() },
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap();
        assert!(verify_token(b"secret", &token).is_err());
    }

    #[test]
    fn test_non_hs256_fails() {
        let claims = RunnerClaims {
            sub: ctx().subject(),
            exp: (Utc::now() + chrono::Duration::minutes(5)).timestamp(),
            jti: None,
        };
        let token = encode(
            &Header::new(Algorithm::HS384),
            &claims,
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap();
        assert!(verify_token(b"secret", &token).is_err());
    }

    #[test]
    fn test_parse_subject() {
        assert!(RunnerAuthContext::parse_subject("a:b:c").is_none());
        assert!(RunnerAuthContext::parse_subject(&format!("{}:extra", ctx().subject())).is_none());

        let nil = RunnerAuthContext {
            project_id: Uuid::nil(),
            ..ctx()
        };
        let parsed = RunnerAuthContext::parse_subject(&nil.subject()).unwrap();
        assert!(!parsed.is_complete());
    }

    #[test]
    fn test_peek_subject_garbage() {
        assert_eq!(peek_subject("not-a-jwt"), None);
        assert_eq!(peek_subject("a.!!!.c"), None);
    }
}
