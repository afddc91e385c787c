// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Short-lived signed asset tokens.
//!
//! Tokens are HS256 JWTs carrying `{asset_id, project_id, jti, exp}` signed
//! with the process JWT secret. They are never persisted; possession of a
//! valid token is the only authorization needed to read the asset.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Claims of a signed asset token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetClaims {
    /// Asset being granted
    pub asset_id: Uuid,
    /// Project owning the asset
    pub project_id: Uuid,
    /// Unique token id
    pub jti: String,
    /// Expiry, seconds since the epoch
    pub exp: i64,
}

/// Issues and verifies signed asset tokens.
#[derive(Clone)]
pub struct AssetTokens {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl std::fmt::Debug for AssetTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetTokens").finish_non_exhaustive()
    }
}

impl AssetTokens {
    /// Create from the process JWT secret.
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Sign a token for `asset_id` valid for `ttl`.
    pub fn issue(
        &self,
        asset_id: Uuid,
        project_id: Uuid,
        ttl: Duration,
    ) -> Result<(String, DateTime<Utc>)> {
        let expires_at = Utc::now() + ttl;
        let claims = AssetClaims {
            asset_id,
            project_id,
            jti: Uuid::new_v4().to_string(),
            exp: expires_at.timestamp(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| Error::Unexpected(format!("failed to sign asset token: {}", e)))?;
        Ok((token, expires_at))
    }

    /// Verify a token. Any failure is `Unauthorized`.
    pub fn verify(&self, token: &str) -> Result<AssetClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp"]);

        let claims = decode::<AssetClaims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| {
                tracing::debug!(error = %e, "Rejected asset token");
                invalid_token()
            })?;

        // jsonwebtoken only rejects `exp < now`.
        if claims.exp <= Utc::now().timestamp() {
            tracing::debug!(exp = claims.exp, "Rejected expired asset token");
            return Err(invalid_token());
        }
        Ok(claims)
    }
}

fn invalid_token() -> Error {
    Error::Unauthorized("invalid or expired token".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_and_verify() {
        let tokens = AssetTokens::new("secret");
        let asset = Uuid::new_v4();
        let project = Uuid::new_v4();

        let (token, expires_at) = tokens.issue(asset, project, Duration::minutes(10)).unwrap();
        assert!(expires_at > Utc::now());

        let claims = tokens.verify(&token).unwrap();
        assert_eq!(claims.asset_id, asset);
        assert_eq!(claims.project_id, project);
        assert_eq!(claims.exp, expires_at.timestamp());
    }

    #[test]
    fn test_wrong_secret_fails() {
        let (token, _) = AssetTokens::new("secret")
            .issue(Uuid::new_v4(), Uuid::new_v4(), Duration::minutes(10))
            .unwrap();
        let err = AssetTokens::new("other").verify(&token).unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
    }

    #[test]
    fn test_expired_fails() {
        let tokens = AssetTokens::new("secret");
        let (token, _) = tokens
            .issue(Uuid::new_v4(), Uuid::new_v4(), Duration::seconds(-30))
            .unwrap();
        assert!(matches!(tokens.verify(&token), Err(Error::Unauthorized(_))));
    }

    #[test]
    fn test_expiring_this_second_fails() {
        let claims = AssetClaims {
            asset_id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            jti: "j".to_string(),
            exp: Utc::now().timestamp(),
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap();
        assert!(matches!(
            AssetTokens::new("secret").verify(&token),
            Err(Error::Unauthorized(_))
        ));
    }

    #[test]
    fn test_other_algorithm_fails() {
        let claims = AssetClaims {
            asset_id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            jti: "j".to_string(),
            exp: (Utc::now() + Duration::minutes(5)).timestamp(),
        };
        let token = encode(
            &Header::new(Algorithm::HS512),
            &claims,
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap();
        assert!(matches!(
            AssetTokens::new("secret").verify(&token),
            Err(Error::Unauthorized(_))
        ));
    }

    #[test]
    fn test_garbage_fails() {
        assert!(AssetTokens::new("secret").verify("not.a.jwt").is_err());
    }
}
