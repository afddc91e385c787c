// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request principals.
//!
//! Session handling lives in front of this service; the gateway forwards the
//! authenticated principal in headers. Runner callbacks authenticate with a
//! bearer JWT instead, see [`bearer_token`].

use axum::extract::FromRequestParts;
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use uuid::Uuid;

use super::AppState;
use crate::error::{Error, Result};
use crate::tenancy;

/// Header carrying the active organization.
pub const ORGANIZATION_HEADER: &str = "x-gram-organization-id";
/// Header carrying the active project.
pub const PROJECT_HEADER: &str = "x-gram-project-id";
/// Header carrying the user.
pub const USER_HEADER: &str = "x-gram-user-id";

/// An authenticated principal with an active organization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    /// Active organization
    pub organization_id: String,
    /// User
    pub user_id: String,
}

/// A principal acting in one of its organization's projects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectScope {
    /// Caller
    pub principal: Principal,
    /// Active project, verified to belong to the organization
    pub project_id: Uuid,
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

impl Principal {
    fn from_headers(headers: &HeaderMap) -> Result<Self> {
        let organization_id = header(headers, ORGANIZATION_HEADER)
            .ok_or_else(|| Error::Unauthorized("no active organization".to_string()))?;
        let user_id = header(headers, USER_HEADER)
            .ok_or_else(|| Error::Unauthorized("authentication required".to_string()))?;
        Ok(Self {
            organization_id: organization_id.to_string(),
            user_id: user_id.to_string(),
        })
    }
}

fn project_id(headers: &HeaderMap) -> Result<Uuid> {
    let raw = header(headers, PROJECT_HEADER)
        .ok_or_else(|| Error::Unauthorized("no active project".to_string()))?;
    Uuid::parse_str(raw).map_err(|_| Error::BadRequest("malformed project id".to_string()))
}

impl FromRequestParts<AppState> for ProjectScope {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        let principal = Principal::from_headers(&parts.headers)?;
        let project_id = project_id(&parts.headers)?;
        tenancy::ensure_project(&state.pool, &principal.organization_id, project_id).await?;
        Ok(Self {
            principal,
            project_id,
        })
    }
}

/// Token of an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str> {
    let value = header(headers, AUTHORIZATION.as_str())
        .ok_or_else(|| Error::Unauthorized("missing bearer token".to_string()))?;
    let mut parts = value.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(scheme), Some(token), None) if scheme.eq_ignore_ascii_case("bearer") => Ok(token),
        _ => Err(Error::Unauthorized("malformed authorization header".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_str(v).unwrap());
        }
        map
    }

    #[test]
    fn test_principal_requires_org_and_user() {
        let ok = headers(&[(ORGANIZATION_HEADER, "org-1"), (USER_HEADER, "user-1")]);
        let principal = Principal::from_headers(&ok).unwrap();
        assert_eq!(principal.organization_id, "org-1");

        let missing = headers(&[(USER_HEADER, "user-1")]);
        assert!(matches!(
            Principal::from_headers(&missing),
            Err(Error::Unauthorized(_))
        ));

        let blank = headers(&[(ORGANIZATION_HEADER, " "), (USER_HEADER, "user-1")]);
        assert!(Principal::from_headers(&blank).is_err());
    }

    #[test]
    fn test_project_header() {
        let id = Uuid::new_v4();
        assert_eq!(project_id(&headers(&[(PROJECT_HEADER, &id.to_string())])).unwrap(), id);
        assert!(matches!(project_id(&HeaderMap::new()), Err(Error::Unauthorized(_))));
        assert!(matches!(
            project_id(&headers(&[(PROJECT_HEADER, "nope")])),
            Err(Error::BadRequest(_))
        ));
    }

    #[test]
    fn test_bearer_token() {
        let map = headers(&[("authorization", "Bearer abc.def.ghi")]);
        assert_eq!(bearer_token(&map).unwrap(), "abc.def.ghi");

        let map = headers(&[("authorization", "bearer abc")]);
        assert_eq!(bearer_token(&map).unwrap(), "abc");

        assert!(bearer_token(&headers(&[("authorization", "Basic abc")])).is_err());
        assert!(bearer_token(&headers(&[("authorization", "Bearer a b")])).is_err());
        assert!(bearer_token(&HeaderMap::new()).is_err());
    }
}
