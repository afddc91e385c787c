// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error envelope returned by every endpoint.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::{error, warn};
use uuid::Uuid;

use crate::error::{Error, ErrorKind};
use crate::runner::RunnerError;

/// Wire form of an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorEnvelope {
    /// Generated per response, logged alongside the internal cause
    pub id: String,
    /// Error kind name
    pub name: &'static str,
    /// Public message
    pub message: String,
    /// Set when a provider call timed out
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<bool>,
    /// Set when retrying may succeed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temporary: Option<bool>,
    /// Set when the server is at fault
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault: Option<bool>,
}

impl ErrorEnvelope {
    /// Build the envelope for `err`.
    pub fn from_error(err: &Error) -> Self {
        let kind = err.kind();
        Self {
            id: Uuid::new_v4().simple().to_string(),
            name: kind.name(),
            message: err.public_message(),
            timeout: matches!(err, Error::Runner(RunnerError::Timeout(_))).then_some(true),
            temporary: err.is_retryable().then_some(true),
            fault: kind.is_fault().then_some(true),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let kind = self.kind();
        let envelope = ErrorEnvelope::from_error(&self);

        match kind {
            ErrorKind::InvariantViolation | ErrorKind::Unexpected => {
                error!(error_id = %envelope.id, kind = %kind, error = %self, "Request failed");
            }
            ErrorKind::Unauthorized | ErrorKind::Forbidden => {
                warn!(error_id = %envelope.id, kind = %kind, error = %self, "Request rejected");
            }
            _ => {}
        }

        let status = StatusCode::from_u16(kind.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(envelope)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_for_caller_error() {
        let envelope = ErrorEnvelope::from_error(&Error::NotFound("asset not found".into()));
        assert_eq!(envelope.name, "not_found");
        assert_eq!(envelope.message, "asset not found");
        assert_eq!(envelope.fault, None);
        assert_eq!(envelope.temporary, None);
        assert_eq!(envelope.id.len(), 32);

        let json = serde_json::to_value(&envelope).unwrap();
        assert!(json.get("fault").is_none());
    }

    #[test]
    fn test_envelope_for_fault_hides_cause() {
        let err = Error::Io(std::io::Error::other("disk /var/lib/gram is full"));
        let envelope = ErrorEnvelope::from_error(&err);
        assert_eq!(envelope.name, "unexpected");
        assert_eq!(envelope.fault, Some(true));
        assert_eq!(envelope.temporary, Some(true));
        assert!(!envelope.message.contains("/var/lib"));
    }

    #[test]
    fn test_envelope_flags_timeouts() {
        let err = Error::Runner(RunnerError::Timeout("machine did not start".into()));
        let envelope = ErrorEnvelope::from_error(&err);
        assert_eq!(envelope.timeout, Some(true));
    }

    #[test]
    fn test_status_codes() {
        let res = Error::UnsupportedMedia("text/html".into()).into_response();
        assert_eq!(res.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

        let res = Error::InvariantViolation("missing sha".into()).into_response();
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
