// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for gram-server.
//!
//! Every failure carries an [`ErrorKind`] that decides its HTTP status and
//! wire name, and a public message that is safe to return to callers.
//! Infrastructure errors (database, I/O, blob backends) surface as
//! `unexpected` with a generic message; their detail is only logged.

use thiserror::Error;

use crate::blob_store::BlobStoreError;
use crate::encryption::EncryptionError;
use crate::runner::RunnerError;

/// Gram errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Blob storage operation failed.
    #[error("Blob store error: {0}")]
    BlobStore(#[from] BlobStoreError),

    /// Runner platform operation failed.
    #[error("Runner error: {0}")]
    Runner(#[from] RunnerError),

    /// Sealing or unsealing a secret failed.
    #[error("Encryption error: {0}")]
    Encryption(#[from] EncryptionError),

    /// Caller is not authenticated, or presented a bad token.
    #[error("{0}")]
    Unauthorized(String),

    /// Caller is authenticated but not allowed to act.
    #[error("{0}")]
    Forbidden(String),

    /// Caller-supplied data is invalid.
    #[error("{0}")]
    BadRequest(String),

    /// Content type is not accepted for the target kind.
    #[error("{0}")]
    UnsupportedMedia(String),

    /// Resource is absent or not owned by the caller.
    #[error("{0}")]
    NotFound(String),

    /// A unique constraint was violated.
    #[error("{0}")]
    Conflict(String),

    /// Request is well formed but semantically invalid.
    #[error("{0}")]
    Invalid(String),

    /// Stored data breaks a data model contract.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Any other failure.
    #[error("{0}")]
    Unexpected(String),
}

/// Result type using gram Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Error classification shared by the HTTP boundary and the workflow engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 401
    Unauthorized,
    /// 403
    Forbidden,
    /// 400
    BadRequest,
    /// 415
    UnsupportedMedia,
    /// 404
    NotFound,
    /// 409
    Conflict,
    /// 400, semantically invalid request
    Invalid,
    /// 500, always logged
    InvariantViolation,
    /// 500
    Unexpected,
}

impl ErrorKind {
    /// Wire name used in the error envelope.
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::UnsupportedMedia => "unsupported_media",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Invalid => "invalid",
            ErrorKind::InvariantViolation => "invariant_violation",
            ErrorKind::Unexpected => "unexpected",
        }
    }

    /// HTTP status code for this kind.
    pub fn status_code(self) -> u16 {
        match self {
            ErrorKind::Unauthorized => 401,
            ErrorKind::Forbidden => 403,
            ErrorKind::BadRequest | ErrorKind::Invalid => 400,
            ErrorKind::UnsupportedMedia => 415,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::InvariantViolation | ErrorKind::Unexpected => 500,
        }
    }

    /// Whether the failure is attributed to the server rather than the caller.
    pub fn is_fault(self) -> bool {
        matches!(self, ErrorKind::InvariantViolation | ErrorKind::Unexpected)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Postgres SQLSTATE for unique_violation.
const UNIQUE_VIOLATION: &str = "23505";
/// Postgres SQLSTATEs that are safe to retry (serialization failure, deadlock).
const RETRYABLE_SQLSTATES: &[&str] = &["40001", "40P01"];

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Unauthorized(_) => ErrorKind::Unauthorized,
            Error::Forbidden(_) => ErrorKind::Forbidden,
            Error::BadRequest(_) => ErrorKind::BadRequest,
            Error::UnsupportedMedia(_) => ErrorKind::UnsupportedMedia,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::Invalid(_) => ErrorKind::Invalid,
            Error::InvariantViolation(_) => ErrorKind::InvariantViolation,
            Error::Database(sqlx::Error::RowNotFound) => ErrorKind::NotFound,
            Error::Database(sqlx::Error::Database(db))
                if db.code().as_deref() == Some(UNIQUE_VIOLATION) =>
            {
                ErrorKind::Conflict
            }
            Error::BlobStore(BlobStoreError::NotFound(_)) => ErrorKind::NotFound,
            Error::BlobStore(BlobStoreError::Unauthorized(_)) => ErrorKind::Unauthorized,
            Error::BlobStore(BlobStoreError::Invalid(_)) => ErrorKind::Invalid,
            Error::Runner(RunnerError::Invalid(_)) => ErrorKind::Invalid,
            _ => ErrorKind::Unexpected,
        }
    }

    /// Message that may be shown to callers.
    ///
    /// Infrastructure errors are replaced by a generic message so that
    /// connection strings, paths and provider responses never leak.
    pub fn public_message(&self) -> String {
        match self {
            Error::Unauthorized(m)
            | Error::Forbidden(m)
            | Error::BadRequest(m)
            | Error::UnsupportedMedia(m)
            | Error::NotFound(m)
            | Error::Conflict(m)
            | Error::Invalid(m)
            | Error::Unexpected(m) => m.clone(),
            Error::InvariantViolation(_) => "internal data inconsistency".to_string(),
            Error::Runner(RunnerError::Invalid(m)) => m.clone(),
            Error::BlobStore(BlobStoreError::NotFound(_)) => "not found".to_string(),
            Error::BlobStore(BlobStoreError::Unauthorized(_)) => "unauthorized".to_string(),
            Error::BlobStore(BlobStoreError::Invalid(m)) => m.clone(),
            Error::Database(sqlx::Error::RowNotFound) => "not found".to_string(),
            _ => match self.kind() {
                ErrorKind::Conflict => "resource already exists".to_string(),
                _ => "an unexpected error occurred".to_string(),
            },
        }
    }

    /// Whether the workflow engine should retry the step that produced this
    /// error.
    ///
    /// Transient database, blob backend and provider failures are retryable.
    /// Validation, invariant and tier failures are permanent.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Database(e) => match e {
                sqlx::Error::Io(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::Tls(_)
                | sqlx::Error::Protocol(_)
                | sqlx::Error::WorkerCrashed => true,
                sqlx::Error::Database(db) => db
                    .code()
                    .is_some_and(|code| RETRYABLE_SQLSTATES.contains(&code.as_ref())),
                _ => false,
            },
            Error::Io(_) => true,
            Error::BlobStore(e) => e.is_retryable(),
            Error::Runner(e) => e.is_retryable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_wire_names() {
        assert_eq!(ErrorKind::BadRequest.name(), "bad_request");
        assert_eq!(ErrorKind::UnsupportedMedia.name(), "unsupported_media");
        assert_eq!(ErrorKind::InvariantViolation.name(), "invariant_violation");
        assert_eq!(ErrorKind::NotFound.to_string(), "not_found");
    }

    #[test]
    fn test_kind_status_codes() {
        assert_eq!(ErrorKind::Unauthorized.status_code(), 401);
        assert_eq!(ErrorKind::Forbidden.status_code(), 403);
        assert_eq!(ErrorKind::Invalid.status_code(), 400);
        assert_eq!(ErrorKind::UnsupportedMedia.status_code(), 415);
        assert_eq!(ErrorKind::Conflict.status_code(), 409);
        assert_eq!(ErrorKind::Unexpected.status_code(), 500);
    }

    #[test]
    fn test_classification() {
        assert_eq!(
            Error::Database(sqlx::Error::RowNotFound).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            Error::BlobStore(BlobStoreError::Unauthorized("x".into())).kind(),
            ErrorKind::Unauthorized
        );
        assert_eq!(
            Error::Runner(RunnerError::Invalid("too big".into())).kind(),
            ErrorKind::Invalid
        );
        assert_eq!(
            Error::Io(std::io::Error::other("boom")).kind(),
            ErrorKind::Unexpected
        );
    }

    #[test]
    fn test_public_message_hides_internals() {
        let err = Error::Io(std::io::Error::other("/secret/path is broken"));
        assert_eq!(err.public_message(), "an unexpected error occurred");

        let err = Error::BadRequest("no content".into());
        assert_eq!(err.public_message(), "no content");
    }

    #[test]
    fn test_retry_classification() {
        assert!(Error::Database(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(!Error::Database(sqlx::Error::RowNotFound).is_retryable());
        assert!(!Error::BadRequest("bad".into()).is_retryable());
        assert!(!Error::Forbidden("tier".into()).is_retryable());
        assert!(!Error::InvariantViolation("missing sha".into()).is_retryable());
        assert!(Error::Runner(RunnerError::Timeout("wait".into())).is_retryable());
        assert!(!Error::Runner(RunnerError::Invalid("too big".into())).is_retryable());
        assert!(Error::BlobStore(BlobStoreError::Backend("503".into())).is_retryable());
        assert!(!Error::BlobStore(BlobStoreError::NotFound("x".into())).is_retryable());
    }
}
