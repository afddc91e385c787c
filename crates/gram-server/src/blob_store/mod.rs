// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Blob storage backends.
//!
//! A single capability trait, [`BlobStore`], with three implementations:
//!
//! | Scheme | Backend |
//! |--------|---------|
//! | `file://` | [`FsBlobStore`], rooted at a local directory |
//! | `s3://` | [`S3BlobStore`] |
//! | `gs://` | [`S3BlobStore`] against the GCS interoperability endpoint |
//!
//! Writers stage content and only publish the object on
//! [`BlobWriter::finish`]; a dropped writer leaves nothing behind.

mod fs;
mod s3;

use std::io::{Read, Seek};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use url::Url;

use crate::config::ObjectStorageConfig;

pub use fs::FsBlobStore;
pub use s3::S3BlobStore;

/// Errors from blob storage operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BlobStoreError {
    /// Object does not exist.
    #[error("object not found: {0}")]
    NotFound(String),

    /// URL is outside the configured bucket or root.
    #[error("unauthorized object access: {0}")]
    Unauthorized(String),

    /// Path or URL is malformed or escapes the bucket root.
    #[error("invalid object path: {0}")]
    Invalid(String),

    /// Backend request failed.
    #[error("backend error: {0}")]
    Backend(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BlobStoreError {
    /// Transient backend and I/O failures are retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BlobStoreError::Backend(_) | BlobStoreError::Io(_))
    }
}

/// Result type for blob storage operations.
pub type Result<T> = std::result::Result<T, BlobStoreError>;

/// Streaming reader over a stored object.
pub type BlobReader = Pin<Box<dyn AsyncRead + Send>>;

/// Blocking random-access reader, suitable for ZIP central directory lookup.
pub trait RandomAccess: Read + Seek + Send {}

impl<T: Read + Seek + Send> RandomAccess for T {}

/// Staged write into a blob store.
#[async_trait]
pub trait BlobWrite: Send {
    /// Append a chunk.
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()>;

    /// Publish the object. Nothing is visible before this returns.
    async fn finish(self: Box<Self>) -> Result<()>;
}

/// Writer returned by [`BlobStore::write`].
pub struct BlobWriter {
    inner: Box<dyn BlobWrite>,
    expected_length: u64,
    written: u64,
}

impl BlobWriter {
    pub(crate) fn new(inner: Box<dyn BlobWrite>, expected_length: u64) -> Self {
        Self {
            inner,
            expected_length,
            written: 0,
        }
    }

    /// Append a chunk.
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.written += chunk.len() as u64;
        self.inner.write_chunk(chunk).await
    }

    /// Drain `reader` into the writer.
    pub async fn copy_from<R: AsyncRead + Unpin + ?Sized>(&mut self, reader: &mut R) -> Result<u64> {
        let mut buf = vec![0u8; 64 * 1024];
        let mut total = 0u64;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            self.write_chunk(&buf[..n]).await?;
            total += n as u64;
        }
        Ok(total)
    }

    /// Publish the object.
    ///
    /// Fails with `Invalid` if the number of bytes written does not match the
    /// declared content length.
    pub async fn finish(self) -> Result<()> {
        if self.written != self.expected_length {
            return Err(BlobStoreError::Invalid(format!(
                "wrote {} bytes, expected {}",
                self.written, self.expected_length
            )));
        }
        self.inner.finish().await
    }
}

/// Uniform object storage capability.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// URL scheme served by this store (`file`, `s3` or `gs`).
    fn scheme(&self) -> &'static str;

    /// Whether the object exists.
    async fn exists(&self, url: &Url) -> Result<bool>;

    /// Open the object as a stream.
    async fn read(&self, url: &Url) -> Result<BlobReader>;

    /// Open the object for random access, returning the reader and its size.
    async fn read_at(&self, url: &Url) -> Result<(Box<dyn RandomAccess>, u64)>;

    /// Start writing an object at `path`, relative to the store root.
    ///
    /// Returns the writer and the canonical URL the object will have once
    /// the writer is finished.
    async fn write(
        &self,
        path: &str,
        content_type: &str,
        content_length: u64,
    ) -> Result<(BlobWriter, Url)>;

    /// URL granting time-limited read access to the object.
    ///
    /// Stores that cannot presign return `url` unchanged.
    async fn presign_read(&self, url: &Url, ttl: Duration) -> Result<Url>;
}

/// Build the blob store for `assets_uri`.
pub async fn from_uri(
    assets_uri: &str,
    storage: &ObjectStorageConfig,
) -> Result<Arc<dyn BlobStore>> {
    if let Some(root) = assets_uri.strip_prefix("file://") {
        return Ok(Arc::new(FsBlobStore::new(root).await?));
    }

    let uri = Url::parse(assets_uri)
        .map_err(|e| BlobStoreError::Invalid(format!("{}: {}", assets_uri, e)))?;

    match uri.scheme() {
        "s3" => Ok(Arc::new(S3BlobStore::s3(&uri, storage).await?)),
        "gs" => Ok(Arc::new(S3BlobStore::gcs(&uri, storage).await?)),
        other => Err(BlobStoreError::Invalid(format!(
            "unsupported blob store scheme: {}",
            other
        ))),
    }
}

/// Split a bucket URI (`s3://bucket/prefix`) into bucket and key prefix.
pub(crate) fn bucket_parts(uri: &Url) -> Result<(String, String)> {
    let bucket = uri
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| BlobStoreError::Invalid(format!("missing bucket in {}", uri)))?
        .to_string();
    let prefix = uri.path().trim_matches('/').to_string();
    Ok((bucket, prefix))
}

/// Join a relative object path under the bucket prefix.
///
/// Rejects empty paths, paths equal to the root, traversal segments and
/// results that do not stay under the prefix.
pub(crate) fn object_key(prefix: &str, path: &str) -> Result<String> {
    let path = path.trim_matches('/');
    if path.is_empty() {
        return Err(BlobStoreError::Invalid("empty object path".to_string()));
    }
    if path
        .split('/')
        .any(|seg| seg.is_empty() || seg == "." || seg == "..")
    {
        return Err(BlobStoreError::Invalid(format!(
            "object path escapes bucket root: {}",
            path
        )));
    }

    let key = if prefix.is_empty() {
        path.to_string()
    } else {
        format!("{}/{}", prefix, path)
    };

    if key == prefix || (!prefix.is_empty() && !key.starts_with(&format!("{}/", prefix))) {
        return Err(BlobStoreError::Invalid(format!(
            "object path escapes bucket root: {}",
            path
        )));
    }

    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_parts() {
        let (bucket, prefix) = bucket_parts(&Url::parse("s3://assets/gram/prod").unwrap()).unwrap();
        assert_eq!(bucket, "assets");
        assert_eq!(prefix, "gram/prod");

        let (bucket, prefix) = bucket_parts(&Url::parse("gs://assets").unwrap()).unwrap();
        assert_eq!(bucket, "assets");
        assert_eq!(prefix, "");
    }

    #[test]
    fn test_object_key() {
        assert_eq!(object_key("", "p/openapi-abc.yaml").unwrap(), "p/openapi-abc.yaml");
        assert_eq!(
            object_key("root", "p/openapi-abc.yaml").unwrap(),
            "root/p/openapi-abc.yaml"
        );
    }

    #[test]
    fn test_object_key_rejects_escapes() {
        assert!(matches!(object_key("root", ""), Err(BlobStoreError::Invalid(_))));
        assert!(matches!(object_key("root", "/"), Err(BlobStoreError::Invalid(_))));
        assert!(matches!(
            object_key("root", "../other/x"),
            Err(BlobStoreError::Invalid(_))
        ));
        assert!(matches!(
            object_key("root", "a//b"),
            Err(BlobStoreError::Invalid(_))
        ));
    }

    #[test]
    fn test_retryable() {
        assert!(BlobStoreError::Backend("503".into()).is_retryable());
        assert!(!BlobStoreError::NotFound("x".into()).is_retryable());
        assert!(!BlobStoreError::Unauthorized("x".into()).is_retryable());
    }
}
