// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! S3 blob store, also used for GCS through its interoperability endpoint.

use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::info;
use url::Url;

use super::{
    BlobReader, BlobStore, BlobStoreError, BlobWrite, BlobWriter, RandomAccess, Result,
    bucket_parts, object_key,
};
use crate::config::ObjectStorageConfig;

const GCS_ENDPOINT: &str = "https://storage.googleapis.com";

/// Blob store backed by an S3-compatible bucket.
#[derive(Clone)]
pub struct S3BlobStore {
    client: Client,
    scheme: &'static str,
    bucket: String,
    prefix: String,
}

impl std::fmt::Debug for S3BlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3BlobStore")
            .field("scheme", &self.scheme)
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl S3BlobStore {
    /// Connect to the `s3://bucket/prefix` in `uri` using the default AWS
    /// credential chain.
    pub async fn s3(uri: &Url, storage: &ObjectStorageConfig) -> Result<Self> {
        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(storage.region.clone()))
            .load()
            .await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(ep) = &storage.endpoint_url {
            builder = builder.endpoint_url(ep);
        }
        if storage.force_path_style {
            builder = builder.force_path_style(true);
        }

        let store = Self::with_client(Client::from_conf(builder.build()), uri, "s3")?;
        info!(bucket = %store.bucket, prefix = %store.prefix, "S3 blob store initialized");
        Ok(store)
    }

    /// Connect to the `gs://bucket/prefix` in `uri` through the GCS XML API
    /// with HMAC credentials.
    pub async fn gcs(uri: &Url, storage: &ObjectStorageConfig) -> Result<Self> {
        let (Some(access_key), Some(secret)) = (
            storage.gcs_hmac_access_key.as_ref(),
            storage.gcs_hmac_secret.as_ref(),
        ) else {
            return Err(BlobStoreError::Invalid(
                "gs:// assets require GRAM_GCS_HMAC_ACCESS_KEY and GRAM_GCS_HMAC_SECRET"
                    .to_string(),
            ));
        };

        let credentials = Credentials::new(access_key, secret, None, None, "gcs-hmac");
        let conf = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("auto"))
            .endpoint_url(GCS_ENDPOINT)
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        let store = Self::with_client(Client::from_conf(conf), uri, "gs")?;
        info!(bucket = %store.bucket, prefix = %store.prefix, "GCS blob store initialized");
        Ok(store)
    }

    pub(crate) fn with_client(
        client: Client,
        uri: &Url,
        scheme: &'static str,
    ) -> Result<Self> {
        let (bucket, prefix) = bucket_parts(uri)?;
        Ok(Self {
            client,
            scheme,
            bucket,
            prefix,
        })
    }

    fn bucket_uri(&self) -> String {
        if self.prefix.is_empty() {
            format!("{}://{}", self.scheme, self.bucket)
        } else {
            format!("{}://{}/{}", self.scheme, self.bucket, self.prefix)
        }
    }

    /// Object key for a stored URL; the URL must live under the bucket URI.
    fn key_for(&self, url: &Url) -> Result<String> {
        if url.scheme() != self.scheme || url.host_str() != Some(self.bucket.as_str()) {
            return Err(self.outside(url));
        }

        // Path-style URLs repeat the bucket as the first segment.
        let mut path = url.path().trim_start_matches('/');
        if let Some(rest) = path.strip_prefix(&format!("{}/", self.bucket)) {
            path = rest;
        }

        let relative = if self.prefix.is_empty() {
            path
        } else {
            path.strip_prefix(&format!("{}/", self.prefix))
                .ok_or_else(|| self.outside(url))?
        };

        object_key(&self.prefix, relative)
    }

    fn outside(&self, url: &Url) -> BlobStoreError {
        BlobStoreError::Unauthorized(format!("{} is outside {}", url, self.bucket_uri()))
    }

    fn url_for(&self, key: &str) -> Result<Url> {
        let raw = format!("{}://{}/{}", self.scheme, self.bucket, key);
        Url::parse(&raw).map_err(|e| BlobStoreError::Invalid(format!("{}: {}", raw, e)))
    }
}

fn classify<E>(url: &str, err: SdkError<E, HttpResponse>) -> BlobStoreError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let status = err.raw_response().map(|r| r.status().as_u16());
    let code = err.as_service_error().and_then(|e| e.code());
    if status == Some(404) || matches!(code, Some("NotFound" | "NoSuchKey")) {
        return BlobStoreError::NotFound(url.to_string());
    }
    if status == Some(403) {
        return BlobStoreError::Unauthorized(url.to_string());
    }
    BlobStoreError::Backend(format!("{}: {}", url, DisplayErrorContext(&err)))
}

#[async_trait]
impl BlobStore for S3BlobStore {
    fn scheme(&self) -> &'static str {
        self.scheme
    }

    async fn exists(&self, url: &Url) -> Result<bool> {
        let key = self.key_for(url)?;
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => match classify(url.as_str(), e) {
                BlobStoreError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn read(&self, url: &Url) -> Result<BlobReader> {
        let key = self.key_for(url)?;
        let obj = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| classify(url.as_str(), e))?;
        Ok(Box::pin(obj.body.into_async_read()))
    }

    async fn read_at(&self, url: &Url) -> Result<(Box<dyn RandomAccess>, u64)> {
        let mut reader = self.read(url).await?;
        let mut file = tokio::fs::File::from_std(tempfile::tempfile()?);
        let size = tokio::io::copy(&mut reader, &mut file).await?;
        file.flush().await?;
        file.seek(std::io::SeekFrom::Start(0)).await?;
        Ok((Box::new(file.into_std().await), size))
    }

    async fn write(
        &self,
        path: &str,
        content_type: &str,
        content_length: u64,
    ) -> Result<(BlobWriter, Url)> {
        let key = object_key(&self.prefix, path)?;
        let url = self.url_for(&key)?;

        let staging = tempfile::NamedTempFile::new()?;
        let file = tokio::fs::File::from_std(staging.reopen()?);

        let writer = S3Write {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key,
            content_type: content_type.to_string(),
            file,
            staging,
        };

        Ok((BlobWriter::new(Box::new(writer), content_length), url))
    }

    async fn presign_read(&self, url: &Url, ttl: Duration) -> Result<Url> {
        let key = self.key_for(url)?;
        let config = PresigningConfig::expires_in(ttl)
            .map_err(|e| BlobStoreError::Invalid(format!("presign ttl: {}", e)))?;
        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .presigned(config)
            .await
            .map_err(|e| classify(url.as_str(), e))?;
        Url::parse(presigned.uri())
            .map_err(|e| BlobStoreError::Backend(format!("presigned url: {}", e)))
    }
}

struct S3Write {
    client: Client,
    bucket: String,
    key: String,
    content_type: String,
    file: tokio::fs::File,
    staging: tempfile::NamedTempFile,
}

#[async_trait]
impl BlobWrite for S3Write {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        Ok(self.file.write_all(chunk).await?)
    }

    async fn finish(mut self: Box<Self>) -> Result<()> {
        self.file.flush().await?;
        self.file.sync_all().await?;

        let body = ByteStream::from_path(self.staging.path())
            .await
            .map_err(|e| BlobStoreError::Backend(format!("staging file: {}", e)))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .content_type(&self.content_type)
            .body(body)
            .send()
            .await
            .map_err(|e| classify(&self.key, e))?;

        info!(bucket = %self.bucket, key = %self.key, "Object uploaded");
        Ok(())
    }
}
