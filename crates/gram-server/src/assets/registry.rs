// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Asset registry: upload pipeline, project-scoped serving and signed URLs.

use std::io::SeekFrom;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, error, info};
use url::Url;
use uuid::Uuid;

use super::{Asset, AssetKind, media_type};
use crate::blob_store::{BlobReader, BlobStore};
use crate::error::{Error, Result};
use crate::functions::archive::{self, ArchiveError};
use crate::tokens::AssetTokens;

/// Default lifetime of a signed chat attachment URL.
const DEFAULT_SIGNED_URL_TTL_SECS: i64 = 10 * 60;
/// Upper bound for a caller-requested lifetime.
const MAX_SIGNED_URL_TTL_SECS: i64 = 60 * 60;

/// Path of the unauthenticated signed attachment endpoint.
pub const SERVE_CHAT_ATTACHMENT_SIGNED_PATH: &str = "/rpc/assets.serveChatAttachmentSigned";

/// Asset metadata plus an open content stream.
pub struct ServedAsset {
    /// Asset metadata
    pub asset: Asset,
    /// Content stream
    pub body: BlobReader,
}

/// A signed, time-limited URL.
#[derive(Debug, Clone, Serialize)]
pub struct SignedUrl {
    /// URL including the `token` query parameter
    pub url: String,
    /// When the token stops being accepted
    pub expires_at: DateTime<Utc>,
}

/// Registry of content-addressed assets.
#[derive(Clone)]
pub struct AssetRegistry {
    pool: PgPool,
    store: Arc<dyn BlobStore>,
    tokens: AssetTokens,
    server_url: String,
}

impl AssetRegistry {
    /// Create a new asset registry.
    pub fn new(
        pool: PgPool,
        store: Arc<dyn BlobStore>,
        tokens: AssetTokens,
        server_url: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            store,
            tokens,
            server_url: server_url.into(),
        }
    }

    /// Underlying blob store.
    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    /// Store an upload, returning the existing asset when the project already
    /// holds identical content.
    pub async fn upload<R>(
        &self,
        project_id: Uuid,
        kind: AssetKind,
        content_type: &str,
        content_length: u64,
        body: R,
    ) -> Result<Asset>
    where
        R: AsyncRead + Unpin + Send,
    {
        if content_length == 0 {
            return Err(Error::BadRequest("no content".to_string()));
        }
        if content_length > kind.max_size() {
            return Err(Error::BadRequest(format!(
                "content length exceeds {} MiB limit",
                kind.max_size() / (1024 * 1024)
            )));
        }

        let media = media_type(content_type);
        if !kind.allowed_types().contains(&media.as_str()) {
            return Err(Error::UnsupportedMedia(format!(
                "unsupported content type: {} (allowed: {})",
                media,
                kind.allowed_types().join(", ")
            )));
        }

        let (mut staging, sha256) = stage(body, content_length).await?;

        if let Some(existing) = self.find_existing(project_id, &sha256).await? {
            debug!(asset_id = %existing.id, sha256 = %sha256, "Reusing existing asset");
            return Ok(existing);
        }

        if kind == AssetKind::Functions {
            let probe = staging.try_clone().await?.into_std().await;
            let validated = tokio::task::spawn_blocking(move || archive::validate_upload(probe))
                .await
                .map_err(|e| Error::Unexpected(format!("archive validation task failed: {}", e)))?;
            match validated {
                Ok(entrypoint) => debug!(entrypoint, "Functions archive validated"),
                Err(ArchiveError::NotZip(_)) => {
                    return Err(Error::BadRequest("not a valid zip file".to_string()));
                }
                Err(e) => return Err(Error::BadRequest(e.to_string())),
            }
            staging.seek(SeekFrom::Start(0)).await?;
        }

        let path = format!("{}/{}", project_id, kind.file_name(&sha256, &media));
        let (mut writer, url) = self.store.write(&path, &media, content_length).await?;
        writer.copy_from(&mut staging).await?;
        writer.finish().await?;

        let row: AssetRow = sqlx::query_as(
            r#"
            INSERT INTO assets (id, project_id, kind, url, sha256, content_type, content_length)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (project_id, sha256) DO UPDATE SET
                url = EXCLUDED.url,
                updated_at = NOW()
            RETURNING id, project_id, kind, url, sha256, content_type, content_length,
                      created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(project_id)
        .bind(kind.as_str())
        .bind(url.as_str())
        .bind(&sha256)
        .bind(&media)
        .bind(content_length as i64)
        .fetch_one(&self.pool)
        .await?;

        let asset = Asset::try_from(row)?;

        info!(
            asset_id = %asset.id,
            project_id = %project_id,
            kind = %kind,
            sha256 = %sha256,
            "Stored asset"
        );

        Ok(asset)
    }

    /// List a project's assets, newest first.
    pub async fn list(&self, project_id: Uuid) -> Result<Vec<Asset>> {
        let rows: Vec<AssetRow> = sqlx::query_as(
            r#"
            SELECT id, project_id, kind, url, sha256, content_type, content_length,
                   created_at, updated_at
            FROM assets
            WHERE project_id = $1
            ORDER BY created_at DESC, id
            "#,
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Asset::try_from).collect()
    }

    /// Get an asset owned by `project_id`.
    pub async fn get(&self, project_id: Uuid, asset_id: Uuid) -> Result<Option<Asset>> {
        let row: Option<AssetRow> = sqlx::query_as(
            r#"
            SELECT id, project_id, kind, url, sha256, content_type, content_length,
                   created_at, updated_at
            FROM assets
            WHERE id = $1 AND project_id = $2
            "#,
        )
        .bind(asset_id)
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Asset::try_from).transpose()
    }

    /// Open an asset of `kind` owned by `project_id`.
    pub async fn serve(
        &self,
        project_id: Uuid,
        asset_id: Uuid,
        kind: AssetKind,
    ) -> Result<ServedAsset> {
        let asset = self
            .get(project_id, asset_id)
            .await?
            .filter(|a| a.kind == kind)
            .ok_or_else(|| Error::NotFound("asset not found".to_string()))?;
        self.open(asset).await
    }

    /// Open an image asset. Images are public.
    pub async fn serve_image(&self, asset_id: Uuid) -> Result<ServedAsset> {
        let row: Option<AssetRow> = sqlx::query_as(
            r#"
            SELECT id, project_id, kind, url, sha256, content_type, content_length,
                   created_at, updated_at
            FROM assets
            WHERE id = $1 AND kind = 'image'
            "#,
        )
        .bind(asset_id)
        .fetch_optional(&self.pool)
        .await?;

        let asset = row
            .map(Asset::try_from)
            .transpose()?
            .ok_or_else(|| Error::NotFound("asset not found".to_string()))?;
        self.open(asset).await
    }

    /// Issue a signed URL for a chat attachment owned by `project_id`.
    ///
    /// A positive `ttl_seconds` overrides the 10 minute default, capped at
    /// one hour.
    pub async fn create_signed_chat_attachment_url(
        &self,
        project_id: Uuid,
        asset_id: Uuid,
        ttl_seconds: Option<i64>,
    ) -> Result<SignedUrl> {
        self.get(project_id, asset_id)
            .await?
            .filter(|a| a.kind == AssetKind::ChatAttachment)
            .ok_or_else(|| Error::NotFound("asset not found".to_string()))?;

        let ttl = match ttl_seconds {
            Some(secs) if secs > 0 => secs.min(MAX_SIGNED_URL_TTL_SECS),
            _ => DEFAULT_SIGNED_URL_TTL_SECS,
        };

        let (token, expires_at) = self
            .tokens
            .issue(asset_id, project_id, Duration::seconds(ttl))?;

        Ok(SignedUrl {
            url: format!(
                "{}{}?token={}",
                self.server_url.trim_end_matches('/'),
                SERVE_CHAT_ATTACHMENT_SIGNED_PATH,
                token
            ),
            expires_at,
        })
    }

    /// Open the chat attachment named by a signed token.
    pub async fn serve_chat_attachment_signed(&self, token: &str) -> Result<ServedAsset> {
        let claims = self.tokens.verify(token)?;
        self.serve(claims.project_id, claims.asset_id, AssetKind::ChatAttachment)
            .await
    }

    async fn open(&self, asset: Asset) -> Result<ServedAsset> {
        let url = Url::parse(&asset.url).map_err(|e| {
            error!(asset_id = %asset.id, url = %asset.url, error = %e, "Malformed asset url");
            Error::Unexpected("error loading asset".to_string())
        })?;

        if !self.store.exists(&url).await? {
            return Err(Error::NotFound("asset not found".to_string()));
        }

        let body = self.store.read(&url).await?;
        Ok(ServedAsset { asset, body })
    }

    async fn find_existing(&self, project_id: Uuid, sha256: &str) -> Result<Option<Asset>> {
        let row: Option<AssetRow> = sqlx::query_as(
            r#"
            SELECT id, project_id, kind, url, sha256, content_type, content_length,
                   created_at, updated_at
            FROM assets
            WHERE project_id = $1 AND sha256 = $2
            "#,
        )
        .bind(project_id)
        .bind(sha256)
        .fetch_optional(&self.pool)
        .await?;

        let Some(asset) = row.map(Asset::try_from).transpose()? else {
            return Ok(None);
        };

        let url = match Url::parse(&asset.url) {
            Ok(url) => url,
            Err(e) => {
                error!(asset_id = %asset.id, url = %asset.url, error = %e, "Malformed asset url");
                return Ok(None);
            }
        };

        match self.store.exists(&url).await {
            Ok(true) => Ok(Some(asset)),
            Ok(false) => Ok(None),
            Err(e) => {
                error!(asset_id = %asset.id, error = %e, "Failed to check if asset exists");
                Ok(None)
            }
        }
    }
}

/// Stream `body` into an anonymous temp file while hashing it.
///
/// Returns the file rewound to the start and the hex SHA-256. The byte count
/// must match `content_length` exactly.
async fn stage<R>(body: R, content_length: u64) -> Result<(tokio::fs::File, String)>
where
    R: AsyncRead + Unpin + Send,
{
    let mut staging = tokio::fs::File::from_std(tempfile::tempfile()?);
    let mut hasher = Sha256::new();
    let mut limited = body.take(content_length + 1);
    let mut buf = vec![0u8; 64 * 1024];
    let mut received = 0u64;

    loop {
        let n = limited.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        staging.write_all(&buf[..n]).await?;
        received += n as u64;
    }

    if received != content_length {
        return Err(Error::BadRequest(format!(
            "content length mismatch: declared {}, received {}",
            content_length, received
        )));
    }

    staging.flush().await?;
    staging.seek(SeekFrom::Start(0)).await?;
    Ok((staging, hex::encode(hasher.finalize())))
}

#[derive(sqlx::FromRow)]
struct AssetRow {
    id: Uuid,
    project_id: Uuid,
    kind: String,
    url: String,
    sha256: String,
    content_type: String,
    content_length: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<AssetRow> for Asset {
    type Error = Error;

    fn try_from(row: AssetRow) -> Result<Self> {
        Ok(Asset {
            kind: row.kind.parse().map_err(Error::InvariantViolation)?,
            id: row.id,
            project_id: row.project_id,
            url: row.url,
            sha256: row.sha256,
            content_type: row.content_type,
            content_length: row.content_length,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stage_hashes_and_rewinds() {
        let (mut file, sha) = stage(&b"hello"[..], 5).await.unwrap();
        assert_eq!(
            sha,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        let mut out = String::new();
        file.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn test_stage_rejects_length_mismatch() {
        assert!(matches!(
            stage(&b"hello"[..], 4).await,
            Err(Error::BadRequest(_))
        ));
        assert!(matches!(
            stage(&b"hi"[..], 5).await,
            Err(Error::BadRequest(_))
        ));
    }
}
