// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Local filesystem blob store.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use url::Url;
use uuid::Uuid;

use super::{
    BlobReader, BlobStore, BlobStoreError, BlobWrite, BlobWriter, RandomAccess, Result, object_key,
};

/// Blob store rooted at a local directory.
///
/// All mutations (directory creation and publishing renames) are serialized
/// behind one lock.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl FsBlobStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        tokio::fs::create_dir_all(root.as_ref()).await?;
        let root = tokio::fs::canonicalize(root.as_ref()).await?;
        Ok(Self {
            root,
            lock: Arc::new(Mutex::new(())),
        })
    }

    /// Canonical root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, url: &Url) -> Result<PathBuf> {
        if url.scheme() != "file" {
            return Err(BlobStoreError::Invalid(format!(
                "expected file:// url, got {}",
                url.scheme()
            )));
        }
        let path = url
            .to_file_path()
            .map_err(|_| BlobStoreError::Invalid(format!("malformed file url: {}", url)))?;
        if path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
            || !path.starts_with(&self.root)
        {
            return Err(BlobStoreError::Unauthorized(url.to_string()));
        }
        Ok(path)
    }
}

fn not_found(url: &Url) -> impl FnOnce(std::io::Error) -> BlobStoreError + '_ {
    move |e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            BlobStoreError::NotFound(url.to_string())
        } else {
            BlobStoreError::Io(e)
        }
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    fn scheme(&self) -> &'static str {
        "file"
    }

    async fn exists(&self, url: &Url) -> Result<bool> {
        let path = self.path_for(url)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn read(&self, url: &Url) -> Result<BlobReader> {
        let path = self.path_for(url)?;
        let file = tokio::fs::File::open(&path).await.map_err(not_found(url))?;
        Ok(Box::pin(file))
    }

    async fn read_at(&self, url: &Url) -> Result<(Box<dyn RandomAccess>, u64)> {
        let path = self.path_for(url)?;
        let file = tokio::fs::File::open(&path).await.map_err(not_found(url))?;
        let size = file.metadata().await?.len();
        let file = file.into_std().await;
        Ok((Box::new(file), size))
    }

    async fn write(
        &self,
        path: &str,
        _content_type: &str,
        content_length: u64,
    ) -> Result<(BlobWriter, Url)> {
        let key = object_key("", path)?;
        let target = self.root.join(&key);
        let url = Url::from_file_path(&target)
            .map_err(|_| BlobStoreError::Invalid(format!("cannot build url for {}", key)))?;

        let parent = target
            .parent()
            .ok_or_else(|| BlobStoreError::Invalid(format!("no parent for {}", key)))?
            .to_path_buf();
        {
            let _guard = self.lock.lock().await;
            tokio::fs::create_dir_all(&parent).await?;
        }

        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let staging = parent.join(format!(".{}.{}.partial", file_name, Uuid::new_v4()));
        let file = tokio::fs::File::create(&staging).await?;

        let writer = FsWrite {
            file: Some(file),
            staging,
            target,
            lock: self.lock.clone(),
            published: false,
        };

        Ok((BlobWriter::new(Box::new(writer), content_length), url))
    }

    async fn presign_read(&self, url: &Url, _ttl: Duration) -> Result<Url> {
        self.path_for(url)?;
        Ok(url.clone())
    }
}

struct FsWrite {
    file: Option<tokio::fs::File>,
    staging: PathBuf,
    target: PathBuf,
    lock: Arc<Mutex<()>>,
    published: bool,
}

#[async_trait]
impl BlobWrite for FsWrite {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        match self.file.as_mut() {
            Some(file) => Ok(file.write_all(chunk).await?),
            None => Err(BlobStoreError::Invalid("writer already closed".to_string())),
        }
    }

    async fn finish(mut self: Box<Self>) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        let _guard = self.lock.lock().await;
        tokio::fs::rename(&self.staging, &self.target).await?;
        self.published = true;
        Ok(())
    }
}

impl Drop for FsWrite {
    fn drop(&mut self) {
        if !self.published {
            let _ = std::fs::remove_file(&self.staging);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_write_then_read() {
        let temp = TempDir::new().unwrap();
        let store = FsBlobStore::new(temp.path()).await.unwrap();

        let (mut writer, url) = store.write("p1/openapi-abc.yaml", "application/yaml", 5).await.unwrap();
        assert_eq!(url.scheme(), "file");
        assert!(!store.exists(&url).await.unwrap());

        writer.write_chunk(b"hello").await.unwrap();
        writer.finish().await.unwrap();

        assert!(store.exists(&url).await.unwrap());
        let mut reader = store.read(&url).await.unwrap();
        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello");

        let (mut ra, size) = store.read_at(&url).await.unwrap();
        assert_eq!(size, 5);
        let mut buf = String::new();
        std::io::Read::read_to_string(&mut ra, &mut buf).unwrap();
        assert_eq!(buf, "hello");
    }

    #[tokio::test]
    async fn test_dropped_writer_leaves_nothing() {
        let temp = TempDir::new().unwrap();
        let store = FsBlobStore::new(temp.path()).await.unwrap();

        let (mut writer, url) = store.write("p1/file.bin", "application/zip", 3).await.unwrap();
        writer.write_chunk(b"abc").await.unwrap();
        drop(writer);

        assert!(!store.exists(&url).await.unwrap());
        let entries: Vec<_> = std::fs::read_dir(temp.path().join("p1")).unwrap().collect();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_length_mismatch_is_rejected() {
        let temp = TempDir::new().unwrap();
        let store = FsBlobStore::new(temp.path()).await.unwrap();

        let (mut writer, url) = store.write("p1/file.bin", "text/plain", 10).await.unwrap();
        writer.write_chunk(b"abc").await.unwrap();
        assert!(matches!(writer.finish().await, Err(BlobStoreError::Invalid(_))));
        assert!(!store.exists(&url).await.unwrap());
    }

    #[tokio::test]
    async fn test_read_missing_is_not_found() {
        let temp = TempDir::new().unwrap();
        let store = FsBlobStore::new(temp.path()).await.unwrap();
        let url = Url::from_file_path(store.root().join("nope.txt")).unwrap();

        assert!(matches!(store.read(&url).await, Err(BlobStoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_rejects_paths_outside_root() {
        let temp = TempDir::new().unwrap();
        let store = FsBlobStore::new(temp.path().join("root")).await.unwrap();

        let outside = Url::parse("file:///etc/passwd").unwrap();
        assert!(matches!(
            store.exists(&outside).await,
            Err(BlobStoreError::Unauthorized(_))
        ));
        assert!(matches!(
            store.write("../escape.txt", "text/plain", 1).await,
            Err(BlobStoreError::Invalid(_))
        ));
        assert!(matches!(
            store.write("", "text/plain", 1).await,
            Err(BlobStoreError::Invalid(_))
        ));
        let s3 = Url::parse("s3://bucket/key").unwrap();
        assert!(matches!(store.read(&s3).await, Err(BlobStoreError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_presign_returns_same_url() {
        let temp = TempDir::new().unwrap();
        let store = FsBlobStore::new(temp.path()).await.unwrap();
        let url = Url::from_file_path(store.root().join("a.txt")).unwrap();
        let signed = store.presign_read(&url, Duration::from_secs(600)).await.unwrap();
        assert_eq!(signed, url);
    }
}
