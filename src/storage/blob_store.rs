use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;

use crate::storage::{BlobPath, BlobStore, StorageError};

const FILE_SCHEME: &str = "file://";
const MEMORY_SCHEME: &str = "mem://";

/// Stores blobs as files under a root directory and hands out `file://` URLs.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self, StorageError> {
        std::fs::create_dir_all(root.as_ref())?;
        let root = std::fs::canonicalize(root.as_ref())?;
        tracing::debug!("Blob store rooted at {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, url: &str) -> Result<PathBuf, StorageError> {
        let path = url.strip_prefix(FILE_SCHEME)
            .map(PathBuf::from)
            .ok_or_else(|| StorageError::InvalidUrl(url.to_string()))?;
        let has_parent_refs = path.components().any(|c| matches!(c, std::path::Component::ParentDir));
        if has_parent_refs || !path.starts_with(&self.root) {
            return Err(StorageError::InvalidUrl(format!("{} is outside {}", url, self.root.display())));
        }
        Ok(path)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn upload(&self, bytes: &[u8], path: &BlobPath) -> Result<String, StorageError> {
        let target = self.root.join(path.as_str());
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = match tokio::fs::OpenOptions::new().write(true).create_new(true).open(&target).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(StorageError::AlreadyExists(path.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(bytes).await?;
        file.sync_all().await?;

        tracing::debug!("Stored {} bytes at {}", bytes.len(), target.display());
        Ok(format!("{}{}", FILE_SCHEME, target.display()))
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.resolve(url)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::NotFound(url.to_string())),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process blob store for development mode and tests.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    fail_uploads: AtomicBool,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent upload fail as if the backend were down.
    pub fn set_fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.blobs.lock()
            .map(|b| b.keys().cloned().collect())
            .unwrap_or_default();
        paths.sort();
        paths
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(&self, bytes: &[u8], path: &BlobPath) -> Result<String, StorageError> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("blob store is offline".into()));
        }
        let mut blobs = self.blobs.lock()
            .map_err(|_| StorageError::Unavailable("blob store lock poisoned".into()))?;
        if blobs.contains_key(path.as_str()) {
            return Err(StorageError::AlreadyExists(path.to_string()));
        }
        blobs.insert(path.as_str().to_string(), bytes.to_vec());
        Ok(format!("{}{}", MEMORY_SCHEME, path))
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, StorageError> {
        let key = url.strip_prefix(MEMORY_SCHEME)
            .ok_or_else(|| StorageError::InvalidUrl(url.to_string()))?;
        let blobs = self.blobs.lock()
            .map_err(|_| StorageError::Unavailable("blob store lock poisoned".into()))?;
        blobs.get(key).cloned().ok_or_else(|| StorageError::NotFound(url.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::Identity;
    use crate::storage::BlobPurpose;
    use chrono::Utc;
    use tempfile::TempDir;

    fn path(purpose: BlobPurpose) -> BlobPath {
        BlobPath::new(purpose, &Identity::new("emp-1").unwrap(), Utc::now())
    }

    #[tokio::test]
    async fn test_fs_upload_then_fetch() {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::new(dir.path()).unwrap();
        let path = path(BlobPurpose::Reference);

        let url = store.upload(b"jpeg-bytes", &path).await.unwrap();
        assert!(url.starts_with("file://"));
        assert!(url.ends_with(path.as_str()));
        assert_eq!(store.fetch(&url).await.unwrap(), b"jpeg-bytes");
    }

    #[tokio::test]
    async fn test_fs_blobs_are_write_once() {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::new(dir.path()).unwrap();
        let path = path(BlobPurpose::Attempt);

        store.upload(b"first", &path).await.unwrap();
        let err = store.upload(b"second", &path).await.unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_fs_rejects_urls_outside_root() {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::new(dir.path()).unwrap();

        assert!(matches!(store.fetch("file:///etc/passwd").await, Err(StorageError::InvalidUrl(_))));
        let sneaky = format!("file://{}/../x.jpg", store.root().display());
        assert!(matches!(store.fetch(&sneaky).await, Err(StorageError::InvalidUrl(_))));
        assert!(matches!(store.fetch("https://example.com/a.jpg").await, Err(StorageError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn test_memory_store_failure_injection() {
        let store = MemoryBlobStore::new();
        store.set_fail_uploads(true);
        assert!(matches!(store.upload(b"x", &path(BlobPurpose::Attempt)).await, Err(StorageError::Unavailable(_))));
        assert!(store.is_empty());

        store.set_fail_uploads(false);
        let url = store.upload(b"x", &path(BlobPurpose::Attempt)).await.unwrap();
        assert_eq!(store.fetch(&url).await.unwrap(), b"x");
    }
}
