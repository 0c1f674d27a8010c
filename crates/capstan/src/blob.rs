//! Filesystem blob store for upload bytes
//!
//! Blobs live under `<root>/<YYYY-MM-DD>/<job-id>/<name>`. Writes go to a
//! temporary sibling first and are renamed into place so readers never see
//! a partial file. The SHA-256 of the content is computed during `put` and
//! handed back for the job record.

use chrono::Utc;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("invalid blob handle: {0}")]
    InvalidHandle(String),

    #[error("blob I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of storing a blob
#[derive(Debug, Clone, PartialEq)]
pub struct StoredBlob {
    /// Opaque handle, a path relative to the store root
    pub handle: String,
    /// Hex-encoded SHA-256 of the content
    pub sha256: String,
}

/// Content-hashed filesystem storage under a single root
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Handles are relative paths; reject anything that could escape the
    /// root.
    fn resolve(&self, handle: &str) -> Result<PathBuf, BlobError> {
        let rel = Path::new(handle);
        if rel.is_absolute()
            || rel
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(BlobError::InvalidHandle(handle.to_string()));
        }
        Ok(self.root.join(rel))
    }

    /// Store bytes and return the handle plus content hash.
    pub async fn put(
        &self,
        job_id: Uuid,
        name: &str,
        bytes: &[u8],
    ) -> Result<StoredBlob, BlobError> {
        let shard = Utc::now().format("%Y-%m-%d").to_string();
        let handle = format!("{}/{}/{}", shard, job_id, name);
        let path = self.resolve(&handle)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let sha256 = hex::encode(hasher.finalize());

        // Write-then-rename keeps the final path atomic on the same
        // filesystem.
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;

        Ok(StoredBlob { handle, sha256 })
    }

    pub async fn get(&self, handle: &str) -> Result<Vec<u8>, BlobError> {
        let path = self.resolve(handle)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobError::NotFound(handle.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Idempotent delete; removing a missing blob is not an error.
    pub async fn delete(&self, handle: &str) -> Result<(), BlobError> {
        let path = self.resolve(handle)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        // Drop the now-empty job directory; best effort.
        if let Some(parent) = path.parent() {
            let _ = tokio::fs::remove_dir(parent).await;
        }
        Ok(())
    }

    /// Whether the blob root is writable; used by health checks.
    pub async fn probe(&self) -> Result<(), BlobError> {
        tokio::fs::create_dir_all(&self.root).await?;
        let probe = self.root.join(".probe");
        tokio::fs::write(&probe, b"ok").await?;
        tokio::fs::remove_file(&probe).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let dir = tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        let id = Uuid::new_v4();

        let stored = store.put(id, "label.pdf", b"%PDF-1.4 test").await.unwrap();
        assert!(stored.handle.ends_with(&format!("{}/label.pdf", id)));

        let bytes = store.get(&stored.handle).await.unwrap();
        assert_eq!(bytes, b"%PDF-1.4 test");

        // The returned hash matches a fresh digest of the same bytes.
        let mut hasher = Sha256::new();
        hasher.update(b"%PDF-1.4 test");
        assert_eq!(stored.sha256, hex::encode(hasher.finalize()));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        let id = Uuid::new_v4();

        let stored = store.put(id, "a.pdf", b"bytes").await.unwrap();
        store.delete(&stored.handle).await.unwrap();
        store.delete(&stored.handle).await.unwrap();

        assert!(matches!(
            store.get(&stored.handle).await,
            Err(BlobError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_traversal_handles() {
        let dir = tempdir().unwrap();
        let store = BlobStore::new(dir.path());

        assert!(matches!(
            store.get("../etc/passwd").await,
            Err(BlobError::InvalidHandle(_))
        ));
        assert!(matches!(
            store.get("/etc/passwd").await,
            Err(BlobError::InvalidHandle(_))
        ));
    }

    #[tokio::test]
    async fn test_probe() {
        let dir = tempdir().unwrap();
        let store = BlobStore::new(dir.path().join("uploads"));
        store.probe().await.unwrap();
    }
}
