//! Filesystem-backed provider for tests and local development.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::{
    FileProvider, INCOMING_FILES_BUCKET, PRODUCT_FILES_BUCKET, PUBLIC_FILES_BUCKET, ProviderError,
    ScopedFile, temp_file_for_key,
};

/// Provider rooted at a local directory, with one subdirectory per bucket.
///
/// Downloads copy the object into a temp file so scoped-cleanup semantics
/// match the S3 provider exactly; the stored "bucket" objects are never
/// handed out directly.
#[derive(Debug, Clone)]
pub struct LocalFileProvider {
    root: PathBuf,
}

impl LocalFileProvider {
    /// Creates a provider rooted at `root`, creating the bucket directories.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, ProviderError> {
        let root = root.into();
        for bucket in [
            INCOMING_FILES_BUCKET,
            PUBLIC_FILES_BUCKET,
            PRODUCT_FILES_BUCKET,
        ] {
            let dir = root.join(bucket);
            std::fs::create_dir_all(&dir).map_err(|e| ProviderError::io(dir, e))?;
        }
        Ok(Self { root })
    }

    /// Absolute path of an object within a bucket directory.
    #[must_use]
    pub fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.root.join(bucket).join(key)
    }

    /// Seeds an incoming object (test helper mirroring an upstream upload).
    pub fn put_incoming(&self, key: &str, bytes: &[u8]) -> Result<(), ProviderError> {
        let path = self.object_path(INCOMING_FILES_BUCKET, key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ProviderError::io(parent.to_path_buf(), e))?;
        }
        std::fs::write(&path, bytes).map_err(|e| ProviderError::io(path, e))
    }

    fn store(&self, bucket: &str, source: &Path, dest_key: &str) -> Result<(), ProviderError> {
        let dest = self.object_path(bucket, dest_key);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ProviderError::io(parent.to_path_buf(), e))?;
        }
        std::fs::copy(source, &dest).map_err(|e| ProviderError::io(dest.clone(), e))?;
        debug!(bucket, key = dest_key, "stored object locally");
        Ok(())
    }
}

#[async_trait]
impl FileProvider for LocalFileProvider {
    async fn get_file(&self, key: &str) -> Result<ScopedFile, ProviderError> {
        let source = self.object_path(INCOMING_FILES_BUCKET, key);
        if !source.exists() {
            return Err(ProviderError::not_found(key));
        }

        let tmp = temp_file_for_key(key).map_err(|e| ProviderError::io(&source, e))?;
        std::fs::copy(&source, tmp.path()).map_err(|e| ProviderError::io(&source, e))?;
        Ok(ScopedFile::new(tmp.into_temp_path()))
    }

    async fn store_image(&self, source: &Path, dest_key: &str) -> Result<(), ProviderError> {
        self.store(PUBLIC_FILES_BUCKET, source, dest_key)
    }

    async fn store_product_file(
        &self,
        source: &Path,
        dest_key: &str,
    ) -> Result<(), ProviderError> {
        self.store(PRODUCT_FILES_BUCKET, source, dest_key)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn test_get_file_copies_incoming_object() {
        let dir = TempDir::new().unwrap();
        let provider = LocalFileProvider::new(dir.path()).unwrap();
        provider.put_incoming("photo.jpg", b"jpeg bytes").unwrap();

        let scoped = provider.get_file("photo.jpg").await.unwrap();
        assert_eq!(std::fs::read(scoped.path()).unwrap(), b"jpeg bytes");
        assert_eq!(
            scoped.path().extension().and_then(|e| e.to_str()),
            Some("jpg")
        );

        let temp_path = scoped.path().to_path_buf();
        drop(scoped);
        assert!(!temp_path.exists());
    }

    #[tokio::test]
    async fn test_get_file_missing_key() {
        let dir = TempDir::new().unwrap();
        let provider = LocalFileProvider::new(dir.path()).unwrap();
        let err = provider.get_file("nope.jpg").await.unwrap_err();
        assert!(matches!(err, ProviderError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_get_file_temp_survives_scope() {
        let dir = TempDir::new().unwrap();
        let provider = LocalFileProvider::new(dir.path()).unwrap();
        provider.put_incoming("part.stl", b"stl bytes").unwrap();

        let path = provider.get_file_temp("part.stl").await.unwrap();
        assert!(path.exists());
        std::fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn test_store_image_lands_in_public_bucket() {
        let dir = TempDir::new().unwrap();
        let provider = LocalFileProvider::new(dir.path()).unwrap();

        let src = dir.path().join("out.webp");
        std::fs::write(&src, b"webp bytes").unwrap();
        provider.store_image(&src, "u/l/f.webp").await.unwrap();

        let stored = provider.object_path(PUBLIC_FILES_BUCKET, "u/l/f.webp");
        assert_eq!(std::fs::read(stored).unwrap(), b"webp bytes");
    }

    #[tokio::test]
    async fn test_store_product_file_lands_in_product_bucket() {
        let dir = TempDir::new().unwrap();
        let provider = LocalFileProvider::new(dir.path()).unwrap();

        let src = dir.path().join("part.stl");
        std::fs::write(&src, b"stl bytes").unwrap();
        provider
            .store_product_file(&src, "u/l/f.stl")
            .await
            .unwrap();

        let stored = provider.object_path(PRODUCT_FILES_BUCKET, "u/l/f.stl");
        assert_eq!(std::fs::read(stored).unwrap(), b"stl bytes");
    }
}
