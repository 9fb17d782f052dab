//! File providers: fetch incoming blobs to local disk, upload derived
//! artifacts.
//!
//! Downloads land in temp files whose suffix is derived from the object key,
//! so header detectors and extension gates see the same name shape they
//! would in production. [`ScopedFile`] ties cleanup to scope exit; the
//! caller-owned variant exists for the model flow, which writes sibling
//! files next to the source and cleans up the whole set itself.

mod local;
mod s3;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

pub use local::LocalFileProvider;
pub use s3::S3FileProvider;

/// Bucket for raw uploads awaiting validation.
pub const INCOMING_FILES_BUCKET: &str = "incoming-files";

/// Bucket for public derived artifacts (normalized images, renders).
pub const PUBLIC_FILES_BUCKET: &str = "public-files";

/// Bucket for validated original model files.
pub const PRODUCT_FILES_BUCKET: &str = "product-files";

/// Errors from storage operations. All of them are I/O flavored and treated
/// as transient by the worker.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The requested object does not exist.
    #[error("object not found: {key}")]
    NotFound {
        /// The object-store key that was requested.
        key: String,
    },

    /// Local filesystem failure while staging or reading a file.
    #[error("IO error for {path}: {source}")]
    Io {
        /// The local path involved.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The storage backend rejected or failed the operation.
    #[error("storage backend error for {key}: {message}")]
    Backend {
        /// The object-store key involved.
        key: String,
        /// Backend-reported detail.
        message: String,
    },
}

impl ProviderError {
    /// Creates a not-found error.
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Creates a local IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates a backend error.
    pub fn backend(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// A downloaded file that is unlinked when the guard leaves scope,
/// including during unwinding.
#[derive(Debug)]
pub struct ScopedFile {
    path: tempfile::TempPath,
}

impl ScopedFile {
    /// Wraps a temp path into a scoped guard.
    #[must_use]
    pub fn new(path: tempfile::TempPath) -> Self {
        Self { path }
    }

    /// The local path of the downloaded file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Disarms the guard, handing cleanup responsibility to the caller.
    pub fn into_owned(self) -> Result<PathBuf, ProviderError> {
        let display = self.path.to_path_buf();
        self.path
            .keep()
            .map_err(|e| ProviderError::io(display, e.error))
    }
}

impl AsRef<Path> for ScopedFile {
    fn as_ref(&self) -> &Path {
        self.path()
    }
}

/// Storage abstraction consumed by the worker.
#[async_trait]
pub trait FileProvider: Send + Sync {
    /// Downloads an incoming object to a fresh temp file; the file is
    /// removed when the returned guard drops.
    async fn get_file(&self, key: &str) -> Result<ScopedFile, ProviderError>;

    /// Downloads an incoming object to a temp file the caller must remove.
    async fn get_file_temp(&self, key: &str) -> Result<PathBuf, ProviderError> {
        self.get_file(key).await?.into_owned()
    }

    /// Uploads a derived public artifact.
    async fn store_image(&self, source: &Path, dest_key: &str) -> Result<(), ProviderError>;

    /// Uploads a validated original product file.
    async fn store_product_file(&self, source: &Path, dest_key: &str)
    -> Result<(), ProviderError>;
}

/// Builds a temp file whose suffix mirrors the key's extension.
pub(crate) fn temp_file_for_key(key: &str) -> std::io::Result<tempfile::NamedTempFile> {
    let mut builder = tempfile::Builder::new();
    let suffix = Path::new(key)
        .extension()
        .and_then(|e| e.to_str())
        .map(|ext| format!(".{ext}"));
    if let Some(suffix) = &suffix {
        builder.suffix(suffix);
    }
    builder.prefix("asset-").tempfile()
}
