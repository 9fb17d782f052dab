//! Shared fixtures for the worker integration tests.

// Each test binary compiles this module and uses a different subset of it.
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use image::{ImageFormat, RgbImage};
use tempfile::TempDir;
use validation_worker::bus::{EventBus, InMemoryEventBus, MessageHandler, SubscribeOptions};
use validation_worker::pipeline::ValidationPolicy;
use validation_worker::provider::{FileProvider, ProviderError, ScopedFile};
use validation_worker::repository::InMemoryListingRepository;
use validation_worker::worker::{ValidationWorker, WorkerOptions};
use validation_worker::LocalFileProvider;

/// Ingress subject used across the scenario tests.
pub const INGRESS: &str = "validation.start";

/// Egress subject for activation events.
pub const INDEX_TOPIC: &str = "index_listing";

/// A worker wired against deterministic in-memory dependencies.
pub struct Harness {
    /// Keeps the storage root alive for the test's duration.
    pub dir: TempDir,
    pub provider: Arc<LocalFileProvider>,
    pub repo: Arc<InMemoryListingRepository>,
    pub bus: Arc<InMemoryEventBus>,
    pub worker: Arc<ValidationWorker>,
}

impl Harness {
    /// Builds a harness around an optional provider decorator (used to
    /// inject storage faults).
    pub async fn with_provider<P: FileProvider + 'static>(
        dir: TempDir,
        local: Arc<LocalFileProvider>,
        provider: Arc<P>,
    ) -> Self {
        let repo = Arc::new(InMemoryListingRepository::new());
        let bus = Arc::new(InMemoryEventBus::new(5));

        let repo_dep: Arc<dyn validation_worker::ListingRepository> = repo.clone();
        let bus_dep: Arc<dyn validation_worker::EventBus> = bus.clone();
        let worker = Arc::new(ValidationWorker::new(
            provider,
            repo_dep,
            bus_dep,
            ValidationPolicy::default(),
            WorkerOptions {
                concurrency: 4,
                ingress_topic: INGRESS.to_string(),
                index_topic: INDEX_TOPIC.to_string(),
                ..WorkerOptions::default()
            },
        ));

        bus.subscribe(
            INGRESS,
            Arc::clone(&worker) as Arc<dyn MessageHandler>,
            SubscribeOptions {
                max_in_flight: 4,
                manual_ack: true,
                on_failure: None,
            },
        )
        .await
        .unwrap();

        Self {
            dir,
            provider: local,
            repo,
            bus,
            worker,
        }
    }

    /// Builds the default harness over a local provider.
    pub async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let local = Arc::new(LocalFileProvider::new(dir.path()).unwrap());
        Self::with_provider(dir, Arc::clone(&local), local.clone()).await
    }

    /// Serialized ingress payload for a job.
    pub fn job_payload(file_id: &str, listing_id: &str, file_key: &str, file_type: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "trace_id": format!("trace-{file_id}"),
            "file_id": file_id,
            "listing_id": listing_id,
            "user_id": "u",
            "file_key": file_key,
            "file_type": file_type,
        }))
        .unwrap()
    }
}

/// Encoded JPEG bytes of a solid-color image.
pub fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, height, image::Rgb([200, 20, 20]));
    let mut out = std::io::Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Jpeg).unwrap();
    out.into_inner()
}

/// Encoded PNG bytes of a solid-color image.
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, height, image::Rgb([20, 200, 20]));
    let mut out = std::io::Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

/// Binary STL bytes for a unit tetrahedron (watertight, 4 faces).
pub fn tetrahedron_stl() -> Vec<u8> {
    let a = [0.0f32, 0.0, 0.0];
    let b = [1.0f32, 0.0, 0.0];
    let c = [0.0f32, 1.0, 0.0];
    let d = [0.0f32, 0.0, 1.0];
    let triangles: Vec<[[f32; 3]; 3]> = vec![[a, c, b], [a, b, d], [b, c, d], [a, d, c]];

    let mut out = vec![0u8; 80];
    out.extend_from_slice(&(triangles.len() as u32).to_le_bytes());
    for tri in &triangles {
        out.extend_from_slice(&[0u8; 12]);
        for v in tri {
            for coord in v {
                out.extend_from_slice(&coord.to_le_bytes());
            }
        }
        out.extend_from_slice(&[0u8; 2]);
    }
    out
}

/// Provider decorator that sabotages one render view: it plants a
/// directory where that view's output file would be written, so the
/// renderer's save fails for that view while the other views succeed.
pub struct ViewBlockingProvider {
    inner: Arc<LocalFileProvider>,
    view: &'static str,
    blocked: std::sync::Mutex<Option<std::path::PathBuf>>,
}

impl ViewBlockingProvider {
    pub fn new(inner: Arc<LocalFileProvider>, view: &'static str) -> Self {
        Self {
            inner,
            view,
            blocked: std::sync::Mutex::new(None),
        }
    }

    /// Path of the planted obstruction, for cleanup.
    pub fn blocked_path(&self) -> Option<std::path::PathBuf> {
        self.blocked.lock().unwrap().clone()
    }
}

#[async_trait]
impl FileProvider for ViewBlockingProvider {
    async fn get_file(&self, key: &str) -> Result<ScopedFile, ProviderError> {
        self.inner.get_file(key).await
    }

    async fn get_file_temp(&self, key: &str) -> Result<std::path::PathBuf, ProviderError> {
        let path = self.inner.get_file_temp(key).await?;
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("model")
            .to_string();
        let obstruction = path.with_file_name(format!("{stem}_{}.webp", self.view));
        std::fs::create_dir(&obstruction)
            .map_err(|e| ProviderError::io(obstruction.clone(), e))?;
        *self.blocked.lock().unwrap() = Some(obstruction);
        Ok(path)
    }

    async fn store_image(&self, source: &Path, dest_key: &str) -> Result<(), ProviderError> {
        self.inner.store_image(source, dest_key).await
    }

    async fn store_product_file(
        &self,
        source: &Path,
        dest_key: &str,
    ) -> Result<(), ProviderError> {
        self.inner.store_product_file(source, dest_key).await
    }
}

/// Provider decorator that fails the first N `store_image` calls.
pub struct FlakyStoreProvider {
    inner: Arc<LocalFileProvider>,
    failures_remaining: AtomicU32,
}

impl FlakyStoreProvider {
    pub fn new(inner: Arc<LocalFileProvider>, failures: u32) -> Self {
        Self {
            inner,
            failures_remaining: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl FileProvider for FlakyStoreProvider {
    async fn get_file(&self, key: &str) -> Result<ScopedFile, ProviderError> {
        self.inner.get_file(key).await
    }

    async fn store_image(&self, source: &Path, dest_key: &str) -> Result<(), ProviderError> {
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(ProviderError::backend(dest_key, "connection reset"));
        }
        self.inner.store_image(source, dest_key).await
    }

    async fn store_product_file(
        &self,
        source: &Path,
        dest_key: &str,
    ) -> Result<(), ProviderError> {
        self.inner.store_product_file(source, dest_key).await
    }
}
