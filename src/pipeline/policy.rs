//! Validation policy shared read-only by all workers.

use std::collections::HashMap;
use std::time::Duration;

/// Default maximum file size for model files, in megabytes.
const DEFAULT_MAX_FILE_SIZE_MB: f64 = 100.0;

/// Default vertex cap for 3D models.
const DEFAULT_MAX_MODEL_VERTICES: usize = 1_000_000;

/// Default face cap for 3D models.
const DEFAULT_MAX_MODEL_FACES: usize = 500_000;

/// Default wall-time budget after which the pipeline logs a slow-run warning.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default maximum image dimensions (width, height).
const DEFAULT_MAX_IMAGE_RESOLUTION: (u32, u32) = (4096, 4096);

/// Default decoded-pixel cap. An encoded image whose pixel count exceeds
/// this is treated as a decompression bomb.
const DEFAULT_MAX_IMAGE_PIXELS: u64 = 89_478_485;

/// Immutable validation limits applied to every job.
///
/// Constructed once at startup and shared by reference; validators read it,
/// never mutate it.
#[derive(Debug, Clone)]
pub struct ValidationPolicy {
    /// Maximum model file size in megabytes.
    pub max_file_size_mb: f64,
    /// Maximum vertex count for a decoded mesh.
    pub max_model_vertices: usize,
    /// Maximum face count for a decoded mesh.
    pub max_model_faces: usize,
    /// Pipeline wall-time budget; exceeding it logs a warning, it does not
    /// abort the run.
    pub timeout: Duration,
    /// Allowed MIME types per file-type hint (`image`, `model`).
    pub allowed_file_types: HashMap<String, Vec<String>>,
    /// Maximum image dimensions as (width, height).
    pub max_image_resolution: (u32, u32),
    /// Maximum decoded pixel count before an image is rejected as a
    /// decompression bomb.
    pub max_image_pixels: u64,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        let mut allowed_file_types = HashMap::new();
        allowed_file_types.insert(
            "image".to_string(),
            vec![
                "image/jpeg".to_string(),
                "image/png".to_string(),
                "image/webp".to_string(),
            ],
        );
        allowed_file_types.insert(
            "model".to_string(),
            vec![
                "model/stl".to_string(),
                "application/octet-stream".to_string(),
            ],
        );

        Self {
            max_file_size_mb: DEFAULT_MAX_FILE_SIZE_MB,
            max_model_vertices: DEFAULT_MAX_MODEL_VERTICES,
            max_model_faces: DEFAULT_MAX_MODEL_FACES,
            timeout: DEFAULT_TIMEOUT,
            allowed_file_types,
            max_image_resolution: DEFAULT_MAX_IMAGE_RESOLUTION,
            max_image_pixels: DEFAULT_MAX_IMAGE_PIXELS,
        }
    }
}

impl ValidationPolicy {
    /// Returns the allowed MIME types for a file-type hint, or an empty
    /// slice when the hint is unknown.
    #[must_use]
    pub fn allowed_types_for(&self, hint: &str) -> &[String] {
        self.allowed_file_types
            .get(hint)
            .map_or(&[], Vec::as_slice)
    }
}
