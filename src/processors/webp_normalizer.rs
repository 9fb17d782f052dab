//! Image sanitizer: re-encodes uploads as WebP.
//!
//! Re-encoding strips all metadata (EXIF, ICC, comments). The EXIF
//! orientation is the one thing worth keeping, so it is applied to the
//! pixels before the metadata is dropped.

use std::path::PathBuf;

use image::{DynamicImage, ImageDecoder, ImageReader};
use tracing::{debug, info, warn};

use crate::pipeline::{AssetContext, Metadata, ProcessingResult, Processor};

/// Default lossy encoding quality (0-100).
const DEFAULT_QUALITY: f32 = 85.0;

/// Normalizes any allowed input image into a web-safe WebP file written next
/// to the source.
pub struct WebpNormalizer {
    quality: f32,
}

impl Default for WebpNormalizer {
    fn default() -> Self {
        Self {
            quality: DEFAULT_QUALITY,
        }
    }
}

impl WebpNormalizer {
    /// Creates a normalizer with an explicit quality (clamped to 0-100).
    #[must_use]
    pub fn new(quality: f32) -> Self {
        Self {
            quality: quality.clamp(0.0, 100.0),
        }
    }

    fn convert(&self, context: &AssetContext) -> Result<(PathBuf, Metadata), String> {
        let source = context.file_path();
        let output_path = source.with_file_name(format!(
            "{}_normalized.webp",
            source.file_stem().and_then(|s| s.to_str()).unwrap_or("image")
        ));

        let reader = ImageReader::open(source)
            .map_err(|e| format!("cannot open image: {e}"))?
            .with_guessed_format()
            .map_err(|e| format!("cannot probe image format: {e}"))?;

        let format = reader.format();
        let mut decoder = reader
            .into_decoder()
            .map_err(|e| format!("cannot decode image: {e}"))?;

        // Read the orientation before the decoder is consumed; it is baked
        // into the pixels below so the metadata can be dropped safely.
        let orientation = decoder.orientation().ok();

        let mut img = DynamicImage::from_decoder(decoder)
            .map_err(|e| format!("cannot decode image: {e}"))?;

        if let Some(orientation) = orientation {
            img.apply_orientation(orientation);
        }

        let original_color = img.color();
        let (data, width, height) = if original_color.has_alpha() {
            let rgba = img.to_rgba8();
            let (w, h) = rgba.dimensions();
            let encoded = webp::Encoder::from_rgba(&rgba, w, h).encode(self.quality);
            (encoded.to_vec(), w, h)
        } else {
            // Everything without alpha (including exotic decoded modes)
            // flattens to RGB.
            let rgb = img.to_rgb8();
            let (w, h) = rgb.dimensions();
            let encoded = webp::Encoder::from_rgb(&rgb, w, h).encode(self.quality);
            (encoded.to_vec(), w, h)
        };

        std::fs::write(&output_path, &data)
            .map_err(|e| format!("cannot write WebP output: {e}"))?;

        debug!(
            trace_id = context.trace_id(),
            output = %output_path.display(),
            width,
            height,
            "image normalized to WebP"
        );

        let mut metadata = Metadata::new();
        if let Some(format) = format {
            metadata.insert(
                "original_format".to_string(),
                format.extensions_str().first().copied().unwrap_or("unknown").into(),
            );
        }
        metadata.insert("original_color".to_string(), format!("{original_color:?}").into());
        metadata.insert("new_format".to_string(), "webp".into());
        metadata.insert("width".to_string(), width.into());
        metadata.insert("height".to_string(), height.into());

        Ok((output_path, metadata))
    }
}

impl Processor for WebpNormalizer {
    type Output = PathBuf;

    fn name(&self) -> &'static str {
        "WebpNormalizer"
    }

    fn process(&self, context: &AssetContext) -> ProcessingResult<PathBuf> {
        match self.convert(context) {
            Ok((path, metadata)) => {
                info!(
                    trace_id = context.trace_id(),
                    output = %path.display(),
                    "image sanitized and converted"
                );
                ProcessingResult::success(self.name(), path).with_metadata(metadata)
            }
            Err(message) => {
                warn!(trace_id = context.trace_id(), %message, "normalization failed");
                ProcessingResult::failure(self.name(), format!("failed to convert to WebP: {message}"))
            }
        }
    }
}
