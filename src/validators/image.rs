//! Image validators: header-based type detection, resolution limits, and
//! structural integrity.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use image::ImageReader;
use tracing::{debug, info, warn};

use super::HEADER_SNIFF_LEN;
use crate::pipeline::{
    AssetContext, Metadata, ValidationErrorCode, ValidationPolicy, ValidationResult, Validator,
};

/// Identifies an image MIME type from its leading bytes.
///
/// Covers the formats the policy can allow plus GIF, so a disallowed-but-real
/// image reports a MIME mismatch rather than an unidentified file.
#[must_use]
pub fn detect_image_mime(head: &[u8]) -> Option<&'static str> {
    if head.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some("image/jpeg");
    }
    if head.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        return Some("image/png");
    }
    if head.len() >= 12 && head.starts_with(b"RIFF") && &head[8..12] == b"WEBP" {
        return Some("image/webp");
    }
    if head.starts_with(b"GIF87a") || head.starts_with(b"GIF89a") {
        return Some("image/gif");
    }
    None
}

/// Critical gate: is this actually an image of an allowed format?
///
/// Works from the first 2 KiB only, so corrupt or adversarial files are
/// rejected before any decoder touches them.
pub struct FileTypeValidator;

impl Validator for FileTypeValidator {
    fn name(&self) -> &'static str {
        "FileTypeValidator"
    }

    fn is_critical(&self) -> bool {
        true
    }

    fn validate(&self, context: &AssetContext, policy: &ValidationPolicy) -> ValidationResult {
        let path = context.file_path();
        if !path.exists() {
            return ValidationResult::invalid(
                self.name(),
                ValidationErrorCode::FileNotFound,
                format!("no such file: {}", path.display()),
            );
        }

        let head = match read_header(path) {
            Ok(head) => head,
            Err(e) => {
                return ValidationResult::invalid(
                    self.name(),
                    ValidationErrorCode::FileRead,
                    format!("cannot read file: {e}"),
                );
            }
        };

        let Some(detected) = detect_image_mime(&head) else {
            warn!(
                trace_id = context.trace_id(),
                file = %path.display(),
                "no known image signature in header"
            );
            return ValidationResult::invalid(
                self.name(),
                ValidationErrorCode::FileCorrupt,
                "could not identify file type",
            );
        };

        let mut metadata = Metadata::new();
        metadata.insert("mime".to_string(), detected.into());

        let allowed = policy.allowed_types_for(context.file_type_hint());
        if !allowed.iter().any(|m| m == detected) {
            info!(
                trace_id = context.trace_id(),
                mime = detected,
                "detected MIME not allowed by policy"
            );
            return ValidationResult::invalid(
                self.name(),
                ValidationErrorCode::MimeMismatch,
                format!("invalid MIME: {detected}"),
            )
            .with_metadata(metadata);
        }

        debug!(trace_id = context.trace_id(), mime = detected, "valid MIME type detected");
        ValidationResult::valid_with(self.name(), metadata)
    }
}

/// Checks image dimensions against policy limits.
///
/// Reads only the header, never pixel data. The decompression-bomb guard
/// runs first so an absurd pixel count is reported as an oversized file, not
/// as an oversized dimension.
pub struct ResolutionValidator;

impl Validator for ResolutionValidator {
    fn name(&self) -> &'static str {
        "ResolutionValidator"
    }

    fn validate(&self, context: &AssetContext, policy: &ValidationPolicy) -> ValidationResult {
        let dimensions = ImageReader::open(context.file_path())
            .and_then(|r| r.with_guessed_format())
            .map_err(|e| e.to_string())
            .and_then(|r| r.into_dimensions().map_err(|e| e.to_string()));

        let (width, height) = match dimensions {
            Ok(dims) => dims,
            Err(e) => {
                return ValidationResult::invalid(
                    self.name(),
                    ValidationErrorCode::FileCorrupt,
                    format!("could not read image dimensions: {e}"),
                );
            }
        };

        let (max_w, max_h) = policy.max_image_resolution;
        let mut metadata = Metadata::new();
        metadata.insert("width".to_string(), width.into());
        metadata.insert("height".to_string(), height.into());
        metadata.insert("max_allowed".to_string(), format!("{max_w}x{max_h}").into());

        let pixels = u64::from(width) * u64::from(height);
        if pixels > policy.max_image_pixels {
            info!(
                trace_id = context.trace_id(),
                pixels,
                limit = policy.max_image_pixels,
                "decompression bomb guard triggered"
            );
            return ValidationResult::invalid(
                self.name(),
                ValidationErrorCode::FileTooLarge,
                format!(
                    "image contains {pixels} pixels, exceeding the safety limit of {}",
                    policy.max_image_pixels
                ),
            )
            .with_metadata(metadata);
        }

        if width > max_w || height > max_h {
            info!(
                trace_id = context.trace_id(),
                width, height, "image dimensions exceed policy"
            );
            return ValidationResult::invalid(
                self.name(),
                ValidationErrorCode::DimensionTooLarge,
                format!("image resolution {width}x{height} exceeds limit of {max_w}x{max_h}"),
            )
            .with_metadata(metadata);
        }

        debug!(trace_id = context.trace_id(), width, height, "resolution validated");
        ValidationResult::valid_with(self.name(), metadata)
    }
}

/// Verifies the image decodes fully, catching truncation and structural
/// corruption. Decodes pixel data, so it belongs in the standard phase.
pub struct ImageIntegrityValidator;

impl Validator for ImageIntegrityValidator {
    fn name(&self) -> &'static str {
        "ImageIntegrityValidator"
    }

    fn validate(&self, context: &AssetContext, _policy: &ValidationPolicy) -> ValidationResult {
        let decoded = ImageReader::open(context.file_path())
            .and_then(|r| r.with_guessed_format())
            .map_err(|e| e.to_string())
            .and_then(|r| r.decode().map_err(|e| e.to_string()));

        match decoded {
            Ok(_) => {
                debug!(trace_id = context.trace_id(), "integrity check passed");
                ValidationResult::valid(self.name())
            }
            Err(e) => {
                warn!(trace_id = context.trace_id(), error = %e, "integrity check failed");
                ValidationResult::invalid(
                    self.name(),
                    ValidationErrorCode::FileCorrupt,
                    "image file is corrupt, truncated, or unreadable",
                )
            }
        }
    }
}

fn read_header(path: &Path) -> std::io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    let mut buf = vec![0u8; HEADER_SNIFF_LEN];
    let mut filled = 0;
    loop {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
        if filled == buf.len() {
            break;
        }
    }
    buf.truncate(filled);
    Ok(buf)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Write;

    use image::{ImageFormat, RgbImage};
    use tempfile::TempDir;

    use super::*;

    fn write_jpeg(dir: &TempDir, name: &str, width: u32, height: u32) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let img = RgbImage::from_pixel(width, height, image::Rgb([200, 30, 30]));
        img.save_with_format(&path, ImageFormat::Jpeg).unwrap();
        path
    }

    fn write_png(dir: &TempDir, name: &str, width: u32, height: u32) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let img = RgbImage::from_pixel(width, height, image::Rgb([10, 200, 10]));
        img.save_with_format(&path, ImageFormat::Png).unwrap();
        path
    }

    fn image_ctx(path: &Path) -> AssetContext {
        AssetContext::new(path, "trace-test", "image")
    }

    #[test]
    fn test_detect_image_mime_signatures() {
        assert_eq!(detect_image_mime(&[0xFF, 0xD8, 0xFF, 0xE0]), Some("image/jpeg"));
        assert_eq!(
            detect_image_mime(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]),
            Some("image/png")
        );
        assert_eq!(detect_image_mime(b"RIFF\x00\x00\x00\x00WEBPVP8 "), Some("image/webp"));
        assert_eq!(detect_image_mime(b"GIF89a..."), Some("image/gif"));
        assert_eq!(detect_image_mime(b"plain text"), None);
    }

    #[test]
    fn test_file_type_validator_accepts_jpeg() {
        let dir = TempDir::new().unwrap();
        let path = write_jpeg(&dir, "ok.jpg", 32, 32);
        let result = FileTypeValidator.validate(&image_ctx(&path), &ValidationPolicy::default());
        assert!(result.is_valid, "{:?}", result.error_message);
        assert_eq!(
            result.metadata.get("mime").and_then(|v| v.as_str()),
            Some("image/jpeg")
        );
    }

    #[test]
    fn test_file_type_validator_rejects_text_named_jpg() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fake.jpg");
        std::fs::write(&path, b"definitely not an image").unwrap();
        let result = FileTypeValidator.validate(&image_ctx(&path), &ValidationPolicy::default());
        assert!(!result.is_valid);
        assert_eq!(result.error_code, Some(ValidationErrorCode::FileCorrupt));
    }

    #[test]
    fn test_file_type_validator_rejects_disallowed_format() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("anim.gif");
        let mut file = File::create(&path).unwrap();
        file.write_all(b"GIF89a").unwrap();
        let result = FileTypeValidator.validate(&image_ctx(&path), &ValidationPolicy::default());
        assert!(!result.is_valid);
        assert_eq!(result.error_code, Some(ValidationErrorCode::MimeMismatch));
    }

    #[test]
    fn test_file_type_validator_missing_file() {
        let ctx = AssetContext::new("/no/such/file.jpg", "trace", "image");
        let result = FileTypeValidator.validate(&ctx, &ValidationPolicy::default());
        assert!(!result.is_valid);
        assert_eq!(result.error_code, Some(ValidationErrorCode::FileNotFound));
    }

    #[test]
    fn test_resolution_validator_within_limits() {
        let dir = TempDir::new().unwrap();
        let path = write_png(&dir, "small.png", 60, 30);
        let result = ResolutionValidator.validate(&image_ctx(&path), &ValidationPolicy::default());
        assert!(result.is_valid);
        assert_eq!(result.metadata.get("width").and_then(|v| v.as_u64()), Some(60));
        assert_eq!(result.metadata.get("height").and_then(|v| v.as_u64()), Some(30));
    }

    #[test]
    fn test_resolution_validator_dimension_too_large() {
        let dir = TempDir::new().unwrap();
        let path = write_png(&dir, "wide.png", 128, 16);
        let mut policy = ValidationPolicy::default();
        policy.max_image_resolution = (100, 100);
        let result = ResolutionValidator.validate(&image_ctx(&path), &policy);
        assert!(!result.is_valid);
        assert_eq!(result.error_code, Some(ValidationErrorCode::DimensionTooLarge));
    }

    #[test]
    fn test_resolution_validator_bomb_reports_file_too_large() {
        let dir = TempDir::new().unwrap();
        let path = write_png(&dir, "bomb.png", 300, 300);
        let mut policy = ValidationPolicy::default();
        // Force both limits below the image so the bomb guard must win.
        policy.max_image_pixels = 10_000;
        policy.max_image_resolution = (100, 100);
        let result = ResolutionValidator.validate(&image_ctx(&path), &policy);
        assert!(!result.is_valid);
        assert_eq!(
            result.error_code,
            Some(ValidationErrorCode::FileTooLarge),
            "bomb must classify as FILE_TOO_LARGE, not dimension or unknown"
        );
    }

    #[test]
    fn test_integrity_validator_accepts_valid_image() {
        let dir = TempDir::new().unwrap();
        let path = write_jpeg(&dir, "ok.jpg", 40, 40);
        let result =
            ImageIntegrityValidator.validate(&image_ctx(&path), &ValidationPolicy::default());
        assert!(result.is_valid);
    }

    #[test]
    fn test_integrity_validator_rejects_truncated_image() {
        let dir = TempDir::new().unwrap();
        let path = write_jpeg(&dir, "cut.jpg", 64, 64);
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();
        let result =
            ImageIntegrityValidator.validate(&image_ctx(&path), &ValidationPolicy::default());
        assert!(!result.is_valid);
        assert_eq!(result.error_code, Some(ValidationErrorCode::FileCorrupt));
    }
}
