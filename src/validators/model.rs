//! Model validators: size gate, STL detection, mesh decode, and complexity
//! caps.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use tracing::{debug, info, warn};

use super::HEADER_SNIFF_LEN;
use crate::mesh::{
    BINARY_STL_HEADER_LEN, BINARY_STL_TRIANGLE_LEN, TriMesh, looks_like_ascii_stl,
};
use crate::pipeline::{
    AssetContext, Metadata, ValidationErrorCode, ValidationPolicy, ValidationResult, Validator,
};

/// Signature detector: header bytes + total size -> MIME type.
pub type DetectorFn = fn(&[u8], u64) -> Option<&'static str>;

/// Detects STL files from the first header bytes and the total file size.
///
/// ASCII: the header begins with `solid` after whitespace and the first
/// 80 bytes contain no NUL byte. Binary: the little-endian u32 at offset 80
/// declares N triangles and the file holds at least `84 + 50*N` bytes.
/// Larger-than-declared files are accepted (some exporters append color
/// data); smaller files imply missing triangles.
#[must_use]
pub fn detect_stl(head: &[u8], file_size: u64) -> Option<&'static str> {
    if looks_like_ascii_stl(head) {
        return Some("model/stl");
    }

    let count_bytes: [u8; 4] = head.get(80..84)?.try_into().ok()?;
    let triangles = u64::from(u32::from_le_bytes(count_bytes));
    let min_expected = triangles
        .checked_mul(BINARY_STL_TRIANGLE_LEN)
        .and_then(|body| body.checked_add(BINARY_STL_HEADER_LEN))?;

    (file_size >= min_expected).then_some("model/stl")
}

/// Critical gate: rejects model files over the policy size cap before any
/// parsing happens.
pub struct FileSizeValidator;

impl Validator for FileSizeValidator {
    fn name(&self) -> &'static str {
        "FileSizeValidator"
    }

    fn is_critical(&self) -> bool {
        true
    }

    fn validate(&self, context: &AssetContext, policy: &ValidationPolicy) -> ValidationResult {
        let size = match std::fs::metadata(context.file_path()) {
            Ok(meta) => meta.len(),
            Err(e) => {
                return ValidationResult::invalid(
                    self.name(),
                    ValidationErrorCode::FileNotFound,
                    format!("cannot stat file: {e}"),
                );
            }
        };

        let size_mb = size as f64 / (1024.0 * 1024.0);
        if size_mb > policy.max_file_size_mb {
            warn!(
                trace_id = context.trace_id(),
                size_mb, limit_mb = policy.max_file_size_mb, "model file over size cap"
            );
            return ValidationResult::invalid(
                self.name(),
                ValidationErrorCode::FileTooLarge,
                format!(
                    "file size {size_mb:.2} MB exceeds the maximum allowed size of {} MB",
                    policy.max_file_size_mb
                ),
            );
        }

        ValidationResult::valid(self.name())
    }
}

/// Critical gate: is this a model format we can decode, by extension and
/// header signature, and does the policy allow it?
pub struct ModelFileTypeValidator {
    detectors: Vec<DetectorFn>,
    valid_extensions: Vec<&'static str>,
}

impl Default for ModelFileTypeValidator {
    fn default() -> Self {
        Self {
            // New formats plug in here.
            detectors: vec![detect_stl],
            valid_extensions: vec!["stl"],
        }
    }
}

impl Validator for ModelFileTypeValidator {
    fn name(&self) -> &'static str {
        "ModelFileTypeValidator"
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

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        if !self.valid_extensions.contains(&extension.as_str()) {
            return ValidationResult::invalid(
                self.name(),
                ValidationErrorCode::FileCorrupt,
                format!(
                    "invalid file extension '{extension}', expected one of: {}",
                    self.valid_extensions.join(", ")
                ),
            );
        }

        let (head, file_size) = match read_header_and_size(path) {
            Ok(parts) => parts,
            Err(e) => {
                return ValidationResult::invalid(
                    self.name(),
                    ValidationErrorCode::FileRead,
                    format!("read error: {e}"),
                );
            }
        };

        let detected = self
            .detectors
            .iter()
            .find_map(|detector| detector(&head, file_size));

        let Some(detected) = detected else {
            return ValidationResult::invalid(
                self.name(),
                ValidationErrorCode::FileCorrupt,
                "file type unsupported or header corrupt",
            );
        };

        debug!(trace_id = context.trace_id(), mime = detected, "model format identified");

        if !policy.allowed_types_for("model").iter().any(|m| m == detected) {
            return ValidationResult::invalid(
                self.name(),
                ValidationErrorCode::MimeMismatch,
                format!("format '{detected}' is valid but not allowed by policy"),
            );
        }

        let mut metadata = Metadata::new();
        metadata.insert("mime".to_string(), detected.into());
        ValidationResult::valid_with(self.name(), metadata)
    }
}

/// Collects the mesh facts persisted with the file record.
#[must_use]
pub fn mesh_metadata(mesh: &TriMesh) -> Metadata {
    let topology = mesh.topology();
    let mut metadata = Metadata::new();
    metadata.insert("vertices".to_string(), mesh.vertices.len().into());
    metadata.insert("faces".to_string(), mesh.faces.len().into());
    metadata.insert("triangles".to_string(), mesh.faces.len().into());
    metadata.insert("is_watertight".to_string(), topology.is_watertight.into());
    metadata.insert(
        "is_winding_consistent".to_string(),
        topology.is_winding_consistent.into(),
    );
    metadata.insert("euler_number".to_string(), mesh.euler_number().into());
    if let Some((min, max)) = mesh.bounds() {
        metadata.insert(
            "bounds".to_string(),
            serde_json::json!([
                [min[0], min[1], min[2]],
                [max[0], max[1], max[2]]
            ]),
        );
    }
    metadata
}

/// Critical gate: decodes the mesh (memoized on the context) and records its
/// structural facts.
pub struct MeshLoadValidator;

impl Validator for MeshLoadValidator {
    fn name(&self) -> &'static str {
        "MeshLoadValidator"
    }

    fn is_critical(&self) -> bool {
        true
    }

    fn validate(&self, context: &AssetContext, _policy: &ValidationPolicy) -> ValidationResult {
        debug!(trace_id = context.trace_id(), "attempting to load 3D mesh");

        let mesh = match context.mesh() {
            Ok(mesh) => mesh,
            Err(e) => {
                warn!(trace_id = context.trace_id(), error = %e, "failed to load mesh");
                return ValidationResult::invalid(
                    self.name(),
                    ValidationErrorCode::MeshLoadFailure,
                    format!(
                        "failed to load model mesh; contact support with reference {}",
                        context.trace_id()
                    ),
                );
            }
        };

        if mesh.is_empty() {
            warn!(trace_id = context.trace_id(), "mesh loaded but was empty");
            return ValidationResult::invalid(
                self.name(),
                ValidationErrorCode::FileCorrupt,
                "file parsing resulted in an empty mesh",
            );
        }

        let metadata = mesh_metadata(mesh);
        info!(trace_id = context.trace_id(), mesh = %mesh, "mesh loaded successfully");
        ValidationResult::valid_with(self.name(), metadata)
    }
}

/// Rejects meshes over the vertex/face complexity caps.
pub struct ModelComplexityValidator;

impl ModelComplexityValidator {
    fn check(mesh: &TriMesh, policy: &ValidationPolicy) -> Option<(ValidationErrorCode, String)> {
        if mesh.vertices.iter().flatten().any(|c| !c.is_finite()) {
            return Some((
                ValidationErrorCode::MeshIntegrityFailure,
                "model contains non-finite vertex coordinates".to_string(),
            ));
        }
        if mesh.is_empty() {
            return Some((
                ValidationErrorCode::FileCorrupt,
                "model contains no vertices or faces".to_string(),
            ));
        }
        if mesh.vertices.len() > policy.max_model_vertices {
            return Some((
                ValidationErrorCode::ModelTooComplex,
                format!("model contains too many vertices ({})", mesh.vertices.len()),
            ));
        }
        if mesh.faces.len() > policy.max_model_faces {
            return Some((
                ValidationErrorCode::ModelTooComplex,
                format!("model contains too many faces ({})", mesh.faces.len()),
            ));
        }
        None
    }
}

impl Validator for ModelComplexityValidator {
    fn name(&self) -> &'static str {
        "ModelComplexityValidator"
    }

    fn validate(&self, context: &AssetContext, policy: &ValidationPolicy) -> ValidationResult {
        let mesh = match context.mesh() {
            Ok(mesh) => mesh,
            Err(e) => {
                return ValidationResult::invalid(
                    self.name(),
                    ValidationErrorCode::MeshLoadFailure,
                    format!("failed to load mesh: {e}"),
                );
            }
        };

        if let Some((code, message)) = Self::check(mesh, policy) {
            info!(trace_id = context.trace_id(), %message, "model complexity validation failed");
            return ValidationResult::invalid(self.name(), code, message);
        }

        ValidationResult::valid(self.name())
    }
}

fn read_header_and_size(path: &Path) -> std::io::Result<(Vec<u8>, u64)> {
    let mut file = File::open(path)?;
    let size = file.metadata()?.len();
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
    Ok((buf, size))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::mesh::testutil::{binary_stl, tetrahedron};

    fn model_ctx(path: &Path) -> AssetContext {
        AssetContext::new(path, "trace-test", "model")
    }

    fn write_stl(dir: &TempDir, name: &str, bytes: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    // ==================== detect_stl ====================

    #[test]
    fn test_detect_stl_ascii() {
        let head = b"solid part\nfacet normal 0 0 1\n";
        assert_eq!(detect_stl(head, head.len() as u64), Some("model/stl"));
    }

    #[test]
    fn test_detect_stl_ascii_leading_whitespace() {
        let head = b"  \n\tsolid part\n";
        assert_eq!(detect_stl(head, head.len() as u64), Some("model/stl"));
    }

    #[test]
    fn test_detect_stl_solid_prefix_with_nul_falls_through_to_binary() {
        // A binary file whose header happens to start with "solid": the NUL
        // bytes force the binary size check, which fails for a short file.
        let mut head = b"solid".to_vec();
        head.resize(90, 0);
        assert_eq!(detect_stl(&head, 90), None);
    }

    #[test]
    fn test_detect_stl_binary_exact_size_accepted() {
        let mut head = vec![0u8; 84];
        head[80..84].copy_from_slice(&10u32.to_le_bytes());
        let exact = 84 + 50 * 10;
        assert_eq!(detect_stl(&head, exact), Some("model/stl"));
    }

    #[test]
    fn test_detect_stl_binary_one_byte_short_rejected() {
        let mut head = vec![0u8; 84];
        head[80..84].copy_from_slice(&10u32.to_le_bytes());
        let exact = 84 + 50 * 10;
        assert_eq!(detect_stl(&head, exact - 1), None);
    }

    #[test]
    fn test_detect_stl_binary_larger_than_declared_accepted() {
        let mut head = vec![0u8; 84];
        head[80..84].copy_from_slice(&2u32.to_le_bytes());
        assert_eq!(detect_stl(&head, 84 + 50 * 2 + 512), Some("model/stl"));
    }

    #[test]
    fn test_detect_stl_header_too_short() {
        assert_eq!(detect_stl(&[0u8; 40], 40), None);
    }

    #[test]
    fn test_detect_stl_max_count_does_not_overflow() {
        let mut head = vec![0u8; 84];
        head[80..84].copy_from_slice(&u32::MAX.to_le_bytes());
        assert_eq!(detect_stl(&head, u64::MAX), Some("model/stl"));
        assert_eq!(detect_stl(&head, 84), None);
    }

    // ==================== FileSizeValidator ====================

    #[test]
    fn test_file_size_within_limit() {
        let dir = TempDir::new().unwrap();
        let path = write_stl(&dir, "small.stl", &binary_stl(&tetrahedron()));
        let result = FileSizeValidator.validate(&model_ctx(&path), &ValidationPolicy::default());
        assert!(result.is_valid);
    }

    #[test]
    fn test_file_size_over_limit() {
        let dir = TempDir::new().unwrap();
        let path = write_stl(&dir, "big.stl", &vec![0u8; 2 * 1024 * 1024]);
        let mut policy = ValidationPolicy::default();
        policy.max_file_size_mb = 1.0;
        let result = FileSizeValidator.validate(&model_ctx(&path), &policy);
        assert!(!result.is_valid);
        assert_eq!(result.error_code, Some(ValidationErrorCode::FileTooLarge));
    }

    // ==================== ModelFileTypeValidator ====================

    #[test]
    fn test_model_file_type_accepts_binary_stl() {
        let dir = TempDir::new().unwrap();
        let path = write_stl(&dir, "part.stl", &binary_stl(&tetrahedron()));
        let result = ModelFileTypeValidator::default()
            .validate(&model_ctx(&path), &ValidationPolicy::default());
        assert!(result.is_valid, "{:?}", result.error_message);
        assert_eq!(
            result.metadata.get("mime").and_then(|v| v.as_str()),
            Some("model/stl")
        );
    }

    #[test]
    fn test_model_file_type_rejects_wrong_extension() {
        let dir = TempDir::new().unwrap();
        let path = write_stl(&dir, "part.obj", &binary_stl(&tetrahedron()));
        let result = ModelFileTypeValidator::default()
            .validate(&model_ctx(&path), &ValidationPolicy::default());
        assert!(!result.is_valid);
        assert_eq!(result.error_code, Some(ValidationErrorCode::FileCorrupt));
    }

    #[test]
    fn test_model_file_type_rejects_truncated_binary() {
        let dir = TempDir::new().unwrap();
        let mut bytes = binary_stl(&tetrahedron());
        bytes.truncate(bytes.len() - 1);
        let path = write_stl(&dir, "cut.stl", &bytes);
        let result = ModelFileTypeValidator::default()
            .validate(&model_ctx(&path), &ValidationPolicy::default());
        assert!(!result.is_valid);
        assert_eq!(result.error_code, Some(ValidationErrorCode::FileCorrupt));
    }

    #[test]
    fn test_model_file_type_policy_disallow() {
        let dir = TempDir::new().unwrap();
        let path = write_stl(&dir, "part.stl", &binary_stl(&tetrahedron()));
        let mut policy = ValidationPolicy::default();
        policy
            .allowed_file_types
            .insert("model".to_string(), vec!["model/gltf".to_string()]);
        let result = ModelFileTypeValidator::default().validate(&model_ctx(&path), &policy);
        assert!(!result.is_valid);
        assert_eq!(result.error_code, Some(ValidationErrorCode::MimeMismatch));
    }

    // ==================== MeshLoadValidator ====================

    #[test]
    fn test_mesh_load_collects_metadata() {
        let dir = TempDir::new().unwrap();
        let path = write_stl(&dir, "tet.stl", &binary_stl(&tetrahedron()));
        let result = MeshLoadValidator.validate(&model_ctx(&path), &ValidationPolicy::default());
        assert!(result.is_valid);
        assert_eq!(result.metadata.get("vertices").and_then(|v| v.as_u64()), Some(4));
        assert_eq!(result.metadata.get("faces").and_then(|v| v.as_u64()), Some(4));
        assert_eq!(
            result.metadata.get("is_watertight").and_then(|v| v.as_bool()),
            Some(true)
        );
        assert_eq!(
            result.metadata.get("euler_number").and_then(|v| v.as_i64()),
            Some(2)
        );
    }

    #[test]
    fn test_mesh_load_failure_mentions_trace_id() {
        let dir = TempDir::new().unwrap();
        let path = write_stl(&dir, "junk.stl", b"solid\ngarbage that is not facets\nvertex x");
        let result = MeshLoadValidator.validate(&model_ctx(&path), &ValidationPolicy::default());
        assert!(!result.is_valid);
        assert_eq!(result.error_code, Some(ValidationErrorCode::MeshLoadFailure));
        assert!(result.error_message.unwrap().contains("trace-test"));
    }

    // ==================== ModelComplexityValidator ====================

    #[test]
    fn test_complexity_within_limits() {
        let dir = TempDir::new().unwrap();
        let path = write_stl(&dir, "tet.stl", &binary_stl(&tetrahedron()));
        let result =
            ModelComplexityValidator.validate(&model_ctx(&path), &ValidationPolicy::default());
        assert!(result.is_valid);
    }

    #[test]
    fn test_complexity_too_many_faces() {
        let dir = TempDir::new().unwrap();
        let path = write_stl(&dir, "tet.stl", &binary_stl(&tetrahedron()));
        let mut policy = ValidationPolicy::default();
        policy.max_model_faces = 2;
        let result = ModelComplexityValidator.validate(&model_ctx(&path), &policy);
        assert!(!result.is_valid);
        assert_eq!(result.error_code, Some(ValidationErrorCode::ModelTooComplex));
    }

    #[test]
    fn test_complexity_too_many_vertices() {
        let dir = TempDir::new().unwrap();
        let path = write_stl(&dir, "tet.stl", &binary_stl(&tetrahedron()));
        let mut policy = ValidationPolicy::default();
        policy.max_model_vertices = 3;
        let result = ModelComplexityValidator.validate(&model_ctx(&path), &policy);
        assert!(!result.is_valid);
        assert_eq!(result.error_code, Some(ValidationErrorCode::ModelTooComplex));
    }
}
