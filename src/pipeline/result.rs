//! Structured outcomes for validators and processors.
//!
//! Validators and processors never propagate errors past their boundary;
//! every failure is captured in one of these result types so the worker can
//! classify it exactly once.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Free-form key/value context attached to results and persisted with the
/// file record.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Fixed set of validator error codes.
///
/// These are stable identifiers surfaced to users and operators; new checks
/// must reuse an existing code or extend this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationErrorCode {
    /// Unclassified failure (crashed validator, unexpected state).
    Unknown,
    /// The file does not exist at the expected path.
    FileNotFound,
    /// The file exists but could not be read.
    FileRead,
    /// Detected MIME type is not allowed by policy.
    MimeMismatch,
    /// The file is structurally corrupt, truncated, or unidentifiable.
    FileCorrupt,
    /// Image dimensions exceed the policy limit.
    DimensionTooLarge,
    /// File size or decoded pixel count exceeds the policy limit.
    FileTooLarge,
    /// The 3D mesh could not be decoded.
    MeshLoadFailure,
    /// The decoded mesh violates structural expectations.
    MeshIntegrityFailure,
    /// The mesh exceeds vertex/face complexity caps.
    ModelTooComplex,
}

impl ValidationErrorCode {
    /// Returns the wire/database representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "ERR_UNKNOWN",
            Self::FileNotFound => "ERR_FILE_NOT_FOUND",
            Self::FileRead => "ERR_FILE_READ",
            Self::MimeMismatch => "ERR_MIME_MISMATCH",
            Self::FileCorrupt => "ERR_FILE_CORRUPT",
            Self::DimensionTooLarge => "ERR_DIMENSION_TOO_LARGE",
            Self::FileTooLarge => "ERR_FILE_TOO_LARGE",
            Self::MeshLoadFailure => "ERR_MESH_LOAD_FAILURE",
            Self::MeshIntegrityFailure => "ERR_MESH_INTEGRITY_FAILURE",
            Self::ModelTooComplex => "ERR_MODEL_TOO_COMPLEX",
        }
    }
}

impl fmt::Display for ValidationErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of a single validator run.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    /// Name of the validator that produced this result.
    pub validator_name: String,
    /// Whether the check passed.
    pub is_valid: bool,
    /// Error code when `is_valid` is false.
    pub error_code: Option<ValidationErrorCode>,
    /// Human-readable failure detail.
    pub error_message: Option<String>,
    /// Context captured regardless of pass/fail (dimensions, MIME, counts).
    pub metadata: Metadata,
    /// Wall time of the validator, attached by the pipeline executor.
    pub duration: Duration,
}

impl ValidationResult {
    /// Creates a passing result.
    #[must_use]
    pub fn valid(validator_name: impl Into<String>) -> Self {
        Self {
            validator_name: validator_name.into(),
            is_valid: true,
            error_code: None,
            error_message: None,
            metadata: Metadata::new(),
            duration: Duration::ZERO,
        }
    }

    /// Creates a passing result carrying metadata.
    #[must_use]
    pub fn valid_with(validator_name: impl Into<String>, metadata: Metadata) -> Self {
        Self {
            metadata,
            ..Self::valid(validator_name)
        }
    }

    /// Creates a failing result.
    #[must_use]
    pub fn invalid(
        validator_name: impl Into<String>,
        code: ValidationErrorCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            validator_name: validator_name.into(),
            is_valid: false,
            error_code: Some(code),
            error_message: Some(message.into()),
            metadata: Metadata::new(),
            duration: Duration::ZERO,
        }
    }

    /// Attaches metadata to a result (builder style).
    #[must_use]
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Output of the model processing stage: the validated original plus any
/// rendered preview images written next to it.
#[derive(Debug, Clone)]
pub struct ModelProcessingOutput {
    /// Path of the original model file on local disk.
    pub original_file: PathBuf,
    /// Paths of successfully rendered preview images.
    pub generated_image_paths: Vec<PathBuf>,
}

/// Outcome of a transform step.
///
/// `warning` is a non-fatal defect report (e.g. one of four render angles
/// failed); it never implies `success == false`.
#[derive(Debug, Clone)]
pub struct ProcessingResult<T> {
    /// Name of the processor that produced this result.
    pub processor_name: String,
    /// Whether the transform produced usable output.
    pub success: bool,
    /// The produced artifact(s), present iff `success`.
    pub output: Option<T>,
    /// Fatal failure detail, present iff not `success`.
    pub error_message: Option<String>,
    /// Non-fatal defect detail, persisted with the file record.
    pub warning: Option<String>,
    /// Context captured during processing.
    pub metadata: Metadata,
}

impl<T> ProcessingResult<T> {
    /// Creates a successful result.
    #[must_use]
    pub fn success(processor_name: impl Into<String>, output: T) -> Self {
        Self {
            processor_name: processor_name.into(),
            success: true,
            output: Some(output),
            error_message: None,
            warning: None,
            metadata: Metadata::new(),
        }
    }

    /// Creates a failed result.
    #[must_use]
    pub fn failure(processor_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            processor_name: processor_name.into(),
            success: false,
            output: None,
            error_message: Some(message.into()),
            warning: None,
            metadata: Metadata::new(),
        }
    }

    /// Attaches a non-fatal warning (builder style).
    #[must_use]
    pub fn with_warning(mut self, warning: Option<String>) -> Self {
        self.warning = warning;
        self
    }

    /// Attaches metadata (builder style).
    #[must_use]
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}
