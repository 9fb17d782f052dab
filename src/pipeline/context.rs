//! Per-job asset state shared across validators and processors.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::mesh::{self, MeshError, TriMesh};

/// State of the asset being validated.
///
/// Holds a path rather than file contents so nothing is read into memory
/// until a validator actually needs it. The decoded mesh is memoized: the
/// first reader pays the decode cost, every later reader (including the
/// parallel standard phase) sees the same immutable value.
pub struct AssetContext {
    file_path: PathBuf,
    trace_id: String,
    file_type_hint: String,
    mesh_cell: OnceLock<Result<TriMesh, MeshError>>,
}

impl AssetContext {
    /// Creates a context for one pipeline invocation.
    #[must_use]
    pub fn new(
        file_path: impl Into<PathBuf>,
        trace_id: impl Into<String>,
        file_type_hint: impl Into<String>,
    ) -> Self {
        Self {
            file_path: file_path.into(),
            trace_id: trace_id.into(),
            file_type_hint: file_type_hint.into(),
            mesh_cell: OnceLock::new(),
        }
    }

    /// Path of the local file under validation.
    #[must_use]
    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    /// Trace id for logging and user-facing error references.
    #[must_use]
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Declared file type (`image`, `model`).
    #[must_use]
    pub fn file_type_hint(&self) -> &str {
        &self.file_type_hint
    }

    /// Returns the decoded mesh, loading it on first access.
    ///
    /// Decode failures are memoized too, so a corrupt file is parsed once
    /// no matter how many validators ask for it.
    pub fn mesh(&self) -> Result<&TriMesh, &MeshError> {
        self.mesh_cell
            .get_or_init(|| mesh::load_stl(&self.file_path))
            .as_ref()
    }
}

impl std::fmt::Debug for AssetContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetContext")
            .field("file_path", &self.file_path)
            .field("trace_id", &self.trace_id)
            .field("file_type_hint", &self.file_type_hint)
            .field("mesh_loaded", &self.mesh_cell.get().is_some())
            .finish()
    }
}
