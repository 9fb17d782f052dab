//! Indexed triangle mesh and STL decoding.
//!
//! The loader accepts both ASCII and binary STL. Vertices are deduplicated
//! into an indexed mesh so structural queries (watertightness, winding
//! consistency, Euler number) are meaningful; raw STL stores one vertex
//! triple per facet with no connectivity.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;

use thiserror::Error;

/// Binary STL layout: 80-byte header + 4-byte triangle count.
pub const BINARY_STL_HEADER_LEN: u64 = 84;

/// Binary STL layout: bytes per triangle record (normal + 3 vertices + attr).
pub const BINARY_STL_TRIANGLE_LEN: u64 = 50;

/// Errors produced while decoding a mesh file.
#[derive(Debug, Error)]
pub enum MeshError {
    /// The file could not be read.
    #[error("failed to read mesh file: {0}")]
    Io(#[from] std::io::Error),

    /// The bytes do not form a recognizable STL body.
    #[error("malformed STL data: {reason}")]
    Malformed {
        /// What was wrong with the data.
        reason: String,
    },

    /// The file parsed but contained no usable geometry.
    #[error("mesh contains no triangles")]
    Empty,
}

impl MeshError {
    fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }
}

/// An indexed triangle mesh.
#[derive(Debug, Clone, Default)]
pub struct TriMesh {
    /// Unique vertex positions.
    pub vertices: Vec<[f32; 3]>,
    /// Triangles as indices into `vertices`.
    pub faces: Vec<[u32; 3]>,
}

/// Connectivity-derived structural properties of a mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshTopology {
    /// Number of distinct undirected edges.
    pub edge_count: usize,
    /// True when every edge is shared by exactly two faces.
    pub is_watertight: bool,
    /// True when every shared edge is traversed in opposite directions by
    /// its two faces.
    pub is_winding_consistent: bool,
}

impl TriMesh {
    /// Returns true when the mesh has no vertices or no faces.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty() || self.faces.is_empty()
    }

    /// Axis-aligned bounds as (min, max), or `None` for an empty mesh.
    #[must_use]
    pub fn bounds(&self) -> Option<([f32; 3], [f32; 3])> {
        let mut iter = self.vertices.iter();
        let first = *iter.next()?;
        let mut min = first;
        let mut max = first;
        for v in iter {
            for axis in 0..3 {
                min[axis] = min[axis].min(v[axis]);
                max[axis] = max[axis].max(v[axis]);
            }
        }
        Some((min, max))
    }

    /// Geometric center of the bounding box.
    #[must_use]
    pub fn centroid(&self) -> [f32; 3] {
        match self.bounds() {
            Some((min, max)) => [
                (min[0] + max[0]) / 2.0,
                (min[1] + max[1]) / 2.0,
                (min[2] + max[2]) / 2.0,
            ],
            None => [0.0; 3],
        }
    }

    /// Largest bounding-box extent across the three axes.
    #[must_use]
    pub fn max_extent(&self) -> f32 {
        match self.bounds() {
            Some((min, max)) => (max[0] - min[0])
                .max(max[1] - min[1])
                .max(max[2] - min[2]),
            None => 0.0,
        }
    }

    /// Computes edge-based structural properties in one pass.
    #[must_use]
    pub fn topology(&self) -> MeshTopology {
        // Undirected edge -> (times seen, forward traversals a < b).
        let mut edges: HashMap<(u32, u32), (u32, u32)> = HashMap::new();
        for face in &self.faces {
            for (a, b) in [
                (face[0], face[1]),
                (face[1], face[2]),
                (face[2], face[0]),
            ] {
                let key = (a.min(b), a.max(b));
                let entry = edges.entry(key).or_insert((0, 0));
                entry.0 += 1;
                if a < b {
                    entry.1 += 1;
                }
            }
        }

        let is_watertight = !edges.is_empty() && edges.values().all(|&(count, _)| count == 2);
        // Consistent winding means the two faces sharing an edge traverse it
        // in opposite directions: one forward, one backward.
        let is_winding_consistent = edges
            .values()
            .all(|&(count, forward)| count != 2 || forward == 1);

        MeshTopology {
            edge_count: edges.len(),
            is_watertight,
            is_winding_consistent,
        }
    }

    /// Euler characteristic `V - E + F`.
    #[must_use]
    pub fn euler_number(&self) -> i64 {
        let v = self.vertices.len() as i64;
        let e = self.topology().edge_count as i64;
        let f = self.faces.len() as i64;
        v - e + f
    }
}

impl fmt::Display for TriMesh {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TriMesh({} vertices, {} faces)",
            self.vertices.len(),
            self.faces.len()
        )
    }
}

/// Builder that deduplicates vertex positions while accumulating faces.
#[derive(Default)]
struct MeshBuilder {
    mesh: TriMesh,
    index: HashMap<[u32; 3], u32>,
}

impl MeshBuilder {
    fn push_vertex(&mut self, v: [f32; 3]) -> u32 {
        // Key on bit patterns: exact duplicates collapse, NaN payloads stay
        // distinct instead of poisoning equality.
        let key = [v[0].to_bits(), v[1].to_bits(), v[2].to_bits()];
        if let Some(&idx) = self.index.get(&key) {
            return idx;
        }
        let idx = self.mesh.vertices.len() as u32;
        self.mesh.vertices.push(v);
        self.index.insert(key, idx);
        idx
    }

    fn push_triangle(&mut self, a: [f32; 3], b: [f32; 3], c: [f32; 3]) {
        let ia = self.push_vertex(a);
        let ib = self.push_vertex(b);
        let ic = self.push_vertex(c);
        self.mesh.faces.push([ia, ib, ic]);
    }

    fn finish(self) -> Result<TriMesh, MeshError> {
        if self.mesh.is_empty() {
            return Err(MeshError::Empty);
        }
        Ok(self.mesh)
    }
}

/// Returns true when the bytes look like an ASCII STL body: the header
/// starts with `solid` after whitespace and the first 80 bytes carry no NUL.
#[must_use]
pub fn looks_like_ascii_stl(head: &[u8]) -> bool {
    let trimmed = trim_ascii_start(head);
    trimmed.starts_with(b"solid") && !head.iter().take(80).any(|&b| b == 0)
}

fn trim_ascii_start(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    &bytes[start..]
}

/// Loads an STL file from disk, deciding the variant from the header.
pub fn load_stl(path: &Path) -> Result<TriMesh, MeshError> {
    let data = fs::read(path)?;
    if looks_like_ascii_stl(&data) {
        parse_ascii_stl(&data)
    } else {
        parse_binary_stl(&data)
    }
}

/// Parses a binary STL body: 80-byte header, little-endian u32 triangle
/// count, then 50-byte records.
pub fn parse_binary_stl(data: &[u8]) -> Result<TriMesh, MeshError> {
    if (data.len() as u64) < BINARY_STL_HEADER_LEN {
        return Err(MeshError::malformed(format!(
            "binary STL requires at least {BINARY_STL_HEADER_LEN} bytes, got {}",
            data.len()
        )));
    }

    let count_bytes: [u8; 4] = data[80..84]
        .try_into()
        .map_err(|_| MeshError::malformed("unreadable triangle count"))?;
    let triangle_count = u32::from_le_bytes(count_bytes) as u64;

    let required = BINARY_STL_HEADER_LEN + triangle_count * BINARY_STL_TRIANGLE_LEN;
    if (data.len() as u64) < required {
        return Err(MeshError::malformed(format!(
            "header declares {triangle_count} triangles ({required} bytes) but file is {} bytes",
            data.len()
        )));
    }

    let mut builder = MeshBuilder::default();
    let mut offset = BINARY_STL_HEADER_LEN as usize;
    for _ in 0..triangle_count {
        // Skip the 12-byte facet normal; it is recomputed when needed.
        let verts = read_vec3(data, offset + 12)
            .zip(read_vec3(data, offset + 24))
            .zip(read_vec3(data, offset + 36));
        match verts {
            Some(((a, b), c)) => builder.push_triangle(a, b, c),
            None => return Err(MeshError::malformed("truncated triangle record")),
        }
        offset += BINARY_STL_TRIANGLE_LEN as usize;
    }

    builder.finish()
}

fn read_vec3(data: &[u8], offset: usize) -> Option<[f32; 3]> {
    let mut out = [0.0f32; 3];
    for (i, slot) in out.iter_mut().enumerate() {
        let start = offset + i * 4;
        let bytes: [u8; 4] = data.get(start..start + 4)?.try_into().ok()?;
        *slot = f32::from_le_bytes(bytes);
    }
    Some(out)
}

/// Parses an ASCII STL body (`solid` / `facet` / `vertex x y z` tokens).
pub fn parse_ascii_stl(data: &[u8]) -> Result<TriMesh, MeshError> {
    let text = std::str::from_utf8(data)
        .map_err(|_| MeshError::malformed("ASCII STL contains invalid UTF-8"))?;

    let mut builder = MeshBuilder::default();
    let mut pending: Vec<[f32; 3]> = Vec::with_capacity(3);

    for line in text.lines() {
        let mut tokens = line.split_whitespace();
        match tokens.next() {
            Some("vertex") => {
                let vertex = parse_vertex(tokens)
                    .ok_or_else(|| MeshError::malformed(format!("bad vertex line: {line}")))?;
                pending.push(vertex);
            }
            Some("endfacet") => {
                if pending.len() != 3 {
                    return Err(MeshError::malformed(format!(
                        "facet closed with {} vertices",
                        pending.len()
                    )));
                }
                builder.push_triangle(pending[0], pending[1], pending[2]);
                pending.clear();
            }
            _ => {}
        }
    }

    if !pending.is_empty() {
        return Err(MeshError::malformed("unterminated facet at end of file"));
    }

    builder.finish()
}

fn parse_vertex<'a>(mut tokens: impl Iterator<Item = &'a str>) -> Option<[f32; 3]> {
    let x = tokens.next()?.parse().ok()?;
    let y = tokens.next()?.parse().ok()?;
    let z = tokens.next()?.parse().ok()?;
    Some([x, y, z])
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub mod testutil {
    //! Deterministic STL fixtures shared by unit and integration tests.

    /// Serializes triangles (as vertex triples) into a binary STL body.
    #[must_use]
    pub fn binary_stl(triangles: &[[[f32; 3]; 3]]) -> Vec<u8> {
        let mut out = vec![0u8; 80];
        out.extend_from_slice(&(triangles.len() as u32).to_le_bytes());
        for tri in triangles {
            out.extend_from_slice(&[0u8; 12]); // normal, unused
            for v in tri {
                for c in v {
                    out.extend_from_slice(&c.to_le_bytes());
                }
            }
            out.extend_from_slice(&[0u8; 2]); // attribute byte count
        }
        out
    }

    /// A unit tetrahedron: the smallest watertight mesh.
    #[must_use]
    pub fn tetrahedron() -> Vec<[[f32; 3]; 3]> {
        let a = [0.0, 0.0, 0.0];
        let b = [1.0, 0.0, 0.0];
        let c = [0.0, 1.0, 0.0];
        let d = [0.0, 0.0, 1.0];
        // Outward-facing winding for every face.
        vec![[a, c, b], [a, b, d], [b, c, d], [a, d, c]]
    }
}
