//! Multi-angle preview renderer for 3D models.
//!
//! Renders the decoded mesh from four canonical views (iso, front, side,
//! top) into WebP images written next to the source file. A failed view is
//! isolated: remaining views still render and the failure is reported as a
//! non-fatal warning. The renderer is a self-contained z-buffer rasterizer
//! with flat shading, so output is deterministic and needs no GPU.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::mesh::TriMesh;
use crate::pipeline::{
    AssetContext, Metadata, ModelProcessingOutput, ProcessingResult, Processor,
};

/// Face cap above which rendering is refused outright.
const MAX_RENDER_FACES: usize = 500_000;

/// Output resolution (width, height).
const RESOLUTION: (u32, u32) = (1024, 768);

/// Vertical field of view in radians.
const Y_FOV: f32 = std::f32::consts::FRAC_PI_4;

/// Camera distance as a multiple of the mesh's largest extent.
const CAMERA_DISTANCE_FACTOR: f32 = 1.8;

/// WebP encoding quality for preview images.
const RENDER_QUALITY: f32 = 85.0;

/// Camera views as (name, elevation°, azimuth°).
const VIEWS: [(&str, f32, f32); 4] = [
    ("iso", 30.0, 45.0),
    ("front", 0.0, 0.0),
    ("side", 0.0, 90.0),
    ("top", 90.0, 0.0),
];

/// Base surface color for the untextured material.
const MATERIAL_RGB: [f32; 3] = [0.72, 0.72, 0.76];

/// Renders four preview angles of the context's mesh.
#[derive(Default)]
pub struct ModelRenderer;

impl Processor for ModelRenderer {
    type Output = ModelProcessingOutput;

    fn name(&self) -> &'static str {
        "ModelRenderer"
    }

    fn process(&self, context: &AssetContext) -> ProcessingResult<ModelProcessingOutput> {
        let mesh = match context.mesh() {
            Ok(mesh) => mesh,
            Err(e) => {
                return ProcessingResult::failure(self.name(), format!("mesh unavailable: {e}"));
            }
        };

        if mesh.faces.len() > MAX_RENDER_FACES {
            return ProcessingResult::failure(
                self.name(),
                format!("mesh too complex ({} faces)", mesh.faces.len()),
            );
        }

        let scene = match Scene::new(mesh) {
            Ok(scene) => scene,
            Err(e) => return ProcessingResult::failure(self.name(), e),
        };

        info!(trace_id = context.trace_id(), "starting multi-angle render");

        let mut generated: Vec<PathBuf> = Vec::with_capacity(VIEWS.len());
        let mut failures: Vec<(&str, String)> = Vec::new();

        for (view_name, elevation, azimuth) in VIEWS {
            debug!(
                trace_id = context.trace_id(),
                view = view_name,
                elevation,
                azimuth,
                "rendering view"
            );
            let output_path = view_output_path(context.file_path(), view_name);
            match scene.render_view(elevation, azimuth, &output_path) {
                Ok(()) => {
                    info!(trace_id = context.trace_id(), view = view_name, "saved view");
                    generated.push(output_path);
                }
                Err(e) => {
                    warn!(trace_id = context.trace_id(), view = view_name, error = %e, "view failed");
                    failures.push((view_name, e));
                }
            }
        }

        if generated.is_empty() {
            let detail = failures
                .iter()
                .map(|(name, err)| format!("{name}: {err}"))
                .collect::<Vec<_>>()
                .join("; ");
            return ProcessingResult::failure(self.name(), format!("all renders failed; {detail}"));
        }

        let warning = (!failures.is_empty()).then(|| {
            format!(
                "some views failed to render: {}",
                failures
                    .iter()
                    .map(|(name, err)| format!("{name}: {err}"))
                    .collect::<Vec<_>>()
                    .join("; ")
            )
        });

        let mut metadata = Metadata::new();
        metadata.insert(
            "rendered_views".to_string(),
            generated
                .iter()
                .filter_map(|p| p.file_name().and_then(|n| n.to_str()))
                .collect::<Vec<_>>()
                .into(),
        );

        let output = ModelProcessingOutput {
            original_file: context.file_path().to_path_buf(),
            generated_image_paths: generated,
        };

        ProcessingResult::success(self.name(), output)
            .with_warning(warning)
            .with_metadata(metadata)
    }
}

fn view_output_path(source: &Path, view_name: &str) -> PathBuf {
    let stem = source
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("model");
    source.with_file_name(format!("{stem}_{view_name}.webp"))
}

/// Pre-computed per-mesh rendering state shared across views.
struct Scene<'m> {
    mesh: &'m TriMesh,
    center: [f32; 3],
    scale: f32,
}

impl<'m> Scene<'m> {
    fn new(mesh: &'m TriMesh) -> Result<Self, String> {
        let center = mesh.centroid();
        let scale = mesh.max_extent();
        if !scale.is_finite() || scale <= 0.0 {
            return Err(format!("mesh has degenerate bounds (extent {scale})"));
        }
        if center.iter().any(|c| !c.is_finite()) {
            return Err("mesh center is not finite".to_string());
        }
        Ok(Self { mesh, center, scale })
    }

    fn render_view(&self, elevation_deg: f32, azimuth_deg: f32, output: &Path) -> Result<(), String> {
        let (width, height) = RESOLUTION;
        let aspect = width as f32 / height as f32;

        // Camera on a sphere around the mesh center.
        let theta = azimuth_deg.to_radians();
        let phi = elevation_deg.to_radians();
        let dist = self.scale * CAMERA_DISTANCE_FACTOR;
        let eye = [
            self.center[0] + dist * phi.cos() * theta.sin(),
            self.center[1] + dist * phi.cos() * theta.cos(),
            self.center[2] + dist * phi.sin(),
        ];

        let camera = look_at(eye, self.center, [0.0, 0.0, 1.0]);
        let focal = 1.0 / (Y_FOV / 2.0).tan();

        let mut color = vec![255u8; (width * height * 3) as usize];
        let mut depth = vec![f32::INFINITY; (width * height) as usize];

        let key_dir = normalize([10.0, 10.0, 10.0]);
        let fill_dir = normalize([-10.0, 5.0, 5.0]);

        for face in &self.mesh.faces {
            let world = [
                self.mesh.vertices[face[0] as usize],
                self.mesh.vertices[face[1] as usize],
                self.mesh.vertices[face[2] as usize],
            ];
            if world.iter().flatten().any(|c| !c.is_finite()) {
                continue;
            }

            // Two-sided flat shading from the face normal.
            let normal = normalize(cross(
                sub(world[1], world[0]),
                sub(world[2], world[0]),
            ));
            let lum = (0.3
                + 0.5 * dot(normal, key_dir).abs()
                + 0.25 * dot(normal, fill_dir).abs())
            .clamp(0.0, 1.0);
            let shade = [
                (MATERIAL_RGB[0] * lum * 255.0) as u8,
                (MATERIAL_RGB[1] * lum * 255.0) as u8,
                (MATERIAL_RGB[2] * lum * 255.0) as u8,
            ];

            // Project to screen space; skip faces touching the camera plane.
            let mut screen = [[0.0f32; 3]; 3];
            let mut skip = false;
            for (slot, vertex) in screen.iter_mut().zip(world) {
                let cam = camera.transform(vertex);
                if cam[2] >= -1e-4 {
                    skip = true;
                    break;
                }
                let inv = -1.0 / cam[2];
                let ndc_x = cam[0] * focal / aspect * inv;
                let ndc_y = cam[1] * focal * inv;
                *slot = [
                    (ndc_x + 1.0) / 2.0 * width as f32,
                    (1.0 - ndc_y) / 2.0 * height as f32,
                    -cam[2],
                ];
            }
            if skip {
                continue;
            }

            fill_triangle(&screen, shade, width, height, &mut color, &mut depth);
        }

        let encoded = webp::Encoder::from_rgb(&color, width, height).encode(RENDER_QUALITY);
        std::fs::write(output, &*encoded).map_err(|e| format!("cannot write render: {e}"))?;
        Ok(())
    }
}

/// Camera transform: world space to camera space (camera looks down -Z).
struct CameraTransform {
    // Rows of the inverse (world-to-camera) rotation.
    rows: [[f32; 3]; 3],
    eye: [f32; 3],
}

impl CameraTransform {
    fn transform(&self, p: [f32; 3]) -> [f32; 3] {
        let rel = sub(p, self.eye);
        [
            dot(self.rows[0], rel),
            dot(self.rows[1], rel),
            dot(self.rows[2], rel),
        ]
    }
}

fn look_at(eye: [f32; 3], target: [f32; 3], up: [f32; 3]) -> CameraTransform {
    let z_axis = normalize(sub(eye, target));
    let x_raw = cross(up, z_axis);
    let x_axis = if length(x_raw) < 1e-6 {
        // Degenerate when looking straight along the up vector (top view).
        [1.0, 0.0, 0.0]
    } else {
        normalize(x_raw)
    };
    let y_axis = normalize(cross(z_axis, x_axis));

    CameraTransform {
        rows: [x_axis, y_axis, z_axis],
        eye,
    }
}

#[allow(clippy::many_single_char_names)]
fn fill_triangle(
    screen: &[[f32; 3]; 3],
    shade: [u8; 3],
    width: u32,
    height: u32,
    color: &mut [u8],
    depth: &mut [f32],
) {
    let [a, b, c] = *screen;

    let area = (b[0] - a[0]) * (c[1] - a[1]) - (b[1] - a[1]) * (c[0] - a[0]);
    if area.abs() < f32::EPSILON {
        return;
    }

    let min_x = a[0].min(b[0]).min(c[0]).floor().max(0.0) as u32;
    let max_x = (a[0].max(b[0]).max(c[0]).ceil() as i64).clamp(0, i64::from(width) - 1) as u32;
    let min_y = a[1].min(b[1]).min(c[1]).floor().max(0.0) as u32;
    let max_y = (a[1].max(b[1]).max(c[1]).ceil() as i64).clamp(0, i64::from(height) - 1) as u32;
    if min_x > max_x || min_y > max_y {
        return;
    }

    for y in min_y..=max_y {
        for x in min_x..=max_x {
            let px = x as f32 + 0.5;
            let py = y as f32 + 0.5;

            // Barycentric weights via edge functions; dividing by the signed
            // area makes the test winding-independent.
            let wc = ((b[0] - a[0]) * (py - a[1]) - (b[1] - a[1]) * (px - a[0])) / area;
            let wa = ((c[0] - b[0]) * (py - b[1]) - (c[1] - b[1]) * (px - b[0])) / area;
            let wb = 1.0 - wa - wc;
            if wa < 0.0 || wb < 0.0 || wc < 0.0 {
                continue;
            }

            let z = wa * a[2] + wb * b[2] + wc * c[2];
            let idx = (y * width + x) as usize;
            if z < depth[idx] {
                depth[idx] = z;
                let base = idx * 3;
                color[base] = shade[0];
                color[base + 1] = shade[1];
                color[base + 2] = shade[2];
            }
        }
    }
}

fn sub(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn cross(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn dot(a: [f32; 3], b: [f32; 3]) -> f32 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn length(v: [f32; 3]) -> f32 {
    dot(v, v).sqrt()
}

fn normalize(v: [f32; 3]) -> [f32; 3] {
    let len = length(v);
    if len < f32::EPSILON {
        [0.0, 0.0, 0.0]
    } else {
        [v[0] / len, v[1] / len, v[2] / len]
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::mesh::testutil::{binary_stl, tetrahedron};

    fn stl_context(dir: &TempDir, name: &str, bytes: &[u8]) -> AssetContext {
        let path = dir.path().join(name);
        std::fs::write(&path, bytes).unwrap();
        AssetContext::new(path, "trace-render", "model")
    }

    #[test]
    fn test_renders_all_four_views() {
        let dir = TempDir::new().unwrap();
        let ctx = stl_context(&dir, "part.stl", &binary_stl(&tetrahedron()));

        let result = ModelRenderer.process(&ctx);

        assert!(result.success, "{:?}", result.error_message);
        assert!(result.warning.is_none());
        let output = result.output.unwrap();
        assert_eq!(output.generated_image_paths.len(), 4);
        for path in &output.generated_image_paths {
            assert!(path.exists(), "missing render {}", path.display());
        }
        let names: Vec<_> = output
            .generated_image_paths
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        for view in ["iso", "front", "side", "top"] {
            assert!(names.iter().any(|n| n.contains(view)), "missing {view} view");
        }
    }

    #[test]
    fn test_render_output_is_decodable_webp() {
        let dir = TempDir::new().unwrap();
        let ctx = stl_context(&dir, "part.stl", &binary_stl(&tetrahedron()));

        let result = ModelRenderer.process(&ctx);
        let output = result.output.unwrap();

        let decoded = image::open(&output.generated_image_paths[0]).unwrap();
        assert_eq!((decoded.width(), decoded.height()), RESOLUTION);
    }

    #[test]
    fn test_render_draws_something() {
        let dir = TempDir::new().unwrap();
        let ctx = stl_context(&dir, "part.stl", &binary_stl(&tetrahedron()));

        let result = ModelRenderer.process(&ctx);
        let output = result.output.unwrap();

        let decoded = image::open(&output.generated_image_paths[0]).unwrap().to_rgb8();
        let non_white = decoded.pixels().filter(|p| p.0 != [255, 255, 255]).count();
        assert!(non_white > 100, "expected visible geometry, got {non_white} pixels");
    }

    #[test]
    fn test_complexity_gate_refuses_render() {
        let dir = TempDir::new().unwrap();
        let tri = [[[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]];
        let body = binary_stl(&tri.repeat(MAX_RENDER_FACES + 1));
        let ctx = stl_context(&dir, "huge.stl", &body);

        let result = ModelRenderer.process(&ctx);

        assert!(!result.success);
        assert!(result.error_message.unwrap().contains("too complex"));
    }

    #[test]
    fn test_partial_failure_renders_survivors_with_warning() {
        let dir = TempDir::new().unwrap();
        let ctx = stl_context(&dir, "part.stl", &binary_stl(&tetrahedron()));
        // A directory squatting on the front view's output path makes that
        // one save fail; the other views are unaffected.
        std::fs::create_dir(dir.path().join("part_front.webp")).unwrap();

        let result = ModelRenderer.process(&ctx);

        assert!(result.success, "one failed view must not fail the processor");
        let warning = result.warning.unwrap();
        assert!(warning.contains("front"), "warning was: {warning}");

        let output = result.output.unwrap();
        assert_eq!(output.generated_image_paths.len(), 3);
        assert!(
            output
                .generated_image_paths
                .iter()
                .all(|p| !p.ends_with("part_front.webp")),
            "failed view must not be reported as generated"
        );
    }

    #[test]
    fn test_degenerate_mesh_fails_cleanly() {
        let dir = TempDir::new().unwrap();
        // All vertices identical: zero extent.
        let tri = [[[1.0, 1.0, 1.0]; 3]];
        let ctx = stl_context(&dir, "point.stl", &binary_stl(&tri));

        let result = ModelRenderer.process(&ctx);

        assert!(!result.success);
        assert!(result.error_message.unwrap().contains("degenerate"));
    }

    #[test]
    fn test_original_file_flows_through_output() {
        let dir = TempDir::new().unwrap();
        let ctx = stl_context(&dir, "part.stl", &binary_stl(&tetrahedron()));

        let result = ModelRenderer.process(&ctx);
        let output = result.output.unwrap();

        assert_eq!(output.original_file, ctx.file_path());
    }
}
