//! Concrete processors: WebP normalization and multi-angle model rendering.

mod render;
mod webp_normalizer;

pub use render::ModelRenderer;
pub use webp_normalizer::WebpNormalizer;
