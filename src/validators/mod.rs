//! Concrete validators for the image and model pipelines.

pub mod image;
pub mod model;

/// Number of leading bytes read for header-based type detection.
pub(crate) const HEADER_SNIFF_LEN: usize = 2048;
