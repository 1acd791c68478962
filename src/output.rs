//! Output types for a single-document conversion.

use crate::config::OutputFormat;
use serde::{Deserialize, Serialize};

/// The result of converting one ZPL document.
#[derive(Debug, Clone)]
pub struct ConversionOutput {
    /// PDF bytes, or a `.tar.gz` of images for image formats.
    pub bytes: Vec<u8>,
    pub format: OutputFormat,
    pub stats: ConversionStats,
}

impl ConversionOutput {
    pub fn content_type(&self) -> &'static str {
        self.format.content_type()
    }
}

/// What a conversion did and how long each phase took.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionStats {
    /// Output units requested (Σ copies).
    pub total_labels: usize,
    /// Distinct labels sent to the renderer.
    pub unique_labels: usize,
    pub chunks: usize,
    pub renderer_calls: usize,
    /// Pages (PDF) or archive entries (images) actually produced.
    pub output_units: usize,
    /// Units lost to unavailable chunks or images.
    pub skipped_units: usize,
    pub render_duration_ms: u64,
    pub assemble_duration_ms: u64,
    pub total_duration_ms: u64,
}

impl ConversionStats {
    /// Fraction of renderer work saved by deduplication, 0.0–1.0.
    pub fn dedup_ratio(&self) -> f64 {
        if self.total_labels == 0 {
            return 0.0;
        }
        1.0 - self.unique_labels as f64 / self.total_labels as f64
    }
}
