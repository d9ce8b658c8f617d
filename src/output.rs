//! Result types returned by the generation entry points.

use crate::error::ImageError;
use serde::{Deserialize, Serialize};

/// The finished document plus timing and image statistics.
#[derive(Debug, Clone)]
pub struct GenerationOutput {
    /// The final PDF buffer.
    pub pdf: Vec<u8>,
    pub stats: GenerationStats,
}

/// Per-call statistics. Stage durations are 0 for stages that did not run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationStats {
    /// True when the HTML was built from structured paper data.
    pub from_paper: bool,
    /// Byte length of the HTML handed to the renderer.
    pub html_bytes: usize,
    pub images: InlineReport,
    /// Pages in the final PDF, when it could be counted.
    pub page_count: Option<usize>,
    pub pdf_bytes: usize,
    pub fetch_duration_ms: u64,
    pub template_duration_ms: u64,
    pub inline_duration_ms: u64,
    pub render_duration_ms: u64,
    pub postprocess_duration_ms: u64,
    pub total_duration_ms: u64,
}

/// What happened to the `<img>` tags of one document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InlineReport {
    /// `<img>` tags carrying a `src` attribute.
    pub found: usize,
    /// Occurrences whose `src` was replaced by a data URI.
    pub inlined: usize,
    /// Occurrences left alone on purpose (data URIs, relative paths,
    /// disallowed schemes, remote inlining switched off).
    pub skipped: usize,
    /// One entry per distinct URL that could not be inlined.
    pub failed: Vec<ImageError>,
}

impl InlineReport {
    /// True when every eligible image was embedded.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}
