//! Progress-callback trait for per-stage and per-image generation events.
//!
//! Inject an [`Arc<dyn GenerationProgressCallback>`] via
//! [`crate::config::GeneratorConfigBuilder::progress_callback`] to observe a
//! call as it moves through the pipeline. The CLI uses this to drive its
//! spinner; a web service might forward events to a job-status record.
//!
//! # Example
//!
//! ```rust
//! use exam_pdf::{GenerationProgressCallback, GeneratorConfig, Stage};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     images: AtomicUsize,
//! }
//!
//! impl GenerationProgressCallback for CountingCallback {
//!     fn on_image_complete(&self, _url: &str, _bytes: usize) {
//!         self.images.fetch_add(1, Ordering::SeqCst);
//!     }
//! }
//!
//! let counter = Arc::new(CountingCallback { images: AtomicUsize::new(0) });
//!
//! let config = GeneratorConfig::builder()
//!     .progress_callback(counter as Arc<dyn GenerationProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// A step of the generation pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    /// Paper lookup through the configured fetcher.
    FetchPaper,
    /// Structured paper → HTML document.
    Template,
    /// Image fetch, optimisation and data-URI substitution.
    Inline,
    /// Headless browser HTML → PDF.
    Render,
    /// Page numbers, watermark and metadata.
    PostProcess,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::FetchPaper => "fetch paper",
            Stage::Template => "build html",
            Stage::Inline => "inline images",
            Stage::Render => "render",
            Stage::PostProcess => "post-process",
        })
    }
}

/// Called by the pipeline as a generation call makes progress.
///
/// Image events may arrive concurrently from several fetch tasks, so
/// implementations must synchronise any shared mutable state. All methods
/// default to no-ops.
pub trait GenerationProgressCallback: Send + Sync {
    /// Called once before any stage runs.
    fn on_generation_start(&self) {}

    /// Called as a stage begins.
    fn on_stage_start(&self, stage: Stage) {
        let _ = stage;
    }

    /// Called when a stage finishes successfully.
    ///
    /// # Arguments
    /// * `stage`: the stage that finished
    /// * `duration_ms`: wall time spent in the stage
    fn on_stage_complete(&self, stage: Stage, duration_ms: u64) {
        let _ = (stage, duration_ms);
    }

    /// Called when an image has been fetched, optimised and embedded.
    ///
    /// # Arguments
    /// * `url`: resolved absolute source URL
    /// * `bytes`: size of the embedded (optimised) image
    fn on_image_complete(&self, url: &str, bytes: usize) {
        let _ = (url, bytes);
    }

    /// Called when an image is left un-inlined after a failure.
    fn on_image_error(&self, url: &str, error: &str) {
        let _ = (url, error);
    }

    /// Called once after the final PDF buffer is ready.
    fn on_generation_complete(&self, pdf_bytes: usize) {
        let _ = pdf_bytes;
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl GenerationProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::GeneratorConfig`].
pub type ProgressCallback = Arc<dyn GenerationProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct TrackingCallback {
        stages: Mutex<Vec<Stage>>,
        images_ok: AtomicUsize,
        images_err: AtomicUsize,
        final_bytes: AtomicUsize,
    }

    impl GenerationProgressCallback for TrackingCallback {
        fn on_stage_complete(&self, stage: Stage, _duration_ms: u64) {
            self.stages.lock().unwrap().push(stage);
        }

        fn on_image_complete(&self, _url: &str, _bytes: usize) {
            self.images_ok.fetch_add(1, Ordering::SeqCst);
        }

        fn on_image_error(&self, _url: &str, _error: &str) {
            self.images_err.fetch_add(1, Ordering::SeqCst);
        }

        fn on_generation_complete(&self, pdf_bytes: usize) {
            self.final_bytes.store(pdf_bytes, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_generation_start();
        cb.on_stage_start(Stage::Render);
        cb.on_stage_complete(Stage::Render, 12);
        cb.on_image_complete("https://x/a.png", 10);
        cb.on_image_error("https://x/b.png", "HTTP 404");
        cb.on_generation_complete(1024);
    }

    #[test]
    fn tracking_callback_receives_events() {
        let tracker = TrackingCallback::default();

        tracker.on_stage_complete(Stage::Template, 1);
        tracker.on_image_complete("https://x/a.png", 100);
        tracker.on_image_complete("https://x/b.png", 200);
        tracker.on_image_error("https://x/c.png", "timed out");
        tracker.on_stage_complete(Stage::Inline, 5);
        tracker.on_generation_complete(4096);

        assert_eq!(
            *tracker.stages.lock().unwrap(),
            vec![Stage::Template, Stage::Inline]
        );
        assert_eq!(tracker.images_ok.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.images_err.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.final_bytes.load(Ordering::SeqCst), 4096);
    }

    #[test]
    fn stage_display() {
        assert_eq!(Stage::PostProcess.to_string(), "post-process");
        assert_eq!(Stage::Inline.to_string(), "inline images");
    }
}
