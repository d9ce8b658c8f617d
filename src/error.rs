//! Error types for the exam-pdf library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`ExamPdfError`]: **Fatal**: the document cannot be produced at all
//!   (no usable input, unknown paper, browser crash, unparsable PDF). Returned
//!   as `Err(ExamPdfError)` from the top-level `generate*` functions, and no
//!   partial buffer is ever returned alongside it.
//!
//! * [`ImageError`]: **Non-fatal**: a single `<img>` could not be fetched or
//!   inlined. The occurrence keeps its original `src`, the failure is logged
//!   and recorded in [`crate::output::InlineReport`], and generation carries on.
//!
//! [`ExamPdfError::kind`] collapses the fatal variants into the small set of
//! categories an HTTP layer needs; [`ExamPdfError::http_status`] applies the
//! usual mapping (validation → 400, not found → 404, anything else → 500).

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the exam-pdf library.
///
/// Per-image failures use [`ImageError`] and are recorded in
/// [`crate::output::InlineReport`] rather than propagated here.
#[derive(Debug, Error)]
pub enum ExamPdfError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Neither literal HTML nor a usable `(paper_id, fetcher)` pair was supplied.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// The paper fetcher reported that no paper exists for the id.
    #[error("Paper '{id}' not found")]
    PaperNotFound { id: String },

    /// The paper fetcher itself failed (database down, unreadable file, ...).
    #[error("Failed to fetch paper '{id}': {reason}")]
    PaperFetchFailed { id: String, reason: String },

    // ── Render errors ─────────────────────────────────────────────────────
    /// The Chromium process could not be configured or started.
    #[error("Failed to launch browser: {reason}\nSet CHROME_PATH to a Chrome/Chromium binary if none is on PATH.")]
    BrowserLaunchFailed { reason: String },

    /// A CDP call failed while loading or printing the page.
    #[error("Rendering failed during {stage}: {detail}")]
    RenderFailed { stage: &'static str, detail: String },

    /// A render step exceeded its deadline.
    #[error("Rendering timed out after {secs}s during {stage}")]
    RenderTimeout { stage: &'static str, secs: u64 },

    /// The renderer pool was shut down before the request acquired a worker.
    #[error("Renderer pool is shut down")]
    PoolShutDown,

    // ── Post-process errors ───────────────────────────────────────────────
    /// The rendered buffer could not be parsed or re-serialised as a PDF.
    #[error("PDF post-processing failed: {detail}")]
    PostProcessFailed { detail: String },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write the output PDF file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification of a fatal error, independent of its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Render,
    PostProcess,
    Config,
    Io,
    Internal,
}

impl ExamPdfError {
    /// The category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExamPdfError::Validation(_) => ErrorKind::Validation,
            ExamPdfError::PaperNotFound { .. } => ErrorKind::NotFound,
            ExamPdfError::PaperFetchFailed { .. } => ErrorKind::Internal,
            ExamPdfError::BrowserLaunchFailed { .. }
            | ExamPdfError::RenderFailed { .. }
            | ExamPdfError::RenderTimeout { .. }
            | ExamPdfError::PoolShutDown => ErrorKind::Render,
            ExamPdfError::PostProcessFailed { .. } => ErrorKind::PostProcess,
            ExamPdfError::OutputWriteFailed { .. } => ErrorKind::Io,
            ExamPdfError::InvalidConfig(_) => ErrorKind::Config,
            ExamPdfError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// HTTP status a web layer should answer with for this error.
    pub fn http_status(&self) -> u16 {
        match self.kind() {
            ErrorKind::Validation => 400,
            ErrorKind::NotFound => 404,
            _ => 500,
        }
    }
}

/// A non-fatal failure to inline a single image.
///
/// The image keeps its original `src` attribute; the document still renders.
#[derive(Debug, Clone, PartialEq, Error, serde::Serialize, serde::Deserialize)]
pub enum ImageError {
    /// Connection, TLS or body read failure.
    #[error("Image '{url}': fetch failed: {detail}")]
    FetchFailed { url: String, detail: String },

    /// The server answered with a non-success status.
    #[error("Image '{url}': HTTP {status}")]
    HttpStatus { url: String, status: u16 },

    /// The fetch exceeded its timeout.
    #[error("Image '{url}': timed out after {secs}s")]
    Timeout { url: String, secs: u64 },

    /// The body exceeded the configured size cap.
    #[error("Image '{url}': {bytes} bytes exceeds the {limit} byte limit")]
    TooLarge { url: String, bytes: usize, limit: usize },

    /// The body is neither a decodable image nor served as `image/*`.
    #[error("Image '{url}': response is not an image")]
    NotAnImage { url: String },

    /// A `file://` source could not be read.
    #[error("Image '{url}': could not read file: {detail}")]
    FileReadFailed { url: String, detail: String },
}

impl ImageError {
    /// The source URL this failure refers to.
    pub fn url(&self) -> &str {
        match self {
            ImageError::FetchFailed { url, .. }
            | ImageError::HttpStatus { url, .. }
            | ImageError::Timeout { url, .. }
            | ImageError::TooLarge { url, .. }
            | ImageError::NotAnImage { url }
            | ImageError::FileReadFailed { url, .. } => url,
        }
    }
}
