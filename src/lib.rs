//! # exam-pdf
//!
//! Turn exam papers (or arbitrary HTML) into print-ready PDFs with a headless
//! Chromium browser.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PdfRequest (html | paper id + fetcher)
//!  │
//!  ├─ 0. Validate  reject unusable input before any I/O
//!  ├─ 1. Fetch     load PaperData through a PaperFetcher
//!  ├─ 2. Template  PaperData → self-contained HTML
//!  ├─ 3. Inline    every <img src> → optimised base64 data URI (concurrent)
//!  ├─ 4. Render    Chromium print-to-PDF, bounded by deadlines
//!  └─ 5. Post      page numbers, watermark, metadata (lopdf, spawn_blocking)
//! ```
//!
//! An image that cannot be fetched or decoded never fails the request: it is
//! logged, counted in [`GenerationStats::images`] and left as it was.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use exam_pdf::{generate_pdf, GeneratorConfig, PdfRequest, PageSize};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GeneratorConfig::builder()
//!         .page_size(PageSize::Letter)
//!         .build()?;
//!     let request = PdfRequest::from_html("<h1>Midterm</h1><img src=\"https://example.com/fig.png\">");
//!     let pdf = generate_pdf(&request, &config).await?;
//!     std::fs::write("midterm.pdf", pdf)?;
//!     Ok(())
//! }
//! ```
//!
//! Papers stored elsewhere are loaded through a [`PaperFetcher`]; any async
//! closure returning `Result<Option<PaperData>, E>` qualifies, and
//! [`JsonDirFetcher`] reads `<dir>/<id>.json`.
//!
//! ## Browser Reuse
//!
//! By default every call launches and tears down its own browser. Services
//! should share a [`ChromePool`] through [`GeneratorConfigBuilder::renderer`].
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `exampdf` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! exam-pdf = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod fetcher;
pub mod generate;
pub mod model;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod response;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{
    BrowserOptions, GeneratorConfig, GeneratorConfigBuilder, HeaderFooter, Margins,
    PageNumberOptions, PageSize, PdfMetadata, PostProcessOptions, RenderOptions,
    WatermarkOptions,
};
pub use error::{ErrorKind, ExamPdfError, ImageError};
pub use fetcher::{JsonDirFetcher, PaperFetcher};
pub use generate::{
    generate_pdf, generate_pdf_with_stats, generate_sync, generate_to_file, prepare_html,
    PdfRequest, PreparedHtml,
};
pub use model::{PaperData, PaperId, PaperMetadata, Question, TextOrNumber};
pub use output::{GenerationOutput, GenerationStats, InlineReport};
pub use pipeline::render::{ChromePool, ChromeRenderer, PdfRenderer};
pub use progress::{GenerationProgressCallback, NoopProgressCallback, ProgressCallback, Stage};
pub use response::PdfHeaders;
