//! Pipeline stages for paper → PDF generation.
//!
//! Each submodule implements one transformation step and can be used on its
//! own; [`crate::generate`] sequences them.
//!
//! ## Data Flow
//!
//! ```text
//! template ──▶ inline ──▶ render ──▶ postprocess
//! (paper→HTML)  (data URIs) (Chromium)  (lopdf)
//!                 │
//!                 ├─ fetch     download / read one image
//!                 ├─ optimize  orient, downscale, JPEG
//!                 └─ encode    base64 data URI
//! ```
//!
//! 1. [`template`]: pure function of the paper data; skipped for literal HTML
//! 2. [`inline`]: the only stage with outbound network I/O; per-image
//!    failures are recovered locally
//! 3. [`render`]: headless browser print; bounded by deadlines
//! 4. [`postprocess`]: CPU-bound PDF edit; run via `spawn_blocking`

pub mod encode;
pub mod fetch;
pub mod inline;
pub mod optimize;
pub mod postprocess;
pub mod render;
pub mod template;
