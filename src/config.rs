//! Configuration types for PDF generation.
//!
//! All pipeline behaviour is controlled through [`GeneratorConfig`], built
//! via its [`GeneratorConfigBuilder`]. The config is an immutable value:
//! it is constructed once, cloned cheaply (the renderer and callback are
//! `Arc`s) and passed by reference into every stage. There is no module-level
//! mutable default object; per-request overrides travel on
//! [`crate::generate::PdfRequest`] and replace the corresponding defaults for
//! that call only.

use crate::error::ExamPdfError;
use crate::pipeline::render::PdfRenderer;
use crate::progress::ProgressCallback;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Configuration for a PDF generator.
///
/// Built via [`GeneratorConfig::builder()`] or using
/// [`GeneratorConfig::default()`].
///
/// # Example
/// ```rust
/// use exam_pdf::{GeneratorConfig, PageSize};
///
/// let config = GeneratorConfig::builder()
///     .page_size(PageSize::Letter)
///     .dpi(150)
///     .image_concurrency(4)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct GeneratorConfig {
    /// Default render options, used when a request carries none.
    pub render: RenderOptions,

    /// Default post-processing options, used when a request carries none.
    pub post: PostProcessOptions,

    /// Fetch and embed remote `http(s)` images. Default: true.
    pub inline_remote_images: bool,

    /// Allow `file://` image sources to be read from disk. Default: false.
    pub allow_file_urls: bool,

    /// Maximum simultaneous image fetch+optimize tasks per document. Default: 8.
    pub image_concurrency: usize,

    /// Per-image download timeout in seconds. Default: 20.
    pub image_fetch_timeout_secs: u64,

    /// Largest image body accepted, in bytes. Default: 15 MiB.
    pub max_image_bytes: usize,

    /// Browser launch/timeout settings for the built-in Chromium renderers.
    pub browser: BrowserOptions,

    /// Pre-constructed renderer (e.g. a shared [`crate::ChromePool`]).
    /// When `None`, each call launches and closes its own browser.
    pub renderer: Option<Arc<dyn PdfRenderer>>,

    /// Optional per-stage/per-image progress events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            render: RenderOptions::default(),
            post: PostProcessOptions::default(),
            inline_remote_images: true,
            allow_file_urls: false,
            image_concurrency: 8,
            image_fetch_timeout_secs: 20,
            max_image_bytes: 15 * 1024 * 1024,
            browser: BrowserOptions::default(),
            renderer: None,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for GeneratorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneratorConfig")
            .field("render", &self.render)
            .field("post", &self.post)
            .field("inline_remote_images", &self.inline_remote_images)
            .field("allow_file_urls", &self.allow_file_urls)
            .field("image_concurrency", &self.image_concurrency)
            .field("image_fetch_timeout_secs", &self.image_fetch_timeout_secs)
            .field("max_image_bytes", &self.max_image_bytes)
            .field("browser", &self.browser)
            .field("renderer", &self.renderer.as_ref().map(|_| "<dyn PdfRenderer>"))
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn GenerationProgressCallback>"),
            )
            .finish()
    }
}

impl GeneratorConfig {
    /// Create a new builder for `GeneratorConfig`.
    pub fn builder() -> GeneratorConfigBuilder {
        GeneratorConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`GeneratorConfig`].
#[derive(Debug)]
pub struct GeneratorConfigBuilder {
    config: GeneratorConfig,
}

impl GeneratorConfigBuilder {
    pub fn render_options(mut self, render: RenderOptions) -> Self {
        self.config.render = render;
        self
    }

    pub fn post_options(mut self, post: PostProcessOptions) -> Self {
        self.config.post = post;
        self
    }

    pub fn page_size(mut self, size: PageSize) -> Self {
        self.config.render.page_size = size;
        self
    }

    pub fn margins(mut self, margins: Margins) -> Self {
        self.config.render.margins = margins;
        self
    }

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.render.dpi = dpi.clamp(48, 600);
        self
    }

    pub fn max_image_size(mut self, width_px: u32, height_px: u32) -> Self {
        self.config.render.max_image_width_px = width_px.max(16);
        self.config.render.max_image_height_px = height_px.max(16);
        self
    }

    pub fn image_quality(mut self, quality: u8) -> Self {
        self.config.render.image_quality = quality.clamp(1, 100);
        self
    }

    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.config.render.user_agent = Some(ua.into());
        self
    }

    pub fn header_footer(mut self, hf: HeaderFooter) -> Self {
        self.config.render.header_footer = hf;
        self
    }

    pub fn inline_remote_images(mut self, v: bool) -> Self {
        self.config.inline_remote_images = v;
        self
    }

    pub fn allow_file_urls(mut self, v: bool) -> Self {
        self.config.allow_file_urls = v;
        self
    }

    pub fn image_concurrency(mut self, n: usize) -> Self {
        self.config.image_concurrency = n.max(1);
        self
    }

    pub fn image_fetch_timeout_secs(mut self, secs: u64) -> Self {
        self.config.image_fetch_timeout_secs = secs;
        self
    }

    pub fn max_image_bytes(mut self, bytes: usize) -> Self {
        self.config.max_image_bytes = bytes;
        self
    }

    pub fn browser(mut self, browser: BrowserOptions) -> Self {
        self.config.browser = browser;
        self
    }

    pub fn renderer(mut self, renderer: Arc<dyn PdfRenderer>) -> Self {
        self.config.renderer = Some(renderer);
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<GeneratorConfig, ExamPdfError> {
        let c = &self.config;
        c.render.validate()?;
        if c.image_concurrency == 0 {
            return Err(ExamPdfError::InvalidConfig(
                "Image concurrency must be ≥ 1".into(),
            ));
        }
        if c.image_fetch_timeout_secs == 0 {
            return Err(ExamPdfError::InvalidConfig(
                "Image fetch timeout must be ≥ 1s".into(),
            ));
        }
        if c.browser.launch_timeout_secs == 0 || c.browser.render_timeout_secs == 0 {
            return Err(ExamPdfError::InvalidConfig(
                "Browser timeouts must be ≥ 1s".into(),
            ));
        }
        c.post.validate()?;
        Ok(self.config)
    }
}

// ── Render options ───────────────────────────────────────────────────────

/// Physical paper formats supported by the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PageSize {
    /// 210 × 297 mm.
    #[default]
    A4,
    /// 8.5 × 11 in.
    Letter,
}

impl PageSize {
    /// Paper width and height in inches.
    pub fn dimensions_in(self) -> (f64, f64) {
        match self {
            PageSize::A4 => (8.27, 11.69),
            PageSize::Letter => (8.5, 11.0),
        }
    }

    /// Name used in the CSS `@page { size: ... }` rule.
    pub fn css_name(self) -> &'static str {
        match self {
            PageSize::A4 => "A4",
            PageSize::Letter => "Letter",
        }
    }
}

/// Page margins as CSS length strings (`"18mm"`, `"0.5in"`, `"40px"`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Margins {
    pub top: String,
    pub right: String,
    pub bottom: String,
    pub left: String,
}

impl Default for Margins {
    fn default() -> Self {
        Self {
            top: "18mm".into(),
            right: "15mm".into(),
            bottom: "18mm".into(),
            left: "15mm".into(),
        }
    }
}

impl Margins {
    /// The same length on all four sides.
    pub fn uniform(len: impl Into<String>) -> Self {
        let len = len.into();
        Self {
            top: len.clone(),
            right: len.clone(),
            bottom: len.clone(),
            left: len,
        }
    }
}

/// Header/footer behaviour of the printed PDF.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeaderFooter {
    /// No header or footer. (default)
    #[default]
    None,
    /// Empty header; footer with the current date left and "Page X / Y" right.
    Default,
    /// Caller-supplied Chromium header/footer snippets. A missing header is
    /// printed empty; a missing footer falls back to the default footer.
    Custom {
        header: Option<String>,
        footer: Option<String>,
    },
}

/// Options for turning HTML into a PDF.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderOptions {
    pub page_size: PageSize,
    pub margins: Margins,
    /// Dots per inch used to size the rendering viewport. Default: 96.
    pub dpi: u32,
    /// Inlined images are downscaled to fit this box. Default: 1600 × 1600.
    pub max_image_width_px: u32,
    pub max_image_height_px: u32,
    /// Lossy re-encode quality, 1–100. Default: 80.
    pub image_quality: u8,
    /// User-Agent for the rendering page. `None` keeps the browser default.
    pub user_agent: Option<String>,
    pub header_footer: HeaderFooter,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            page_size: PageSize::A4,
            margins: Margins::default(),
            dpi: 96,
            max_image_width_px: 1600,
            max_image_height_px: 1600,
            image_quality: 80,
            user_agent: None,
            header_footer: HeaderFooter::None,
        }
    }
}

impl RenderOptions {
    /// Check value ranges and that every margin parses as a length.
    pub fn validate(&self) -> Result<(), ExamPdfError> {
        if !(48..=600).contains(&self.dpi) {
            return Err(ExamPdfError::InvalidConfig(format!(
                "DPI must be 48–600, got {}",
                self.dpi
            )));
        }
        if !(1..=100).contains(&self.image_quality) {
            return Err(ExamPdfError::InvalidConfig(format!(
                "Image quality must be 1–100, got {}",
                self.image_quality
            )));
        }
        if self.max_image_width_px == 0 || self.max_image_height_px == 0 {
            return Err(ExamPdfError::InvalidConfig(
                "Maximum image dimensions must be non-zero".into(),
            ));
        }
        for m in [
            &self.margins.top,
            &self.margins.right,
            &self.margins.bottom,
            &self.margins.left,
        ] {
            crate::pipeline::render::parse_length_in(m)?;
        }
        Ok(())
    }
}

// ── Post-process options ─────────────────────────────────────────────────

/// Options for editing the rendered PDF.
///
/// The default value has every edit switched off, which makes
/// [`crate::pipeline::postprocess::post_process`] return its input unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostProcessOptions {
    pub add_page_numbers: bool,
    pub page_numbers: PageNumberOptions,
    pub watermark: Option<WatermarkOptions>,
    pub metadata: Option<PdfMetadata>,
}

impl PostProcessOptions {
    /// True when no edit is requested.
    pub fn is_noop(&self) -> bool {
        !self.add_page_numbers && self.watermark.is_none() && self.metadata.is_none()
    }

    pub fn validate(&self) -> Result<(), ExamPdfError> {
        if self.add_page_numbers {
            let pn = &self.page_numbers;
            if !is_positive(pn.font_size) {
                return Err(ExamPdfError::InvalidConfig(format!(
                    "Page number font size must be a positive number, got {}",
                    pn.font_size
                )));
            }
            if !(pn.margin_bottom.is_finite() && pn.margin_bottom >= 0.0) {
                return Err(ExamPdfError::InvalidConfig(format!(
                    "Page number bottom margin must be zero or more, got {}",
                    pn.margin_bottom
                )));
            }
        }
        match self.watermark {
            Some(ref wm) => wm.validate(),
            None => Ok(()),
        }
    }
}

/// Placement of the "Page i / N" stamp, in PDF points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageNumberOptions {
    pub font_size: f32,
    /// Distance from the bottom edge of the page to the text baseline.
    pub margin_bottom: f32,
}

impl Default for PageNumberOptions {
    fn default() -> Self {
        Self {
            font_size: 10.0,
            margin_bottom: 20.0,
        }
    }
}

/// A rotated, translucent text overlay stamped on every page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatermarkOptions {
    pub text: String,
    /// Font size in points. Default: 60.
    pub size: f32,
    /// Fill opacity, 0.0–1.0. Default: 0.15.
    pub opacity: f32,
    /// Counter-clockwise rotation in degrees. Default: 45.
    pub rotate_deg: f32,
}

impl WatermarkOptions {
    /// A watermark with the default size, opacity and angle.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            size: 60.0,
            opacity: 0.15,
            rotate_deg: 45.0,
        }
    }

    fn validate(&self) -> Result<(), ExamPdfError> {
        if self.text.trim().is_empty() {
            return Err(ExamPdfError::InvalidConfig("Watermark text is empty".into()));
        }
        if !(0.0..=1.0).contains(&self.opacity) {
            return Err(ExamPdfError::InvalidConfig(format!(
                "Watermark opacity must be 0.0–1.0, got {}",
                self.opacity
            )));
        }
        if !is_positive(self.size) {
            return Err(ExamPdfError::InvalidConfig(format!(
                "Watermark size must be a positive number, got {}",
                self.size
            )));
        }
        if !self.rotate_deg.is_finite() {
            return Err(ExamPdfError::InvalidConfig(format!(
                "Watermark rotation must be finite, got {}",
                self.rotate_deg
            )));
        }
        Ok(())
    }
}

/// Finite and greater than zero; NaN fails.
fn is_positive(x: f32) -> bool {
    x.is_finite() && x > 0.0
}

/// Document information entries. `None` fields are left as they are.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PdfMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
    pub subject: Option<String>,
    pub keywords: Option<String>,
}

// ── Browser options ──────────────────────────────────────────────────────

/// How the built-in renderers launch Chromium.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrowserOptions {
    /// Explicit Chrome/Chromium binary. `None` lets chromiumoxide search PATH.
    pub chrome_executable: Option<PathBuf>,
    /// Pass `--no-sandbox` (needed in most containers). Default: true.
    pub no_sandbox: bool,
    /// Deadline for the browser process to come up. Default: 30.
    pub launch_timeout_secs: u64,
    /// Deadline for each of page load, idle wait and printing. Default: 60.
    pub render_timeout_secs: u64,
    /// How long the page must go without an open network request, after
    /// images and fonts settle, before printing. Default: 500.
    pub network_idle_ms: u64,
    /// Extra command-line switches for Chromium.
    pub extra_args: Vec<String>,
    /// Where per-browser `exampdf-chrome-*` profile directories are created.
    /// `None` uses the system temp directory.
    pub profile_root: Option<PathBuf>,
    /// Maximum browsers a [`crate::ChromePool`] keeps. Default: 2.
    pub pool_size: usize,
    /// Renders after which a pooled browser is recycled. Default: 100.
    pub max_renders_per_browser: usize,
}

impl Default for BrowserOptions {
    fn default() -> Self {
        Self {
            chrome_executable: std::env::var_os("CHROME_PATH").map(PathBuf::from),
            no_sandbox: true,
            launch_timeout_secs: 30,
            render_timeout_secs: 60,
            network_idle_ms: 500,
            extra_args: Vec::new(),
            profile_root: None,
            pool_size: 2,
            max_renders_per_browser: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_builds() {
        let config = GeneratorConfig::builder().build().expect("defaults are valid");
        assert_eq!(config.render.page_size, PageSize::A4);
        assert_eq!(config.render.dpi, 96);
        assert!(config.post.is_noop());
        assert!(config.inline_remote_images);
        assert!(!config.allow_file_urls);
    }

    #[test]
    fn setters_clamp() {
        let config = GeneratorConfig::builder()
            .dpi(5000)
            .image_quality(0)
            .image_concurrency(0)
            .build()
            .unwrap();
        assert_eq!(config.render.dpi, 600);
        assert_eq!(config.render.image_quality, 1);
        assert_eq!(config.image_concurrency, 1);
    }

    #[test]
    fn bad_margin_rejected() {
        let err = GeneratorConfig::builder()
            .margins(Margins::uniform("wide"))
            .build()
            .unwrap_err();
        assert!(matches!(err, ExamPdfError::InvalidConfig(_)));
    }

    #[test]
    fn watermark_opacity_validated() {
        let mut wm = WatermarkOptions::new("DRAFT");
        wm.opacity = 1.5;
        let err = GeneratorConfig::builder()
            .post_options(PostProcessOptions {
                watermark: Some(wm),
                ..Default::default()
            })
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("opacity"));
    }

    #[test]
    fn non_finite_numbers_rejected() {
        let watermark = |f: fn(&mut WatermarkOptions)| {
            let mut wm = WatermarkOptions::new("DRAFT");
            f(&mut wm);
            PostProcessOptions {
                watermark: Some(wm),
                ..Default::default()
            }
        };
        let page_numbers = |font_size: f32, margin_bottom: f32| PostProcessOptions {
            add_page_numbers: true,
            page_numbers: PageNumberOptions {
                font_size,
                margin_bottom,
            },
            ..Default::default()
        };

        let bad = [
            ("size", watermark(|wm| wm.size = f32::NAN)),
            ("size", watermark(|wm| wm.size = f32::INFINITY)),
            ("rotation", watermark(|wm| wm.rotate_deg = f32::NAN)),
            ("opacity", watermark(|wm| wm.opacity = f32::NAN)),
            ("font size", page_numbers(f32::NAN, 20.0)),
            ("bottom margin", page_numbers(10.0, f32::NAN)),
            ("bottom margin", page_numbers(10.0, -1.0)),
        ];
        for (field, post) in bad {
            let err = post.validate().unwrap_err();
            assert!(err.to_string().contains(field), "{field}: {err}");
        }

        // Page-number settings are ignored while stamping is off.
        let mut off = page_numbers(f32::NAN, f32::NAN);
        off.add_page_numbers = false;
        assert!(off.validate().is_ok());
        assert!(watermark(|wm| wm.rotate_deg = -30.0).validate().is_ok());
    }

    #[test]
    fn page_dimensions() {
        assert_eq!(PageSize::A4.dimensions_in(), (8.27, 11.69));
        assert_eq!(PageSize::Letter.dimensions_in(), (8.5, 11.0));
    }

    #[test]
    fn noop_detection() {
        let mut post = PostProcessOptions::default();
        assert!(post.is_noop());
        post.metadata = Some(PdfMetadata::default());
        assert!(!post.is_noop());
    }
}
