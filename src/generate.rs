//! Generation entry points: one request in, one finished PDF out.
//!
//! ```text
//! validate ─▶ [fetch paper ─▶ build html] ─▶ inline images ─▶ render ─▶ post-process
//! ```
//!
//! Validation happens before any I/O. Every later stage consumes only the
//! previous stage's output. A fatal error in any stage aborts the call and is
//! returned unchanged; no partial buffer is ever returned. Per-image failures
//! are the one recovered condition: they are logged, reported in
//! [`GenerationStats::images`] and leave the image un-inlined.

use crate::config::{GeneratorConfig, PostProcessOptions, RenderOptions};
use crate::error::ExamPdfError;
use crate::fetcher::PaperFetcher;
use crate::model::PaperId;
use crate::output::{GenerationOutput, GenerationStats, InlineReport};
use crate::pipeline::inline::{self, InlineOptions};
use crate::pipeline::render::{ChromeRenderer, PdfRenderer};
use crate::pipeline::{postprocess, template};
use crate::progress::{ProgressCallback, Stage};
use std::borrow::Cow;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// What to generate.
///
/// Supply either literal `html`, or a `paper_id` together with a `fetcher`.
/// When both are present the HTML wins; empty or whitespace-only HTML counts
/// as absent.
#[derive(Clone, Default)]
pub struct PdfRequest {
    pub html: Option<String>,
    pub paper_id: Option<PaperId>,
    pub fetcher: Option<Arc<dyn PaperFetcher>>,
    /// Base for resolving `//host/…` and `/path` image sources.
    pub base_url: Option<String>,
    /// Replaces [`GeneratorConfig::render`] for this call.
    pub render_options: Option<RenderOptions>,
    /// Replaces [`GeneratorConfig::post`] for this call.
    pub post_options: Option<PostProcessOptions>,
}

impl fmt::Debug for PdfRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PdfRequest")
            .field("html", &self.html.as_ref().map(|h| format!("<{} bytes>", h.len())))
            .field("paper_id", &self.paper_id)
            .field("fetcher", &self.fetcher.as_ref().map(|_| "<dyn PaperFetcher>"))
            .field("base_url", &self.base_url)
            .field("render_options", &self.render_options)
            .field("post_options", &self.post_options)
            .finish()
    }
}

impl PdfRequest {
    /// Render literal HTML.
    pub fn from_html(html: impl Into<String>) -> Self {
        Self {
            html: Some(html.into()),
            ..Default::default()
        }
    }

    /// Load a paper through `fetcher` and render it with the built-in template.
    pub fn from_paper(id: impl Into<PaperId>, fetcher: Arc<dyn PaperFetcher>) -> Self {
        Self {
            paper_id: Some(id.into()),
            fetcher: Some(fetcher),
            ..Default::default()
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_render_options(mut self, options: RenderOptions) -> Self {
        self.render_options = Some(options);
        self
    }

    pub fn with_post_options(mut self, options: PostProcessOptions) -> Self {
        self.post_options = Some(options);
        self
    }
}

/// The usable input of a validated request.
enum Source<'a> {
    Html(&'a str),
    Paper(&'a PaperId, &'a dyn PaperFetcher),
}

fn validate_request(request: &PdfRequest) -> Result<Source<'_>, ExamPdfError> {
    if let Some(html) = request.html.as_deref().filter(|h| !h.trim().is_empty()) {
        return Ok(Source::Html(html));
    }
    match (&request.paper_id, &request.fetcher) {
        (Some(id), Some(fetcher)) => Ok(Source::Paper(id, fetcher.as_ref())),
        (Some(id), None) => Err(ExamPdfError::Validation(format!(
            "paper id '{id}' given without a paper fetcher"
        ))),
        (None, _) => Err(ExamPdfError::Validation(
            "either html or a paper id with a fetcher is required".into(),
        )),
    }
}

/// Output of the HTML half of the pipeline (everything before rendering).
#[derive(Debug, Clone)]
pub struct PreparedHtml {
    pub html: String,
    pub images: InlineReport,
    pub from_paper: bool,
    pub fetch_duration_ms: u64,
    pub template_duration_ms: u64,
    pub inline_duration_ms: u64,
}

/// Produce the final, image-inlined HTML without rendering it.
pub async fn prepare_html(
    request: &PdfRequest,
    config: &GeneratorConfig,
) -> Result<PreparedHtml, ExamPdfError> {
    let source = validate_request(request)?;
    let render = request.render_options.as_ref().unwrap_or(&config.render);
    render.validate()?;
    prepare_validated(source, request, render, config).await
}

async fn prepare_validated(
    source: Source<'_>,
    request: &PdfRequest,
    render: &RenderOptions,
    config: &GeneratorConfig,
) -> Result<PreparedHtml, ExamPdfError> {
    let cb = config.progress_callback.as_ref();
    let mut fetch_duration_ms = 0;
    let mut template_duration_ms = 0;

    // ── Step 1: Paper → HTML (skipped for literal HTML) ──────────────────
    let (html, from_paper): (Cow<'_, str>, bool) = match source {
        Source::Html(html) => (Cow::Borrowed(html), false),
        Source::Paper(id, fetcher) => {
            let start = stage_start(cb, Stage::FetchPaper);
            let paper = fetcher
                .fetch_paper(id)
                .await?
                .ok_or_else(|| ExamPdfError::PaperNotFound { id: id.to_string() })?;
            fetch_duration_ms = stage_done(cb, Stage::FetchPaper, start);
            info!(
                "Fetched paper '{}': \"{}\" ({} questions)",
                id,
                paper.title,
                paper.questions.len()
            );

            let start = stage_start(cb, Stage::Template);
            let html = template::build_html(&paper, render.page_size, &render.margins);
            template_duration_ms = stage_done(cb, Stage::Template, start);
            debug!("Built {} bytes of HTML", html.len());
            (Cow::Owned(html), true)
        }
    };

    // ── Step 2: Inline images ────────────────────────────────────────────
    let start = stage_start(cb, Stage::Inline);
    let inline_opts = InlineOptions::from_config(config, render);
    let (html, images) =
        inline::inline_images_with_report(&html, request.base_url.as_deref(), &inline_opts).await;
    let inline_duration_ms = stage_done(cb, Stage::Inline, start);

    Ok(PreparedHtml {
        html,
        images,
        from_paper,
        fetch_duration_ms,
        template_duration_ms,
        inline_duration_ms,
    })
}

/// Generate a PDF.
///
/// This is the primary entry point for the library.
///
/// # Errors
/// * [`ExamPdfError::Validation`]: no usable input; raised before any I/O
/// * [`ExamPdfError::PaperNotFound`]: the fetcher has no such paper
/// * render errors: browser launch, CDP failure or deadline
/// * [`ExamPdfError::PostProcessFailed`]: the rendered PDF could not be edited
pub async fn generate_pdf(
    request: &PdfRequest,
    config: &GeneratorConfig,
) -> Result<Vec<u8>, ExamPdfError> {
    Ok(generate_pdf_with_stats(request, config).await?.pdf)
}

/// [`generate_pdf`], also returning timings and image statistics.
pub async fn generate_pdf_with_stats(
    request: &PdfRequest,
    config: &GeneratorConfig,
) -> Result<GenerationOutput, ExamPdfError> {
    let total_start = Instant::now();

    // ── Step 0: Validate (no I/O) ────────────────────────────────────────
    let source = validate_request(request)?;
    let render = request.render_options.as_ref().unwrap_or(&config.render);
    render.validate()?;
    let post = request.post_options.as_ref().unwrap_or(&config.post);
    post.validate()?;
    let renderer = resolve_renderer(config);
    let cb = config.progress_callback.as_ref();

    info!(
        "Starting generation ({})",
        match &source {
            Source::Html(h) => format!("{} bytes of html", h.len()),
            Source::Paper(id, _) => format!("paper '{id}'"),
        }
    );
    if let Some(cb) = cb {
        cb.on_generation_start();
    }

    // ── Steps 1–2: HTML ──────────────────────────────────────────────────
    let prepared = prepare_validated(source, request, render, config).await?;

    // ── Step 3: Render ───────────────────────────────────────────────────
    let start = stage_start(cb, Stage::Render);
    let rendered = renderer.render(&prepared.html, render).await?;
    let render_duration_ms = stage_done(cb, Stage::Render, start);
    info!("Rendered {} bytes in {}ms", rendered.len(), render_duration_ms);

    // ── Step 4: Post-process ─────────────────────────────────────────────
    let start = stage_start(cb, Stage::PostProcess);
    let post_owned = post.clone();
    let (pdf, page_count) = tokio::task::spawn_blocking(move || {
        if post_owned.is_noop() {
            return Ok((rendered, None));
        }
        let out = postprocess::post_process(&rendered, &post_owned)?;
        let pages = postprocess::page_count(&out).ok();
        Ok::<_, ExamPdfError>((out, pages))
    })
    .await
    .map_err(|e| ExamPdfError::Internal(format!("Post-process task panicked: {e}")))??;
    let postprocess_duration_ms = stage_done(cb, Stage::PostProcess, start);

    let stats = GenerationStats {
        from_paper: prepared.from_paper,
        html_bytes: prepared.html.len(),
        images: prepared.images,
        page_count,
        pdf_bytes: pdf.len(),
        fetch_duration_ms: prepared.fetch_duration_ms,
        template_duration_ms: prepared.template_duration_ms,
        inline_duration_ms: prepared.inline_duration_ms,
        render_duration_ms,
        postprocess_duration_ms,
        total_duration_ms: total_start.elapsed().as_millis() as u64,
    };

    info!(
        "Generation complete: {} bytes, {}/{} images inlined, {}ms total",
        stats.pdf_bytes, stats.images.inlined, stats.images.found, stats.total_duration_ms
    );
    if let Some(cb) = cb {
        cb.on_generation_complete(pdf.len());
    }

    Ok(GenerationOutput { pdf, stats })
}

/// Generate a PDF and write it to `output_path`.
///
/// Uses atomic write (temp file + rename) to prevent partial files.
pub async fn generate_to_file(
    request: &PdfRequest,
    output_path: impl AsRef<Path>,
    config: &GeneratorConfig,
) -> Result<GenerationStats, ExamPdfError> {
    let output = generate_pdf_with_stats(request, config).await?;
    let path = output_path.as_ref();
    let write_err = |source| ExamPdfError::OutputWriteFailed {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }

    let tmp_path = path.with_extension("pdf.tmp");
    tokio::fs::write(&tmp_path, &output.pdf)
        .await
        .map_err(write_err)?;
    tokio::fs::rename(&tmp_path, path).await.map_err(write_err)?;

    Ok(output.stats)
}

/// Synchronous wrapper around [`generate_pdf`].
///
/// Creates a temporary tokio runtime internally; do not call from within an
/// async context.
pub fn generate_sync(
    request: &PdfRequest,
    config: &GeneratorConfig,
) -> Result<Vec<u8>, ExamPdfError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| ExamPdfError::Internal(format!("Failed to create tokio runtime: {e}")))?
        .block_on(generate_pdf(request, config))
}

// ── Internal helpers ─────────────────────────────────────────────────────

/// The configured renderer (e.g. a shared pool), or a one-shot Chromium
/// renderer built from the browser options.
fn resolve_renderer(config: &GeneratorConfig) -> Arc<dyn PdfRenderer> {
    match config.renderer {
        Some(ref renderer) => Arc::clone(renderer),
        None => Arc::new(ChromeRenderer::new(config.browser.clone())),
    }
}

fn stage_start(cb: Option<&ProgressCallback>, stage: Stage) -> Instant {
    debug!("Stage start: {}", stage);
    if let Some(cb) = cb {
        cb.on_stage_start(stage);
    }
    Instant::now()
}

fn stage_done(cb: Option<&ProgressCallback>, stage: Stage, start: Instant) -> u64 {
    let ms = start.elapsed().as_millis() as u64;
    debug!("Stage done: {} ({}ms)", stage, ms);
    if let Some(cb) = cb {
        cb.on_stage_complete(stage, ms);
    }
    ms
}
