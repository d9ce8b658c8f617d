//! CLI binary for exam-pdf.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `GeneratorConfig` / `PdfRequest` and writes the result.

use anyhow::{bail, Context, Result};
use clap::Parser;
use exam_pdf::{
    generate_to_file, prepare_html, BrowserOptions, GenerationProgressCallback, GeneratorConfig,
    HeaderFooter, JsonDirFetcher, Margins, PageSize, PaperData, PaperFetcher, PaperId,
    PdfMetadata, PdfRequest, PostProcessOptions, ProgressCallback, Stage, WatermarkOptions,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::convert::Infallible;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal spinner that names the current stage and logs each image as it
/// lands. Image events arrive out of order from concurrent fetches.
struct CliProgressCallback {
    bar: ProgressBar,
    image_errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}  {elapsed:.dim}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(style);
        bar.set_prefix("Preparing");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            image_errors: AtomicUsize::new(0),
        })
    }
}

impl GenerationProgressCallback for CliProgressCallback {
    fn on_stage_start(&self, stage: Stage) {
        self.bar.set_prefix(match stage {
            Stage::FetchPaper => "Fetching",
            Stage::Template => "Building",
            Stage::Inline => "Inlining",
            Stage::Render => "Rendering",
            Stage::PostProcess => "Finishing",
        });
        self.bar.set_message(stage.to_string());
    }

    fn on_stage_complete(&self, stage: Stage, duration_ms: u64) {
        self.bar.println(format!(
            "  {} {:<14} {}",
            green("✓"),
            stage.to_string(),
            dim(&format!("{:.1}s", duration_ms as f64 / 1000.0)),
        ));
    }

    fn on_image_complete(&self, url: &str, bytes: usize) {
        self.bar.println(format!(
            "    {} {}  {}",
            dim("·"),
            truncate(url, 70),
            dim(&format!("{} KiB", bytes / 1024)),
        ));
    }

    fn on_image_error(&self, url: &str, error: &str) {
        self.image_errors.fetch_add(1, Ordering::SeqCst);
        self.bar.println(format!(
            "    {} {}  {}",
            red("✗"),
            truncate(url, 70),
            red(&truncate(error, 60)),
        ));
    }

    fn on_generation_complete(&self, pdf_bytes: usize) {
        self.bar.finish_and_clear();
        let failed = self.image_errors.load(Ordering::SeqCst);
        if failed == 0 {
            eprintln!("{} PDF ready ({} KiB)", green("✔"), pdf_bytes / 1024);
        } else {
            eprintln!(
                "{} PDF ready ({} KiB), {} image(s) left un-inlined",
                cyan("⚠"),
                pdf_bytes / 1024,
                red(&failed.to_string()),
            );
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let head: String = s.chars().take(max - 1).collect();
        format!("{head}\u{2026}")
    } else {
        s.to_string()
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Render a paper stored as JSON
  exampdf midterm.json -o midterm.pdf

  # Look a paper up by id in a directory of <id>.json files
  exampdf --paper-id 42 --paper-dir ./papers

  # Render an HTML file on Letter paper with page numbers and a watermark
  exampdf notes.html --page-size letter --page-numbers --watermark DRAFT

  # Resolve /static/... image paths against a server
  exampdf notes.html --base-url https://school.example.com

  # Inspect the final HTML (images inlined) without launching a browser
  exampdf midterm.json --html-only > midterm.html

ENVIRONMENT VARIABLES:
  CHROME_PATH      Chrome/Chromium binary (otherwise searched on PATH)
  RUST_LOG         Log filter, overrides -v / -q
  EXAMPDF_*        Every flag can also be set through its EXAMPDF_ variable
"#;

/// Render exam papers and HTML documents to print-ready PDF.
#[derive(Parser, Debug)]
#[command(
    name = "exampdf",
    version,
    about = "Render exam papers and HTML documents to print-ready PDF",
    long_about = "Render a question paper (JSON) or an HTML document to PDF with headless \
Chromium. Images are downloaded, downscaled and embedded before printing; page numbers, \
a watermark and document metadata can be stamped afterwards.",
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// An .html document or a .json paper file.
    #[arg(required_unless_present = "paper_id")]
    input: Option<PathBuf>,

    /// Paper id to load from --paper-dir.
    #[arg(long, env = "EXAMPDF_PAPER_ID", requires = "paper_dir", conflicts_with = "input")]
    paper_id: Option<String>,

    /// Directory holding <id>.json paper files.
    #[arg(long, env = "EXAMPDF_PAPER_DIR")]
    paper_dir: Option<PathBuf>,

    /// Write the PDF here. Default: input name with a .pdf extension.
    #[arg(short, long, env = "EXAMPDF_OUTPUT")]
    output: Option<PathBuf>,

    /// Paper format.
    #[arg(long, env = "EXAMPDF_PAGE_SIZE", value_enum, default_value = "a4")]
    page_size: PageSizeArg,

    /// CSS margins: one value for all sides, or four as top,right,bottom,left.
    #[arg(long, env = "EXAMPDF_MARGINS")]
    margins: Option<String>,

    /// Rendering DPI (48–600).
    #[arg(long, env = "EXAMPDF_DPI", default_value_t = 96,
          value_parser = clap::value_parser!(u32).range(48..=600))]
    dpi: u32,

    /// Maximum embedded image width in pixels.
    #[arg(long, env = "EXAMPDF_MAX_IMAGE_WIDTH", default_value_t = 1600)]
    max_image_width: u32,

    /// Maximum embedded image height in pixels.
    #[arg(long, env = "EXAMPDF_MAX_IMAGE_HEIGHT", default_value_t = 1600)]
    max_image_height: u32,

    /// JPEG quality for re-encoded images (1–100).
    #[arg(long, env = "EXAMPDF_IMAGE_QUALITY", default_value_t = 80,
          value_parser = clap::value_parser!(u8).range(1..=100))]
    image_quality: u8,

    /// Concurrent image downloads.
    #[arg(long, env = "EXAMPDF_IMAGE_CONCURRENCY", default_value_t = 8)]
    image_concurrency: usize,

    /// Per-image download timeout in seconds.
    #[arg(long, env = "EXAMPDF_IMAGE_TIMEOUT", default_value_t = 20)]
    image_timeout: u64,

    /// Leave remote images as links instead of embedding them.
    #[arg(long, env = "EXAMPDF_NO_REMOTE_IMAGES")]
    no_remote_images: bool,

    /// Embed file:// images from the local disk.
    #[arg(long, env = "EXAMPDF_ALLOW_FILE_URLS")]
    allow_file_urls: bool,

    /// Base URL for //host and /path image sources.
    #[arg(long, env = "EXAMPDF_BASE_URL")]
    base_url: Option<String>,

    /// User-Agent for image downloads and the browser.
    #[arg(long, env = "EXAMPDF_USER_AGENT")]
    user_agent: Option<String>,

    /// Print Chromium's default footer (date and "Page X / Y").
    #[arg(long, env = "EXAMPDF_HEADER_FOOTER")]
    header_footer: bool,

    /// File with a Chromium header template snippet.
    #[arg(long, env = "EXAMPDF_HEADER_TEMPLATE")]
    header_template: Option<PathBuf>,

    /// File with a Chromium footer template snippet.
    #[arg(long, env = "EXAMPDF_FOOTER_TEMPLATE")]
    footer_template: Option<PathBuf>,

    /// Stamp "Page i / N" at the bottom of every page.
    #[arg(long, env = "EXAMPDF_PAGE_NUMBERS")]
    page_numbers: bool,

    /// Diagonal watermark text.
    #[arg(long, env = "EXAMPDF_WATERMARK")]
    watermark: Option<String>,

    /// Watermark opacity (0.0–1.0).
    #[arg(long, env = "EXAMPDF_WATERMARK_OPACITY", default_value_t = 0.15)]
    watermark_opacity: f32,

    /// PDF metadata: title.
    #[arg(long, env = "EXAMPDF_TITLE")]
    title: Option<String>,

    /// PDF metadata: author.
    #[arg(long, env = "EXAMPDF_AUTHOR")]
    author: Option<String>,

    /// PDF metadata: subject.
    #[arg(long, env = "EXAMPDF_SUBJECT")]
    subject: Option<String>,

    /// PDF metadata: keywords.
    #[arg(long, env = "EXAMPDF_KEYWORDS")]
    keywords: Option<String>,

    /// Chrome/Chromium executable.
    #[arg(long, env = "CHROME_PATH")]
    chrome_path: Option<PathBuf>,

    /// Keep Chromium's sandbox enabled.
    #[arg(long, env = "EXAMPDF_SANDBOX")]
    sandbox: bool,

    /// Directory for temporary browser profiles (default: system temp dir).
    #[arg(long, env = "EXAMPDF_PROFILE_DIR")]
    profile_dir: Option<PathBuf>,

    /// Browser launch timeout in seconds.
    #[arg(long, env = "EXAMPDF_LAUNCH_TIMEOUT", default_value_t = 30)]
    launch_timeout: u64,

    /// Per-step render timeout in seconds.
    #[arg(long, env = "EXAMPDF_RENDER_TIMEOUT", default_value_t = 60)]
    render_timeout: u64,

    /// Print the final HTML (images inlined) to stdout or -o and stop.
    #[arg(long)]
    html_only: bool,

    /// Print generation stats as JSON on stdout.
    #[arg(long, env = "EXAMPDF_JSON")]
    json: bool,

    /// Disable the progress spinner.
    #[arg(long, env = "EXAMPDF_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "EXAMPDF_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "EXAMPDF_QUIET")]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum PageSizeArg {
    A4,
    Letter,
}

impl From<PageSizeArg> for PageSize {
    fn from(v: PageSizeArg) -> Self {
        match v {
            PageSizeArg::A4 => PageSize::A4,
            PageSizeArg::Letter => PageSize::Letter,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The spinner provides the feedback that matters; keep INFO logs out of it.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json && !cli.html_only;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Build config and request ─────────────────────────────────────────
    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn GenerationProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress_cb).await?;
    let (request, default_stem) = build_request(&cli).await?;

    // ── HTML-only mode ───────────────────────────────────────────────────
    if cli.html_only {
        let prepared = prepare_html(&request, &config)
            .await
            .context("Failed to build HTML")?;
        match cli.output {
            Some(ref path) => tokio::fs::write(path, &prepared.html)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?,
            None => io::stdout()
                .lock()
                .write_all(prepared.html.as_bytes())
                .context("Failed to write to stdout")?,
        }
        if !cli.quiet && !prepared.images.is_complete() {
            eprintln!(
                "{} {} image(s) could not be inlined",
                cyan("⚠"),
                prepared.images.failed.len()
            );
        }
        return Ok(());
    }

    // ── Generate ─────────────────────────────────────────────────────────
    let output_path = cli
        .output
        .clone()
        .unwrap_or_else(|| PathBuf::from(format!("{default_stem}.pdf")));

    let stats = generate_to_file(&request, &output_path, &config)
        .await
        .context("Generation failed")?;

    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&stats).context("Failed to serialise stats")?
        );
    } else if !cli.quiet {
        eprintln!(
            "{}  {}/{} images  {}ms  →  {}",
            if stats.images.is_complete() {
                green("✔")
            } else {
                cyan("⚠")
            },
            stats.images.inlined,
            stats.images.found,
            stats.total_duration_ms,
            bold(&output_path.display().to_string()),
        );
        if let Some(pages) = stats.page_count {
            eprintln!("   {}", dim(&format!("{pages} pages, {} bytes", stats.pdf_bytes)));
        }
    }

    Ok(())
}

/// Map CLI args to `GeneratorConfig`.
async fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<GeneratorConfig> {
    let header_footer = match (&cli.header_template, &cli.footer_template) {
        (None, None) if cli.header_footer => HeaderFooter::Default,
        (None, None) => HeaderFooter::None,
        (header, footer) => HeaderFooter::Custom {
            header: read_optional(header.as_deref()).await?,
            footer: read_optional(footer.as_deref()).await?,
        },
    };

    let metadata = PdfMetadata {
        title: cli.title.clone(),
        author: cli.author.clone(),
        subject: cli.subject.clone(),
        keywords: cli.keywords.clone(),
    };
    let has_metadata = metadata != PdfMetadata::default();

    let post = PostProcessOptions {
        add_page_numbers: cli.page_numbers,
        watermark: cli.watermark.as_ref().map(|text| WatermarkOptions {
            opacity: cli.watermark_opacity,
            ..WatermarkOptions::new(text.clone())
        }),
        metadata: has_metadata.then_some(metadata),
        ..Default::default()
    };

    let browser = BrowserOptions {
        chrome_executable: cli.chrome_path.clone(),
        no_sandbox: !cli.sandbox,
        profile_root: cli.profile_dir.clone(),
        launch_timeout_secs: cli.launch_timeout,
        render_timeout_secs: cli.render_timeout,
        ..Default::default()
    };

    let mut builder = GeneratorConfig::builder()
        .page_size(cli.page_size.into())
        .dpi(cli.dpi)
        .max_image_size(cli.max_image_width, cli.max_image_height)
        .image_quality(cli.image_quality)
        .header_footer(header_footer)
        .inline_remote_images(!cli.no_remote_images)
        .allow_file_urls(cli.allow_file_urls)
        .image_concurrency(cli.image_concurrency)
        .image_fetch_timeout_secs(cli.image_timeout)
        .post_options(post)
        .browser(browser);

    if let Some(ref margins) = cli.margins {
        builder = builder.margins(parse_margins(margins)?);
    }
    if let Some(ref ua) = cli.user_agent {
        builder = builder.user_agent(ua.clone());
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

/// Map the input arguments to a request plus a default output file stem.
async fn build_request(cli: &Cli) -> Result<(PdfRequest, String)> {
    let (request, stem) = match (&cli.paper_id, &cli.input, &cli.paper_dir) {
        (Some(id), _, Some(dir)) => {
            let fetcher: Arc<dyn PaperFetcher> = Arc::new(JsonDirFetcher::new(dir));
            (
                PdfRequest::from_paper(parse_paper_id(id), fetcher),
                format!("paper-{id}"),
            )
        }
        (None, Some(path), _) => {
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "document".to_string());
            let ext = path
                .extension()
                .map(|e| e.to_string_lossy().to_ascii_lowercase());
            let request = match ext.as_deref() {
                Some("json") => {
                    let raw = tokio::fs::read(path)
                        .await
                        .with_context(|| format!("Failed to read {}", path.display()))?;
                    let paper: PaperData = serde_json::from_slice(&raw)
                        .with_context(|| format!("{} is not a valid paper", path.display()))?;
                    PdfRequest::from_paper(PaperId::Text(stem.clone()), single_paper(paper))
                }
                Some("html") | Some("htm") => {
                    let html = tokio::fs::read_to_string(path)
                        .await
                        .with_context(|| format!("Failed to read {}", path.display()))?;
                    PdfRequest::from_html(html)
                }
                _ => bail!("Unsupported input {}: expected .html or .json", path.display()),
            };
            (request, stem)
        }
        _ => bail!("Provide an input file, or --paper-id with --paper-dir"),
    };

    let request = match cli.base_url {
        Some(ref base) => request.with_base_url(base.clone()),
        None => request,
    };
    Ok((request, stem))
}

/// A fetcher that always answers with the one paper read from disk.
fn single_paper(paper: PaperData) -> Arc<dyn PaperFetcher> {
    let paper = Arc::new(paper);
    Arc::new(move |_id: PaperId| {
        let paper = Arc::clone(&paper);
        async move { Ok::<_, Infallible>(Some((*paper).clone())) }
    })
}

fn parse_paper_id(s: &str) -> PaperId {
    match s.parse::<i64>() {
        Ok(n) => PaperId::Number(n),
        Err(_) => PaperId::Text(s.to_string()),
    }
}

/// Parse `--margins`: `18mm` or `18mm,15mm,18mm,15mm`.
fn parse_margins(s: &str) -> Result<Margins> {
    let parts: Vec<&str> = s.split(',').map(str::trim).collect();
    match parts.as_slice() {
        [all] if !all.is_empty() => Ok(Margins::uniform(*all)),
        [top, right, bottom, left] => Ok(Margins {
            top: top.to_string(),
            right: right.to_string(),
            bottom: bottom.to_string(),
            left: left.to_string(),
        }),
        _ => bail!("Invalid --margins '{s}': give one value or four (top,right,bottom,left)"),
    }
}

async fn read_optional(path: Option<&Path>) -> Result<Option<String>> {
    match path {
        Some(p) => Ok(Some(
            tokio::fs::read_to_string(p)
                .await
                .with_context(|| format!("Failed to read template {}", p.display()))?,
        )),
        None => Ok(None),
    }
}
