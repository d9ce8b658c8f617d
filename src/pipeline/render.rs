//! HTML → PDF rendering through headless Chromium (CDP via `chromiumoxide`).
//!
//! ## Renderers
//!
//! * [`ChromeRenderer`]: launches a fresh browser for every call and closes
//!   it before returning. No state survives between calls.
//! * [`ChromePool`]: keeps up to `pool_size` browsers alive and hands them
//!   out one render at a time. A browser is discarded after a failed render
//!   or after `max_renders_per_browser` renders.
//!
//! Both implement [`PdfRenderer`], the seam the generator renders through;
//! tests plug in their own implementation.
//!
//! ## Render steps
//!
//! ```text
//! new page ─▶ viewport (dpi × inches) ─▶ set_content ─▶ wait idle ─▶ media=print ─▶ printToPDF
//! ```
//!
//! "Wait idle" follows the page's requests over CDP (`requestWillBeSent`
//! against `loadingFinished` / `loadingFailed`) and resolves after
//! `network_idle_ms` with none in flight.
//!
//! Each step runs under `render_timeout_secs`; launching runs under
//! `launch_timeout_secs`. The page is closed on every exit path, and a
//! one-shot browser is closed whether or not rendering succeeded.

use crate::config::{BrowserOptions, HeaderFooter, PageSize, RenderOptions};
use crate::error::ExamPdfError;
use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::emulation::{
    SetDeviceMetricsOverrideParams, SetEmulatedMediaParams, SetUserAgentOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::network::{
    EventLoadingFailed, EventLoadingFinished, EventRequestWillBeSent,
};
use chromiumoxide::cdp::browser_protocol::page::PrintToPdfParams;
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::error::CdpError;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::convert::Infallible;
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Grace period for closing a page or browser before it is killed.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Turns a complete HTML document into PDF bytes.
#[async_trait]
pub trait PdfRenderer: Send + Sync {
    async fn render(&self, html: &str, options: &RenderOptions) -> Result<Vec<u8>, ExamPdfError>;
}

// ── Geometry ─────────────────────────────────────────────────────────────

/// Viewport in CSS pixels for a paper size at the given DPI.
pub fn viewport_for(page_size: PageSize, dpi: u32) -> (u32, u32) {
    let (w_in, h_in) = page_size.dimensions_in();
    let dpi = dpi as f64;
    ((w_in * dpi).round() as u32, (h_in * dpi).round() as u32)
}

/// Parse a CSS length into inches.
///
/// Accepts `mm`, `cm`, `in`, `px` (96 per inch) and `pt` (72 per inch);
/// a bare number is taken as pixels.
pub fn parse_length_in(len: &str) -> Result<f64, ExamPdfError> {
    let s = len.trim().to_ascii_lowercase();
    let (num, per_inch) = if let Some(n) = s.strip_suffix("mm") {
        (n, 25.4)
    } else if let Some(n) = s.strip_suffix("cm") {
        (n, 2.54)
    } else if let Some(n) = s.strip_suffix("in") {
        (n, 1.0)
    } else if let Some(n) = s.strip_suffix("px") {
        (n, 96.0)
    } else if let Some(n) = s.strip_suffix("pt") {
        (n, 72.0)
    } else {
        (s.as_str(), 96.0)
    };
    match num.trim().parse::<f64>() {
        Ok(v) if v.is_finite() && v >= 0.0 => Ok(v / per_inch),
        _ => Err(ExamPdfError::InvalidConfig(format!(
            "Invalid length '{len}' (expected e.g. 18mm, 1.5cm, 0.5in, 40px, 12pt)"
        ))),
    }
}

// ── Header / footer ──────────────────────────────────────────────────────

/// Footer used by [`HeaderFooter::Default`]: print date left, page counter right.
pub const DEFAULT_FOOTER_TEMPLATE: &str = concat!(
    r#"<div style="width:100%;font-size:9px;color:#444;padding:0 15mm;"#,
    r#"display:flex;justify-content:space-between;">"#,
    r#"<span class="date"></span>"#,
    r#"<span>Page <span class="pageNumber"></span> / <span class="totalPages"></span></span>"#,
    r#"</div>"#
);

const EMPTY_TEMPLATE: &str = "<div></div>";

/// Header and footer snippets for `printToPDF`, or `None` to print without.
pub fn header_footer_templates(hf: &HeaderFooter) -> Option<(String, String)> {
    match hf {
        HeaderFooter::None => None,
        HeaderFooter::Default => Some((EMPTY_TEMPLATE.into(), DEFAULT_FOOTER_TEMPLATE.into())),
        HeaderFooter::Custom { header, footer } => Some((
            header.clone().unwrap_or_else(|| EMPTY_TEMPLATE.into()),
            footer.clone().unwrap_or_else(|| DEFAULT_FOOTER_TEMPLATE.into()),
        )),
    }
}

/// Build the CDP print parameters for a render.
pub fn print_params(options: &RenderOptions) -> Result<PrintToPdfParams, ExamPdfError> {
    let (w_in, h_in) = options.page_size.dimensions_in();
    let m = &options.margins;
    let mut params = PrintToPdfParams {
        print_background: Some(true),
        paper_width: Some(w_in),
        paper_height: Some(h_in),
        margin_top: Some(parse_length_in(&m.top)?),
        margin_right: Some(parse_length_in(&m.right)?),
        margin_bottom: Some(parse_length_in(&m.bottom)?),
        margin_left: Some(parse_length_in(&m.left)?),
        prefer_css_page_size: Some(false),
        display_header_footer: Some(false),
        ..Default::default()
    };
    if let Some((header, footer)) = header_footer_templates(&options.header_footer) {
        params.display_header_footer = Some(true);
        params.header_template = Some(header);
        params.footer_template = Some(footer);
    }
    Ok(params)
}

// ── Idle wait ────────────────────────────────────────────────────────────

/// Resolves once the document has loaded, every `<img>` has settled and
/// fonts are ready.
const WAIT_LOADED_JS: &str = r#"(async () => {
  if (document.readyState !== 'complete') {
    await new Promise(r => window.addEventListener('load', r, { once: true }));
  }
  const pending = Array.from(document.images).filter(img => !img.complete);
  await Promise.all(pending.map(img => new Promise(r => {
    img.addEventListener('load', r, { once: true });
    img.addEventListener('error', r, { once: true });
  })));
  if (document.fonts && document.fonts.ready) { await document.fonts.ready; }
  return document.images.length;
})()"#;

/// How often the quiet-window check wakes up.
const IDLE_POLL: Duration = Duration::from_millis(50);

/// Requests a page has in flight, keyed by CDP request id.
#[derive(Debug)]
struct NetworkActivity {
    inflight: HashSet<String>,
    last_change: Instant,
}

impl NetworkActivity {
    fn new(now: Instant) -> Self {
        Self {
            inflight: HashSet::new(),
            last_change: now,
        }
    }

    fn started(&mut self, id: String, now: Instant) {
        // Redirects reuse the id of the original request.
        self.inflight.insert(id);
        self.last_change = now;
    }

    fn finished(&mut self, id: &str, now: Instant) {
        if self.inflight.remove(id) {
            self.last_change = now;
        }
    }

    /// How long the network has been quiet, or `None` while requests are open.
    fn quiet_for(&self, now: Instant) -> Option<Duration> {
        self.inflight
            .is_empty()
            .then(|| now.saturating_duration_since(self.last_change))
    }
}

/// Subscribe to the page's network events before any content is loaded.
async fn watch_network(
    page: &Page,
) -> Result<(Arc<Mutex<NetworkActivity>>, JoinHandle<()>), CdpError> {
    let started = page
        .event_listener::<EventRequestWillBeSent>()
        .await?
        .map(|e| (true, e.request_id.inner().clone()));
    let finished = page
        .event_listener::<EventLoadingFinished>()
        .await?
        .map(|e| (false, e.request_id.inner().clone()));
    let failed = page
        .event_listener::<EventLoadingFailed>()
        .await?
        .map(|e| (false, e.request_id.inner().clone()));
    let mut events = stream::select(started, stream::select(finished, failed));

    let activity = Arc::new(Mutex::new(NetworkActivity::new(Instant::now())));
    let sink = Arc::clone(&activity);
    let handle = tokio::spawn(async move {
        while let Some((is_start, id)) = events.next().await {
            let mut activity = sink.lock().await;
            if is_start {
                activity.started(id, Instant::now());
            } else {
                activity.finished(&id, Instant::now());
            }
        }
    });
    Ok((activity, handle))
}

/// Wait until no request has been open for `quiet`.
async fn network_quiet(activity: &Mutex<NetworkActivity>, quiet: Duration) {
    loop {
        let quiet_for = activity.lock().await.quiet_for(Instant::now());
        let wait = match quiet_for {
            Some(q) if q >= quiet => return,
            Some(q) => quiet - q,
            None => IDLE_POLL,
        };
        tokio::time::sleep(wait.min(IDLE_POLL)).await;
    }
}

/// Run one render step under a deadline.
async fn step<T, E, F>(stage: &'static str, secs: u64, fut: F) -> Result<T, ExamPdfError>
where
    E: Display,
    F: Future<Output = Result<T, E>>,
{
    match tokio::time::timeout(Duration::from_secs(secs), fut).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(ExamPdfError::RenderFailed {
            stage,
            detail: e.to_string(),
        }),
        Err(_) => Err(ExamPdfError::RenderTimeout { stage, secs }),
    }
}

// ── Browser session ──────────────────────────────────────────────────────

/// One launched browser, its CDP event loop and its private profile directory.
struct BrowserSession {
    browser: Browser,
    handler: JoinHandle<()>,
    renders: usize,
    // Removed from disk when the session is dropped, after the browser exits.
    _profile: TempDir,
}

impl BrowserSession {
    async fn launch(opts: &BrowserOptions) -> Result<Self, ExamPdfError> {
        let mut dir = tempfile::Builder::new();
        dir.prefix("exampdf-chrome-");
        let profile = match opts.profile_root {
            Some(ref root) => dir.tempdir_in(root),
            None => dir.tempdir(),
        }
        .map_err(|e| ExamPdfError::BrowserLaunchFailed {
            reason: format!("could not create profile directory: {e}"),
        })?;

        let mut args: Vec<String> = vec![
            "--disable-gpu".into(),
            "--disable-dev-shm-usage".into(),
            "--hide-scrollbars".into(),
            "--mute-audio".into(),
            "--font-render-hinting=none".into(),
        ];
        args.extend(opts.extra_args.iter().cloned());

        let mut builder = BrowserConfig::builder()
            .new_headless_mode()
            .user_data_dir(profile.path())
            .request_timeout(Duration::from_secs(opts.render_timeout_secs))
            .args(args);
        if opts.no_sandbox {
            builder = builder.no_sandbox();
        }
        if let Some(ref exe) = opts.chrome_executable {
            builder = builder.chrome_executable(exe);
        }
        let config = builder
            .build()
            .map_err(|reason| ExamPdfError::BrowserLaunchFailed { reason })?;

        let secs = opts.launch_timeout_secs;
        let (browser, mut handler) =
            match tokio::time::timeout(Duration::from_secs(secs), Browser::launch(config)).await {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => {
                    return Err(ExamPdfError::BrowserLaunchFailed {
                        reason: e.to_string(),
                    })
                }
                Err(_) => {
                    return Err(ExamPdfError::RenderTimeout {
                        stage: "browser launch",
                        secs,
                    })
                }
            };

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("CDP handler: {}", e);
                }
            }
        });

        debug!("Browser launched (profile {})", profile.path().display());
        Ok(Self {
            browser,
            handler,
            renders: 0,
            _profile: profile,
        })
    }

    /// Render on a fresh page of this browser. The page is always closed.
    async fn render(
        &mut self,
        html: &str,
        options: &RenderOptions,
        opts: &BrowserOptions,
    ) -> Result<Vec<u8>, ExamPdfError> {
        self.renders += 1;
        let secs = opts.render_timeout_secs;
        let page = step("new page", secs, self.browser.new_page("about:blank")).await?;

        let result = print_page(&page, html, options, opts).await;

        match tokio::time::timeout(CLOSE_GRACE, page.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Closing page failed: {}", e),
            Err(_) => debug!("Closing page timed out"),
        }
        result
    }

    /// Close the browser, killing it if it does not exit in time.
    async fn close(mut self) {
        let closed = matches!(
            tokio::time::timeout(CLOSE_GRACE, self.browser.close()).await,
            Ok(Ok(_))
        );
        if !closed {
            warn!("Browser did not close cleanly; killing it");
            if let Some(Err(e)) = self.browser.kill().await {
                warn!("Failed to kill browser: {}", e);
            }
        }
        if tokio::time::timeout(CLOSE_GRACE, self.browser.wait()).await.is_err() {
            warn!("Timed out waiting for browser exit");
        }
        self.handler.abort();
        debug!("Browser closed after {} render(s)", self.renders);
    }
}

async fn print_page(
    page: &Page,
    html: &str,
    options: &RenderOptions,
    opts: &BrowserOptions,
) -> Result<Vec<u8>, ExamPdfError> {
    let secs = opts.render_timeout_secs;

    // ── Step 1: Viewport at the physical page scale ──────────────────────
    let (vw, vh) = viewport_for(options.page_size, options.dpi);
    debug!(
        "Viewport {}x{} px ({:?} @ {} dpi)",
        vw, vh, options.page_size, options.dpi
    );
    step(
        "viewport",
        secs,
        page.execute(SetDeviceMetricsOverrideParams::new(vw as i64, vh as i64, 1.0, false)),
    )
    .await?;

    if let Some(ref ua) = options.user_agent {
        step(
            "user agent",
            secs,
            page.execute(SetUserAgentOverrideParams::new(ua.clone())),
        )
        .await?;
    }

    // ── Step 2: Load content and wait for it to settle ───────────────────
    let (activity, watcher) = step("network watch", secs, watch_network(page)).await?;
    let settled = load_and_settle(page, html, &activity, opts).await;
    watcher.abort();
    settled?;

    // ── Step 3: Print ────────────────────────────────────────────────────
    step(
        "print media",
        secs,
        page.execute(SetEmulatedMediaParams {
            media: Some("print".into()),
            features: None,
        }),
    )
    .await?;

    let params = print_params(options)?;
    let pdf = step("print", secs, page.pdf(params)).await?;
    debug!("Printed {} bytes", pdf.len());
    Ok(pdf)
}

/// Load the document, then wait for images and fonts followed by a window of
/// `network_idle_ms` with no request in flight.
async fn load_and_settle(
    page: &Page,
    html: &str,
    activity: &Mutex<NetworkActivity>,
    opts: &BrowserOptions,
) -> Result<(), ExamPdfError> {
    let secs = opts.render_timeout_secs;
    step("page load", secs, async { page.set_content(html).await.map(|_| ()) }).await?;

    let eval = EvaluateParams::builder()
        .expression(WAIT_LOADED_JS)
        .await_promise(true)
        .return_by_value(true)
        .build()
        .map_err(|detail| ExamPdfError::RenderFailed {
            stage: "document load",
            detail,
        })?;
    step("document load", secs, page.evaluate_expression(eval)).await?;

    let quiet = Duration::from_millis(opts.network_idle_ms);
    step("network idle", secs, async {
        network_quiet(activity, quiet).await;
        Ok::<_, Infallible>(())
    })
    .await
}

// ── One-shot renderer ────────────────────────────────────────────────────

/// Launches an isolated browser per render and closes it afterwards.
#[derive(Debug, Clone, Default)]
pub struct ChromeRenderer {
    options: BrowserOptions,
}

impl ChromeRenderer {
    pub fn new(options: BrowserOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl PdfRenderer for ChromeRenderer {
    async fn render(&self, html: &str, options: &RenderOptions) -> Result<Vec<u8>, ExamPdfError> {
        let mut session = BrowserSession::launch(&self.options).await?;
        let result = session.render(html, options, &self.options).await;
        session.close().await;
        result
    }
}

// ── Pool ─────────────────────────────────────────────────────────────────

/// A bounded pool of reusable browsers.
///
/// At most `pool_size` renders run at once; further callers wait for a slot.
/// Call [`ChromePool::shutdown`] before dropping the pool to close its
/// browsers cleanly.
///
/// ```rust,no_run
/// use exam_pdf::{BrowserOptions, ChromePool, GeneratorConfig};
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = Arc::new(ChromePool::new(BrowserOptions::default()));
/// pool.warmup(1).await?;
/// let config = GeneratorConfig::builder().renderer(pool.clone()).build()?;
/// // ... generate documents with `config` ...
/// pool.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct ChromePool {
    options: BrowserOptions,
    size: usize,
    slots: Semaphore,
    idle: Mutex<Vec<BrowserSession>>,
    closed: AtomicBool,
}

impl ChromePool {
    pub fn new(options: BrowserOptions) -> Self {
        let size = options.pool_size.max(1);
        Self {
            options,
            size,
            slots: Semaphore::new(size),
            idle: Mutex::new(Vec::with_capacity(size)),
            closed: AtomicBool::new(false),
        }
    }

    /// Maximum concurrent renders.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Browsers currently idle and ready for reuse.
    pub async fn idle_count(&self) -> usize {
        self.idle.lock().await.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Launch browsers until `n` (capped at the pool size) are idle.
    ///
    /// Each launch holds a render slot, so warmup never runs more browsers
    /// than the pool allows and cannot outlive [`ChromePool::shutdown`].
    pub async fn warmup(&self, n: usize) -> Result<(), ExamPdfError> {
        let target = n.min(self.size);
        while self.idle_count().await < target {
            let _slot = self
                .slots
                .acquire()
                .await
                .map_err(|_| ExamPdfError::PoolShutDown)?;
            if self.is_shut_down() {
                return Err(ExamPdfError::PoolShutDown);
            }
            if self.idle_count().await >= target {
                break;
            }
            let session = BrowserSession::launch(&self.options).await?;
            if self.is_shut_down() {
                session.close().await;
                return Err(ExamPdfError::PoolShutDown);
            }
            self.check_in(session).await;
        }
        info!("Browser pool warmed up: {} idle", target);
        Ok(())
    }

    /// Put a healthy session back on the idle list. It is closed instead when
    /// the pool is shutting down or already holds `size` idle browsers.
    async fn check_in(&self, session: BrowserSession) {
        let surplus = {
            let mut idle = self.idle.lock().await;
            if self.is_shut_down() || idle.len() >= self.size {
                Some(session)
            } else {
                idle.push(session);
                None
            }
        };
        if let Some(session) = surplus {
            debug!("Closing surplus pooled browser");
            session.close().await;
        }
    }

    /// Stop accepting renders, wait for in-flight ones and close every browser.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Holding every slot means no render is in flight.
        match self.slots.acquire_many(self.size as u32).await {
            Ok(permits) => permits.forget(),
            Err(_) => return,
        }
        self.slots.close();

        let sessions: Vec<BrowserSession> = std::mem::take(&mut *self.idle.lock().await);
        let n = sessions.len();
        futures::future::join_all(sessions.into_iter().map(BrowserSession::close)).await;
        info!("Browser pool shut down ({} browser(s) closed)", n);
    }
}

#[async_trait]
impl PdfRenderer for ChromePool {
    async fn render(&self, html: &str, options: &RenderOptions) -> Result<Vec<u8>, ExamPdfError> {
        if self.is_shut_down() {
            return Err(ExamPdfError::PoolShutDown);
        }
        let _slot = self
            .slots
            .acquire()
            .await
            .map_err(|_| ExamPdfError::PoolShutDown)?;

        let reused = self.idle.lock().await.pop();
        let mut session = match reused {
            Some(s) => s,
            None => BrowserSession::launch(&self.options).await?,
        };

        let result = session.render(html, options, &self.options).await;

        let recycle =
            result.is_err() || session.renders >= self.options.max_renders_per_browser.max(1);
        if recycle {
            debug!("Recycling pooled browser after {} render(s)", session.renders);
            session.close().await;
        } else {
            self.check_in(session).await;
        }
        result
    }
}

impl Drop for ChromePool {
    fn drop(&mut self) {
        if !self.is_shut_down() {
            if let Ok(idle) = self.idle.try_lock() {
                if !idle.is_empty() {
                    warn!(
                        "ChromePool dropped without shutdown(); {} idle browser(s) will be killed",
                        idle.len()
                    );
                }
            }
        }
    }
}
