//! Image resolver & inliner: rewrite `<img src>` values as `data:` URIs.
//!
//! ## How a document is processed
//!
//! 1. **Scan**: `<img>` start tags are tokenised outside `<!-- -->` comments.
//!    Each tag's attributes are parsed individually (double-, single- or
//!    un-quoted), and the byte span of the first `src` value is recorded.
//! 2. **Classify**: every source is resolved against the document's base URL
//!    ([`classify_source`]). Data URIs, relative paths and disallowed schemes
//!    are left alone.
//! 3. **Fetch**: each *distinct* resolved URL is fetched once, optimised
//!    ([`super::optimize`]) and encoded ([`super::encode`]). At most
//!    `concurrency` of these tasks run at a time (`buffer_unordered`).
//! 4. **Splice**: successful results replace only the recorded value spans,
//!    in document order. Every other byte of the input is copied unchanged;
//!    a failed URL leaves its occurrences exactly as they were.
//!
//! A document with no `<img src>` at all is returned as-is without any I/O.

use crate::config::{GeneratorConfig, RenderOptions};
use crate::error::ImageError;
use crate::output::InlineReport;
use crate::pipeline::{encode, fetch, optimize};
use crate::progress::ProgressCallback;
use futures::stream::{self, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use std::borrow::Cow;
use std::collections::HashMap;
use std::ops::Range;
use tracing::{debug, info, warn};

// ── Patterns ─────────────────────────────────────────────────────────────

/// An `<img ...>` start tag. The name must end at whitespace, `/` or `>`, so
/// custom elements such as `<img-compare>` are not matched. Quoted attribute
/// values may contain `>`.
static IMG_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)<img(?:[\s/](?:[^>"']|"[^"]*"|'[^']*')*)?>"#).expect("valid img tag regex")
});

/// One attribute: name, then an optional double-, single- or un-quoted value.
static ATTR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"([^\s"'<>/=]+)(?:\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'=<>`]+)))?"#)
        .expect("valid attribute regex")
});

static COMMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<!--.*?-->").expect("valid comment regex"));

// ── Options ──────────────────────────────────────────────────────────────

/// Settings for one inlining pass, derived from the generator config and the
/// effective render options of the call.
#[derive(Clone)]
pub struct InlineOptions {
    /// Fetch `http(s)` sources. When false only `file://` (if allowed) is read.
    pub inline_remote: bool,
    pub allow_file_urls: bool,
    pub concurrency: usize,
    pub fetch_timeout_secs: u64,
    pub max_image_bytes: usize,
    pub max_width_px: u32,
    pub max_height_px: u32,
    pub quality: u8,
    pub user_agent: Option<String>,
    pub progress: Option<ProgressCallback>,
}

impl Default for InlineOptions {
    fn default() -> Self {
        Self::from_config(&GeneratorConfig::default(), &RenderOptions::default())
    }
}

impl InlineOptions {
    pub fn from_config(config: &GeneratorConfig, render: &RenderOptions) -> Self {
        Self {
            inline_remote: config.inline_remote_images,
            allow_file_urls: config.allow_file_urls,
            concurrency: config.image_concurrency.max(1),
            fetch_timeout_secs: config.image_fetch_timeout_secs,
            max_image_bytes: config.max_image_bytes,
            max_width_px: render.max_image_width_px,
            max_height_px: render.max_image_height_px,
            quality: render.image_quality,
            user_agent: render.user_agent.clone(),
            progress: config.progress_callback.clone(),
        }
    }
}

// ── Source classification ────────────────────────────────────────────────

/// What an `src` value refers to, after resolution against the base URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ImageSource {
    /// Already embedded; never touched.
    DataUri,
    /// Absolute `http(s)` URL to download.
    Remote(String),
    /// `file://` URL, only produced when file sources are allowed.
    File(String),
    /// Relative path, unknown scheme, disallowed `file://`, or a
    /// root-relative path with no base URL.
    Unsupported,
}

/// Resolve an `src` value to an [`ImageSource`].
///
/// * `//host/x.png` takes the scheme of `base_url` (`https` when there is none)
/// * `/x.png` is joined onto the origin of `base_url`
/// * `http://` and `https://` are used as-is
/// * `file://` is accepted only when `allow_file` is set
pub fn classify_source(src: &str, base_url: Option<&str>, allow_file: bool) -> ImageSource {
    let src = src.trim();
    let lower = src.to_ascii_lowercase();
    let base = base_url.and_then(|b| reqwest::Url::parse(b.trim()).ok());

    if lower.starts_with("data:") {
        return ImageSource::DataUri;
    }
    if src.starts_with("//") {
        let scheme = match base.as_ref().map(|b| b.scheme()) {
            Some("http") => "http",
            _ => "https",
        };
        return ImageSource::Remote(format!("{scheme}:{src}"));
    }
    if src.starts_with('/') {
        return match base.as_ref().and_then(|b| b.join(src).ok()) {
            Some(url) if matches!(url.scheme(), "http" | "https") => {
                ImageSource::Remote(url.to_string())
            }
            _ => ImageSource::Unsupported,
        };
    }
    if lower.starts_with("http://") || lower.starts_with("https://") {
        return ImageSource::Remote(src.to_string());
    }
    if lower.starts_with("file://") && allow_file {
        return ImageSource::File(src.to_string());
    }
    ImageSource::Unsupported
}

// ── Scanning ─────────────────────────────────────────────────────────────

/// One `src` attribute value found in the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImgOccurrence {
    /// Byte range of the raw value, excluding quotes.
    pub value: Range<usize>,
    /// The value with character references decoded.
    pub src: String,
}

/// Find the `src` value of every `<img>` tag outside HTML comments.
pub fn scan_img_sources(html: &str) -> Vec<ImgOccurrence> {
    let mut found = Vec::new();
    let mut cursor = 0;
    for comment in COMMENT.find_iter(html) {
        scan_segment(html, cursor..comment.start(), &mut found);
        cursor = comment.end();
    }
    scan_segment(html, cursor..html.len(), &mut found);
    found
}

fn scan_segment(html: &str, segment: Range<usize>, out: &mut Vec<ImgOccurrence>) {
    let text = &html[segment.clone()];
    for tag in IMG_TAG.find_iter(text) {
        // Attributes sit between "<img" and the closing ">".
        let attrs_start = segment.start + tag.start() + 4;
        let attrs = &html[attrs_start..segment.start + tag.end() - 1];
        for attr in ATTR.captures_iter(attrs) {
            let is_src = attr
                .get(1)
                .is_some_and(|name| name.as_str().eq_ignore_ascii_case("src"));
            if !is_src {
                continue;
            }
            if let Some(v) = attr.get(2).or_else(|| attr.get(3)).or_else(|| attr.get(4)) {
                out.push(ImgOccurrence {
                    value: attrs_start + v.start()..attrs_start + v.end(),
                    src: decode_entities(v.as_str()).into_owned(),
                });
            }
            // Only the first `src` counts.
            break;
        }
    }
}

/// Decode the character references that commonly appear in URLs.
pub fn decode_entities(s: &str) -> Cow<'_, str> {
    if !s.contains('&') {
        return Cow::Borrowed(s);
    }
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];
        let decoded = rest.find(';').filter(|&semi| semi <= 10).and_then(|semi| {
            let entity = &rest[1..semi];
            let c = match entity {
                "amp" => Some('&'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                "lt" => Some('<'),
                "gt" => Some('>'),
                _ if entity.starts_with("#x") || entity.starts_with("#X") => {
                    u32::from_str_radix(&entity[2..], 16).ok().and_then(char::from_u32)
                }
                _ if entity.starts_with('#') => {
                    entity[1..].parse::<u32>().ok().and_then(char::from_u32)
                }
                _ => None,
            };
            c.map(|c| (c, semi + 1))
        });
        match decoded {
            Some((c, len)) => {
                out.push(c);
                rest = &rest[len..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    Cow::Owned(out)
}

// ── Inlining ─────────────────────────────────────────────────────────────

/// Replace fetchable image sources with embedded data URIs.
///
/// Per-image failures are logged and leave the original `src` in place.
pub async fn inline_images(html: &str, base_url: Option<&str>, options: &InlineOptions) -> String {
    inline_images_with_report(html, base_url, options).await.0
}

/// [`inline_images`], also returning what happened to each image.
pub async fn inline_images_with_report(
    html: &str,
    base_url: Option<&str>,
    options: &InlineOptions,
) -> (String, InlineReport) {
    let occurrences = scan_img_sources(html);
    let mut report = InlineReport {
        found: occurrences.len(),
        ..Default::default()
    };
    if occurrences.is_empty() {
        return (html.to_string(), report);
    }

    // ── Classify and de-duplicate ────────────────────────────────────────
    let mut targets: Vec<ImageSource> = Vec::new();
    let mut target_index: HashMap<ImageSource, usize> = HashMap::new();
    let mut occurrence_target: Vec<Option<usize>> = Vec::with_capacity(occurrences.len());

    for occ in &occurrences {
        let source = classify_source(&occ.src, base_url, options.allow_file_urls);
        let eligible = match &source {
            ImageSource::Remote(_) => options.inline_remote,
            ImageSource::File(_) => true,
            ImageSource::DataUri | ImageSource::Unsupported => false,
        };
        if !eligible {
            report.skipped += 1;
            occurrence_target.push(None);
            continue;
        }
        let idx = *target_index.entry(source.clone()).or_insert_with(|| {
            targets.push(source);
            targets.len() - 1
        });
        occurrence_target.push(Some(idx));
    }

    if targets.is_empty() {
        debug!("No fetchable images among {} <img> tags", occurrences.len());
        return (html.to_string(), report);
    }
    info!(
        "Inlining {} distinct image(s) from {} <img> tag(s), concurrency {}",
        targets.len(),
        occurrences.len(),
        options.concurrency
    );

    // ── Fetch + optimise, bounded ────────────────────────────────────────
    let client = if targets.iter().any(|t| matches!(t, ImageSource::Remote(_))) {
        match fetch::build_client(options.fetch_timeout_secs, options.user_agent.as_deref()) {
            Ok(c) => Some(c),
            Err(e) => {
                warn!("{}", e);
                None
            }
        }
    } else {
        None
    };

    // Each job owns its target and client handle so the whole future stays
    // `Send` and can be handed to `tokio::spawn`.
    let jobs: Vec<_> = targets
        .iter()
        .cloned()
        .enumerate()
        .map(|(idx, target)| {
            let client = client.clone();
            async move { (idx, resolve_one(target, client, options).await) }
        })
        .collect();
    let results: Vec<(usize, Result<String, ImageError>)> = stream::iter(jobs)
        .buffer_unordered(options.concurrency.max(1))
        .collect()
        .await;

    let mut resolved: Vec<Option<String>> = vec![None; targets.len()];
    for (idx, result) in results {
        match result {
            Ok(uri) => resolved[idx] = Some(uri),
            Err(e) => {
                warn!("{}", e);
                if let Some(ref cb) = options.progress {
                    cb.on_image_error(e.url(), &e.to_string());
                }
                report.failed.push(e);
            }
        }
    }
    // `buffer_unordered` completes in any order; keep the report stable.
    report.failed.sort_by(|a, b| a.url().cmp(b.url()));

    // ── Splice ───────────────────────────────────────────────────────────
    let extra: usize = resolved.iter().flatten().map(String::len).sum();
    let mut out = String::with_capacity(html.len() + extra);
    let mut cursor = 0;
    for (occ, target) in occurrences.iter().zip(&occurrence_target) {
        if let Some(uri) = target.and_then(|t| resolved[t].as_ref()) {
            out.push_str(&html[cursor..occ.value.start]);
            out.push_str(uri);
            cursor = occ.value.end;
            report.inlined += 1;
        }
    }
    out.push_str(&html[cursor..]);

    debug!(
        "Inline report: found={} inlined={} skipped={} failed={}",
        report.found,
        report.inlined,
        report.skipped,
        report.failed.len()
    );
    (out, report)
}

/// Fetch, optimise and encode a single target.
async fn resolve_one(
    target: ImageSource,
    client: Option<reqwest::Client>,
    options: &InlineOptions,
) -> Result<String, ImageError> {
    let (url, fetched) = match &target {
        ImageSource::Remote(url) => {
            let client = client.as_ref().ok_or_else(|| ImageError::FetchFailed {
                url: url.clone(),
                detail: "HTTP client unavailable".into(),
            })?;
            let fetched = fetch::fetch_image(
                client,
                url,
                options.fetch_timeout_secs,
                options.max_image_bytes,
            )
            .await?;
            (url, fetched)
        }
        ImageSource::File(url) => (url, fetch::read_file_image(url, options.max_image_bytes).await?),
        ImageSource::DataUri | ImageSource::Unsupported => {
            return Err(ImageError::NotAnImage {
                url: String::new(),
            })
        }
    };

    // Reject early: no point optimising an HTML error page served with 200.
    let content_type = fetched.content_type.as_deref();
    if encode::detect_mime(&fetched.bytes, content_type).is_none() {
        return Err(ImageError::NotAnImage { url: url.clone() });
    }

    let (w, h, q) = (options.max_width_px, options.max_height_px, options.quality);
    let raw = fetched.bytes;
    let optimized = tokio::task::spawn_blocking(move || optimize::optimize(&raw, w, h, q))
        .await
        .map_err(|e| ImageError::FetchFailed {
            url: url.clone(),
            detail: format!("optimiser task failed: {e}"),
        })?;

    let mime = encode::detect_mime(&optimized, content_type)
        .ok_or_else(|| ImageError::NotAnImage { url: url.clone() })?;
    if let Some(ref cb) = options.progress {
        cb.on_image_complete(url, optimized.len());
    }
    Ok(encode::encode_data_uri(&optimized, &mime))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
    use std::io::Write;

    fn opts() -> InlineOptions {
        InlineOptions::default()
    }

    #[test]
    fn scan_handles_quote_styles_and_attribute_order() {
        let html = r#"<p><img alt="a > b" src="https://x/1.png"><IMG SRC='/2.png' width=3><img src=//cdn/3.png/></p>"#;
        let srcs: Vec<String> = scan_img_sources(html).into_iter().map(|o| o.src).collect();
        assert_eq!(srcs, vec!["https://x/1.png", "/2.png", "//cdn/3.png/"]);
    }

    #[test]
    fn scan_spans_point_at_raw_values() {
        let html = r#"<img class="x" src="a.png?x=1&amp;y=2">"#;
        let occ = &scan_img_sources(html)[0];
        assert_eq!(&html[occ.value.clone()], "a.png?x=1&amp;y=2");
        assert_eq!(occ.src, "a.png?x=1&y=2");
    }

    #[test]
    fn scan_ignores_comments_and_data_src() {
        let html = r#"<!-- <img src="https://x/hidden.png"> --><img data-src="https://x/lazy.png"><img src="https://x/real.png">"#;
        let srcs: Vec<String> = scan_img_sources(html).into_iter().map(|o| o.src).collect();
        assert_eq!(srcs, vec!["https://x/real.png"]);
    }

    #[test]
    fn scan_skips_img_without_src() {
        assert!(scan_img_sources("<img alt=\"none\"><imgx src=\"a\">").is_empty());
    }

    #[test]
    fn scan_ignores_custom_elements_named_like_img() {
        let html = concat!(
            r#"<img-compare src="https://x/custom.png"></img-compare>"#,
            "<img/><IMG\tSRC=\"https://x/tab.png\">",
            r#"<img/src="https://x/slash.png">"#,
        );
        let srcs: Vec<String> = scan_img_sources(html).into_iter().map(|o| o.src).collect();
        assert_eq!(srcs, vec!["https://x/tab.png", "https://x/slash.png"]);
    }

    #[test]
    fn classify_variants() {
        let base = Some("http://school.example.edu/papers/12");
        assert_eq!(classify_source("data:image/png;base64,AA", base, false), ImageSource::DataUri);
        assert_eq!(
            classify_source("//cdn.example.com/a.png", base, false),
            ImageSource::Remote("http://cdn.example.com/a.png".into())
        );
        assert_eq!(
            classify_source("//cdn.example.com/a.png", None, false),
            ImageSource::Remote("https://cdn.example.com/a.png".into())
        );
        assert_eq!(
            classify_source("/uploads/a.png", base, false),
            ImageSource::Remote("http://school.example.edu/uploads/a.png".into())
        );
        assert_eq!(classify_source("/uploads/a.png", None, false), ImageSource::Unsupported);
        assert_eq!(
            classify_source("HTTPS://x.org/a.png", None, false),
            ImageSource::Remote("HTTPS://x.org/a.png".into())
        );
        assert_eq!(classify_source("file:///tmp/a.png", None, false), ImageSource::Unsupported);
        assert_eq!(
            classify_source("file:///tmp/a.png", None, true),
            ImageSource::File("file:///tmp/a.png".into())
        );
        assert_eq!(classify_source("images/a.png", base, false), ImageSource::Unsupported);
        assert_eq!(classify_source("ftp://x/a.png", base, false), ImageSource::Unsupported);
    }

    #[test]
    fn entities_decoded() {
        assert_eq!(decode_entities("a&amp;b&#38;c&#x26;d&lt;"), "a&b&c&d<");
        assert_eq!(decode_entities("plain"), "plain");
        assert_eq!(decode_entities("R&D &unknown; x"), "R&D &unknown; x");
    }

    #[tokio::test]
    async fn no_images_is_identity() {
        let html = "<html><body><p>No pictures here.</p></body></html>";
        let (out, report) = inline_images_with_report(html, None, &opts()).await;
        assert_eq!(out, html);
        assert_eq!(report, InlineReport::default());
    }

    #[tokio::test]
    async fn data_uri_untouched() {
        let html = r#"<img src="data:image/gif;base64,R0lGODlhAQABAAAAACw=">"#;
        let (out, report) = inline_images_with_report(html, None, &opts()).await;
        assert_eq!(out, html);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.inlined, 0);
    }

    #[tokio::test]
    async fn remote_disabled_skips_http() {
        let html = r#"<img src="https://unreachable.invalid/a.png">"#;
        let mut o = opts();
        o.inline_remote = false;
        let (out, report) = inline_images_with_report(html, None, &o).await;
        assert_eq!(out, html);
        assert_eq!(report.skipped, 1);
        assert!(report.failed.is_empty());
    }

    #[tokio::test]
    async fn file_source_inlined_when_allowed() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(8, 8, Rgba([0, 128, 0, 255])));
        let mut png = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut png), ImageFormat::Png)
            .unwrap();
        let mut tmp = tempfile::Builder::new().suffix(".png").tempfile().unwrap();
        tmp.write_all(&png).unwrap();
        let url = reqwest::Url::from_file_path(tmp.path()).unwrap().to_string();

        let html = format!(r#"<p>before</p><img alt="x" src="{url}"><img src='{url}'><p>after</p>"#);
        let mut o = opts();
        o.allow_file_urls = true;
        let (out, report) = inline_images_with_report(&html, None, &o).await;

        assert_eq!(report.found, 2);
        assert_eq!(report.inlined, 2);
        assert!(out.starts_with(r#"<p>before</p><img alt="x" src="data:image/jpeg;base64,"#));
        assert!(out.contains(r#"<img src='data:image/jpeg;base64,"#));
        assert!(out.ends_with("<p>after</p>"));
        assert!(!out.contains("file://"));
    }

    #[tokio::test]
    async fn unreadable_file_left_unchanged() {
        let html = r#"<img src="file:///no/such/image.png"><img src="data:image/png;base64,AA">"#;
        let mut o = opts();
        o.allow_file_urls = true;
        let (out, report) = inline_images_with_report(html, None, &o).await;
        assert_eq!(out, html);
        assert_eq!(report.found, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].url(), "file:///no/such/image.png");
    }
}
