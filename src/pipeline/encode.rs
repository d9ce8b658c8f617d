//! Image encoding: raw bytes → `data:` URI for embedding in an `src` attribute.
//!
//! Embedding turns every image into part of the document itself, so the
//! renderer never has to reach the network for it and the page settles as
//! soon as the HTML is parsed.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use tracing::debug;

/// Encode `bytes` as a base64 `data:` URI with the given MIME type.
pub fn encode_data_uri(bytes: &[u8], mime: &str) -> String {
    let b64 = STANDARD.encode(bytes);
    debug!("Encoded {} bytes → {} bytes base64 ({})", bytes.len(), b64.len(), mime);

    let mut uri = String::with_capacity(b64.len() + mime.len() + 13);
    uri.push_str("data:");
    uri.push_str(mime);
    uri.push_str(";base64,");
    uri.push_str(&b64);
    uri
}

/// MIME type for a buffer, sniffed from its magic bytes.
///
/// Falls back to `declared` (a response `Content-Type`) when it names an
/// `image/*` type. Returns `None` when the bytes are not recognisably an image.
pub fn detect_mime(bytes: &[u8], declared: Option<&str>) -> Option<String> {
    if let Ok(format) = image::guess_format(bytes) {
        return Some(format.to_mime_type().to_string());
    }
    if looks_like_svg(bytes) {
        return Some("image/svg+xml".to_string());
    }
    declared
        .map(|ct| ct.split(';').next().unwrap_or(ct).trim().to_ascii_lowercase())
        .filter(|ct| ct.starts_with("image/"))
}

fn looks_like_svg(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(512)];
    let text = String::from_utf8_lossy(head);
    let text = text.trim_start_matches('\u{feff}').trim_start();
    text.starts_with("<svg") || (text.starts_with("<?xml") && text.contains("<svg"))
}
