//! Image download: bounded-timeout, size-capped fetch of one image source.
//!
//! A single [`reqwest::Client`] is built per document (see [`build_client`])
//! so that all images of a page share one connection pool; the per-request
//! timeout is set on the client and covers connect, headers and body.

use crate::error::{ExamPdfError, ImageError};
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;
use tracing::debug;

/// Raw bytes of a fetched image, before optimisation.
#[derive(Debug, Clone)]
pub struct FetchedImage {
    pub bytes: Vec<u8>,
    /// `Content-Type` reported by the server, if any.
    pub content_type: Option<String>,
}

/// Build the HTTP client used for one document's image fetches.
pub fn build_client(
    timeout_secs: u64,
    user_agent: Option<&str>,
) -> Result<reqwest::Client, ExamPdfError> {
    let mut builder = reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .connect_timeout(Duration::from_secs(timeout_secs.min(10)))
        .redirect(reqwest::redirect::Policy::limited(5));
    builder = match user_agent {
        Some(ua) => builder.user_agent(ua),
        None => builder.user_agent(concat!("exam-pdf/", env!("CARGO_PKG_VERSION"))),
    };
    builder
        .build()
        .map_err(|e| ExamPdfError::Internal(format!("Failed to build HTTP client: {e}")))
}

/// Download an `http(s)` image, rejecting non-2xx answers and bodies larger
/// than `max_bytes`.
pub async fn fetch_image(
    client: &reqwest::Client,
    url: &str,
    timeout_secs: u64,
    max_bytes: usize,
) -> Result<FetchedImage, ImageError> {
    let map_err = |e: reqwest::Error| {
        if e.is_timeout() {
            ImageError::Timeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            ImageError::FetchFailed {
                url: url.to_string(),
                detail: e.to_string(),
            }
        }
    };

    let mut response = client.get(url).send().await.map_err(map_err)?;

    if !response.status().is_success() {
        return Err(ImageError::HttpStatus {
            url: url.to_string(),
            status: response.status().as_u16(),
        });
    }

    if let Some(len) = response.content_length() {
        if len as usize > max_bytes {
            return Err(ImageError::TooLarge {
                url: url.to_string(),
                bytes: len as usize,
                limit: max_bytes,
            });
        }
    }

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    // Read chunk by chunk so a missing or lying Content-Length cannot push
    // the buffer past the cap.
    let mut bytes = Vec::new();
    while let Some(chunk) = response.chunk().await.map_err(map_err)? {
        if bytes.len() + chunk.len() > max_bytes {
            return Err(ImageError::TooLarge {
                url: url.to_string(),
                bytes: bytes.len() + chunk.len(),
                limit: max_bytes,
            });
        }
        bytes.extend_from_slice(&chunk);
    }

    debug!("Fetched {} ({} bytes)", url, bytes.len());
    Ok(FetchedImage {
        bytes,
        content_type,
    })
}

/// Read a `file://` image from disk.
pub async fn read_file_image(url: &str, max_bytes: usize) -> Result<FetchedImage, ImageError> {
    let read_err = |detail: String| ImageError::FileReadFailed {
        url: url.to_string(),
        detail,
    };

    let path = reqwest::Url::parse(url)
        .map_err(|e| read_err(e.to_string()))?
        .to_file_path()
        .map_err(|_| read_err("not a local file path".to_string()))?;

    let meta = tokio::fs::metadata(&path)
        .await
        .map_err(|e| read_err(e.to_string()))?;
    if meta.len() as usize > max_bytes {
        return Err(ImageError::TooLarge {
            url: url.to_string(),
            bytes: meta.len() as usize,
            limit: max_bytes,
        });
    }

    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| read_err(e.to_string()))?;
    debug!("Read {} ({} bytes)", path.display(), bytes.len());
    Ok(FetchedImage {
        bytes,
        content_type: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn client_builds_with_and_without_user_agent() {
        assert!(build_client(5, None).is_ok());
        assert!(build_client(5, Some("exam-bot/1.0")).is_ok());
    }

    #[tokio::test]
    async fn file_image_is_read() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"\x89PNG\r\n\x1a\nrest").unwrap();
        let url = reqwest::Url::from_file_path(tmp.path()).unwrap().to_string();

        let img = read_file_image(&url, 1024).await.unwrap();
        assert!(img.bytes.starts_with(b"\x89PNG"));
    }

    #[tokio::test]
    async fn file_image_over_cap_is_rejected() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&[0u8; 64]).unwrap();
        let url = reqwest::Url::from_file_path(tmp.path()).unwrap().to_string();

        let err = read_file_image(&url, 16).await.unwrap_err();
        assert!(matches!(err, ImageError::TooLarge { bytes: 64, limit: 16, .. }));
    }

    #[tokio::test]
    async fn missing_file_is_read_error() {
        let err = read_file_image("file:///definitely/not/here.png", 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, ImageError::FileReadFailed { .. }));
        assert_eq!(err.url(), "file:///definitely/not/here.png");
    }
}
