//! Helpers for an HTTP layer that serves generated PDFs.
//!
//! The generator itself never speaks HTTP. A handler calls
//! [`crate::generate_pdf`], then uses [`PdfHeaders::for_pdf`] to describe the
//! download and [`crate::ExamPdfError::http_status`] to map failures.

/// Strip every character other than ASCII alphanumerics and `._-`.
///
/// Returns `"document"` when nothing survives.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "document".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Sanitised file name with a `.pdf` extension.
pub fn pdf_filename(name: &str) -> String {
    let base = sanitize_filename(name);
    if base.to_ascii_lowercase().ends_with(".pdf") {
        base
    } else {
        format!("{base}.pdf")
    }
}

/// `attachment; filename="…"` for an already sanitised file name.
pub fn content_disposition(filename: &str) -> String {
    format!("attachment; filename=\"{filename}\"")
}

/// Response headers for a PDF download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdfHeaders {
    pub content_type: &'static str,
    pub content_disposition: String,
    pub content_length: usize,
}

impl PdfHeaders {
    pub fn for_pdf(name: &str, pdf: &[u8]) -> Self {
        Self {
            content_type: "application/pdf",
            content_disposition: content_disposition(&pdf_filename(name)),
            content_length: pdf.len(),
        }
    }

    /// Header name/value pairs, ready to copy into a response.
    pub fn pairs(&self) -> [(&'static str, String); 3] {
        [
            ("Content-Type", self.content_type.to_string()),
            ("Content-Disposition", self.content_disposition.clone()),
            ("Content-Length", self.content_length.to_string()),
        ]
    }
}
