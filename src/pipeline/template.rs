//! HTML template builder: structured [`PaperData`] → one self-contained
//! printable HTML document.
//!
//! The output carries its own `<style>` block with an `@page` rule for the
//! requested physical paper, a header (institution, exam type, academic year,
//! title, course), a time/marks summary line and one block per question.
//!
//! Header text is HTML-escaped. Question `content_html` is inserted verbatim:
//! it is sanitised upstream by the authoring application and may carry
//! markup (tables, `<img>`, math) that must reach the renderer intact.

use crate::config::{Margins, PageSize};
use crate::model::{format_number, PaperData, Question};
use std::fmt::Write as _;

const BASE_CSS: &str = r#"
  * { box-sizing: border-box; }
  body { font-family: "Times New Roman", Times, serif; font-size: 12pt; color: #000; margin: 0; }
  .paper-header { text-align: center; border-bottom: 1.5px solid #000; padding-bottom: 6pt; margin-bottom: 8pt; }
  .paper-header .institution { font-size: 16pt; font-weight: bold; text-transform: uppercase; }
  .paper-header .exam-line { font-size: 11pt; margin-top: 2pt; }
  .paper-header h1 { font-size: 14pt; margin: 6pt 0 2pt 0; }
  .paper-header .course { font-size: 12pt; font-style: italic; }
  .summary { display: flex; justify-content: space-between; font-weight: bold; margin: 6pt 0 12pt 0; }
  .question { display: flex; align-items: flex-start; margin-bottom: 10pt; page-break-inside: avoid; break-inside: avoid; }
  .question .q-no { flex: 0 0 2.2em; font-weight: bold; }
  .question .q-body { flex: 1 1 auto; min-width: 0; }
  .question .q-body img { max-width: 100%; height: auto; }
  .question .q-body table { border-collapse: collapse; }
  .question .q-body td, .question .q-body th { border: 1px solid #444; padding: 2pt 4pt; }
  .question .q-marks { flex: 0 0 auto; margin-left: 12pt; font-weight: bold; text-align: right; white-space: nowrap; }
"#;

/// Render a paper into a complete HTML document.
///
/// Questions are emitted in ascending `sequence_number`; questions without
/// one come last, and ties keep their input order.
pub fn build_html(paper: &PaperData, page_size: PageSize, margins: &Margins) -> String {
    let mut html = String::with_capacity(4096 + paper.questions.len() * 512);

    // ── Head ─────────────────────────────────────────────────────────────
    html.push_str("<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n");
    let _ = writeln!(html, "<title>{}</title>", escape_html(&paper.title));
    html.push_str("<style>\n");
    let _ = writeln!(
        html,
        "  @page {{ size: {}; margin: {} {} {} {}; }}",
        page_size.css_name(),
        margins.top,
        margins.right,
        margins.bottom,
        margins.left
    );
    html.push_str(BASE_CSS);
    html.push_str("</style>\n</head>\n<body>\n");

    // ── Header ───────────────────────────────────────────────────────────
    let meta = &paper.metadata;
    html.push_str("<header class=\"paper-header\">\n");
    if let Some(inst) = non_empty(meta.institution.as_deref()) {
        let _ = writeln!(html, "  <div class=\"institution\">{}</div>", escape_html(inst));
    }
    let semester = meta.semester.as_ref().map(|s| format!("Semester {s}"));
    let exam_line: Vec<String> = [
        non_empty(meta.exam_type.as_deref()),
        semester.as_deref(),
        non_empty(meta.academic_year.as_deref()),
    ]
    .into_iter()
    .flatten()
    .map(escape_html)
    .collect();
    if !exam_line.is_empty() {
        let _ = writeln!(html, "  <div class=\"exam-line\">{}</div>", exam_line.join(" &middot; "));
    }
    let _ = writeln!(html, "  <h1 class=\"title\">{}</h1>", escape_html(&paper.title));
    if !paper.course.trim().is_empty() {
        let _ = writeln!(html, "  <div class=\"course\">{}</div>", escape_html(&paper.course));
    }
    html.push_str("</header>\n");

    // ── Time / marks summary ─────────────────────────────────────────────
    if meta.duration.is_some() || meta.full_marks.is_some() {
        html.push_str("<div class=\"summary\">\n");
        match &meta.duration {
            Some(d) => {
                let _ = writeln!(
                    html,
                    "  <span class=\"duration\">Time: {} minutes</span>",
                    escape_html(&d.to_string())
                );
            }
            None => html.push_str("  <span></span>\n"),
        }
        if let Some(fm) = &meta.full_marks {
            let _ = writeln!(
                html,
                "  <span class=\"full-marks\">Full Marks: {}</span>",
                escape_html(&fm.to_string())
            );
        }
        html.push_str("</div>\n");
    }

    // ── Questions ────────────────────────────────────────────────────────
    html.push_str("<main class=\"questions\">\n");
    for (i, q) in ordered_questions(&paper.questions).into_iter().enumerate() {
        let _ = writeln!(html, "<section class=\"question\">");
        let _ = writeln!(html, "  <div class=\"q-no\">{}.</div>", i + 1);
        let _ = writeln!(html, "  <div class=\"q-body\">{}</div>", q.content_html);
        if let Some(m) = q.marks {
            let _ = writeln!(html, "  <div class=\"q-marks\">[{}]</div>", format_number(m));
        }
        html.push_str("</section>\n");
    }
    html.push_str("</main>\n</body>\n</html>\n");
    html
}

/// Questions sorted by `sequence_number`, nulls last, stable on ties.
pub fn ordered_questions(questions: &[Question]) -> Vec<&Question> {
    let mut sorted: Vec<&Question> = questions.iter().collect();
    // `sort_by_key` is stable; `(is_none, value)` puts `None` after every `Some`.
    sorted.sort_by_key(|q| (q.sequence_number.is_none(), q.sequence_number));
    sorted
}

/// Escape the five HTML-significant characters.
pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.filter(|v| !v.trim().is_empty())
}
