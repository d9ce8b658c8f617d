//! Post-processing: page numbers, watermark and document info on a rendered PDF.
//!
//! Works on the serialised PDF with `lopdf`: the document is loaded, every
//! page gets an overlay content stream, and the result is written back out.
//!
//! ## Page edits
//!
//! The page's existing content is wrapped in `q … Q` so any graphics state it
//! leaves behind (transforms, colours, clipping) cannot leak into the overlay:
//!
//! ```text
//! Contents = [ "q", <original streams…>, "Q" + overlay ]
//! ```
//!
//! Overlay text uses the standard Helvetica font (no embedding needed) and
//! the watermark's opacity comes from an `ExtGState`. Both are registered in
//! a page-local copy of the page's effective `Resources` under names that do
//! not clash with the renderer's own.
//!
//! When no edit is requested the input is returned unchanged, byte for byte.

use crate::config::{PageNumberOptions, PdfMetadata, PostProcessOptions, WatermarkOptions};
use crate::error::ExamPdfError;
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId, Stream, StringFormat};
use tracing::{debug, info, warn};

const FONT_NAME: &[u8] = b"ExPdfHelv";
const GS_NAME: &[u8] = b"ExPdfWmGS";
/// Distance between the page number and the right edge, in points.
const PAGE_NUMBER_RIGHT_INSET: f32 = 40.0;
/// Helvetica cap height as a fraction of the font size.
const CAP_HEIGHT: f32 = 0.718;
/// US Letter, used when a page has no readable MediaBox.
const DEFAULT_MEDIA_BOX: [f32; 4] = [0.0, 0.0, 612.0, 792.0];

fn pp_err(detail: impl std::fmt::Display) -> ExamPdfError {
    ExamPdfError::PostProcessFailed {
        detail: detail.to_string(),
    }
}

/// Apply the requested edits and return a freshly serialised PDF.
///
/// Returns a copy of `pdf` untouched when [`PostProcessOptions::is_noop`].
pub fn post_process(pdf: &[u8], options: &PostProcessOptions) -> Result<Vec<u8>, ExamPdfError> {
    if options.is_noop() {
        debug!("Post-process: nothing to do");
        return Ok(pdf.to_vec());
    }

    let mut doc = Document::load_mem(pdf).map_err(pp_err)?;
    let pages: Vec<ObjectId> = doc.get_pages().into_values().collect();
    let total = pages.len();
    info!(
        "Post-processing {} page(s): numbers={} watermark={} metadata={}",
        total,
        options.add_page_numbers,
        options.watermark.is_some(),
        options.metadata.is_some()
    );

    if options.add_page_numbers || options.watermark.is_some() {
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
            "Encoding" => "WinAnsiEncoding",
        });
        let gs_id = options.watermark.as_ref().map(|wm| {
            doc.add_object(dictionary! {
                "Type" => "ExtGState",
                "ca" => Object::Real(wm.opacity),
                "CA" => Object::Real(wm.opacity),
            })
        });
        let open_id = doc.add_object(Stream::new(Dictionary::new(), b"q\n".to_vec()));
        if let Some(ref wm) = options.watermark {
            let (_, replaced) = encode_win_ansi(&wm.text);
            if replaced > 0 {
                warn!(
                    "Watermark text has {} character(s) Helvetica cannot show; printed as '?'",
                    replaced
                );
            }
        }

        for (i, &page_id) in pages.iter().enumerate() {
            let media_box = media_box(&doc, page_id);
            let mut ops = vec![Operation::new("Q", vec![])];
            if let (Some(wm), Some(_)) = (&options.watermark, gs_id) {
                ops.extend(watermark_ops(wm, &media_box));
            }
            if options.add_page_numbers {
                ops.extend(page_number_ops(&options.page_numbers, i + 1, total, &media_box));
            }
            let bytes = Content { operations: ops }.encode().map_err(pp_err)?;
            let overlay_id = doc.add_object(Stream::new(Dictionary::new(), bytes));

            let mut resources = effective_resources(&doc, page_id);
            add_resource(&doc, &mut resources, b"Font", FONT_NAME, font_id);
            if let Some(gs_id) = gs_id {
                add_resource(&doc, &mut resources, b"ExtGState", GS_NAME, gs_id);
            }

            let contents = wrapped_contents(&doc, page_id, open_id, overlay_id);
            let page = doc.get_dictionary_mut(page_id).map_err(pp_err)?;
            page.set("Resources", Object::Dictionary(resources));
            page.set("Contents", Object::Array(contents));
        }
    }

    if let Some(ref meta) = options.metadata {
        apply_metadata(&mut doc, meta)?;
    }

    let mut out = Vec::with_capacity(pdf.len() + 1024 * total.max(1));
    doc.save_to(&mut out).map_err(pp_err)?;
    debug!("Post-process: {} → {} bytes", pdf.len(), out.len());
    Ok(out)
}

/// Number of pages in a PDF buffer.
pub fn page_count(pdf: &[u8]) -> Result<usize, ExamPdfError> {
    let doc = Document::load_mem(pdf).map_err(pp_err)?;
    Ok(doc.get_pages().len())
}

/// Read the Title/Author/Subject/Keywords entries of the document info.
pub fn read_metadata(pdf: &[u8]) -> Result<PdfMetadata, ExamPdfError> {
    let doc = Document::load_mem(pdf).map_err(pp_err)?;
    let info = match doc.trailer.get(b"Info") {
        Ok(Object::Reference(id)) => doc.get_dictionary(*id).ok(),
        Ok(Object::Dictionary(d)) => Some(d),
        _ => None,
    };
    let Some(info) = info else {
        return Ok(PdfMetadata::default());
    };
    let field = |key: &[u8]| match info.get(key) {
        Ok(Object::String(bytes, _)) => Some(decode_text_string(bytes)),
        _ => None,
    };
    Ok(PdfMetadata {
        title: field(b"Title"),
        author: field(b"Author"),
        subject: field(b"Subject"),
        keywords: field(b"Keywords"),
    })
}

// ── Overlays ─────────────────────────────────────────────────────────────

fn page_number_ops(
    opts: &PageNumberOptions,
    page: usize,
    total: usize,
    media_box: &[f32; 4],
) -> Vec<Operation> {
    let text = format!("Page {page} / {total}");
    let width = text_width(&text, opts.font_size);
    let x = media_box[2] - PAGE_NUMBER_RIGHT_INSET - width;
    let y = media_box[1] + opts.margin_bottom;
    vec![
        Operation::new("q", vec![]),
        Operation::new("g", vec![Object::Real(0.0)]),
        Operation::new("BT", vec![]),
        Operation::new("Tf", vec![Object::Name(FONT_NAME.to_vec()), Object::Real(opts.font_size)]),
        Operation::new("Td", vec![Object::Real(x), Object::Real(y)]),
        Operation::new("Tj", vec![win_ansi_string(&text)]),
        Operation::new("ET", vec![]),
        Operation::new("Q", vec![]),
    ]
}

fn watermark_ops(wm: &WatermarkOptions, media_box: &[f32; 4]) -> Vec<Operation> {
    let cx = (media_box[0] + media_box[2]) / 2.0;
    let cy = (media_box[1] + media_box[3]) / 2.0;
    let (sin, cos) = wm.rotate_deg.to_radians().sin_cos();
    let half_w = text_width(&wm.text, wm.size) / 2.0;
    let half_h = CAP_HEIGHT * wm.size / 2.0;
    // Place the text origin so the rotated text box is centred on the page.
    let tx = cx - (cos * half_w - sin * half_h);
    let ty = cy - (sin * half_w + cos * half_h);
    vec![
        Operation::new("q", vec![]),
        Operation::new("gs", vec![Object::Name(GS_NAME.to_vec())]),
        Operation::new("g", vec![Object::Real(0.5)]),
        Operation::new("BT", vec![]),
        Operation::new("Tf", vec![Object::Name(FONT_NAME.to_vec()), Object::Real(wm.size)]),
        Operation::new(
            "Tm",
            vec![
                Object::Real(cos),
                Object::Real(sin),
                Object::Real(-sin),
                Object::Real(cos),
                Object::Real(tx),
                Object::Real(ty),
            ],
        ),
        Operation::new("Tj", vec![win_ansi_string(&wm.text)]),
        Operation::new("ET", vec![]),
        Operation::new("Q", vec![]),
    ]
}

/// Helvetica advance widths (1/1000 em) for printable ASCII, from the AFM.
const HELVETICA_WIDTHS: [u16; 95] = [
    278, 278, 355, 556, 556, 889, 667, 191, 333, 333, 389, 584, 278, 333, 278, 278, // ' '../
    556, 556, 556, 556, 556, 556, 556, 556, 556, 556, 278, 278, 584, 584, 584, 556, // 0..?
    1015, 667, 667, 722, 722, 667, 611, 778, 722, 278, 500, 667, 556, 833, 722, 778, // @..O
    667, 778, 722, 667, 611, 722, 667, 944, 667, 667, 611, 278, 278, 278, 469, 556, // P.._
    333, 556, 556, 500, 556, 556, 278, 556, 556, 222, 222, 500, 222, 833, 556, 556, // `..o
    556, 556, 333, 500, 278, 556, 500, 722, 500, 500, 500, 334, 260, 334, 584, // p..~
];

/// Rendered width of `text` in points.
pub fn text_width(text: &str, size: f32) -> f32 {
    let units: u32 = text
        .chars()
        .map(|c| match c as u32 {
            code @ 32..=126 => HELVETICA_WIDTHS[(code - 32) as usize] as u32,
            _ => 556,
        })
        .sum();
    units as f32 * size / 1000.0
}

/// Characters WinAnsiEncoding places in 0x80–0x9F, where Latin-1 has
/// control codes.
const WIN_ANSI_HIGH: [(char, u8); 27] = [
    ('€', 0x80), ('‚', 0x82), ('ƒ', 0x83), ('„', 0x84), ('…', 0x85), ('†', 0x86),
    ('‡', 0x87), ('ˆ', 0x88), ('‰', 0x89), ('Š', 0x8A), ('‹', 0x8B), ('Œ', 0x8C),
    ('Ž', 0x8E), ('‘', 0x91), ('’', 0x92), ('“', 0x93), ('”', 0x94), ('•', 0x95),
    ('–', 0x96), ('—', 0x97), ('˜', 0x98), ('™', 0x99), ('š', 0x9A), ('›', 0x9B),
    ('œ', 0x9C), ('ž', 0x9E), ('Ÿ', 0x9F),
];

fn win_ansi_byte(c: char) -> Option<u8> {
    match c as u32 {
        0x20..=0x7E | 0xA0..=0xFF => Some(c as u8),
        _ => WIN_ANSI_HIGH.iter().find(|(u, _)| *u == c).map(|&(_, b)| b),
    }
}

/// Encode `text` for the standard Helvetica font. Returns the bytes and how
/// many characters had no WinAnsi code and were replaced by `?`.
pub fn encode_win_ansi(text: &str) -> (Vec<u8>, usize) {
    let mut replaced = 0;
    let bytes = text
        .chars()
        .map(|c| {
            win_ansi_byte(c).unwrap_or_else(|| {
                replaced += 1;
                b'?'
            })
        })
        .collect();
    (bytes, replaced)
}

fn win_ansi_string(text: &str) -> Object {
    Object::String(encode_win_ansi(text).0, StringFormat::Literal)
}

// ── Page structure ───────────────────────────────────────────────────────

/// The page's MediaBox, following `Parent` links for inherited values.
fn media_box(doc: &Document, page_id: ObjectId) -> [f32; 4] {
    let mut current = doc.get_dictionary(page_id).ok();
    for _ in 0..16 {
        let Some(dict) = current else { break };
        if let Ok(obj) = dict.get(b"MediaBox") {
            let arr = match obj {
                Object::Array(a) => Some(a),
                Object::Reference(id) => doc.get_object(*id).and_then(Object::as_array).ok(),
                _ => None,
            };
            let values: Vec<f32> = arr
                .into_iter()
                .flatten()
                .filter_map(|o| match o {
                    Object::Integer(i) => Some(*i as f32),
                    Object::Real(r) => Some(*r),
                    _ => None,
                })
                .collect();
            if let [x0, y0, x1, y1] = values[..] {
                return [x0.min(x1), y0.min(y1), x0.max(x1), y0.max(y1)];
            }
        }
        current = match dict.get(b"Parent") {
            Ok(Object::Reference(id)) => doc.get_dictionary(*id).ok(),
            _ => None,
        };
    }
    DEFAULT_MEDIA_BOX
}

/// A copy of the page's resources, inherited from an ancestor if needed.
fn effective_resources(doc: &Document, page_id: ObjectId) -> Dictionary {
    let mut current = doc.get_dictionary(page_id).ok();
    for _ in 0..16 {
        let Some(dict) = current else { break };
        match dict.get(b"Resources") {
            Ok(Object::Dictionary(d)) => return d.clone(),
            Ok(Object::Reference(id)) => {
                return doc.get_dictionary(*id).cloned().unwrap_or_else(|_| Dictionary::new())
            }
            _ => {}
        }
        current = match dict.get(b"Parent") {
            Ok(Object::Reference(id)) => doc.get_dictionary(*id).ok(),
            _ => None,
        };
    }
    Dictionary::new()
}

/// Register `id` as `/name` in the `category` sub-dictionary of `resources`.
fn add_resource(doc: &Document, resources: &mut Dictionary, category: &[u8], name: &[u8], id: ObjectId) {
    let mut sub = match resources.get(category) {
        Ok(Object::Dictionary(d)) => d.clone(),
        Ok(Object::Reference(r)) => doc.get_dictionary(*r).cloned().unwrap_or_else(|_| Dictionary::new()),
        _ => Dictionary::new(),
    };
    sub.set(name.to_vec(), Object::Reference(id));
    resources.set(category.to_vec(), Object::Dictionary(sub));
}

/// `[open, original…, overlay]`, flattening an indirect contents array.
fn wrapped_contents(doc: &Document, page_id: ObjectId, open_id: ObjectId, overlay_id: ObjectId) -> Vec<Object> {
    let existing: Vec<Object> = match doc.get_dictionary(page_id).and_then(|d| d.get(b"Contents")) {
        Ok(Object::Reference(id)) => match doc.get_object(*id) {
            Ok(Object::Array(arr)) => arr.clone(),
            _ => vec![Object::Reference(*id)],
        },
        Ok(Object::Array(arr)) => arr.clone(),
        _ => Vec::new(),
    };
    let mut contents = Vec::with_capacity(existing.len() + 2);
    contents.push(Object::Reference(open_id));
    contents.extend(existing);
    contents.push(Object::Reference(overlay_id));
    contents
}

// ── Metadata ─────────────────────────────────────────────────────────────

fn apply_metadata(doc: &mut Document, meta: &PdfMetadata) -> Result<(), ExamPdfError> {
    let info_id = match doc.trailer.get(b"Info").ok().cloned() {
        Some(Object::Reference(id)) if doc.get_dictionary(id).is_ok() => id,
        Some(Object::Dictionary(d)) => doc.add_object(d),
        _ => doc.add_object(Dictionary::new()),
    };
    doc.trailer.set("Info", Object::Reference(info_id));

    let info = doc.get_dictionary_mut(info_id).map_err(pp_err)?;
    for (key, value) in [
        ("Title", &meta.title),
        ("Author", &meta.author),
        ("Subject", &meta.subject),
        ("Keywords", &meta.keywords),
    ] {
        if let Some(v) = value {
            info.set(key, pdf_text_string(v));
        }
    }
    Ok(())
}

/// ASCII as a literal string, anything else as UTF-16BE with a byte-order mark.
fn pdf_text_string(s: &str) -> Object {
    if s.is_ascii() {
        return Object::string_literal(s);
    }
    let mut bytes = Vec::with_capacity(2 + s.len() * 2);
    bytes.extend_from_slice(&[0xFE, 0xFF]);
    for unit in s.encode_utf16() {
        bytes.extend_from_slice(&unit.to_be_bytes());
    }
    Object::String(bytes, StringFormat::Hexadecimal)
}

fn decode_text_string(bytes: &[u8]) -> String {
    match bytes {
        [0xFE, 0xFF, rest @ ..] => {
            let units: Vec<u16> = rest
                .chunks_exact(2)
                .map(|c| u16::from_be_bytes([c[0], c[1]]))
                .collect();
            String::from_utf16_lossy(&units)
        }
        _ => bytes.iter().map(|&b| b as char).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// An N-page Letter document with "Body i" on page i.
    fn sample_pdf(pages: usize, author: Option<&str>) -> Vec<u8> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Courier",
            "Encoding" => "WinAnsiEncoding",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        });
        let mut kids = Vec::new();
        for i in 1..=pages {
            let content = Content {
                operations: vec![
                    Operation::new("BT", vec![]),
                    Operation::new("Tf", vec!["F1".into(), 24.into()]),
                    Operation::new("Td", vec![72.into(), 700.into()]),
                    Operation::new("Tj", vec![Object::string_literal(format!("Body {i}"))]),
                    Operation::new("ET", vec![]),
                ],
            };
            let content_id = doc.add_object(Stream::new(Dictionary::new(), content.encode().unwrap()));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
            });
            kids.push(Object::Reference(page_id));
        }
        // Resources and MediaBox inherited from the page tree.
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => pages as i64,
                "Resources" => resources_id,
                "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);
        if let Some(a) = author {
            let info_id = doc.add_object(dictionary! { "Author" => Object::string_literal(a) });
            doc.trailer.set("Info", info_id);
        }
        let mut out = Vec::new();
        doc.save_to(&mut out).unwrap();
        out
    }

    fn page_texts(pdf: &[u8]) -> Vec<String> {
        let doc = Document::load_mem(pdf).unwrap();
        doc.get_pages()
            .keys()
            .map(|&n| doc.extract_text(&[n]).unwrap())
            .collect()
    }

    #[test]
    fn noop_is_byte_identical() {
        let pdf = sample_pdf(2, None);
        let out = post_process(&pdf, &PostProcessOptions::default()).unwrap();
        assert_eq!(out, pdf);
    }

    #[test]
    fn noop_does_not_even_parse() {
        let junk = b"not a pdf at all".to_vec();
        assert_eq!(post_process(&junk, &PostProcessOptions::default()).unwrap(), junk);
    }

    #[test]
    fn malformed_input_is_post_process_error() {
        let opts = PostProcessOptions {
            add_page_numbers: true,
            ..Default::default()
        };
        let err = post_process(b"%PDF-1.7 garbage", &opts).unwrap_err();
        assert!(matches!(err, ExamPdfError::PostProcessFailed { .. }));
    }

    #[test]
    fn watermark_on_every_page() {
        let pdf = sample_pdf(3, None);
        let opts = PostProcessOptions {
            watermark: Some(WatermarkOptions::new("DRAFT")),
            ..Default::default()
        };
        let out = post_process(&pdf, &opts).unwrap();
        let texts = page_texts(&out);
        assert_eq!(texts.len(), 3);
        for (i, t) in texts.iter().enumerate() {
            assert!(t.contains("DRAFT"), "page {} text: {t:?}", i + 1);
            assert!(t.contains(&format!("Body {}", i + 1)), "original text kept");
        }
    }

    #[test]
    fn page_numbers_use_total_count() {
        let pdf = sample_pdf(3, None);
        let opts = PostProcessOptions {
            add_page_numbers: true,
            ..Default::default()
        };
        let out = post_process(&pdf, &opts).unwrap();
        let texts = page_texts(&out);
        assert!(texts[0].contains("Page 1 / 3"));
        assert!(texts[2].contains("Page 3 / 3"));
        assert_eq!(page_count(&out).unwrap(), 3);
    }

    #[test]
    fn metadata_is_additive() {
        let pdf = sample_pdf(1, Some("Exam Cell"));
        let opts = PostProcessOptions {
            metadata: Some(PdfMetadata {
                title: Some("Midterm".into()),
                keywords: Some("cs101, midterm".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let meta = read_metadata(&post_process(&pdf, &opts).unwrap()).unwrap();
        assert_eq!(meta.title.as_deref(), Some("Midterm"));
        assert_eq!(meta.keywords.as_deref(), Some("cs101, midterm"));
        assert_eq!(meta.author.as_deref(), Some("Exam Cell"));
        assert_eq!(meta.subject, None);
    }

    #[test]
    fn unicode_metadata_round_trips() {
        let pdf = sample_pdf(1, None);
        let opts = PostProcessOptions {
            metadata: Some(PdfMetadata {
                title: Some("Épreuve – 数学".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let meta = read_metadata(&post_process(&pdf, &opts).unwrap()).unwrap();
        assert_eq!(meta.title.as_deref(), Some("Épreuve – 数学"));
    }

    #[test]
    fn inherited_media_box_and_resources_are_found() {
        let pdf = sample_pdf(1, None);
        let doc = Document::load_mem(&pdf).unwrap();
        let page_id = *doc.get_pages().values().next().unwrap();
        assert_eq!(media_box(&doc, page_id), [0.0, 0.0, 612.0, 792.0]);
        assert!(effective_resources(&doc, page_id).get(b"Font").is_ok());
    }

    #[test]
    fn win_ansi_maps_typographic_characters() {
        let (bytes, replaced) = encode_win_ansi("€5 – “ok” é");
        assert_eq!(
            bytes,
            vec![0x80, b'5', b' ', 0x96, b' ', 0x93, b'o', b'k', 0x94, b' ', 0xE9]
        );
        assert_eq!(replaced, 0);

        // C1 controls and anything beyond WinAnsi are replaced and counted.
        let (bytes, replaced) = encode_win_ansi("A\u{0085}中B");
        assert_eq!(bytes, b"A??B".to_vec());
        assert_eq!(replaced, 2);
    }

    #[test]
    fn unsupported_watermark_characters_print_as_question_marks() {
        let out = post_process(
            &sample_pdf(1, None),
            &PostProcessOptions {
                watermark: Some(WatermarkOptions::new("草稿 — DRAFT")),
                ..Default::default()
            },
        )
        .unwrap();
        let doc = Document::load_mem(&out).unwrap();
        let page_id = *doc.get_pages().values().next().unwrap();
        let content = Content::decode(&doc.get_page_content(page_id).unwrap()).unwrap();
        let shown: Vec<&[u8]> = content
            .operations
            .iter()
            .filter(|op| op.operator == "Tj")
            .filter_map(|op| op.operands.first()?.as_str().ok())
            .collect();
        assert!(shown.contains(&&b"?? \x97 DRAFT"[..]), "{shown:?}");
    }

    #[test]
    fn helvetica_widths() {
        assert!((text_width("DRAFT", 1000.0) - (722.0 + 722.0 + 667.0 + 611.0 + 611.0)).abs() < 1e-3);
        assert_eq!(text_width("", 12.0), 0.0);
    }
}
