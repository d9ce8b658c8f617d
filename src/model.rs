//! Question-paper value types consumed by the template stage.
//!
//! These are request-scoped, immutable inputs: the surrounding application
//! loads them from its own persistence layer (or a JSON file, see
//! [`crate::fetcher::JsonDirFetcher`]) and hands them to the pipeline.
//! Field names follow the JSON shape used by the authoring application, so
//! the types deserialise directly from its API payloads.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a paper, numeric or textual depending on the backing store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PaperId {
    Number(i64),
    Text(String),
}

impl fmt::Display for PaperId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaperId::Number(n) => write!(f, "{n}"),
            PaperId::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for PaperId {
    fn from(n: i64) -> Self {
        PaperId::Number(n)
    }
}

impl From<i32> for PaperId {
    fn from(n: i32) -> Self {
        PaperId::Number(n.into())
    }
}

impl From<&str> for PaperId {
    fn from(s: &str) -> Self {
        PaperId::Text(s.to_string())
    }
}

impl From<String> for PaperId {
    fn from(s: String) -> Self {
        PaperId::Text(s)
    }
}

/// A metadata value that may arrive as either a JSON string or number
/// (`"duration": 60` and `"duration": "60"` are both accepted).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TextOrNumber {
    Number(f64),
    Text(String),
}

impl fmt::Display for TextOrNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TextOrNumber::Number(n) => f.write_str(&format_number(*n)),
            TextOrNumber::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for TextOrNumber {
    fn from(n: f64) -> Self {
        TextOrNumber::Number(n)
    }
}

impl From<&str> for TextOrNumber {
    fn from(s: &str) -> Self {
        TextOrNumber::Text(s.to_string())
    }
}

/// Format a number without a trailing `.0` for whole values (`10` not `10.0`).
pub fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

/// Header information printed above the questions. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaperMetadata {
    pub institution: Option<String>,
    pub academic_year: Option<String>,
    pub exam_type: Option<String>,
    pub semester: Option<TextOrNumber>,
    /// Duration in minutes.
    pub duration: Option<TextOrNumber>,
    pub full_marks: Option<TextOrNumber>,
}

/// One question of a paper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub question_id: serde_json::Value,
    /// Display order; `None` sorts after every numbered question.
    #[serde(default)]
    pub sequence_number: Option<i64>,
    /// Pre-sanitised HTML fragment, inserted verbatim.
    pub content_html: String,
    #[serde(default)]
    pub marks: Option<f64>,
}

/// A complete question paper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperData {
    pub title: String,
    pub course: String,
    #[serde(default)]
    pub metadata: PaperMetadata,
    #[serde(default)]
    pub questions: Vec<Question>,
    /// Opaque author identifier, passed through untouched.
    #[serde(default)]
    pub created_by: serde_json::Value,
}
