//! Paper lookup: how a [`PaperId`] becomes [`PaperData`].
//!
//! The surrounding application owns persistence and authorisation; it hands
//! the generator a [`PaperFetcher`]. `Ok(None)` means "no such paper" and
//! surfaces as [`ExamPdfError::PaperNotFound`]; `Err` is any other failure.
//!
//! Any async closure `Fn(PaperId) -> Future<Output = Result<Option<PaperData>, E>>`
//! is a fetcher:
//!
//! ```rust
//! use exam_pdf::{PaperData, PaperFetcher, PaperId};
//!
//! let fetcher = |id: PaperId| async move {
//!     Ok::<_, std::io::Error>(match id {
//!         PaperId::Number(1) => Some(PaperData {
//!             title: "Quiz".into(),
//!             course: "MATH100".into(),
//!             metadata: Default::default(),
//!             questions: vec![],
//!             created_by: serde_json::Value::Null,
//!         }),
//!         _ => None,
//!     })
//! };
//! # fn assert_fetcher<F: PaperFetcher>(_: &F) {}
//! # assert_fetcher(&fetcher);
//! ```

use crate::error::ExamPdfError;
use crate::model::{PaperData, PaperId};
use async_trait::async_trait;
use std::fmt::Display;
use std::future::Future;
use std::path::PathBuf;
use tracing::debug;

#[async_trait]
pub trait PaperFetcher: Send + Sync {
    /// Load a paper, or `Ok(None)` when it does not exist.
    async fn fetch_paper(&self, id: &PaperId) -> Result<Option<PaperData>, ExamPdfError>;
}

#[async_trait]
impl<F, Fut, E> PaperFetcher for F
where
    F: Fn(PaperId) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Option<PaperData>, E>> + Send,
    E: Display + Send,
{
    async fn fetch_paper(&self, id: &PaperId) -> Result<Option<PaperData>, ExamPdfError> {
        (self)(id.clone())
            .await
            .map_err(|e| ExamPdfError::PaperFetchFailed {
                id: id.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Reads papers from `<dir>/<id>.json`.
#[derive(Debug, Clone)]
pub struct JsonDirFetcher {
    dir: PathBuf,
}

impl JsonDirFetcher {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, id: &PaperId) -> Option<PathBuf> {
        let name = id.to_string();
        // Ids name files directly; refuse anything that could leave `dir`.
        let safe = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !name.starts_with('.');
        safe.then(|| self.dir.join(format!("{name}.json")))
    }
}

#[async_trait]
impl PaperFetcher for JsonDirFetcher {
    async fn fetch_paper(&self, id: &PaperId) -> Result<Option<PaperData>, ExamPdfError> {
        let Some(path) = self.path_for(id) else {
            return Ok(None);
        };
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No paper file at {}", path.display());
                return Ok(None);
            }
            Err(e) => {
                return Err(ExamPdfError::PaperFetchFailed {
                    id: id.to_string(),
                    reason: format!("{}: {e}", path.display()),
                })
            }
        };
        let paper = serde_json::from_slice(&raw).map_err(|e| ExamPdfError::PaperFetchFailed {
            id: id.to_string(),
            reason: format!("{}: invalid paper JSON: {e}", path.display()),
        })?;
        Ok(Some(paper))
    }
}
