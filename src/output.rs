//! Result types: per-page outcomes and per-document / per-batch reports.

use crate::error::PageFailure;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Outcome of converting one page.
///
/// A page either carries Markdown (`failure == None`) or a classified
/// [`PageFailure`]. Only successful and recordable-failure results are ever
/// written to the checkpoint store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageResult {
    /// 0-based page index.
    pub page_index: usize,
    /// Extracted Markdown; empty on failure.
    pub markdown: String,
    /// `None` on success.
    pub failure: Option<PageFailure>,
    /// Number of OCR calls made for this page (0 if never submitted).
    pub attempts: u32,
    /// Wall-clock time spent on the page, including backoff.
    pub duration_ms: u64,
}

impl PageResult {
    pub fn success(page_index: usize, markdown: impl Into<String>, attempts: u32) -> Self {
        Self {
            page_index,
            markdown: markdown.into(),
            failure: None,
            attempts,
            duration_ms: 0,
        }
    }

    pub fn failed(page_index: usize, failure: PageFailure, attempts: u32) -> Self {
        Self {
            page_index,
            markdown: String::new(),
            failure: Some(failure),
            attempts,
            duration_ms: 0,
        }
    }

    pub fn with_duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = ms;
        self
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.failure, Some(PageFailure::Cancelled))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self.failure, Some(PageFailure::Fatal { .. }))
    }

    /// 1-based page number for display.
    pub fn page_num(&self) -> usize {
        self.page_index + 1
    }
}

/// Terminal (or not-yet-started) status of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Cancelled | JobStatus::Failed
        )
    }
}

/// Summary of one document's run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentReport {
    pub document: String,
    pub source: PathBuf,
    pub status: JobStatus,
    /// `None` when the document could not be opened.
    pub total_pages: Option<usize>,
    /// Pages with a successful record at the end of the run.
    pub completed_pages: usize,
    /// 1-based page numbers recorded as failed.
    pub failed_pages: Vec<usize>,
    /// Successful records found on disk before this run started.
    pub resumed_from: usize,
    /// 0-based index of the highest successfully recorded page.
    pub last_successful_page: Option<usize>,
    /// Written Markdown file, set only on `Completed`.
    pub output: Option<PathBuf>,
    pub error: Option<String>,
    /// The failure also stops every later document in the batch.
    pub batch_halted: bool,
    pub duration_ms: u64,
}

impl DocumentReport {
    pub fn pending(document: impl Into<String>, source: PathBuf, reason: Option<String>) -> Self {
        Self {
            document: document.into(),
            source,
            status: JobStatus::Pending,
            total_pages: None,
            completed_pages: 0,
            failed_pages: Vec::new(),
            resumed_from: 0,
            last_successful_page: None,
            output: None,
            error: reason,
            batch_halted: false,
            duration_ms: 0,
        }
    }

    /// Completed with every page converted.
    pub fn is_clean(&self) -> bool {
        self.status == JobStatus::Completed && self.failed_pages.is_empty()
    }
}

/// Summary of a whole batch, in submission order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchReport {
    pub documents: Vec<DocumentReport>,
    /// Set when a fatal error stopped the batch early.
    pub halted: Option<String>,
}

impl BatchReport {
    pub fn all_clean(&self) -> bool {
        self.halted.is_none() && self.documents.iter().all(DocumentReport::is_clean)
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.documents.iter().filter(|d| d.status == status).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_result_constructors() {
        let ok = PageResult::success(0, "# Title", 1);
        assert!(ok.is_success());
        assert_eq!(ok.page_num(), 1);

        let cancelled = PageResult::failed(4, PageFailure::Cancelled, 0);
        assert!(cancelled.is_cancelled());
        assert!(!cancelled.is_success());
    }

    #[test]
    fn clean_batch_requires_no_failed_pages() {
        let mut report = DocumentReport::pending("doc", "a.pdf".into(), None);
        report.status = JobStatus::Completed;
        let mut batch = BatchReport {
            documents: vec![report.clone()],
            halted: None,
        };
        assert!(batch.all_clean());

        report.failed_pages = vec![3];
        batch.documents.push(report);
        assert!(!batch.all_clean());
        assert_eq!(batch.count(JobStatus::Completed), 2);
    }

    #[test]
    fn status_serialises_snake_case() {
        let json = serde_json::to_string(&JobStatus::Cancelled).unwrap();
        assert_eq!(json, "\"cancelled\"");
    }
}
