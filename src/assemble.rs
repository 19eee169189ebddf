//! Final document assembly from checkpointed pages.

use crate::checkpoint::CheckpointStore;
use crate::config::PageSeparator;
use crate::document::DocumentId;
use crate::error::OcrBatchError;
use crate::output::PageResult;

/// An assembled document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assembled {
    pub markdown: String,
    /// 1-based numbers of pages rendered as placeholders.
    pub failed_pages: Vec<usize>,
}

/// Joins a document's checkpoint records into one Markdown string.
#[derive(Debug, Clone, Default)]
pub struct Assembler {
    separator: PageSeparator,
}

impl Assembler {
    pub fn new(separator: PageSeparator) -> Self {
        Self { separator }
    }

    /// Read every record for `id` and join them in page order.
    ///
    /// Fails with [`OcrBatchError::IncompleteDocument`] if a page has no record.
    pub async fn assemble(
        &self,
        store: &CheckpointStore,
        id: &DocumentId,
        page_count: usize,
    ) -> Result<Assembled, OcrBatchError> {
        let pages = store.assemble_order(id, page_count).await?;
        Ok(assemble_pages(&pages, &self.separator))
    }
}

/// Join `pages` (already in page order) with `separator` between them.
///
/// Failed pages become `<!-- page N: OCR failed (reason) -->`. The result ends
/// with exactly one newline.
pub fn assemble_pages(pages: &[PageResult], separator: &PageSeparator) -> Assembled {
    let mut markdown = String::new();
    let mut failed_pages = Vec::new();

    for (i, page) in pages.iter().enumerate() {
        if i > 0 {
            markdown.push_str(&separator.render(page.page_num()));
        }
        match &page.failure {
            None => markdown.push_str(page.markdown.trim_matches('\n')),
            Some(failure) => {
                failed_pages.push(page.page_num());
                markdown.push_str(&placeholder(page.page_num(), &failure.to_string()));
            }
        }
    }

    let trimmed = markdown.trim_end().len();
    markdown.truncate(trimmed);
    markdown.push('\n');

    Assembled {
        markdown,
        failed_pages,
    }
}

fn placeholder(page_num: usize, reason: &str) -> String {
    // `--` would end the HTML comment early.
    let mut reason = reason.replace('\n', " ");
    while reason.contains("--") {
        reason = reason.replace("--", "-");
    }
    format!("<!-- page {page_num}: OCR failed ({reason}) -->")
}
