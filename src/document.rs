//! Document identity.
//!
//! A document is keyed by a [`DocumentId`] derived from its canonical source
//! path: a readable slug of the file stem plus a short SHA-256 prefix of the
//! full path. Two PDFs called `report.pdf` in different folders get distinct
//! checkpoint directories; the same file reached through a different relative
//! path maps to the same id, so a resume always finds its records.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};

/// Stable identifier for a document across runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    /// Derive the id from a source path.
    ///
    /// The path is canonicalised when possible so that `./a.pdf` and
    /// `/abs/a.pdf` agree; if canonicalisation fails the path is hashed as given.
    pub fn from_path(path: &Path) -> Self {
        let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let digest = Sha256::digest(canonical.to_string_lossy().as_bytes());
        let hash: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();

        let stem = path
            .file_stem()
            .map(|s| slug(&s.to_string_lossy()))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "document".to_string());

        DocumentId(format!("{stem}-{hash}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(s: &str) -> Self {
        DocumentId(slug(s))
    }
}

/// Keep `[A-Za-z0-9_-]`, fold everything else to `_`, cap at 48 chars.
fn slug(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(48)
        .collect()
}

/// One PDF in a batch.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: DocumentId,
    /// Local path of the source PDF.
    pub source: PathBuf,
    /// Where the assembled Markdown is written.
    pub output_path: PathBuf,
    /// Unknown until the page source has opened the file.
    pub page_count: Option<usize>,
}

impl Document {
    /// Build a document whose output lands at `<output_dir>/<stem>.md`.
    pub fn new(source: impl Into<PathBuf>, output_dir: &Path) -> Self {
        let source = source.into();
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document".to_string());
        Self {
            id: DocumentId::from_path(&source),
            output_path: output_dir.join(format!("{stem}.md")),
            source,
            page_count: None,
        }
    }
}
