//! Input resolution: turn user-supplied paths into a list of PDF files.
//!
//! Files are checked for the `%PDF` magic bytes up front so a mistyped path
//! fails before any OCR budget is spent, with a message that says why.
//! Directories expand to the `*.pdf` files directly inside them, sorted by
//! name so batch order is reproducible between runs.

use crate::error::OcrBatchError;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Expand and validate the given inputs, preserving their order.
///
/// Explicit files must be readable PDFs. Inside a directory, files with a
/// `.pdf` extension that are not PDFs are skipped with a warning.
pub fn collect_inputs(inputs: &[PathBuf]) -> Result<Vec<PathBuf>, OcrBatchError> {
    let mut files = Vec::new();
    for input in inputs {
        if input.is_dir() {
            let found = expand_dir(input)?;
            info!(dir = %input.display(), count = found.len(), "Expanded input folder");
            files.extend(found);
        } else {
            validate_pdf(input)?;
            files.push(input.clone());
        }
    }

    let mut seen = std::collections::HashSet::new();
    files.retain(|p| seen.insert(std::fs::canonicalize(p).unwrap_or_else(|_| p.clone())));

    if files.is_empty() {
        return Err(OcrBatchError::NoInputs);
    }
    Ok(files)
}

fn expand_dir(dir: &Path) -> Result<Vec<PathBuf>, OcrBatchError> {
    let entries = std::fs::read_dir(dir).map_err(|e| match e.kind() {
        std::io::ErrorKind::PermissionDenied => OcrBatchError::PermissionDenied {
            path: dir.to_path_buf(),
        },
        _ => OcrBatchError::FileNotFound {
            path: dir.to_path_buf(),
        },
    })?;

    let mut pdfs: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file() && has_pdf_extension(p))
        .filter(|p| match validate_pdf(p) {
            Ok(()) => true,
            Err(e) => {
                warn!("Skipping {}: {}", p.display(), e);
                false
            }
        })
        .collect();
    pdfs.sort();
    Ok(pdfs)
}

fn has_pdf_extension(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
}

/// Check that `path` exists, is readable, and starts with `%PDF`.
pub fn validate_pdf(path: &Path) -> Result<(), OcrBatchError> {
    if !path.exists() {
        return Err(OcrBatchError::FileNotFound {
            path: path.to_path_buf(),
        });
    }

    let mut file = std::fs::File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::PermissionDenied => OcrBatchError::PermissionDenied {
            path: path.to_path_buf(),
        },
        _ => OcrBatchError::FileNotFound {
            path: path.to_path_buf(),
        },
    })?;

    let mut magic = [0u8; 4];
    if file.read_exact(&mut magic).is_err() || &magic != b"%PDF" {
        return Err(OcrBatchError::NotAPdf {
            path: path.to_path_buf(),
            magic,
        });
    }

    debug!("Validated PDF: {}", path.display());
    Ok(())
}
