//! Error types for the edgequake-ocrbatch library.
//!
//! Three error types reflect three distinct scopes:
//!
//! * [`OcrBatchError`]: **Document- or batch-level**: the document (or the
//!   whole batch) cannot proceed. Bad input file, unreadable PDF, missing or
//!   revoked credential, a checkpoint write that could not be made durable.
//!
//! * [`PageFailure`]: **Page-level**: one page could not be converted but the
//!   document carries on. Stored inside [`crate::output::PageResult`] and
//!   persisted in the checkpoint so a later run knows which pages to retry.
//!
//! * [`OcrCallError`]: **Call-level**: what a single request to the remote
//!   OCR service returned. [`OcrCallError::class`] decides whether the call is
//!   retried, the page is failed, or the batch is aborted. It never escapes
//!   [`crate::pipeline::ocr::OcrClient`].

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Fatal errors for a document or for the whole batch.
#[derive(Debug, Error)]
pub enum OcrBatchError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("PDF file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The file exists and was read, but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    /// No PDF files were found among the given inputs.
    #[error("No PDF files found in the given inputs")]
    NoInputs,

    // ── Document errors ───────────────────────────────────────────────────
    /// The PDF could not be parsed. Fatal for this document only.
    #[error("PDF '{path}' is unreadable: {detail}\nTry repairing with: qpdf --decrypt input.pdf output.pdf")]
    DocumentUnreadable { path: PathBuf, detail: String },

    /// PDF requires a password but none was provided.
    #[error("PDF '{path}' is encrypted and requires a password.\nProvide it with --password <PASSWORD>.")]
    PasswordRequired { path: PathBuf },

    /// A password was provided but it is wrong.
    #[error("Wrong password for PDF '{path}'")]
    WrongPassword { path: PathBuf },

    /// Assembly was requested before every page had a checkpoint record.
    #[error("Document '{document}' is incomplete: {} page(s) have no checkpoint (first missing index {})", .missing.len(), .missing.first().copied().unwrap_or_default())]
    IncompleteDocument {
        document: String,
        missing: Vec<usize>,
    },

    // ── Credential errors (fatal to the batch) ────────────────────────────
    /// No credential is available from the credential store.
    #[error("No OCR API key available.\n{hint}")]
    CredentialMissing { hint: String },

    /// The OCR service rejected the credential mid-job.
    #[error("OCR API key was rejected: {detail}\nUpdate the stored key and re-run; completed pages are kept.")]
    CredentialInvalid { detail: String },

    /// The credential store itself failed.
    #[error("Credential store error: {0}")]
    CredentialStore(String),

    // ── Storage errors ────────────────────────────────────────────────────
    /// A checkpoint record could not be written durably. Fatal for the document.
    #[error("Failed to write checkpoint '{path}': {source}")]
    StorageWriteError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The checkpoint directory could not be enumerated.
    #[error("Failed to read checkpoints in '{path}': {source}")]
    StorageReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Could not create or write the output Markdown file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Backend / config errors ───────────────────────────────────────────
    /// The configured vision provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl OcrBatchError {
    /// Whether this error must stop every remaining document in the batch.
    pub fn halts_batch(&self) -> bool {
        matches!(
            self,
            OcrBatchError::CredentialMissing { .. }
                | OcrBatchError::CredentialInvalid { .. }
                | OcrBatchError::CredentialStore(_)
        )
    }
}

/// How a failed OCR call is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureClass {
    /// Retry with backoff (bounded attempts).
    Transient,
    /// Do not retry; mark the page failed and continue the document.
    Permanent,
    /// Abort the whole batch.
    Fatal,
}

/// A non-fatal failure for a single page.
///
/// `Transient` and `Permanent` failures are recorded in the checkpoint store so
/// the Assembler can emit a placeholder; `Fatal` and `Cancelled` never are.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PageFailure {
    /// Retries were exhausted on a transient error.
    #[error("transient error after {attempts} attempt(s): {detail}")]
    Transient { attempts: u32, detail: String },

    /// The service rejected the page, or the page could not be rendered.
    #[error("{detail}")]
    Permanent { detail: String },

    /// The credential was rejected; the batch must stop.
    #[error("fatal: {detail}")]
    Fatal { detail: String },

    /// Cancellation was observed before the page finished.
    #[error("cancelled")]
    Cancelled,
}

impl PageFailure {
    /// Whether this failure is persisted as a checkpoint record.
    pub fn is_recordable(&self) -> bool {
        matches!(self, PageFailure::Transient { .. } | PageFailure::Permanent { .. })
    }
}

/// The outcome of one request to the remote OCR service.
#[derive(Debug, Clone, Error)]
pub enum OcrCallError {
    /// HTTP 429 or equivalent. Reported to the rate limiter.
    #[error("rate limited by the OCR service")]
    RateLimited { retry_after: Option<Duration> },

    /// The call did not complete within the per-call timeout.
    #[error("OCR call timed out after {secs}s")]
    Timeout { secs: u64 },

    /// Connection refused, reset, DNS failure…
    #[error("connection error: {0}")]
    Connection(String),

    /// 5xx from the service.
    #[error("server error (HTTP {status}): {detail}")]
    Server { status: u16, detail: String },

    /// 2xx whose body could not be understood.
    #[error("invalid response body: {0}")]
    InvalidResponse(String),

    /// 400 / 422: the request itself is malformed.
    #[error("malformed request (HTTP {status}): {detail}")]
    BadRequest { status: u16, detail: String },

    /// 403: authenticated, but not allowed to use this resource.
    #[error("authentication failure: {0}")]
    Forbidden(String),

    /// 413: the page image is too large for the service.
    #[error("payload too large ({bytes} bytes)")]
    PayloadTooLarge { bytes: usize },

    /// 401: the credential is invalid or has been revoked.
    #[error("invalid or revoked API key: {0}")]
    InvalidCredential(String),
}

impl OcrCallError {
    /// Classify this error for the retry policy.
    pub fn class(&self) -> FailureClass {
        match self {
            OcrCallError::RateLimited { .. }
            | OcrCallError::Timeout { .. }
            | OcrCallError::Connection(_)
            | OcrCallError::Server { .. }
            | OcrCallError::InvalidResponse(_) => FailureClass::Transient,
            OcrCallError::BadRequest { .. }
            | OcrCallError::Forbidden(_)
            | OcrCallError::PayloadTooLarge { .. } => FailureClass::Permanent,
            OcrCallError::InvalidCredential(_) => FailureClass::Fatal,
        }
    }

    /// Map an HTTP status and body onto a classified error.
    ///
    /// Returns `None` for 2xx statuses.
    pub fn from_status(
        status: u16,
        detail: impl Into<String>,
        retry_after: Option<Duration>,
        payload_bytes: usize,
    ) -> Option<Self> {
        let detail = detail.into();
        let err = match status {
            200..=299 => return None,
            401 => OcrCallError::InvalidCredential(detail),
            403 => OcrCallError::Forbidden(detail),
            408 => OcrCallError::Timeout { secs: 0 },
            413 => OcrCallError::PayloadTooLarge {
                bytes: payload_bytes,
            },
            429 => OcrCallError::RateLimited { retry_after },
            500..=599 => OcrCallError::Server { status, detail },
            _ => OcrCallError::BadRequest { status, detail },
        };
        Some(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_document_display() {
        let e = OcrBatchError::IncompleteDocument {
            document: "report-1a2b".into(),
            missing: vec![3, 7],
        };
        let msg = e.to_string();
        assert!(msg.contains("report-1a2b"), "got: {msg}");
        assert!(msg.contains("2 page(s)"), "got: {msg}");
        assert!(msg.contains("index 3"), "got: {msg}");
    }

    #[test]
    fn credential_errors_halt_batch() {
        assert!(OcrBatchError::CredentialInvalid {
            detail: "revoked".into()
        }
        .halts_batch());
        assert!(!OcrBatchError::DocumentUnreadable {
            path: "a.pdf".into(),
            detail: "bad xref".into()
        }
        .halts_batch());
    }

    #[test]
    fn status_classification() {
        let class = |s| {
            OcrCallError::from_status(s, "x", None, 10)
                .map(|e| e.class())
        };
        assert_eq!(class(200), None);
        assert_eq!(class(429), Some(FailureClass::Transient));
        assert_eq!(class(503), Some(FailureClass::Transient));
        assert_eq!(class(408), Some(FailureClass::Transient));
        assert_eq!(class(400), Some(FailureClass::Permanent));
        assert_eq!(class(403), Some(FailureClass::Permanent));
        assert_eq!(class(413), Some(FailureClass::Permanent));
        assert_eq!(class(401), Some(FailureClass::Fatal));
    }

    #[test]
    fn rate_limited_keeps_retry_after() {
        let e = OcrCallError::from_status(429, "slow down", Some(Duration::from_secs(7)), 0);
        match e {
            Some(OcrCallError::RateLimited { retry_after }) => {
                assert_eq!(retry_after, Some(Duration::from_secs(7)))
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn only_transient_and_permanent_are_recordable() {
        assert!(PageFailure::Permanent { detail: "x".into() }.is_recordable());
        assert!(PageFailure::Transient {
            attempts: 4,
            detail: "x".into()
        }
        .is_recordable());
        assert!(!PageFailure::Fatal { detail: "x".into() }.is_recordable());
        assert!(!PageFailure::Cancelled.is_recordable());
    }

    #[test]
    fn page_failure_serialises_with_kind_tag() {
        let json = serde_json::to_string(&PageFailure::Permanent {
            detail: "payload too large".into(),
        })
        .unwrap();
        assert!(json.contains("\"kind\":\"permanent\""), "got: {json}");
    }
}
