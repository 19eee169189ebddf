//! # edgequake-ocrbatch
//!
//! Resumable batch conversion of PDF documents to Markdown through a remote,
//! rate-limited OCR service.
//!
//! ## Why this crate?
//!
//! A remote OCR API is slow, metered, throttled and occasionally flaky. A
//! 300-page scan that dies at page 212 should not cost 212 pages again. This
//! crate processes one page at a time, checkpoints every result durably
//! before moving on, and resumes from the first missing page on the next run.
//! Throttling slows the whole client down instead of burning retries.
//!
//! ## Pipeline Overview
//!
//! ```text
//! paths / folders
//!  │
//!  ├─ 1. Input       expand folders, validate %PDF magic
//!  ├─ 2. Checkpoint  load surviving page records, compute pending pages
//!  ├─ 3. Render      rasterise pending pages lazily, in chunks (pdfium)
//!  ├─ 4. Encode      JPEG/PNG under the 4 MiB upload limit
//!  ├─ 5. OCR         rate limiter → backend call → classify → retry
//!  ├─ 6. Polish      deterministic Markdown cleanup
//!  ├─ 7. Record      atomic per-page checkpoint write
//!  └─ 8. Assemble    ordered pages + separators → <stem>.md (atomic)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_ocrbatch::{convert_batch, BatchConfig, EnvCredentialStore, ProgressSink};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Reads MISTRAL_API_KEY.
//!     let credentials = Arc::new(EnvCredentialStore::default());
//!     let config = BatchConfig::builder().output_dir("out").build()?;
//!     let report = convert_batch(
//!         &["scans/".into()],
//!         &config,
//!         credentials,
//!         &CancellationToken::new(),
//!         &ProgressSink::noop(),
//!     )
//!     .await?;
//!     for doc in &report.documents {
//!         eprintln!("{}: {:?} (failed pages {:?})", doc.document, doc.status, doc.failed_pages);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `ocrbatch` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! ## Backends
//!
//! | Backend | Credential | Default model |
//! |---------|------------|---------------|
//! | `mistral` | `MISTRAL_API_KEY` via [`CredentialStore`] | `mistral-ocr-latest` |
//! | `vision`  | provider env vars (`OPENAI_API_KEY`, …) | `gpt-4.1-nano` |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod assemble;
pub mod backend;
pub mod checkpoint;
pub mod config;
pub mod convert;
pub mod credential;
pub mod document;
pub mod engine;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod rate_limit;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use assemble::{assemble_pages, Assembled, Assembler};
pub use backend::{MistralOcrBackend, OcrBackend, VisionLlmBackend};
pub use checkpoint::{CheckpointStore, RecordOutcome};
pub use config::{BackendKind, BatchConfig, BatchConfigBuilder, ImageFormat, PageSeparator};
pub use convert::{build_engine, convert_batch, documents_for};
pub use credential::{Credential, CredentialStore, EnvCredentialStore, MemoryCredentialStore};
pub use document::{Document, DocumentId};
pub use engine::{EngineHandle, JobEngine, JobRequest, JobState};
pub use error::{FailureClass, OcrBatchError, OcrCallError, PageFailure};
pub use output::{BatchReport, DocumentReport, JobStatus, PageResult};
pub use pipeline::ocr::{OcrClient, RetryPolicy};
pub use pipeline::render::{PageSource, PageUnit, PdfiumPageSource, RenderSettings, SourceError};
pub use progress::{ProgressEvent, ProgressSink};
pub use rate_limit::{Permit, RateLimitConfig, RateLimiter};
