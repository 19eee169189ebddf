//! Per-page pipeline stages.
//!
//! Each submodule implements exactly one transformation step, so each is
//! testable in isolation and the engine only wires them together.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ render ──▶ encode ──▶ ocr ──▶ postprocess
//! (paths)   (pdfium)   (jpeg/png) (HTTP)  (cleanup)
//! ```
//!
//! 1. [`input`]: expand folders and validate `%PDF` magic
//! 2. [`render`]: the lazy [`render::PageSource`]; rasterises in chunks
//!    inside `spawn_blocking` because pdfium is not async-safe
//! 3. [`encode`]: JPEG/PNG encoding under the upload size limit
//! 4. [`ocr`]: rate-limited, retrying calls to the OCR backend; the only
//!    stage with network I/O
//! 5. [`postprocess`]: deterministic Markdown cleanup before checkpointing

pub mod encode;
pub mod input;
pub mod ocr;
pub mod postprocess;
pub mod render;
