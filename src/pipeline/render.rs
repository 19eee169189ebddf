//! Page source: lazily rasterise PDF pages into upload-ready page units.
//!
//! ## Why spawn_blocking?
//!
//! The `pdfium-render` crate wraps the pdfium C++ library, which uses
//! thread-local state internally and is not safe to call from async contexts.
//! `tokio::task::spawn_blocking` moves the work onto a dedicated thread pool
//! thread designed for blocking operations, preventing the Tokio worker
//! threads from stalling during CPU-heavy rendering.
//!
//! ## Why chunks?
//!
//! A thousand-page scan cannot be rendered up front. [`PdfiumPageSource`]
//! renders `chunk_size` pages per blocking call and only starts the next
//! chunk once the consumer has taken every unit of the previous one, so at
//! most one chunk of encoded pages is alive at any time.
//!
//! ## Why cap pixels as well as DPI?
//!
//! Page sizes vary wildly: an A0 poster at 150 DPI would produce a
//! 7,000 × 10,000 px image. `max_rendered_pixels` caps both edges
//! regardless of physical size, keeping memory and payloads bounded.

use crate::config::{BatchConfig, ImageFormat};
use crate::document::{Document, DocumentId};
use crate::error::OcrBatchError;
use crate::pipeline::encode::{encode_within_limit, MAX_BASE64_PAYLOAD};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// One page ready for OCR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageUnit {
    pub document: DocumentId,
    /// 0-based page index.
    pub index: usize,
    /// Encoded image bytes.
    pub payload: Vec<u8>,
    pub format: ImageFormat,
    pub quality: u8,
    pub dpi: u32,
}

impl PageUnit {
    /// 1-based page number.
    pub fn page_num(&self) -> usize {
        self.index + 1
    }
}

/// Failure while producing a page unit.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The whole document became unreadable.
    #[error(transparent)]
    Document(#[from] OcrBatchError),

    /// A single page could not be rasterised or encoded.
    #[error("page {}: {detail}", .index + 1)]
    Page { index: usize, detail: String },
}

/// Supplier of page units for a document.
///
/// `pages` must yield units in the order of `indices`, and asking for the
/// same index again must produce an equivalent unit.
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Open the document and return its page count.
    async fn open(&self, document: &Document) -> Result<usize, OcrBatchError>;

    /// Lazily produce units for `indices`.
    fn pages(
        &self,
        document: &Document,
        indices: Vec<usize>,
    ) -> BoxStream<'static, Result<PageUnit, SourceError>>;
}

/// Rendering parameters taken from [`BatchConfig`].
#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub dpi: u32,
    pub max_pixels: u32,
    pub format: ImageFormat,
    pub quality: u8,
    pub chunk_size: usize,
    pub password: Option<String>,
}

impl RenderSettings {
    pub fn from_config(config: &BatchConfig) -> Self {
        Self {
            dpi: config.dpi,
            max_pixels: config.max_rendered_pixels,
            format: config.image_format,
            quality: config.image_quality,
            chunk_size: config.effective_chunk_size(),
            password: config.password.clone(),
        }
    }
}

/// [`PageSource`] backed by pdfium.
#[derive(Debug, Clone)]
pub struct PdfiumPageSource {
    settings: RenderSettings,
}

impl PdfiumPageSource {
    pub fn new(settings: RenderSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl PageSource for PdfiumPageSource {
    async fn open(&self, document: &Document) -> Result<usize, OcrBatchError> {
        let path = document.source.clone();
        let password = self.settings.password.clone();
        tokio::task::spawn_blocking(move || {
            let pdfium = Pdfium::default();
            let pdf = load(&pdfium, &path, password.as_deref())?;
            let count = pdf.pages().len() as usize;
            info!("PDF loaded: {} ({} pages)", path.display(), count);
            Ok(count)
        })
        .await
        .map_err(|e| OcrBatchError::Internal(format!("Render task panicked: {}", e)))?
    }

    fn pages(
        &self,
        document: &Document,
        indices: Vec<usize>,
    ) -> BoxStream<'static, Result<PageUnit, SourceError>> {
        let chunks: Vec<Vec<usize>> = indices
            .chunks(self.settings.chunk_size.max(1))
            .map(<[usize]>::to_vec)
            .collect();
        let path = document.source.clone();
        let id = document.id.clone();
        let settings = self.settings.clone();

        stream::iter(chunks)
            .then(move |chunk| {
                let path = path.clone();
                let id = id.clone();
                let settings = settings.clone();
                async move { render_chunk(path, id, settings, chunk).await }
            })
            .flat_map(stream::iter)
            .boxed()
    }
}

async fn render_chunk(
    path: PathBuf,
    id: DocumentId,
    settings: RenderSettings,
    chunk: Vec<usize>,
) -> Vec<Result<PageUnit, SourceError>> {
    tokio::task::spawn_blocking(move || render_chunk_blocking(&path, &id, &settings, &chunk))
        .await
        .unwrap_or_else(|e| {
            vec![Err(SourceError::Document(OcrBatchError::Internal(format!(
                "Render task panicked: {}",
                e
            ))))]
        })
}

/// Load the PDF, telling password problems apart from corruption.
fn load<'a>(
    pdfium: &'a Pdfium,
    path: &Path,
    password: Option<&'a str>,
) -> Result<PdfDocument<'a>, OcrBatchError> {
    pdfium
        .load_pdf_from_file(path, password)
        .map_err(|e| load_error(path, password.is_some(), format!("{:?}", e)))
}

fn load_error(path: &Path, password_given: bool, detail: String) -> OcrBatchError {
    let path = path.to_path_buf();
    if detail.contains("Password") || detail.contains("password") {
        if password_given {
            OcrBatchError::WrongPassword { path }
        } else {
            OcrBatchError::PasswordRequired { path }
        }
    } else {
        OcrBatchError::DocumentUnreadable { path, detail }
    }
}

/// Target bitmap width for a page `width_pts` points wide.
fn target_width(width_pts: f32, dpi: u32, max_pixels: u32) -> i32 {
    let px = (width_pts * dpi as f32 / 72.0).round() as i64;
    px.clamp(1, max_pixels.max(1) as i64) as i32
}

fn render_chunk_blocking(
    path: &Path,
    id: &DocumentId,
    settings: &RenderSettings,
    chunk: &[usize],
) -> Vec<Result<PageUnit, SourceError>> {
    let pdfium = Pdfium::default();
    let pdf = match load(&pdfium, path, settings.password.as_deref()) {
        Ok(pdf) => pdf,
        Err(e) => return vec![Err(SourceError::Document(e))],
    };
    let pages = pdf.pages();
    let total = pages.len() as usize;

    chunk
        .iter()
        .map(|&index| {
            let page_err = |detail: String| SourceError::Page { index, detail };
            if index >= total {
                return Err(page_err(format!("out of range (document has {} pages)", total)));
            }
            let page = pages
                .get(index as u16)
                .map_err(|e| page_err(format!("{:?}", e)))?;

            let render_config = PdfRenderConfig::new()
                .set_target_width(target_width(page.width().value, settings.dpi, settings.max_pixels))
                .set_maximum_height(settings.max_pixels as i32);
            let bitmap = page
                .render_with_config(&render_config)
                .map_err(|e| page_err(format!("{:?}", e)))?;
            let image = bitmap.as_image();

            let encoded = encode_within_limit(&image, settings.format, settings.quality, MAX_BASE64_PAYLOAD)
                .map_err(|e| page_err(format!("encode failed: {}", e)))?;
            debug!(
                "Rendered page {} → {}x{} px, {} bytes",
                index + 1,
                encoded.width,
                encoded.height,
                encoded.bytes.len()
            );

            Ok(PageUnit {
                document: id.clone(),
                index,
                payload: encoded.bytes,
                format: encoded.format,
                quality: encoded.quality,
                dpi: settings.dpi,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_width_follows_dpi_and_cap() {
        // US Letter is 612 pt wide.
        assert_eq!(target_width(612.0, 72, 5000), 612);
        assert_eq!(target_width(612.0, 150, 5000), 1275);
        assert_eq!(target_width(612.0, 300, 2000), 2000);
        assert_eq!(target_width(0.0, 150, 2000), 1);
    }

    #[test]
    fn settings_follow_single_page_mode() {
        let config = BatchConfig::builder()
            .chunk_size(8)
            .single_page_mode(true)
            .image_format(ImageFormat::Png)
            .build()
            .unwrap();
        let s = RenderSettings::from_config(&config);
        assert_eq!(s.chunk_size, 1);
        assert_eq!(s.format, ImageFormat::Png);
    }

    #[test]
    fn load_errors_distinguish_password_from_corruption() {
        let path = Path::new("locked.pdf");
        let err = |given, detail: &str| load_error(path, given, detail.to_string());

        assert!(matches!(
            err(false, "PdfiumLibraryInternalError(PasswordError)"),
            OcrBatchError::PasswordRequired { .. }
        ));
        assert!(matches!(
            err(true, "PdfiumLibraryInternalError(PasswordError)"),
            OcrBatchError::WrongPassword { .. }
        ));
        match err(true, "PdfiumLibraryInternalError(FormatError)") {
            OcrBatchError::DocumentUnreadable { detail, .. } => assert!(detail.contains("FormatError")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn page_error_is_one_based() {
        let e = SourceError::Page {
            index: 4,
            detail: "bad stream".into(),
        };
        assert_eq!(e.to_string(), "page 5: bad stream");
    }
}
