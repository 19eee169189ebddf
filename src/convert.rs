//! Library entry points: paths in, batch report out.
//!
//! [`convert_batch`] is the one-call API used by the `ocrbatch` binary. It
//! expands the inputs, picks the OCR backend named in the config, and runs
//! every document through a [`JobEngine`]. Embedders that need to queue work
//! over time should build the engine themselves with [`build_engine`] and
//! call [`JobEngine::spawn`].

use crate::backend::{MistralOcrBackend, OcrBackend, VisionLlmBackend};
use crate::config::{BackendKind, BatchConfig};
use crate::credential::CredentialStore;
use crate::document::Document;
use crate::engine::JobEngine;
use crate::error::OcrBatchError;
use crate::output::BatchReport;
use crate::pipeline::input;
use crate::pipeline::render::{PdfiumPageSource, RenderSettings};
use crate::progress::ProgressSink;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Convert every PDF among `inputs` (files or folders) to Markdown.
///
/// Returns `Err` only when the batch cannot start: no PDFs found, a bad
/// input path, or a backend that cannot be configured. Per-document and
/// per-page outcomes, including credential failures, are in the report.
pub async fn convert_batch(
    inputs: &[PathBuf],
    config: &BatchConfig,
    credentials: Arc<dyn CredentialStore>,
    cancel: &CancellationToken,
    progress: &ProgressSink,
) -> Result<BatchReport, OcrBatchError> {
    let paths = input::collect_inputs(inputs)?;
    info!("Found {} PDF(s) to convert", paths.len());

    let documents = documents_for(paths, config)?;
    let engine = build_engine(config, credentials)?;
    Ok(engine.run_batch(documents, cancel, progress).await)
}

/// One [`Document`] per path, writing to `config.output_dir`.
///
/// Fails with [`OcrBatchError::InvalidConfig`] when two inputs share a file
/// stem, since both would write the same `<stem>.md`.
pub fn documents_for(
    paths: Vec<PathBuf>,
    config: &BatchConfig,
) -> Result<Vec<Document>, OcrBatchError> {
    let mut seen: HashMap<PathBuf, PathBuf> = HashMap::new();
    let mut documents = Vec::with_capacity(paths.len());
    for path in paths {
        let doc = Document::new(path, &config.output_dir);
        if let Some(first) = seen.insert(doc.output_path.clone(), doc.source.clone()) {
            return Err(OcrBatchError::InvalidConfig(format!(
                "'{}' and '{}' would both be written to '{}'; rename one or convert them separately",
                first.display(),
                doc.source.display(),
                doc.output_path.display()
            )));
        }
        documents.push(doc);
    }
    Ok(documents)
}

/// A pdfium-backed engine using the backend selected by `config.backend`.
pub fn build_engine(
    config: &BatchConfig,
    credentials: Arc<dyn CredentialStore>,
) -> Result<JobEngine, OcrBatchError> {
    let source = Arc::new(PdfiumPageSource::new(RenderSettings::from_config(config)));
    let backend = build_backend(config)?;
    info!("OCR backend: {} ({})", backend.name(), config.model_or_default());
    Ok(JobEngine::new(config, source, backend, credentials))
}

fn build_backend(config: &BatchConfig) -> Result<Arc<dyn OcrBackend>, OcrBatchError> {
    Ok(match config.backend {
        BackendKind::Mistral => Arc::new(MistralOcrBackend::new(
            &config.api_base_url,
            config.model_or_default(),
        )?),
        BackendKind::Vision => Arc::new(VisionLlmBackend::from_config(config)?),
    })
}
