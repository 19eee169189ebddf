//! The job engine: documents in, checkpointed Markdown out.
//!
//! ## Per-document lifecycle
//!
//! ```text
//! Pending ──▶ Running ──┬──▶ Completed   every page recorded, output written
//!                       ├──▶ Cancelled   token observed; recorded pages kept
//!                       └──▶ Failed      unreadable PDF, storage error, bad key
//! ```
//!
//! `Running` opens the source, loads the checkpoint, and walks the pages that
//! have no successful record in ascending order: render, OCR, clean, record,
//! report. Nothing is held in memory beyond the current render chunk, so a
//! crash at any point loses at most the page in flight. Re-running a
//! cancelled or failed document picks up from its checkpoint.
//!
//! ## Batches
//!
//! Documents run one after another in submission order. A document that
//! fails on its own (corrupt PDF) does not affect the rest; a credential
//! failure does, because every later call would fail the same way. The
//! remaining documents are then reported as `Pending` with the reason.
//!
//! ## Background use
//!
//! [`JobEngine::spawn`] moves the engine onto its own task and returns an
//! [`EngineHandle`]: send [`JobRequest`]s in, read [`ProgressEvent`]s out,
//! and cancel cooperatively through the shared [`CancellationToken`].

use crate::assemble::Assembler;
use crate::backend::OcrBackend;
use crate::checkpoint::{write_atomic, CheckpointStore};
use crate::config::BatchConfig;
use crate::credential::{Credential, CredentialStore};
use crate::document::{Document, DocumentId};
use crate::error::{OcrBatchError, PageFailure};
use crate::output::{BatchReport, DocumentReport, JobStatus, PageResult};
use crate::pipeline::ocr::{OcrClient, RetryPolicy};
use crate::pipeline::postprocess::clean_markdown;
use crate::pipeline::render::{PageSource, SourceError};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::rate_limit::RateLimiter;
use futures::StreamExt;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Progress of one document, rebuilt from its checkpoint on resume.
#[derive(Debug, Clone)]
pub struct JobState {
    pub document: DocumentId,
    pub completed: BTreeSet<usize>,
    pub failed: BTreeSet<usize>,
    /// Next page index to attempt.
    pub cursor: usize,
    pub status: JobStatus,
}

impl JobState {
    pub fn new(document: DocumentId) -> Self {
        Self {
            document,
            completed: BTreeSet::new(),
            failed: BTreeSet::new(),
            cursor: 0,
            status: JobStatus::Pending,
        }
    }

    /// Rebuild from persisted records.
    pub fn from_records(document: DocumentId, records: &BTreeMap<usize, PageResult>) -> Self {
        let mut state = Self::new(document);
        for (&index, record) in records {
            state.apply(index, record.is_success());
        }
        state
    }

    fn apply(&mut self, index: usize, success: bool) {
        if success {
            self.failed.remove(&index);
            self.completed.insert(index);
        } else if !self.completed.contains(&index) {
            self.failed.insert(index);
        }
    }

    /// Highest page index with a successful record.
    pub fn last_successful(&self) -> Option<usize> {
        self.completed.last().copied()
    }
}

/// A batch of documents for a spawned engine.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub documents: Vec<Document>,
}

/// How `drive` ended without an error.
enum Finish {
    Completed,
    Cancelled,
}

/// Orchestrates page source, OCR client and checkpoint store.
pub struct JobEngine {
    source: Arc<dyn PageSource>,
    client: OcrClient,
    store: CheckpointStore,
    assembler: Assembler,
    credentials: Arc<dyn CredentialStore>,
    keep_checkpoints: bool,
}

impl JobEngine {
    /// Wire up an engine from `config`. The engine owns its rate limiter.
    pub fn new(
        config: &BatchConfig,
        source: Arc<dyn PageSource>,
        backend: Arc<dyn OcrBackend>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::new(config.rate_limit()));
        let client = OcrClient::new(
            backend,
            limiter,
            RetryPolicy::from_config(config),
            Duration::from_secs(config.api_timeout_secs),
        );
        Self::with_client(config, source, client, credentials)
    }

    /// Like [`JobEngine::new`], around a prebuilt client (custom retry policy
    /// or a limiter shared with other engines).
    pub fn with_client(
        config: &BatchConfig,
        source: Arc<dyn PageSource>,
        client: OcrClient,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        Self {
            source,
            client,
            store: CheckpointStore::new(config.checkpoint_root()),
            assembler: Assembler::new(config.page_separator.clone()),
            credentials,
            keep_checkpoints: config.keep_checkpoints,
        }
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    pub fn client(&self) -> &OcrClient {
        &self.client
    }

    /// Run every document in order.
    pub async fn run_batch(
        &self,
        mut documents: Vec<Document>,
        cancel: &CancellationToken,
        progress: &ProgressSink,
    ) -> BatchReport {
        let mut batch = BatchReport::default();

        for doc in documents.iter_mut() {
            let skip_reason = match (&batch.halted, cancel.is_cancelled()) {
                (Some(reason), _) => Some(format!("batch halted: {}", reason)),
                (None, true) => Some("batch cancelled before this document started".to_string()),
                (None, false) => None,
            };
            if let Some(reason) = skip_reason {
                let report = DocumentReport::pending(doc.id.to_string(), doc.source.clone(), Some(reason));
                progress.emit(ProgressEvent::DocumentFinished(report.clone()));
                batch.documents.push(report);
                continue;
            }

            let report = self.run_document(doc, cancel, progress).await;
            if report.batch_halted {
                let reason = report.error.clone().unwrap_or_else(|| "fatal error".into());
                error!("Stopping batch: {}", reason);
                batch.halted = Some(reason);
            }
            batch.documents.push(report);
        }

        info!(
            "Batch finished: {} completed, {} failed, {} cancelled, {} pending",
            batch.count(JobStatus::Completed),
            batch.count(JobStatus::Failed),
            batch.count(JobStatus::Cancelled),
            batch.count(JobStatus::Pending),
        );
        progress.emit(ProgressEvent::BatchFinished(batch.clone()));
        batch
    }

    /// Convert one document, resuming from its checkpoint.
    pub async fn run_document(
        &self,
        doc: &mut Document,
        cancel: &CancellationToken,
        progress: &ProgressSink,
    ) -> DocumentReport {
        let started = Instant::now();
        let mut state = JobState::new(doc.id.clone());
        let mut report = DocumentReport::pending(doc.id.to_string(), doc.source.clone(), None);

        state.status = JobStatus::Running;
        info!("Converting {}", doc.source.display());

        match self.drive(doc, &mut state, &mut report, cancel, progress).await {
            Ok(Finish::Completed) => {
                state.status = JobStatus::Completed;
                report.output = Some(doc.output_path.clone());
                if report.failed_pages.is_empty() {
                    info!("Completed {} → {}", doc.id, doc.output_path.display());
                } else {
                    warn!(
                        "Completed {} with {} failed page(s): {:?}",
                        doc.id,
                        report.failed_pages.len(),
                        report.failed_pages
                    );
                }
            }
            Ok(Finish::Cancelled) => {
                state.status = JobStatus::Cancelled;
                info!(
                    "Cancelled {} at page {} ({} page(s) kept)",
                    doc.id,
                    state.cursor + 1,
                    state.completed.len()
                );
            }
            Err(e) => {
                state.status = JobStatus::Failed;
                error!("Failed {}: {}", doc.id, e);
                report.batch_halted = e.halts_batch();
                report.error = Some(e.to_string());
            }
        }

        report.status = state.status;
        report.completed_pages = state.completed.len();
        if report.status != JobStatus::Completed {
            report.failed_pages = state.failed.iter().map(|i| i + 1).collect();
        }
        report.last_successful_page = state.last_successful();
        report.duration_ms = started.elapsed().as_millis() as u64;

        progress.emit(ProgressEvent::DocumentFinished(report.clone()));
        report
    }

    async fn drive(
        &self,
        doc: &mut Document,
        state: &mut JobState,
        report: &mut DocumentReport,
        cancel: &CancellationToken,
        progress: &ProgressSink,
    ) -> Result<Finish, OcrBatchError> {
        if cancel.is_cancelled() {
            return Ok(Finish::Cancelled);
        }

        let credential = if self.client.requires_credential() {
            self.credentials.require()?
        } else {
            Credential::new("")
        };

        let total = self.source.open(doc).await?;
        doc.page_count = Some(total);
        report.total_pages = Some(total);

        self.store.prepare(doc, total).await?;
        let records = self.store.completed(&doc.id).await?;
        *state = JobState {
            status: JobStatus::Running,
            ..JobState::from_records(doc.id.clone(), &records)
        };
        report.resumed_from = state.completed.len();

        let pending: Vec<usize> = self.store.pending(&doc.id, total).await?.into_iter().collect();
        state.cursor = pending.first().copied().unwrap_or(total);
        if report.resumed_from > 0 && !pending.is_empty() {
            info!(
                "Resuming {} from page {} ({} of {} already done)",
                doc.id,
                state.cursor + 1,
                report.resumed_from,
                total
            );
        }

        progress.emit(ProgressEvent::DocumentStarted {
            document: doc.id.to_string(),
            total_pages: total,
            already_completed: state.completed.len(),
        });

        let mut pages = self.source.pages(doc, pending);
        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(Finish::Cancelled),
                item = pages.next() => item,
            };
            let Some(item) = item else { break };

            let result = match item {
                Ok(unit) => {
                    state.cursor = unit.index;
                    let mut result = self.client.submit(&unit, &credential, cancel).await;
                    if result.is_cancelled() {
                        return Ok(Finish::Cancelled);
                    }
                    if let Some(PageFailure::Fatal { detail }) = &result.failure {
                        return Err(OcrBatchError::CredentialInvalid {
                            detail: detail.clone(),
                        });
                    }
                    if result.is_success() {
                        result.markdown = clean_markdown(&result.markdown);
                    }
                    result
                }
                Err(SourceError::Document(e)) => return Err(e),
                Err(SourceError::Page { index, detail }) => {
                    warn!("Page {}: could not render — {}", index + 1, detail);
                    state.cursor = index;
                    PageResult::failed(
                        index,
                        PageFailure::Permanent {
                            detail: format!("render failed: {}", detail),
                        },
                        0,
                    )
                }
            };

            self.store.record(&doc.id, &result).await?;
            state.apply(result.page_index, result.is_success());
            state.cursor = result.page_index + 1;

            match &result.failure {
                None => {
                    debug!("Page {}/{} recorded", result.page_num(), total);
                    progress.emit(ProgressEvent::PageCompleted {
                        document: doc.id.to_string(),
                        page: result.page_num(),
                        completed: state.completed.len(),
                        total_pages: total,
                    });
                }
                Some(failure) => progress.emit(ProgressEvent::PageFailed {
                    document: doc.id.to_string(),
                    page: result.page_num(),
                    total_pages: total,
                    reason: failure.to_string(),
                }),
            }
        }

        let assembled = self.assembler.assemble(&self.store, &doc.id, total).await?;
        write_output(&doc.output_path, assembled.markdown).await?;
        report.failed_pages = assembled.failed_pages;

        if report.failed_pages.is_empty() && !self.keep_checkpoints {
            self.store.discard(&doc.id).await?;
        } else {
            debug!(
                "Keeping checkpoints for {} in {}",
                doc.id,
                self.store.document_dir(&doc.id).display()
            );
        }
        Ok(Finish::Completed)
    }

    /// Move the engine onto a background task.
    pub fn spawn(self) -> EngineHandle {
        let (req_tx, mut req_rx) = mpsc::channel::<JobRequest>(16);
        let (sink, events) = ProgressSink::channel();
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            while let Some(request) = req_rx.recv().await {
                self.run_batch(request.documents, &token, &sink).await;
            }
            debug!("Engine request channel closed");
        });

        EngineHandle {
            requests: req_tx,
            events,
            cancel,
            task,
        }
    }
}

async fn write_output(path: &Path, markdown: String) -> Result<(), OcrBatchError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| OcrBatchError::OutputWriteFailed {
                path: path.clone(),
                source,
            })?;
        }
        write_atomic(&path, markdown.as_bytes())
            .map_err(|source| OcrBatchError::OutputWriteFailed { path, source })
    })
    .await
    .map_err(|e| OcrBatchError::Internal(format!("Output task panicked: {}", e)))?
}

/// Controls a spawned [`JobEngine`].
///
/// Cancellation is sticky: once cancelled, later requests finish immediately
/// with their documents reported as pending. Start a new engine to resume.
pub struct EngineHandle {
    requests: mpsc::Sender<JobRequest>,
    events: mpsc::UnboundedReceiver<ProgressEvent>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl EngineHandle {
    /// Queue a batch.
    pub async fn submit(&self, request: JobRequest) -> Result<(), OcrBatchError> {
        self.requests
            .send(request)
            .await
            .map_err(|_| OcrBatchError::Internal("engine task has stopped".into()))
    }

    /// Next progress event; `None` once the engine has shut down.
    pub async fn next_event(&mut self) -> Option<ProgressEvent> {
        self.events.recv().await
    }

    /// Ask the engine to stop after the current page attempt.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token shared with the engine, e.g. for a Ctrl-C handler.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop accepting requests and wait for queued work to finish.
    pub async fn shutdown(self) -> Result<(), OcrBatchError> {
        let EngineHandle { requests, task, .. } = self;
        drop(requests);
        task.await
            .map_err(|e| OcrBatchError::Internal(format!("Engine task panicked: {}", e)))
    }
}
