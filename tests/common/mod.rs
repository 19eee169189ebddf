//! Scripted page source and OCR backend for engine tests.

#![allow(dead_code)]

use async_trait::async_trait;
use edgequake_ocrbatch::{
    BatchConfig, Credential, Document, DocumentId, ImageFormat, MemoryCredentialStore,
    OcrBackend, OcrBatchError, OcrCallError, PageSource, PageUnit, SourceError,
};
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Page counts per source path. Unknown paths have `default_pages` pages.
#[derive(Default)]
pub struct FakeSource {
    default_pages: usize,
    pages: HashMap<PathBuf, usize>,
    unreadable: HashSet<PathBuf>,
    render_failures: Arc<HashSet<usize>>,
}

impl FakeSource {
    pub fn new(default_pages: usize) -> Self {
        Self {
            default_pages,
            ..Default::default()
        }
    }

    pub fn with_pages(mut self, path: &Path, n: usize) -> Self {
        self.pages.insert(path.to_path_buf(), n);
        self
    }

    pub fn unreadable(mut self, path: &Path) -> Self {
        self.unreadable.insert(path.to_path_buf());
        self
    }

    pub fn failing_render(mut self, index: usize) -> Self {
        Arc::make_mut(&mut self.render_failures).insert(index);
        self
    }
}

#[async_trait]
impl PageSource for FakeSource {
    async fn open(&self, document: &Document) -> Result<usize, OcrBatchError> {
        if self.unreadable.contains(&document.source) {
            return Err(OcrBatchError::DocumentUnreadable {
                path: document.source.clone(),
                detail: "xref table is corrupt".into(),
            });
        }
        Ok(self
            .pages
            .get(&document.source)
            .copied()
            .unwrap_or(self.default_pages))
    }

    fn pages(
        &self,
        document: &Document,
        indices: Vec<usize>,
    ) -> BoxStream<'static, Result<PageUnit, SourceError>> {
        let id = document.id.clone();
        let failures = Arc::clone(&self.render_failures);
        stream::iter(indices)
            .map(move |index| {
                if failures.contains(&index) {
                    Err(SourceError::Page {
                        index,
                        detail: "bitmap allocation failed".into(),
                    })
                } else {
                    Ok(unit(&id, index))
                }
            })
            .boxed()
    }
}

pub fn unit(id: &DocumentId, index: usize) -> PageUnit {
    PageUnit {
        document: id.clone(),
        index,
        payload: vec![index as u8; 16],
        format: ImageFormat::Jpeg,
        quality: 85,
        dpi: 150,
    }
}

/// Markdown the fake backend returns for a page.
pub fn page_text(index: usize) -> String {
    format!("# Page {}\n\nBody of page {}.", index + 1, index + 1)
}

/// Scripted backend. Pages without a script succeed with [`page_text`].
#[derive(Default)]
pub struct FakeBackend {
    scripts: Mutex<HashMap<usize, VecDeque<Result<String, OcrCallError>>>>,
    always: Mutex<HashMap<usize, OcrCallError>>,
    calls: Mutex<Vec<(DocumentId, usize)>>,
    keys: Mutex<Vec<String>>,
    cancel_on: Option<(usize, CancellationToken)>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return `responses` in order for `index`, then fall back to success.
    pub fn script(self, index: usize, responses: Vec<Result<String, OcrCallError>>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(index, responses.into_iter().collect());
        self
    }

    /// Fail every call for `index` with `err`.
    pub fn always(self, index: usize, err: OcrCallError) -> Self {
        self.always.lock().unwrap().insert(index, err);
        self
    }

    /// Cancel `token` when `index` is submitted, then never answer.
    pub fn cancel_on(mut self, index: usize, token: CancellationToken) -> Self {
        self.cancel_on = Some((index, token));
        self
    }

    /// Every `(document, index)` submitted, in call order.
    pub fn calls(&self) -> Vec<(DocumentId, usize)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn indices(&self) -> Vec<usize> {
        self.calls().into_iter().map(|(_, i)| i).collect()
    }

    pub fn calls_for(&self, index: usize) -> usize {
        self.indices().into_iter().filter(|&i| i == index).count()
    }

    pub fn keys_seen(&self) -> Vec<String> {
        self.keys.lock().unwrap().clone()
    }
}

#[async_trait]
impl OcrBackend for FakeBackend {
    fn name(&self) -> &str {
        "fake"
    }

    async fn recognize(
        &self,
        unit: &PageUnit,
        credential: &Credential,
    ) -> Result<String, OcrCallError> {
        self.calls
            .lock()
            .unwrap()
            .push((unit.document.clone(), unit.index));
        self.keys.lock().unwrap().push(credential.expose().to_string());

        if let Some((index, token)) = &self.cancel_on {
            if *index == unit.index {
                token.cancel();
                futures::future::pending::<()>().await;
            }
        }
        if let Some(err) = self.always.lock().unwrap().get(&unit.index) {
            return Err(err.clone());
        }
        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&unit.index)
            .and_then(VecDeque::pop_front);
        scripted.unwrap_or_else(|| Ok(page_text(unit.index)))
    }
}

/// A scratch workspace with input, output and checkpoint folders.
pub struct Workspace {
    pub dir: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("in")).unwrap();
        Self { dir }
    }

    /// Create a small placeholder PDF and return a document for it.
    pub fn document(&self, name: &str) -> Document {
        let path = self.dir.path().join("in").join(name);
        std::fs::write(&path, b"%PDF-1.7\n%fake\n").unwrap();
        Document::new(path, &self.out_dir())
    }

    pub fn out_dir(&self) -> PathBuf {
        self.dir.path().join("out")
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.dir.path().join("checkpoints")
    }

    pub fn config(&self) -> BatchConfig {
        BatchConfig::builder()
            .output_dir(self.out_dir())
            .checkpoint_dir(self.checkpoint_dir())
            .build()
            .unwrap()
    }

    pub fn read_output(&self, doc: &Document) -> String {
        std::fs::read_to_string(&doc.output_path).unwrap()
    }
}

pub fn credentials() -> Arc<MemoryCredentialStore> {
    Arc::new(MemoryCredentialStore::with(Credential::new("sk-test")))
}
