//! Durable per-page checkpoints.
//!
//! Every converted page is written to its own JSON record before the engine
//! moves on, so a crash, a Ctrl-C or a revoked key costs at most the page that
//! was in flight.
//!
//! ## Layout
//!
//! ```text
//! <checkpoint_dir>/
//!   <document-id>/
//!     manifest.json        source path + size, page count, format version
//!     page-000000.json     one CheckpointRecord per page
//!     page-000001.json
//! ```
//!
//! ## Why one file per page?
//!
//! Appending to a single journal needs its own recovery logic for torn tails.
//! A file per page makes each write an independent temp-file + `fsync` +
//! rename, which is atomic on every filesystem we care about: a reader sees
//! either the complete old record or the complete new one. Leftover `*.tmp`
//! files and records that fail to parse are treated as absent, so the page is
//! simply redone.
//!
//! All blocking filesystem work runs inside `spawn_blocking`.

use crate::document::{Document, DocumentId};
use crate::error::OcrBatchError;
use crate::output::PageResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Format version written into every manifest and record.
pub const CHECKPOINT_VERSION: u32 = 1;

const MANIFEST_FILE: &str = "manifest.json";

/// Identifies what a checkpoint directory belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub document: DocumentId,
    pub source: PathBuf,
    pub source_size: u64,
    pub page_count: usize,
    pub created_at: DateTime<Utc>,
}

/// A persisted [`PageResult`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub version: u32,
    /// Always `true` on disk; a record without it is ignored.
    pub complete: bool,
    pub document: DocumentId,
    pub recorded_at: DateTime<Utc>,
    pub result: PageResult,
}

/// What [`CheckpointStore::record`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// A new or replacement record was written.
    Written,
    /// A successful record already exists; nothing changed.
    AlreadyRecorded,
    /// The result is not persistable (cancelled or fatal).
    Ignored,
}

/// Reads and writes checkpoint records under one root directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding one document's records.
    pub fn document_dir(&self, id: &DocumentId) -> PathBuf {
        self.root.join(id.as_str())
    }

    /// Create the document directory and write or validate its manifest.
    ///
    /// A manifest whose page count, source size or version disagree with the
    /// current document means the records belong to a different file; they
    /// are discarded. Returns the number of records that survive.
    pub async fn prepare(&self, document: &Document, page_count: usize) -> Result<usize, OcrBatchError> {
        let dir = self.document_dir(&document.id);
        let id = document.id.clone();
        let source = document.source.clone();
        run_blocking(move || prepare_blocking(&dir, &id, &source, page_count)).await
    }

    /// Indices in `0..page_count` without a successful record.
    pub async fn pending(
        &self,
        id: &DocumentId,
        page_count: usize,
    ) -> Result<BTreeSet<usize>, OcrBatchError> {
        let done = self.completed(id).await?;
        Ok((0..page_count)
            .filter(|i| !done.get(i).is_some_and(PageResult::is_success))
            .collect())
    }

    /// Snapshot of every readable record, keyed by page index.
    pub async fn completed(
        &self,
        id: &DocumentId,
    ) -> Result<BTreeMap<usize, PageResult>, OcrBatchError> {
        let dir = self.document_dir(id);
        let id = id.clone();
        run_blocking(move || read_records(&dir, &id)).await
    }

    /// Persist a page result.
    ///
    /// A success is never overwritten; a failure is replaced by a later
    /// success or by a newer failure. Cancelled and fatal results are ignored.
    pub async fn record(
        &self,
        id: &DocumentId,
        result: &PageResult,
    ) -> Result<RecordOutcome, OcrBatchError> {
        if !result.failure.as_ref().is_none_or(|f| f.is_recordable()) {
            return Ok(RecordOutcome::Ignored);
        }
        let dir = self.document_dir(id);
        let id = id.clone();
        let result = result.clone();
        run_blocking(move || record_blocking(&dir, &id, result)).await
    }

    /// Every record in page order.
    ///
    /// Fails with [`OcrBatchError::IncompleteDocument`] if any index in
    /// `0..page_count` has no record.
    pub async fn assemble_order(
        &self,
        id: &DocumentId,
        page_count: usize,
    ) -> Result<Vec<PageResult>, OcrBatchError> {
        let mut records = self.completed(id).await?;
        let missing: Vec<usize> = (0..page_count).filter(|i| !records.contains_key(i)).collect();
        if !missing.is_empty() {
            return Err(OcrBatchError::IncompleteDocument {
                document: id.to_string(),
                missing,
            });
        }
        Ok((0..page_count).filter_map(|i| records.remove(&i)).collect())
    }

    /// Remove the document's checkpoint directory.
    pub async fn discard(&self, id: &DocumentId) -> Result<(), OcrBatchError> {
        let dir = self.document_dir(id);
        run_blocking(move || match fs::remove_dir_all(&dir) {
            Ok(()) => {
                debug!(dir = %dir.display(), "Discarded checkpoints");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(OcrBatchError::StorageWriteError { path: dir, source }),
        })
        .await
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, OcrBatchError>
where
    F: FnOnce() -> Result<T, OcrBatchError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| OcrBatchError::Internal(format!("Checkpoint task panicked: {}", e)))?
}

fn page_file_name(index: usize) -> String {
    format!("page-{index:06}.json")
}

/// Parse `page-NNNNNN.json`; anything else (including `*.tmp`) is `None`.
fn parse_page_file_name(name: &str) -> Option<usize> {
    let digits = name.strip_prefix("page-")?.strip_suffix(".json")?;
    if digits.len() != 6 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn prepare_blocking(
    dir: &Path,
    id: &DocumentId,
    source: &Path,
    page_count: usize,
) -> Result<usize, OcrBatchError> {
    fs::create_dir_all(dir).map_err(|source| OcrBatchError::StorageWriteError {
        path: dir.to_path_buf(),
        source,
    })?;

    let source_size = fs::metadata(source).map(|m| m.len()).unwrap_or(0);
    let manifest_path = dir.join(MANIFEST_FILE);
    let existing = fs::read(&manifest_path)
        .ok()
        .and_then(|bytes| serde_json::from_slice::<Manifest>(&bytes).ok());

    let matches = existing.as_ref().is_some_and(|m| {
        m.version == CHECKPOINT_VERSION
            && m.page_count == page_count
            && m.source_size == source_size
    });

    if !matches {
        let stale = clear_records(dir)?;
        if stale > 0 || existing.is_some() {
            warn!(
                document = %id,
                stale_records = stale,
                "Checkpoint does not match the current source; starting over"
            );
        }
        let manifest = Manifest {
            version: CHECKPOINT_VERSION,
            document: id.clone(),
            source: source.to_path_buf(),
            source_size,
            page_count,
            created_at: Utc::now(),
        };
        let bytes = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| OcrBatchError::Internal(format!("Manifest serialisation: {}", e)))?;
        write_atomic(&manifest_path, &bytes).map_err(|source| {
            OcrBatchError::StorageWriteError {
                path: manifest_path.clone(),
                source,
            }
        })?;
    }

    Ok(read_records(dir, id)?.len())
}

/// Delete page records and stray temp files. Returns how many records went.
fn clear_records(dir: &Path) -> Result<usize, OcrBatchError> {
    let entries = fs::read_dir(dir).map_err(|source| OcrBatchError::StorageReadError {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        let is_record = parse_page_file_name(&name).is_some();
        if is_record || name.ends_with(".tmp") {
            fs::remove_file(entry.path()).map_err(|source| OcrBatchError::StorageWriteError {
                path: entry.path(),
                source,
            })?;
            if is_record {
                removed += 1;
            }
        }
    }
    Ok(removed)
}

fn read_records(
    dir: &Path,
    id: &DocumentId,
) -> Result<BTreeMap<usize, PageResult>, OcrBatchError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(source) => {
            return Err(OcrBatchError::StorageReadError {
                path: dir.to_path_buf(),
                source,
            })
        }
    };

    let mut records = BTreeMap::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(index) = parse_page_file_name(&name.to_string_lossy()) else {
            continue;
        };
        match read_record(&entry.path()) {
            Some(rec) if rec.complete
                && rec.version == CHECKPOINT_VERSION
                && rec.document == *id
                && rec.result.page_index == index =>
            {
                records.insert(index, rec.result);
            }
            _ => debug!(file = %entry.path().display(), "Ignoring unreadable checkpoint record"),
        }
    }
    Ok(records)
}

fn read_record(path: &Path) -> Option<CheckpointRecord> {
    let bytes = fs::read(path).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn record_blocking(
    dir: &Path,
    id: &DocumentId,
    result: PageResult,
) -> Result<RecordOutcome, OcrBatchError> {
    let path = dir.join(page_file_name(result.page_index));

    if let Some(existing) = read_record(&path) {
        if existing.complete && existing.result.is_success() {
            return Ok(RecordOutcome::AlreadyRecorded);
        }
    }

    let record = CheckpointRecord {
        version: CHECKPOINT_VERSION,
        complete: true,
        document: id.clone(),
        recorded_at: Utc::now(),
        result,
    };
    let bytes = serde_json::to_vec_pretty(&record)
        .map_err(|e| OcrBatchError::Internal(format!("Record serialisation: {}", e)))?;

    fs::create_dir_all(dir).map_err(|source| OcrBatchError::StorageWriteError {
        path: dir.to_path_buf(),
        source,
    })?;
    write_atomic(&path, &bytes).map_err(|source| OcrBatchError::StorageWriteError {
        path: path.clone(),
        source,
    })?;
    debug!(document = %id, page = record.result.page_num(), "Checkpoint recorded");
    Ok(RecordOutcome::Written)
}

/// Crash-atomic replace: temp file in the same directory, `fsync`, rename,
/// then `fsync` the directory so the rename itself is durable.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let prefix = format!(
        ".{}.",
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    );
    let mut tmp = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(".tmp")
        .tempfile_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    sync_dir(dir)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PageFailure;
    use tempfile::TempDir;

    fn setup() -> (TempDir, CheckpointStore, Document) {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("doc.pdf");
        fs::write(&src, b"%PDF-1.7 fake").unwrap();
        let store = CheckpointStore::new(tmp.path().join("ckpt"));
        let doc = Document::new(&src, tmp.path());
        (tmp, store, doc)
    }

    fn failed(i: usize) -> PageResult {
        PageResult::failed(i, PageFailure::Permanent { detail: "413".into() }, 1)
    }

    #[tokio::test]
    async fn fresh_document_has_everything_pending() {
        let (_tmp, store, doc) = setup();
        assert_eq!(store.prepare(&doc, 3).await.unwrap(), 0);
        let pending = store.pending(&doc.id, 3).await.unwrap();
        assert_eq!(pending.into_iter().collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(store.document_dir(&doc.id).join("manifest.json").exists());
    }

    #[tokio::test]
    async fn record_is_idempotent_and_success_is_sticky() {
        let (_tmp, store, doc) = setup();
        store.prepare(&doc, 2).await.unwrap();

        let ok = PageResult::success(0, "page one", 1);
        assert_eq!(store.record(&doc.id, &ok).await.unwrap(), RecordOutcome::Written);
        assert_eq!(
            store.record(&doc.id, &ok).await.unwrap(),
            RecordOutcome::AlreadyRecorded
        );
        assert_eq!(
            store.record(&doc.id, &failed(0)).await.unwrap(),
            RecordOutcome::AlreadyRecorded
        );

        let snapshot = store.completed(&doc.id).await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[&0].markdown, "page one");
    }

    #[tokio::test]
    async fn success_replaces_failure() {
        let (_tmp, store, doc) = setup();
        store.prepare(&doc, 1).await.unwrap();
        store.record(&doc.id, &failed(0)).await.unwrap();
        assert_eq!(store.pending(&doc.id, 1).await.unwrap().len(), 1);

        store
            .record(&doc.id, &PageResult::success(0, "fixed", 2))
            .await
            .unwrap();
        assert!(store.pending(&doc.id, 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancelled_and_fatal_results_are_not_recorded() {
        let (_tmp, store, doc) = setup();
        store.prepare(&doc, 2).await.unwrap();
        let cancelled = PageResult::failed(0, PageFailure::Cancelled, 1);
        let fatal = PageResult::failed(1, PageFailure::Fatal { detail: "401".into() }, 1);
        assert_eq!(store.record(&doc.id, &cancelled).await.unwrap(), RecordOutcome::Ignored);
        assert_eq!(store.record(&doc.id, &fatal).await.unwrap(), RecordOutcome::Ignored);
        assert!(store.completed(&doc.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn assemble_order_is_independent_of_record_order() {
        let (_tmp, store, doc) = setup();
        store.prepare(&doc, 4).await.unwrap();
        for i in [3, 0, 2, 1] {
            store
                .record(&doc.id, &PageResult::success(i, format!("p{i}"), 1))
                .await
                .unwrap();
        }
        let ordered = store.assemble_order(&doc.id, 4).await.unwrap();
        let indices: Vec<_> = ordered.iter().map(|r| r.page_index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn assemble_order_reports_missing_pages() {
        let (_tmp, store, doc) = setup();
        store.prepare(&doc, 3).await.unwrap();
        store
            .record(&doc.id, &PageResult::success(1, "x", 1))
            .await
            .unwrap();
        match store.assemble_order(&doc.id, 3).await {
            Err(OcrBatchError::IncompleteDocument { missing, .. }) => assert_eq!(missing, vec![0, 2]),
            other => panic!("expected IncompleteDocument, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn temp_files_and_garbage_are_ignored() {
        let (_tmp, store, doc) = setup();
        store.prepare(&doc, 3).await.unwrap();
        let dir = store.document_dir(&doc.id);
        fs::write(dir.join(".page-000000.json.abc.tmp"), b"{").unwrap();
        fs::write(dir.join("page-000001.json"), b"{ not json").unwrap();
        fs::write(dir.join("notes.txt"), b"hello").unwrap();

        assert!(store.completed(&doc.id).await.unwrap().is_empty());
        assert_eq!(store.pending(&doc.id, 3).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn page_count_change_discards_stale_records() {
        let (_tmp, store, doc) = setup();
        store.prepare(&doc, 2).await.unwrap();
        store
            .record(&doc.id, &PageResult::success(0, "old", 1))
            .await
            .unwrap();
        assert_eq!(store.prepare(&doc, 2).await.unwrap(), 1);
        assert_eq!(store.prepare(&doc, 5).await.unwrap(), 0);
        assert_eq!(store.pending(&doc.id, 5).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn discard_removes_directory() {
        let (_tmp, store, doc) = setup();
        store.prepare(&doc, 1).await.unwrap();
        store.discard(&doc.id).await.unwrap();
        assert!(!store.document_dir(&doc.id).exists());
        store.discard(&doc.id).await.unwrap();
    }

    #[test]
    fn page_file_names() {
        assert_eq!(page_file_name(7), "page-000007.json");
        assert_eq!(parse_page_file_name("page-000123.json"), Some(123));
        assert_eq!(parse_page_file_name("page-000123.json.tmp"), None);
        assert_eq!(parse_page_file_name("page-12.json"), None);
    }

    #[test]
    fn write_atomic_replaces_contents() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("out.md");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "two");
        let leftovers = fs::read_dir(tmp.path())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .map(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
                    .unwrap_or(false)
            })
            .count();
        assert_eq!(leftovers, 0);
    }
}
