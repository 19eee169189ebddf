//! Progress events emitted by the job engine.
//!
//! The engine publishes [`ProgressEvent`]s on an unbounded channel. Callers
//! drive a terminal progress bar, a UI, or a log from the receiving end
//! without the engine knowing how the host application communicates.
//!
//! # Why a channel instead of callbacks?
//!
//! The engine runs on its own background task. A channel decouples it from
//! the consumer: a slow or dropped receiver never blocks page processing, and
//! events arrive in exactly the order they were produced.

use crate::output::{BatchReport, DocumentReport};
use serde::Serialize;
use tokio::sync::mpsc;

/// One observable step of a batch run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// A document was opened and its checkpoint loaded.
    DocumentStarted {
        document: String,
        total_pages: usize,
        already_completed: usize,
    },
    /// A page was converted and recorded.
    PageCompleted {
        document: String,
        /// 1-based page number.
        page: usize,
        completed: usize,
        total_pages: usize,
    },
    /// A page failed permanently (or exhausted its retries) and was recorded.
    PageFailed {
        document: String,
        page: usize,
        total_pages: usize,
        reason: String,
    },
    /// A document reached a terminal state (or was skipped after a halt).
    DocumentFinished(DocumentReport),
    /// Every document of a request has been handled.
    BatchFinished(BatchReport),
}

/// Sending half used by the engine. Send errors are ignored: a consumer that
/// stops listening must not stall conversion.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl ProgressSink {
    pub fn new(tx: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A sink that discards every event.
    pub fn noop() -> Self {
        Self { tx: None }
    }

    /// Create a connected sink and receiver.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_sink_does_not_panic() {
        let sink = ProgressSink::noop();
        sink.emit(ProgressEvent::BatchFinished(BatchReport::default()));
    }

    #[test]
    fn events_arrive_in_order() {
        let (sink, mut rx) = ProgressSink::channel();
        sink.emit(ProgressEvent::DocumentStarted {
            document: "a".into(),
            total_pages: 2,
            already_completed: 0,
        });
        sink.emit(ProgressEvent::PageCompleted {
            document: "a".into(),
            page: 1,
            completed: 1,
            total_pages: 2,
        });
        assert!(matches!(
            rx.try_recv(),
            Ok(ProgressEvent::DocumentStarted { .. })
        ));
        assert!(matches!(
            rx.try_recv(),
            Ok(ProgressEvent::PageCompleted { page: 1, .. })
        ));
    }

    #[test]
    fn dropped_receiver_is_ignored() {
        let (sink, rx) = ProgressSink::channel();
        drop(rx);
        sink.emit(ProgressEvent::BatchFinished(BatchReport {
            documents: Vec::new(),
            halted: Some("revoked".into()),
        }));
    }

    #[test]
    fn event_serialises_with_tag() {
        let json = serde_json::to_string(&ProgressEvent::PageFailed {
            document: "a".into(),
            page: 3,
            total_pages: 5,
            reason: "payload too large".into(),
        })
        .unwrap();
        assert!(json.contains("\"event\":\"page_failed\""), "got {json}");
    }
}
