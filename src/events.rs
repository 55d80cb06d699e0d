//! Structured progress events emitted by the extraction pipeline.

use crate::sink::FailureStage;
use std::cell::RefCell;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq)]
pub enum ExtractionEvent {
    ContainerDiscovered {
        name: String,
    },
    ContainerFailed {
        name: String,
        cause: String,
    },
    DirectoryFailed {
        cause: String,
    },
    ImageStarted {
        container: String,
        index: usize,
        count: usize,
        name: String,
    },
    FileExtracted {
        name: String,
        path: PathBuf,
        bytes: u64,
    },
    FileFailed {
        name: String,
        stage: FailureStage,
        cause: String,
    },
    Cancelled,
}

/// Receives pipeline events as they happen.
pub trait ExtractionObserver {
    fn on_event(&self, event: &ExtractionEvent);
}

/// Discards every event.
pub struct NullObserver;

impl ExtractionObserver for NullObserver {
    fn on_event(&self, _event: &ExtractionEvent) {}
}

/// Keeps every event in order; handy for tests and for callers that want to
/// inspect a run afterwards.
#[derive(Default)]
pub struct RecordingObserver {
    events: RefCell<Vec<ExtractionEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ExtractionEvent> {
        self.events.borrow().clone()
    }
}

impl ExtractionObserver for RecordingObserver {
    fn on_event(&self, event: &ExtractionEvent) {
        self.events.borrow_mut().push(event.clone());
    }
}
