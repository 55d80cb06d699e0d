//! Disc image → containers → embedded images → extracted files.
//!
//! [`ExtractionPipeline`] walks the disc root, treats every entry whose name
//! ends with the configured container suffix as a container, decodes it with
//! a [`ContainerDecoder`], walks each embedded image and hands every entry the
//! selection predicate accepts to the [`ExtractionSink`].
//!
//! Failure policy:
//! - the disc root cannot be read → the run fails (`Err`);
//! - a container cannot be spooled or decoded, an embedded image cannot be
//!   opened, or a directory inside it cannot be listed → that container is
//!   abandoned and recorded as a structural failure; the run goes on;
//! - a disc directory cannot be listed → recorded, its siblings are still
//!   walked;
//! - a single file cannot be opened or copied → recorded, the next file is
//!   processed.
//!
//! Containers are handled one at a time and dropped before the next one is
//! opened. Entries are processed in the order the decoders list them, so when
//! two files share a destination name the later one wins.

use crate::cancel::CancellationToken;
use crate::config::ExtractConfig;
use crate::container::{materialize, ContainerDecoder};
use crate::entry::{Filesystem, ImageEntry};
use crate::events::{ExtractionEvent, ExtractionObserver};
use crate::selection::{ExtensionFilter, SelectionPredicate};
use crate::sink::{ExtractionResult, ExtractionSink, FailureStage};
use crate::summary::RunSummary;
use crate::walker::TreeWalker;
use anyhow::{Context, Result};
use log::{debug, info, warn};

/// How a run ended when it did not fail outright.
#[derive(Debug)]
pub enum RunOutcome {
    Completed(RunSummary),
    Cancelled(RunSummary),
}

impl RunOutcome {
    pub fn summary(&self) -> &RunSummary {
        match self {
            RunOutcome::Completed(summary) | RunOutcome::Cancelled(summary) => summary,
        }
    }

    pub fn into_summary(self) -> RunSummary {
        match self {
            RunOutcome::Completed(summary) | RunOutcome::Cancelled(summary) => summary,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RunOutcome::Cancelled(_))
    }
}

/// Whether a nested loop ran to the end or stopped on the cancellation signal.
enum Flow {
    Continue,
    Cancelled,
}

pub struct ExtractionPipeline<'a, C: ContainerDecoder + ?Sized> {
    config: ExtractConfig,
    decoder: &'a C,
    observer: &'a dyn ExtractionObserver,
    container_filter: ExtensionFilter,
    predicate: Box<dyn SelectionPredicate + 'a>,
    sink: ExtractionSink,
    cancel: CancellationToken,
}

impl<'a, C: ContainerDecoder + ?Sized> ExtractionPipeline<'a, C> {
    pub fn new(config: ExtractConfig, decoder: &'a C, observer: &'a dyn ExtractionObserver) -> Self {
        let container_filter = config.container_filter();
        let predicate = Box::new(config.selection_filter());
        let sink = ExtractionSink::new(config.buffer_size);
        Self {
            config,
            decoder,
            observer,
            container_filter,
            predicate,
            sink,
            cancel: CancellationToken::new(),
        }
    }

    /// Replaces the extension-based selection with a custom predicate.
    pub fn with_predicate(mut self, predicate: impl SelectionPredicate + 'a) -> Self {
        self.predicate = Box::new(predicate);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs the whole extraction over `disc`.
    pub fn run<F: Filesystem + ?Sized>(&self, disc: &F) -> Result<RunOutcome> {
        let mut summary = RunSummary::start();
        info!(
            "Scanning disc image for '{}' containers, extracting {:?} into {}",
            self.config.container_suffix,
            self.config.extensions,
            self.config.destination.display()
        );

        let walker = TreeWalker::from_root(disc).context("Failed to read disc image")?;
        for (position, item) in walker.enumerate() {
            if self.cancel.is_cancelled() {
                return Ok(self.cancelled(summary));
            }

            let entry = match item {
                Ok(entry) => entry,
                Err(e) if position == 0 => {
                    return Err(e.context("Failed to read disc image root"));
                }
                Err(e) => {
                    warn!("Skipping unreadable disc directory: {:#}", e);
                    summary.record_structural("disc", "directory", &e);
                    self.observer.on_event(&ExtractionEvent::DirectoryFailed {
                        cause: format!("{:#}", e),
                    });
                    continue;
                }
            };

            debug!("Disc entry: {} (dir: {})", entry.name, entry.is_dir);
            if !self.container_filter.accept(&entry) {
                continue;
            }

            summary.containers_found += 1;
            info!("Processing container: {}", entry.name);
            self.observer.on_event(&ExtractionEvent::ContainerDiscovered {
                name: entry.name.clone(),
            });

            match self.process_container(disc, &entry, &mut summary) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Cancelled) => return Ok(self.cancelled(summary)),
                Err(e) => {
                    warn!("Failed to extract from {}: {:#}", entry.name, e);
                    summary.containers_failed += 1;
                    summary.record_structural(&entry.name, "container", &e);
                    self.observer.on_event(&ExtractionEvent::ContainerFailed {
                        name: entry.name.clone(),
                        cause: format!("{:#}", e),
                    });
                }
            }
        }

        summary.finish();
        info!(
            "Extraction finished: {} file(s) extracted, {} failed, {} container(s) unreadable",
            summary.files_extracted, summary.files_failed, summary.containers_failed
        );
        Ok(RunOutcome::Completed(summary))
    }

    fn process_container<F: Filesystem + ?Sized>(
        &self,
        disc: &F,
        entry: &ImageEntry,
        summary: &mut RunSummary,
    ) -> Result<Flow> {
        let local = materialize(disc, entry)?;
        debug!(
            "Decoding {} with the {} decoder",
            local.path().display(),
            self.decoder.name()
        );
        let container = self
            .decoder
            .open(local.path())
            .with_context(|| format!("Failed to read container {}", entry.name))?;

        let images = container.images();
        info!("Found {} image(s) in {}", images.len(), entry.name);

        for (position, image) in images.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Ok(Flow::Cancelled);
            }

            info!(
                "Processing image {}/{}: {}",
                position + 1,
                images.len(),
                image.name
            );
            self.observer.on_event(&ExtractionEvent::ImageStarted {
                container: entry.name.clone(),
                index: image.index,
                count: images.len(),
                name: image.name.clone(),
            });

            let fs = container
                .open_image(image.index)
                .with_context(|| format!("Failed to open image {} ({})", image.index, image.name))?;
            let flow = self
                .process_image(fs.as_ref(), summary)
                .with_context(|| format!("Failed to process image {} ({})", image.index, image.name))?;
            summary.images_processed += 1;

            if let Flow::Cancelled = flow {
                return Ok(Flow::Cancelled);
            }
        }

        Ok(Flow::Continue)
    }

    fn process_image(&self, fs: &dyn Filesystem, summary: &mut RunSummary) -> Result<Flow> {
        for item in TreeWalker::from_root(fs)? {
            if self.cancel.is_cancelled() {
                return Ok(Flow::Cancelled);
            }

            let entry = item?;
            if !self.predicate.accept(&entry) {
                continue;
            }

            summary.files_matched += 1;
            let result = self.extract_entry(fs, &entry);
            self.report(&result);
            summary.record_result(&result);
        }
        Ok(Flow::Continue)
    }

    fn extract_entry(&self, fs: &dyn Filesystem, entry: &ImageEntry) -> ExtractionResult {
        debug!("Extracting: {}", entry.name);
        let mut stream = match fs.open_content(entry) {
            Ok(stream) => stream,
            Err(cause) => {
                return ExtractionResult::Failed {
                    name: entry.name.clone(),
                    stage: FailureStage::Open,
                    cause,
                }
            }
        };
        self.sink
            .extract(&mut *stream, &self.config.destination, &entry.name)
    }

    fn report(&self, result: &ExtractionResult) {
        match result {
            ExtractionResult::Extracted { name, path, bytes } => {
                info!("  Extracted {} ({} bytes)", name, bytes);
                self.observer.on_event(&ExtractionEvent::FileExtracted {
                    name: name.clone(),
                    path: path.clone(),
                    bytes: *bytes,
                });
            }
            ExtractionResult::Failed { name, stage, cause } => {
                warn!("Failed to {} {}: {:#}", stage, name, cause);
                self.observer.on_event(&ExtractionEvent::FileFailed {
                    name: name.clone(),
                    stage: *stage,
                    cause: format!("{:#}", cause),
                });
            }
        }
    }

    fn cancelled(&self, mut summary: RunSummary) -> RunOutcome {
        info!("Extraction cancelled after {} file(s)", summary.files_extracted);
        self.observer.on_event(&ExtractionEvent::Cancelled);
        summary.finish();
        RunOutcome::Cancelled(summary)
    }
}
