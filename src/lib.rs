pub mod cancel;
pub mod config;
pub mod container;
pub mod disc;
pub mod download;
pub mod entry;
pub mod events;
pub mod notifier;
pub mod path_index;
pub mod pipeline;
pub mod section;
pub mod selection;
pub mod sink;
pub mod summary;
pub mod walker;

// Re-exports for easy access
pub use cancel::CancellationToken;
pub use config::ExtractConfig;
pub use container::{AutoDecoder, Container, ContainerDecoder, EmbeddedImage};
pub use disc::{open_disc, HostDirectory, Iso9660Image, UdfImage};
pub use download::{DownloadConfig, DownloadRequest, WindowsDownloader};
pub use entry::{EntryHandle, Filesystem, ImageEntry};
pub use events::{ExtractionEvent, ExtractionObserver};
pub use notifier::Notifier;
pub use pipeline::{ExtractionPipeline, RunOutcome};
pub use selection::{ExtensionFilter, SelectionPredicate};
pub use sink::{ExtractionResult, ExtractionSink, FailureStage};
pub use summary::RunSummary;
pub use walker::TreeWalker;
