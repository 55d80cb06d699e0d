use crate::selection::ExtensionFilter;
use crate::sink::DEFAULT_BUFFER_SIZE;
use std::path::PathBuf;

/// Container files looked for on the disc unless told otherwise.
pub const DEFAULT_CONTAINER_SUFFIX: &str = ".wim";

/// Files pulled out of embedded images unless told otherwise.
pub const DEFAULT_EXTENSION: &str = ".ttf";

/// Everything the extraction pipeline needs to know about a run.
#[derive(Debug, Clone)]
pub struct ExtractConfig {
    /// Name suffix marking a disc entry as a container candidate.
    pub container_suffix: String,
    /// Extensions of the files to extract from embedded images.
    pub extensions: Vec<String>,
    /// Flat output directory. Must exist before the run starts.
    pub destination: PathBuf,
    /// Copy buffer size for each extracted file.
    pub buffer_size: usize,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            container_suffix: DEFAULT_CONTAINER_SUFFIX.to_string(),
            extensions: vec![DEFAULT_EXTENSION.to_string()],
            destination: PathBuf::from("."),
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl ExtractConfig {
    pub fn new(destination: impl Into<PathBuf>) -> Self {
        Self {
            destination: destination.into(),
            ..Self::default()
        }
    }

    pub fn with_container_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.container_suffix = suffix.into();
        self
    }

    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions = extensions.into_iter().map(Into::into).collect();
        self
    }

    pub fn container_filter(&self) -> ExtensionFilter {
        ExtensionFilter::single(&self.container_suffix)
    }

    pub fn selection_filter(&self) -> ExtensionFilter {
        ExtensionFilter::new(&self.extensions)
    }
}
