//! Streams one entry's content into the flat destination directory.

use anyhow::{anyhow, Context};
use serde::Serialize;
use std::fmt;
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

/// Default size of the copy buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Step at which extracting a single entry failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureStage {
    Open,
    Create,
    Copy,
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureStage::Open => write!(f, "open"),
            FailureStage::Create => write!(f, "create"),
            FailureStage::Copy => write!(f, "copy"),
        }
    }
}

/// Outcome of extracting one entry. Failures are values, never panics or
/// early returns for the caller.
#[derive(Debug)]
pub enum ExtractionResult {
    Extracted {
        name: String,
        path: PathBuf,
        bytes: u64,
    },
    Failed {
        name: String,
        stage: FailureStage,
        cause: anyhow::Error,
    },
}

impl ExtractionResult {
    pub fn name(&self) -> &str {
        match self {
            ExtractionResult::Extracted { name, .. } | ExtractionResult::Failed { name, .. } => {
                name
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExtractionResult::Extracted { .. })
    }
}

/// Copies streams to files through a bounded buffer.
#[derive(Debug, Clone)]
pub struct ExtractionSink {
    buffer_size: usize,
}

impl Default for ExtractionSink {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

impl ExtractionSink {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
        }
    }

    /// Creates (or truncates) `destination_dir/destination_name` and copies
    /// `stream` into it. The destination directory must already exist.
    pub fn extract(
        &self,
        stream: &mut dyn Read,
        destination_dir: &Path,
        destination_name: &str,
    ) -> ExtractionResult {
        let name = destination_name.to_string();

        let file_name = match flat_file_name(destination_name) {
            Some(file_name) => file_name,
            None => {
                return ExtractionResult::Failed {
                    name,
                    stage: FailureStage::Create,
                    cause: anyhow!("No usable file name in '{}'", destination_name),
                }
            }
        };
        let path = destination_dir.join(file_name);

        log::debug!("Creating file: {}", path.display());
        let mut out_file = match File::create(&path)
            .with_context(|| format!("Failed to create file: {}", path.display()))
        {
            Ok(file) => file,
            Err(cause) => {
                return ExtractionResult::Failed {
                    name,
                    stage: FailureStage::Create,
                    cause,
                }
            }
        };

        match self.copy(stream, &mut out_file) {
            Ok(bytes) => ExtractionResult::Extracted { name, path, bytes },
            Err(cause) => ExtractionResult::Failed {
                name,
                stage: FailureStage::Copy,
                cause: cause.context(format!("Failed to write file: {}", path.display())),
            },
        }
    }

    fn copy(&self, reader: &mut dyn Read, writer: &mut File) -> anyhow::Result<u64> {
        let mut buf = vec![0u8; self.buffer_size];
        let mut written = 0u64;
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(anyhow::Error::new(e).context("Failed to read entry content")),
            };
            writer.write_all(&buf[..n])?;
            written += n as u64;
        }
        writer.flush()?;
        Ok(written)
    }
}

/// Reduces an entry name to a single path component safe to join onto the
/// destination directory.
fn flat_file_name(name: &str) -> Option<&str> {
    name.rsplit(['/', '\\'])
        .next()
        .filter(|component| !component.is_empty() && *component != "." && *component != "..")
}
