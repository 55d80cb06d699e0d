//! Tar archives as single-image containers.
//!
//! The archive is indexed once: every regular file remembers where its data
//! starts inside the archive, so entries can later be streamed back with a
//! [`SectionReader`] without re-reading the archive. Gzip-compressed archives
//! are inflated into a temporary file first, since compressed streams cannot be
//! read at random offsets.

use super::{Container, ContainerDecoder, EmbeddedImage};
use crate::entry::{Filesystem, ImageEntry};
use crate::path_index::PathIndex;
use crate::section::SectionReader;
use anyhow::{anyhow, Context, Result};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use std::sync::Mutex;
use tar_rs as tar;
use tempfile::NamedTempFile;

/// Where a regular file's data lives inside the (uncompressed) archive.
#[derive(Debug, Clone, Copy)]
struct DataRange {
    offset: u64,
    len: u64,
}

pub struct TarDecoder;

impl TarDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TarDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerDecoder for TarDecoder {
    fn name(&self) -> &str {
        "tar"
    }

    fn open(&self, path: &Path) -> Result<Box<dyn Container>> {
        Ok(Box::new(TarContainer::open(path)?))
    }
}

pub struct TarContainer {
    source: Mutex<File>,
    index: PathIndex<Option<DataRange>>,
    images: Vec<EmbeddedImage>,
    _inflated: Option<NamedTempFile>,
}

impl TarContainer {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open tar file: {}", path.display()))?;

        let mut buf_reader = BufReader::new(file);
        let mut magic_bytes = [0u8; 2];
        buf_reader
            .read_exact(&mut magic_bytes)
            .context("Failed to read magic bytes from tar file")?;

        let (file, inflated) = if magic_bytes == [0x1f, 0x8b] {
            let inflated = inflate(path)?;
            let file = inflated
                .reopen()
                .context("Failed to reopen inflated tar file")?;
            (file, Some(inflated))
        } else {
            let file = File::open(path)
                .with_context(|| format!("Failed to open tar file: {}", path.display()))?;
            (file, None)
        };

        let (index, file) = build_index(file)?;
        log::debug!("Indexed {} tar entries", index.len());

        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "tar".to_string());

        Ok(Self {
            source: Mutex::new(file),
            index,
            images: vec![EmbeddedImage { index: 1, name }],
            _inflated: inflated,
        })
    }
}

impl Container for TarContainer {
    fn images(&self) -> &[EmbeddedImage] {
        &self.images
    }

    fn open_image(&self, index: usize) -> Result<Box<dyn Filesystem + '_>> {
        if index != 1 {
            return Err(anyhow!("Tar archives hold a single image, no image {}", index));
        }
        Ok(Box::new(TarImage { container: self }))
    }
}

struct TarImage<'a> {
    container: &'a TarContainer,
}

impl Filesystem for TarImage<'_> {
    fn root(&self) -> Result<ImageEntry> {
        Ok(self.container.index.root_entry())
    }

    fn list_children(&self, dir: &ImageEntry) -> Result<Vec<ImageEntry>> {
        self.container.index.children(dir)
    }

    fn open_content(&self, file: &ImageEntry) -> Result<Box<dyn Read + '_>> {
        let range = self
            .container
            .index
            .payload(file)?
            .copied()
            .flatten()
            .ok_or_else(|| anyhow!("No file data recorded for {}", file.name))?;
        Ok(Box::new(SectionReader::new(
            &self.container.source,
            range.offset,
            range.len,
        )))
    }
}

fn inflate(path: &Path) -> Result<NamedTempFile> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open tar file: {}", path.display()))?;
    let mut decoder = GzDecoder::new(BufReader::new(file));
    let mut inflated = NamedTempFile::new().context("Failed to create temporary tar file")?;
    io::copy(&mut decoder, inflated.as_file_mut())
        .with_context(|| format!("Failed to decompress tar file: {}", path.display()))?;
    Ok(inflated)
}

fn build_index(file: File) -> Result<(PathIndex<Option<DataRange>>, File)> {
    let mut index = PathIndex::new();
    let mut archive = tar::Archive::new(file);

    for entry_result in archive.entries()? {
        let entry = entry_result.context("Failed to read tar entry")?;
        let entry_type = entry.header().entry_type();
        let path = entry
            .path()
            .context("Failed to get entry path")?
            .into_owned();

        match entry_type {
            tar::EntryType::Directory => {
                index.insert(&path, true, None, None);
            }
            tar::EntryType::Regular | tar::EntryType::Continuous => {
                let range = DataRange {
                    offset: entry.raw_file_position(),
                    len: entry.size(),
                };
                index.insert(&path, false, Some(range.len), Some(range));
            }
            _ => {
                log::debug!(
                    "Skipping unsupported entry type {:?}: {}",
                    entry_type,
                    path.display()
                );
            }
        }
    }

    Ok((index, archive.into_inner()))
}
