//! Container formats found on the disc and the images they embed.
//!
//! A [`ContainerDecoder`] opens a container file that sits on the host
//! filesystem and returns a [`Container`]: an ordered list of
//! [`EmbeddedImage`]s, each of which can be opened as its own
//! [`Filesystem`]. Containers living inside a disc image are first spooled to
//! a temporary file by [`materialize`] unless the disc adapter can hand out a
//! host path directly.
//!
//! [`AutoDecoder`] picks the concrete decoder from the file's magic bytes:
//! tar (plain or gzip) is decoded natively, WIM through `wimlib-imagex`.

pub mod tar;
pub mod wim;

pub use self::tar::TarDecoder;
pub use self::wim::WimlibDecoder;

use crate::entry::{Filesystem, ImageEntry};
use anyhow::{anyhow, Context, Result};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// One independent filesystem tree inside a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddedImage {
    /// Identifier the container uses for this image.
    pub index: usize,
    pub name: String,
}

/// A decoded container.
pub trait Container {
    /// Embedded images in the order the container stores them.
    fn images(&self) -> &[EmbeddedImage];

    /// Opens the image whose [`EmbeddedImage::index`] is `index`.
    fn open_image(&self, index: usize) -> Result<Box<dyn Filesystem + '_>>;
}

/// Turns a container file into a [`Container`].
pub trait ContainerDecoder {
    /// Returns the name of the decoder for log messages.
    fn name(&self) -> &str;

    fn open(&self, path: &Path) -> Result<Box<dyn Container>>;
}

/// Container formats recognised by their leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerFormat {
    Wim,
    Tar,
    GzipTar,
}

const WIM_MAGIC: &[u8; 8] = b"MSWIM\0\0\0";
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const USTAR_OFFSET: usize = 257;

/// Sniffs the container format from the first bytes of a file.
pub fn detect_format(header: &[u8]) -> Option<ContainerFormat> {
    if header.starts_with(WIM_MAGIC) {
        Some(ContainerFormat::Wim)
    } else if header.starts_with(&GZIP_MAGIC) {
        Some(ContainerFormat::GzipTar)
    } else if header.len() >= USTAR_OFFSET + 5
        && &header[USTAR_OFFSET..USTAR_OFFSET + 5] == b"ustar"
    {
        Some(ContainerFormat::Tar)
    } else {
        None
    }
}

fn read_header(path: &Path) -> Result<Vec<u8>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open container file: {}", path.display()))?;
    let mut header = Vec::with_capacity(512);
    file.take(512)
        .read_to_end(&mut header)
        .context("Failed to read magic bytes from container file")?;
    Ok(header)
}

/// Dispatches to the decoder matching the container's magic bytes.
pub struct AutoDecoder {
    tar: TarDecoder,
    wim: Option<WimlibDecoder>,
}

impl AutoDecoder {
    /// Builds the dispatcher. WIM support is enabled only when
    /// `wimlib-imagex` can be executed.
    pub fn new() -> Self {
        let wim = match WimlibDecoder::new() {
            Ok(decoder) => Some(decoder),
            Err(e) => {
                log::debug!("WIM support disabled: {:#}", e);
                None
            }
        };
        Self {
            tar: TarDecoder::new(),
            wim,
        }
    }

    pub fn with_wimlib(wim: Option<WimlibDecoder>) -> Self {
        Self {
            tar: TarDecoder::new(),
            wim,
        }
    }

    pub fn supports_wim(&self) -> bool {
        self.wim.is_some()
    }
}

impl Default for AutoDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerDecoder for AutoDecoder {
    fn name(&self) -> &str {
        "auto"
    }

    fn open(&self, path: &Path) -> Result<Box<dyn Container>> {
        let header = read_header(path)?;
        match detect_format(&header) {
            Some(ContainerFormat::Wim) => match &self.wim {
                Some(wim) => wim.open(path),
                None => Err(anyhow!(
                    "{} is a WIM archive but wimlib-imagex is not available",
                    path.display()
                )),
            },
            Some(ContainerFormat::Tar) | Some(ContainerFormat::GzipTar) => self.tar.open(path),
            None => Err(anyhow!(
                "Unrecognized container format: {}",
                path.display()
            )),
        }
    }
}

/// A container available as a host file for the duration of its processing.
pub struct LocalContainer {
    path: PathBuf,
    spool: Option<NamedTempFile>,
}

impl LocalContainer {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_spooled(&self) -> bool {
        self.spool.is_some()
    }
}

/// Makes a disc entry available as a host file, spooling its content into a
/// temporary file when the disc adapter has no host path for it. The spool
/// file is deleted when the returned value is dropped.
pub fn materialize<F: Filesystem + ?Sized>(fs: &F, entry: &ImageEntry) -> Result<LocalContainer> {
    if let Some(path) = fs.local_path(entry) {
        return Ok(LocalContainer { path, spool: None });
    }

    let suffix = Path::new(&entry.name)
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();
    let mut spool = tempfile::Builder::new()
        .prefix("winfonts-")
        .suffix(&suffix)
        .tempfile()
        .context("Failed to create temporary container file")?;

    log::debug!(
        "Spooling {} to {}",
        entry.name,
        spool.path().display()
    );
    let mut content = fs
        .open_content(entry)
        .with_context(|| format!("Failed to open container {}", entry.name))?;
    let copied = io::copy(&mut content, spool.as_file_mut())
        .with_context(|| format!("Failed to copy container {} out of the disc image", entry.name))?;
    log::debug!("Spooled {} bytes", copied);

    Ok(LocalContainer {
        path: spool.path().to_path_buf(),
        spool: Some(spool),
    })
}
