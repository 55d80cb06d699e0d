//! ISO 9660 disc images read through any `Read + Seek` source.
//!
//! Volume descriptors are scanned from sector 16. The primary descriptor
//! supplies the root directory; when a Joliet supplementary descriptor is
//! present its tree is used instead, since it carries the long Unicode names.
//! UDF recognition descriptors following the ISO set are noted; `open_disc`
//! reads such discs through [`super::UdfImage`] instead.
//!
//! An entry handle packs the entry's extent location (high 32 bits) and data
//! length (low 32 bits).

use crate::entry::{dedup_siblings, EntryHandle, Filesystem, ImageEntry};
use crate::section::{read_at, SectionReader};
use anyhow::{anyhow, bail, Context, Result};
use std::io::{self, Read, Seek};
use std::sync::Mutex;

pub const SECTOR_SIZE: u64 = 2048;
const VOLUME_DESCRIPTOR_START: u64 = 16;
const MAX_DESCRIPTORS: u64 = 64;
const MAX_DIRECTORY_SIZE: u32 = 64 * 1024 * 1024;

const RECORD_MIN_LENGTH: usize = 34;
const ROOT_RECORD_OFFSET: usize = 156;
const FLAG_DIRECTORY: u8 = 0x02;
const FLAG_NOT_FINAL: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Extent {
    lba: u32,
    len: u32,
}

impl Extent {
    fn handle(self) -> EntryHandle {
        EntryHandle(((self.lba as u64) << 32) | self.len as u64)
    }

    fn from_handle(handle: EntryHandle) -> Self {
        Self {
            lba: (handle.0 >> 32) as u32,
            len: handle.0 as u32,
        }
    }

    fn offset(self) -> u64 {
        self.lba as u64 * SECTOR_SIZE
    }
}

/// Fields of one directory record that the reader cares about.
#[derive(Debug)]
struct DirectoryRecord<'a> {
    length: usize,
    extent: Extent,
    flags: u8,
    identifier: &'a [u8],
}

impl<'a> DirectoryRecord<'a> {
    fn parse(data: &'a [u8]) -> Result<Self> {
        if data.len() < RECORD_MIN_LENGTH {
            bail!("Invalid directory record: {} bytes left", data.len());
        }
        let length = data[0] as usize;
        if length < RECORD_MIN_LENGTH - 1 || length > data.len() {
            bail!("Invalid directory record length: {}", length);
        }
        let id_len = data[32] as usize;
        if 33 + id_len > length {
            bail!("Invalid directory record identifier length: {}", id_len);
        }

        Ok(Self {
            length,
            extent: Extent {
                lba: le_u32(&data[2..6]),
                len: le_u32(&data[10..14]),
            },
            flags: data[25],
            identifier: &data[33..33 + id_len],
        })
    }

    fn is_self_or_parent(&self) -> bool {
        self.identifier.len() == 1 && (self.identifier[0] == 0x00 || self.identifier[0] == 0x01)
    }

    fn is_directory(&self) -> bool {
        self.flags & FLAG_DIRECTORY != 0
    }
}

fn le_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Strips the `;1` version suffix and the trailing dot of extension-less names.
fn strip_version(name: &str) -> &str {
    let base = name.split(';').next().unwrap_or(name);
    base.strip_suffix('.').unwrap_or(base)
}

fn decode_identifier(identifier: &[u8], joliet: bool) -> String {
    let name = if joliet {
        let units: Vec<u16> = identifier
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16_lossy(&units)
    } else {
        String::from_utf8_lossy(identifier).into_owned()
    };
    strip_version(name.trim_end()).to_string()
}

fn is_joliet_escape(escape: &[u8]) -> bool {
    [b"%/@", b"%/C", b"%/E"]
        .iter()
        .any(|seq| escape.windows(3).any(|w| w == *seq))
}

pub struct Iso9660Image<R: Read + Seek> {
    source: Mutex<R>,
    root: Extent,
    joliet: bool,
    volume_id: String,
    has_udf: bool,
}

impl<R: Read + Seek> Iso9660Image<R> {
    /// Mounts the image, failing when no primary volume descriptor is found.
    pub fn new(source: R) -> Result<Self> {
        let source = Mutex::new(source);

        let mut primary: Option<(Extent, String)> = None;
        let mut joliet_root: Option<Extent> = None;
        let mut has_udf = false;
        let mut terminated = false;

        for sector in VOLUME_DESCRIPTOR_START..VOLUME_DESCRIPTOR_START + MAX_DESCRIPTORS {
            let buffer = match read_at(&source, sector * SECTOR_SIZE, SECTOR_SIZE as usize) {
                Ok(buffer) => buffer,
                Err(e) if terminated && e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => {
                    return Err(anyhow::Error::new(e)
                        .context(format!("Failed to read volume descriptor {}", sector)))
                }
            };

            match &buffer[1..6] {
                b"CD001" => match buffer[0] {
                    1 if primary.is_none() => {
                        let root = DirectoryRecord::parse(&buffer[ROOT_RECORD_OFFSET..])
                            .context("Invalid root directory record in primary volume descriptor")?;
                        let volume_id = String::from_utf8_lossy(&buffer[40..72])
                            .trim_end()
                            .to_string();
                        primary = Some((root.extent, volume_id));
                    }
                    2 if joliet_root.is_none() && is_joliet_escape(&buffer[88..120]) => {
                        let root = DirectoryRecord::parse(&buffer[ROOT_RECORD_OFFSET..])
                            .context("Invalid root directory record in Joliet descriptor")?;
                        joliet_root = Some(root.extent);
                    }
                    255 => terminated = true,
                    _ => {}
                },
                b"BEA01" | b"NSR02" | b"NSR03" => has_udf = true,
                b"TEA01" => break,
                _ if terminated => break,
                _ => bail!("Invalid volume descriptor signature at sector {}", sector),
            }
        }

        let (primary_root, volume_id) =
            primary.ok_or_else(|| anyhow!("No ISO 9660 primary volume descriptor found"))?;
        let (root, joliet) = match joliet_root {
            Some(root) => (root, true),
            None => (primary_root, false),
        };

        log::debug!(
            "Mounted ISO 9660 volume '{}' (joliet: {}, udf: {})",
            volume_id,
            joliet,
            has_udf
        );

        Ok(Self {
            source,
            root,
            joliet,
            volume_id,
            has_udf,
        })
    }

    pub fn volume_id(&self) -> &str {
        &self.volume_id
    }

    pub fn is_joliet(&self) -> bool {
        self.joliet
    }

    /// Whether a UDF volume recognition sequence follows the ISO descriptors.
    pub fn has_udf(&self) -> bool {
        self.has_udf
    }

    fn read_directory(&self, extent: Extent) -> Result<Vec<ImageEntry>> {
        if extent.len > MAX_DIRECTORY_SIZE {
            bail!("Directory extent of {} bytes is implausibly large", extent.len);
        }
        let data = read_at(&self.source, extent.offset(), extent.len as usize)
            .context("Failed to read directory extent")?;

        let mut entries = Vec::new();
        let mut offset = 0usize;
        while offset < data.len() {
            if data[offset] == 0 {
                // Records never span sectors; the rest of this one is padding.
                offset = (offset / SECTOR_SIZE as usize + 1) * SECTOR_SIZE as usize;
                continue;
            }

            let record = DirectoryRecord::parse(&data[offset..])
                .with_context(|| format!("Bad directory record at byte {}", offset))?;
            offset += record.length;

            if record.is_self_or_parent() {
                continue;
            }

            let name = decode_identifier(record.identifier, self.joliet);
            if record.flags & FLAG_NOT_FINAL != 0 {
                log::warn!("{} spans several extents; only the first is read", name);
            }

            entries.push(if record.is_directory() {
                ImageEntry::dir(name, record.extent.handle())
            } else {
                ImageEntry::file(name, Some(record.extent.len as u64), record.extent.handle())
            });
        }

        Ok(dedup_siblings(entries))
    }
}

impl<R: Read + Seek> Filesystem for Iso9660Image<R> {
    fn root(&self) -> Result<ImageEntry> {
        Ok(ImageEntry::dir("", self.root.handle()))
    }

    fn list_children(&self, dir: &ImageEntry) -> Result<Vec<ImageEntry>> {
        if !dir.is_dir {
            bail!("Not a directory: {}", dir.name);
        }
        self.read_directory(Extent::from_handle(dir.handle))
    }

    fn open_content(&self, file: &ImageEntry) -> Result<Box<dyn Read + '_>> {
        if file.is_dir {
            bail!("Cannot open directory {} as a file", file.name);
        }
        let extent = Extent::from_handle(file.handle);
        Ok(Box::new(SectionReader::new(
            &self.source,
            extent.offset(),
            extent.len as u64,
        )))
    }
}
