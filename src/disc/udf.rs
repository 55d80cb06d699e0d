//! UDF (ECMA-167) disc images read through any `Read + Seek` source.
//!
//! Mounting follows the descriptor chain: the anchor volume descriptor
//! pointer at sector 256 (or the last sector) locates the volume descriptor
//! sequence, whose partition and logical volume descriptors locate the file
//! set descriptor, which holds the root directory's ICB. Directories are
//! streams of file identifier descriptors pointing at file entries.
//!
//! Only type 1 partition maps are supported, which covers the UDF 1.02 to
//! 2.01 volumes found on installation media. An entry handle packs the
//! partition reference (bits 32 to 47) and the logical block of the entry's
//! ICB (low 32 bits).

use crate::entry::{dedup_siblings, EntryHandle, Filesystem, ImageEntry};
use crate::section::{read_at, SectionReader};
use anyhow::{anyhow, bail, Context, Result};
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Mutex;

pub const SECTOR_SIZE: u64 = 2048;
const RECOGNITION_START: u64 = 16;
const RECOGNITION_LIMIT: u64 = 64;
const ANCHOR_SECTOR: u64 = 256;
const MAX_SEQUENCE_DESCRIPTORS: u64 = 256;
const MAX_DIRECTORY_SIZE: u64 = 64 * 1024 * 1024;
const MAX_ALLOCATION_CHAIN: usize = 1024;

const TAG_ANCHOR: u16 = 2;
const TAG_PARTITION: u16 = 5;
const TAG_LOGICAL_VOLUME: u16 = 6;
const TAG_TERMINATING: u16 = 8;
const TAG_FILE_SET: u16 = 256;
const TAG_FILE_IDENTIFIER: u16 = 257;
const TAG_ALLOCATION_EXTENT: u16 = 258;
const TAG_FILE_ENTRY: u16 = 261;
const TAG_EXTENDED_FILE_ENTRY: u16 = 266;

const FILE_TYPE_DIRECTORY: u8 = 4;
const CHAR_DIRECTORY: u8 = 0x02;
const CHAR_DELETED: u8 = 0x04;
const CHAR_PARENT: u8 = 0x08;

/// Whether the volume recognition sequence from sector 16 contains an
/// `NSR02` or `NSR03` descriptor, which marks a UDF volume.
pub fn has_nsr_descriptor<R: Read + Seek>(source: &mut R) -> io::Result<bool> {
    let mut identifier = [0u8; 7];
    for sector in RECOGNITION_START..RECOGNITION_START + RECOGNITION_LIMIT {
        source.seek(SeekFrom::Start(sector * SECTOR_SIZE))?;
        match source.read_exact(&mut identifier) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(false),
            Err(e) => return Err(e),
        }
        match &identifier[1..6] {
            b"NSR02" | b"NSR03" => return Ok(true),
            b"CD001" | b"BEA01" | b"BOOT2" | b"CDW02" => continue,
            _ => return Ok(false),
        }
    }
    Ok(false)
}

fn le_u16(bytes: &[u8]) -> u16 {
    u16::from_le_bytes([bytes[0], bytes[1]])
}

fn le_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut array = [0u8; 8];
    array.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(array)
}

/// Checks the 16-byte descriptor tag and returns its identifier.
fn tag_id(data: &[u8]) -> Result<u16> {
    if data.len() < 16 {
        bail!("Descriptor tag truncated to {} bytes", data.len());
    }
    let checksum = data[..16]
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != 4)
        .fold(0u8, |sum, (_, b)| sum.wrapping_add(*b));
    if checksum != data[4] {
        bail!("Descriptor tag checksum mismatch");
    }
    Ok(le_u16(&data[0..2]))
}

fn expect_tag(data: &[u8], expected: &[u16], what: &str) -> Result<u16> {
    let id = tag_id(data).with_context(|| format!("Invalid {}", what))?;
    if !expected.contains(&id) {
        bail!("Expected {} but found descriptor tag {}", what, id);
    }
    Ok(id)
}

/// Decodes an OSTA compressed Unicode identifier.
fn decode_compressed(data: &[u8]) -> Result<String> {
    let Some((&compression, chars)) = data.split_first() else {
        return Ok(String::new());
    };
    match compression {
        8 | 254 => Ok(chars.iter().map(|&b| b as char).collect()),
        16 | 255 => {
            let units: Vec<u16> = chars
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect();
            Ok(String::from_utf16_lossy(&units))
        }
        other => bail!("Unknown identifier compression {}", other),
    }
}

/// Decodes a fixed-size `dstring`, whose last byte holds the used length.
fn decode_dstring(field: &[u8]) -> String {
    let Some((&used, body)) = field.split_last() else {
        return String::new();
    };
    let used = (used as usize).min(body.len());
    decode_compressed(&body[..used])
        .map(|s| s.trim_end().to_string())
        .unwrap_or_default()
}

/// Location of an ICB: a logical block inside a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlockAddress {
    partition: u16,
    block: u32,
}

impl BlockAddress {
    fn parse(data: &[u8]) -> Self {
        Self {
            block: le_u32(&data[0..4]),
            partition: le_u16(&data[4..6]),
        }
    }

    fn handle(self) -> EntryHandle {
        EntryHandle(((self.partition as u64) << 32) | self.block as u64)
    }

    fn from_handle(handle: EntryHandle) -> Self {
        Self {
            partition: (handle.0 >> 32) as u16,
            block: handle.0 as u32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExtentKind {
    Recorded,
    /// Allocated or unallocated but unrecorded; reads as zeros.
    Sparse,
    /// Points at the next allocation extent descriptor.
    Continuation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AllocationExtent {
    kind: ExtentKind,
    start: BlockAddress,
    len: u32,
}

impl AllocationExtent {
    fn new(raw_len: u32, start: BlockAddress) -> Self {
        let kind = match raw_len >> 30 {
            0 => ExtentKind::Recorded,
            3 => ExtentKind::Continuation,
            _ => ExtentKind::Sparse,
        };
        Self {
            kind,
            start,
            len: raw_len & 0x3FFF_FFFF,
        }
    }
}

/// Allocation descriptor flavours, from the low bits of the ICB flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DescriptorForm {
    Short,
    Long,
    Extended,
    Embedded,
}

impl DescriptorForm {
    fn from_flags(flags: u16) -> Result<Self> {
        match flags & 0x07 {
            0 => Ok(Self::Short),
            1 => Ok(Self::Long),
            2 => Ok(Self::Extended),
            3 => Ok(Self::Embedded),
            other => bail!("Unsupported allocation descriptor type {}", other),
        }
    }

    fn size(self) -> usize {
        match self {
            Self::Short => 8,
            Self::Long => 16,
            Self::Extended => 20,
            Self::Embedded => 0,
        }
    }
}

/// Parses allocation descriptors, stopping at the first zero-length one.
fn parse_allocation_descriptors(
    data: &[u8],
    form: DescriptorForm,
    partition: u16,
) -> Vec<AllocationExtent> {
    let size = form.size();
    if size == 0 {
        return Vec::new();
    }
    data.chunks_exact(size)
        .map(|ad| match form {
            DescriptorForm::Short => AllocationExtent::new(
                le_u32(&ad[0..4]),
                BlockAddress {
                    partition,
                    block: le_u32(&ad[4..8]),
                },
            ),
            DescriptorForm::Long => {
                AllocationExtent::new(le_u32(&ad[0..4]), BlockAddress::parse(&ad[4..10]))
            }
            _ => AllocationExtent::new(le_u32(&ad[0..4]), BlockAddress::parse(&ad[12..18])),
        })
        .take_while(|extent| extent.len > 0)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FileData {
    Embedded(Vec<u8>),
    Extents(Vec<AllocationExtent>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FileEntry {
    is_dir: bool,
    length: u64,
    data: FileData,
}

/// One file identifier descriptor from a directory stream.
#[derive(Debug)]
struct FileIdentifier {
    length: usize,
    characteristics: u8,
    icb: BlockAddress,
    name: String,
}

impl FileIdentifier {
    fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 38 {
            bail!("File identifier truncated to {} bytes", data.len());
        }
        expect_tag(data, &[TAG_FILE_IDENTIFIER], "file identifier descriptor")?;
        let name_len = data[19] as usize;
        let impl_len = le_u16(&data[36..38]) as usize;
        let name_start = 38 + impl_len;
        let length = (name_start + name_len).div_ceil(4) * 4;
        if name_start + name_len > data.len() {
            bail!("File identifier runs past the directory data");
        }
        Ok(Self {
            length: length.min(data.len()),
            characteristics: data[18],
            icb: BlockAddress::parse(&data[24..30]),
            name: decode_compressed(&data[name_start..name_start + name_len])?,
        })
    }

    fn is_listed(&self) -> bool {
        self.characteristics & (CHAR_PARENT | CHAR_DELETED) == 0 && !self.name.is_empty()
    }

    fn is_directory(&self) -> bool {
        self.characteristics & CHAR_DIRECTORY != 0
    }
}

pub struct UdfImage<R: Read + Seek> {
    source: Mutex<R>,
    block_size: u64,
    /// Partition start (in blocks) for each partition reference number.
    partitions: Vec<u64>,
    root: BlockAddress,
    volume_id: String,
}

impl<R: Read + Seek> UdfImage<R> {
    /// Mounts the volume, failing when the descriptor chain is incomplete.
    pub fn new(source: R) -> Result<Self> {
        let source = Mutex::new(source);
        let anchor = read_anchor(&source)?;

        let mut volume = None;
        for (location, length) in [anchor.main, anchor.reserve] {
            match read_volume_sequence(&source, location, length) {
                Ok(found) => {
                    volume = Some(found);
                    break;
                }
                Err(e) => log::debug!("Volume descriptor sequence at {}: {:#}", location, e),
            }
        }
        let volume = volume.ok_or_else(|| anyhow!("No usable UDF volume descriptor sequence"))?;

        let mut image = Self {
            source,
            block_size: volume.block_size,
            partitions: volume.partitions,
            root: volume.file_set,
            volume_id: volume.volume_id,
        };

        let file_set = image
            .read_block(volume.file_set)
            .context("Failed to read file set descriptor")?;
        expect_tag(&file_set, &[TAG_FILE_SET], "file set descriptor")?;
        image.root = BlockAddress::parse(&file_set[404..410]);

        log::debug!(
            "Mounted UDF volume '{}' (block size {}, root at block {})",
            image.volume_id,
            image.block_size,
            image.root.block
        );
        Ok(image)
    }

    pub fn volume_id(&self) -> &str {
        &self.volume_id
    }

    fn block_offset(&self, address: BlockAddress) -> Result<u64> {
        let start = self
            .partitions
            .get(address.partition as usize)
            .ok_or_else(|| anyhow!("Unknown partition reference {}", address.partition))?;
        Ok((start + address.block as u64) * self.block_size)
    }

    fn read_block(&self, address: BlockAddress) -> Result<Vec<u8>> {
        let offset = self.block_offset(address)?;
        Ok(read_at(&self.source, offset, self.block_size as usize)?)
    }

    fn read_file_entry(&self, address: BlockAddress) -> Result<FileEntry> {
        let block = self
            .read_block(address)
            .with_context(|| format!("Failed to read file entry at block {}", address.block))?;
        let tag = expect_tag(
            &block,
            &[TAG_FILE_ENTRY, TAG_EXTENDED_FILE_ENTRY],
            "file entry",
        )?;

        let file_type = block[27];
        let form = DescriptorForm::from_flags(le_u16(&block[34..36]))?;
        let length = le_u64(&block[56..64]);
        let (ea_len, ad_len, header) = match tag {
            TAG_FILE_ENTRY => (le_u32(&block[168..172]), le_u32(&block[172..176]), 176),
            _ => (le_u32(&block[208..212]), le_u32(&block[212..216]), 216),
        };
        let ad_start = header + ea_len as usize;
        let ad_end = ad_start + ad_len as usize;
        if ad_end > block.len() {
            bail!("Allocation descriptors run past the file entry");
        }
        let descriptors = &block[ad_start..ad_end];

        let data = match form {
            DescriptorForm::Embedded => {
                let embedded = usize::try_from(length)
                    .ok()
                    .filter(|&len| len <= descriptors.len())
                    .ok_or_else(|| anyhow!("Embedded data of {} bytes does not fit", length))?;
                FileData::Embedded(descriptors[..embedded].to_vec())
            }
            _ => FileData::Extents(self.resolve_extents(descriptors, form, address.partition)?),
        };

        Ok(FileEntry {
            is_dir: file_type == FILE_TYPE_DIRECTORY,
            length,
            data,
        })
    }

    /// Follows continuation extents into allocation extent descriptors.
    fn resolve_extents(
        &self,
        descriptors: &[u8],
        form: DescriptorForm,
        partition: u16,
    ) -> Result<Vec<AllocationExtent>> {
        let mut extents = Vec::new();
        let mut pending = parse_allocation_descriptors(descriptors, form, partition);
        for _ in 0..MAX_ALLOCATION_CHAIN {
            let Some(position) = pending
                .iter()
                .position(|e| e.kind == ExtentKind::Continuation)
            else {
                extents.extend(pending);
                return Ok(extents);
            };
            let next = pending[position];
            extents.extend(pending.drain(..position));

            let block = self
                .read_block(next.start)
                .context("Failed to read allocation extent descriptor")?;
            expect_tag(&block, &[TAG_ALLOCATION_EXTENT], "allocation extent descriptor")?;
            let len = (le_u32(&block[20..24]) as usize).min(block.len() - 24);
            pending = parse_allocation_descriptors(&block[24..24 + len], form, partition);
        }
        bail!("Allocation extent chain is too long")
    }

    fn content_reader(&self, entry: &FileEntry) -> Result<Box<dyn Read + '_>> {
        let extents = match &entry.data {
            FileData::Embedded(data) => return Ok(Box::new(io::Cursor::new(data.clone()))),
            FileData::Extents(extents) => extents,
        };

        let mut reader: Box<dyn Read + '_> = Box::new(io::empty());
        for extent in extents {
            let part: Box<dyn Read + '_> = match extent.kind {
                ExtentKind::Recorded => Box::new(SectionReader::new(
                    &self.source,
                    self.block_offset(extent.start)?,
                    extent.len as u64,
                )),
                _ => Box::new(io::repeat(0).take(extent.len as u64)),
            };
            reader = Box::new(reader.chain(part));
        }
        Ok(Box::new(reader.take(entry.length)))
    }

    fn read_directory(&self, address: BlockAddress) -> Result<Vec<ImageEntry>> {
        let entry = self.read_file_entry(address)?;
        if !entry.is_dir {
            bail!("File entry at block {} is not a directory", address.block);
        }
        if entry.length > MAX_DIRECTORY_SIZE {
            bail!("Directory of {} bytes is implausibly large", entry.length);
        }

        let mut data = Vec::with_capacity(entry.length as usize);
        self.content_reader(&entry)?
            .read_to_end(&mut data)
            .context("Failed to read directory data")?;

        let mut entries = Vec::new();
        let mut offset = 0usize;
        while offset < data.len() {
            let fid = FileIdentifier::parse(&data[offset..])
                .with_context(|| format!("Bad file identifier at byte {}", offset))?;
            offset += fid.length;
            if !fid.is_listed() {
                continue;
            }

            entries.push(if fid.is_directory() {
                ImageEntry::dir(fid.name, fid.icb.handle())
            } else {
                // Size is best effort; a broken entry fails when opened.
                let size = self.read_file_entry(fid.icb).ok().map(|fe| fe.length);
                ImageEntry::file(fid.name, size, fid.icb.handle())
            });
        }
        Ok(dedup_siblings(entries))
    }
}

impl<R: Read + Seek> Filesystem for UdfImage<R> {
    fn root(&self) -> Result<ImageEntry> {
        Ok(ImageEntry::dir("", self.root.handle()))
    }

    fn list_children(&self, dir: &ImageEntry) -> Result<Vec<ImageEntry>> {
        if !dir.is_dir {
            bail!("Not a directory: {}", dir.name);
        }
        self.read_directory(BlockAddress::from_handle(dir.handle))
    }

    fn open_content(&self, file: &ImageEntry) -> Result<Box<dyn Read + '_>> {
        let entry = self.read_file_entry(BlockAddress::from_handle(file.handle))?;
        if entry.is_dir {
            bail!("Cannot open directory {} as a file", file.name);
        }
        self.content_reader(&entry)
    }
}

struct Anchor {
    main: (u64, u64),
    reserve: (u64, u64),
}

fn read_anchor<R: Read + Seek>(source: &Mutex<R>) -> Result<Anchor> {
    let mut candidates = vec![ANCHOR_SECTOR];
    {
        let mut guard = source
            .lock()
            .map_err(|_| anyhow!("disc source lock poisoned"))?;
        let end = guard.seek(SeekFrom::End(0))?;
        let last = end / SECTOR_SIZE;
        if last > ANCHOR_SECTOR + 1 {
            candidates.push(last - 1);
        }
    }

    for sector in candidates {
        let Ok(buffer) = read_at(source, sector * SECTOR_SIZE, SECTOR_SIZE as usize) else {
            continue;
        };
        if expect_tag(&buffer, &[TAG_ANCHOR], "anchor volume descriptor").is_ok() {
            return Ok(Anchor {
                main: (le_u32(&buffer[20..24]) as u64, le_u32(&buffer[16..20]) as u64),
                reserve: (le_u32(&buffer[28..32]) as u64, le_u32(&buffer[24..28]) as u64),
            });
        }
    }
    bail!("No UDF anchor volume descriptor found")
}

struct VolumeInfo {
    block_size: u64,
    partitions: Vec<u64>,
    file_set: BlockAddress,
    volume_id: String,
}

fn read_volume_sequence<R: Read + Seek>(
    source: &Mutex<R>,
    location: u64,
    length: u64,
) -> Result<VolumeInfo> {
    let mut partition_starts: Vec<(u16, u64)> = Vec::new();
    let mut logical_volume: Option<Vec<u8>> = None;

    let sectors = length.div_ceil(SECTOR_SIZE).min(MAX_SEQUENCE_DESCRIPTORS);
    for sector in location..location + sectors {
        let buffer = read_at(source, sector * SECTOR_SIZE, SECTOR_SIZE as usize)
            .with_context(|| format!("Failed to read volume descriptor {}", sector))?;
        match tag_id(&buffer) {
            Ok(TAG_PARTITION) => {
                partition_starts.push((le_u16(&buffer[22..24]), le_u32(&buffer[188..192]) as u64));
            }
            Ok(TAG_LOGICAL_VOLUME) if logical_volume.is_none() => logical_volume = Some(buffer),
            Ok(TAG_TERMINATING) | Err(_) => break,
            Ok(_) => {}
        }
    }

    let lvd = logical_volume.ok_or_else(|| anyhow!("No logical volume descriptor"))?;
    let block_size = le_u32(&lvd[212..216]) as u64;
    if block_size != SECTOR_SIZE {
        bail!("Unsupported logical block size {}", block_size);
    }

    let map_count = le_u32(&lvd[268..272]) as usize;
    let mut partitions = Vec::with_capacity(map_count);
    let mut offset = 440usize;
    for _ in 0..map_count {
        let map = lvd
            .get(offset..offset + 6)
            .ok_or_else(|| anyhow!("Partition map table runs past the descriptor"))?;
        if map[0] != 1 || map[1] < 6 {
            bail!("Unsupported partition map type {}", map[0]);
        }
        let number = le_u16(&map[4..6]);
        let start = partition_starts
            .iter()
            .find(|(n, _)| *n == number)
            .map(|(_, start)| *start)
            .ok_or_else(|| anyhow!("No partition descriptor for partition {}", number))?;
        partitions.push(start);
        offset += map[1] as usize;
    }

    Ok(VolumeInfo {
        block_size,
        partitions,
        file_set: BlockAddress::parse(&lvd[252..258]),
        volume_id: decode_dstring(&lvd[84..212]),
    })
}
