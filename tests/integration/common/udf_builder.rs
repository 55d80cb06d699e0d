//! Builds small UDF 1.02 images in memory.
//!
//! Layout: recognition sequence from sector 16 (or after an ISO 9660 bridge),
//! volume descriptor sequence at 240, anchor at 256, one partition from 272.
//! Inside the partition block 0 holds the file set descriptor; every file
//! and directory gets a file entry block followed by its data, split into
//! extents of at most `max_extent` bytes.

use std::collections::BTreeMap;

const SECTOR: usize = 2048;
const VDS_START: usize = 240;
const ANCHOR: usize = 256;
const PARTITION_START: usize = 272;

const CHAR_DIRECTORY: u8 = 0x02;
const CHAR_PARENT: u8 = 0x08;

#[derive(Default)]
struct Dir {
    dirs: BTreeMap<String, Dir>,
    files: BTreeMap<String, usize>,
}

pub struct UdfBuilder {
    volume_id: String,
    files: Vec<(String, Vec<u8>)>,
    max_extent: usize,
    bridge: Option<Vec<u8>>,
}

#[allow(dead_code)]
impl UdfBuilder {
    pub fn new(volume_id: &str) -> Self {
        Self {
            volume_id: volume_id.to_string(),
            files: Vec::new(),
            max_extent: 1 << 29,
            bridge: None,
        }
    }

    pub fn file(mut self, path: &str, content: &[u8]) -> Self {
        self.files.push((path.to_string(), content.to_vec()));
        self
    }

    /// Splits file and directory data into extents of at most `bytes`,
    /// which must be a multiple of the sector size.
    pub fn max_extent(mut self, bytes: usize) -> Self {
        self.max_extent = bytes;
        self
    }

    /// Places an ISO 9660 image in front of the UDF structures. The image
    /// must leave three free sectors after its descriptor terminator.
    pub fn iso_bridge(mut self, iso: Vec<u8>) -> Self {
        self.bridge = Some(iso);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut root = Dir::default();
        for (id, (path, _)) in self.files.iter().enumerate() {
            let mut parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
            let name = parts.pop().expect("file path needs a name");
            let mut dir = &mut root;
            for part in parts {
                dir = dir.dirs.entry(part.to_string()).or_default();
            }
            dir.files.insert(name.to_string(), id);
        }

        let mut blocks: BTreeMap<u32, Vec<u8>> = BTreeMap::new();
        let mut next = 1u32;
        let root_entry = self.layout(&root, None, &mut next, &mut blocks);
        blocks.insert(0, file_set_descriptor(root_entry));

        let mut image = vec![0u8; (PARTITION_START + next as usize) * SECTOR];
        let recognition = match &self.bridge {
            Some(iso) => {
                image[..iso.len()].copy_from_slice(iso);
                (16..)
                    .find(|s| image[s * SECTOR..(s + 1) * SECTOR].iter().all(|b| *b == 0))
                    .expect("bridge leaves a free sector")
            }
            None => 16,
        };
        for (i, id) in [b"BEA01", b"NSR02", b"TEA01"].iter().enumerate() {
            let start = (recognition + i) * SECTOR;
            image[start + 1..start + 6].copy_from_slice(*id);
            image[start + 6] = 1;
        }

        write_sector(&mut image, VDS_START, &partition_descriptor(next));
        write_sector(&mut image, VDS_START + 1, &self.logical_volume_descriptor());
        let mut terminator = vec![0u8; SECTOR];
        finish_tag(&mut terminator, 8, (VDS_START + 2) as u32);
        write_sector(&mut image, VDS_START + 2, &terminator);
        write_sector(&mut image, ANCHOR, &anchor());

        for (lbn, data) in blocks {
            let start = (PARTITION_START + lbn as usize) * SECTOR;
            image[start..start + data.len()].copy_from_slice(&data);
        }
        image
    }

    /// Lays out a directory and its children, returning its file entry block.
    fn layout(
        &self,
        dir: &Dir,
        parent: Option<u32>,
        next: &mut u32,
        blocks: &mut BTreeMap<u32, Vec<u8>>,
    ) -> u32 {
        let entry = *next;
        *next += 1;

        let mut fids = vec![identifier(CHAR_PARENT | CHAR_DIRECTORY, parent.unwrap_or(entry), "")];
        for (name, child) in &dir.dirs {
            let child_entry = self.layout(child, Some(entry), next, blocks);
            fids.push(identifier(CHAR_DIRECTORY, child_entry, name));
        }
        for (name, &id) in &dir.files {
            let content = &self.files[id].1;
            let file_entry_block = *next;
            *next += 1;
            let extents = self.place(content, next, blocks);
            blocks.insert(file_entry_block, file_entry(5, content.len(), &extents));
            fids.push(identifier(0, file_entry_block, name));
        }

        let data = fids.concat();
        let extents = self.place(&data, next, blocks);
        blocks.insert(entry, file_entry(4, data.len(), &extents));
        entry
    }

    fn place(&self, data: &[u8], next: &mut u32, blocks: &mut BTreeMap<u32, Vec<u8>>) -> Vec<(u32, u32)> {
        data.chunks(self.max_extent)
            .map(|chunk| {
                let lbn = *next;
                *next += chunk.len().div_ceil(SECTOR) as u32;
                blocks.insert(lbn, chunk.to_vec());
                (chunk.len() as u32, lbn)
            })
            .collect()
    }

    fn logical_volume_descriptor(&self) -> Vec<u8> {
        let mut lvd = vec![0u8; SECTOR];
        let id = self.volume_id.as_bytes();
        lvd[84] = 8;
        lvd[85..85 + id.len()].copy_from_slice(id);
        lvd[211] = 1 + id.len() as u8;
        lvd[212..216].copy_from_slice(&(SECTOR as u32).to_le_bytes());
        lvd[248..252].copy_from_slice(&(SECTOR as u32).to_le_bytes());
        lvd[264..268].copy_from_slice(&6u32.to_le_bytes());
        lvd[268..272].copy_from_slice(&1u32.to_le_bytes());
        lvd[440] = 1;
        lvd[441] = 6;
        lvd[442..444].copy_from_slice(&1u16.to_le_bytes());
        finish_tag(&mut lvd, 6, (VDS_START + 1) as u32);
        lvd
    }
}

fn write_sector(image: &mut [u8], sector: usize, data: &[u8]) {
    image[sector * SECTOR..sector * SECTOR + data.len()].copy_from_slice(data);
}

/// Fills in the descriptor tag, including its checksum.
fn finish_tag(data: &mut [u8], id: u16, location: u32) {
    data[0..2].copy_from_slice(&id.to_le_bytes());
    data[2..4].copy_from_slice(&2u16.to_le_bytes());
    data[12..16].copy_from_slice(&location.to_le_bytes());
    data[4] = data[..16]
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != 4)
        .fold(0u8, |sum, (_, b)| sum.wrapping_add(*b));
}

fn anchor() -> Vec<u8> {
    let mut avdp = vec![0u8; SECTOR];
    let length = (3 * SECTOR) as u32;
    for offset in [16, 24] {
        avdp[offset..offset + 4].copy_from_slice(&length.to_le_bytes());
        avdp[offset + 4..offset + 8].copy_from_slice(&(VDS_START as u32).to_le_bytes());
    }
    finish_tag(&mut avdp, 2, ANCHOR as u32);
    avdp
}

fn partition_descriptor(blocks: u32) -> Vec<u8> {
    let mut pd = vec![0u8; SECTOR];
    pd[188..192].copy_from_slice(&(PARTITION_START as u32).to_le_bytes());
    pd[192..196].copy_from_slice(&blocks.to_le_bytes());
    finish_tag(&mut pd, 5, VDS_START as u32);
    pd
}

fn file_set_descriptor(root: u32) -> Vec<u8> {
    let mut fsd = vec![0u8; SECTOR];
    fsd[400..404].copy_from_slice(&(SECTOR as u32).to_le_bytes());
    fsd[404..408].copy_from_slice(&root.to_le_bytes());
    finish_tag(&mut fsd, 256, 0);
    fsd
}

fn file_entry(file_type: u8, length: usize, extents: &[(u32, u32)]) -> Vec<u8> {
    let mut fe = vec![0u8; SECTOR];
    fe[20..22].copy_from_slice(&4u16.to_le_bytes());
    fe[27] = file_type;
    fe[48..50].copy_from_slice(&1u16.to_le_bytes());
    fe[56..64].copy_from_slice(&(length as u64).to_le_bytes());
    fe[172..176].copy_from_slice(&((extents.len() * 8) as u32).to_le_bytes());
    for (i, (len, lbn)) in extents.iter().enumerate() {
        let at = 176 + i * 8;
        fe[at..at + 4].copy_from_slice(&len.to_le_bytes());
        fe[at + 4..at + 8].copy_from_slice(&lbn.to_le_bytes());
    }
    finish_tag(&mut fe, 261, 0);
    fe
}

fn identifier(characteristics: u8, icb: u32, name: &str) -> Vec<u8> {
    let encoded: Vec<u8> = if name.is_empty() {
        Vec::new()
    } else if name.is_ascii() {
        std::iter::once(8).chain(name.bytes()).collect()
    } else {
        std::iter::once(16)
            .chain(name.encode_utf16().flat_map(|u| u.to_be_bytes()))
            .collect()
    };

    let mut fid = vec![0u8; (38 + encoded.len()).div_ceil(4) * 4];
    fid[16..18].copy_from_slice(&1u16.to_le_bytes());
    fid[18] = characteristics;
    fid[19] = encoded.len() as u8;
    fid[20..24].copy_from_slice(&(SECTOR as u32).to_le_bytes());
    fid[24..28].copy_from_slice(&icb.to_le_bytes());
    fid[38..38 + encoded.len()].copy_from_slice(&encoded);
    finish_tag(&mut fid, 257, 0);
    fid
}
