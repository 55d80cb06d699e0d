//! The capability every hierarchical format adapter exposes.
//!
//! Both the disc level (ISO 9660, a mounted directory) and the embedded-image
//! level (tar, WIM) are presented to the rest of the crate as a [`Filesystem`]
//! handing out [`ImageEntry`] values. The walker, the selection predicate and
//! the pipeline only ever see this trait.

use anyhow::Result;
use std::io::Read;
use std::path::PathBuf;

/// Decoder-private reference to a node. Only the [`Filesystem`] that produced
/// it knows how to interpret the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryHandle(pub u64);

/// A node in a hierarchical filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageEntry {
    pub name: String,
    pub is_dir: bool,
    /// Content length when the format records one up front.
    pub size: Option<u64>,
    pub handle: EntryHandle,
}

impl ImageEntry {
    pub fn dir(name: impl Into<String>, handle: EntryHandle) -> Self {
        Self {
            name: name.into(),
            is_dir: true,
            size: None,
            handle,
        }
    }

    pub fn file(name: impl Into<String>, size: Option<u64>, handle: EntryHandle) -> Self {
        Self {
            name: name.into(),
            is_dir: false,
            size,
            handle,
        }
    }
}

/// Directory listing and content access over one filesystem tree.
///
/// Implementations report children in the order the underlying format stores
/// them and drop repeated sibling names, keeping the first occurrence.
pub trait Filesystem {
    /// Returns the root directory entry.
    fn root(&self) -> Result<ImageEntry>;

    /// Lists the direct children of a directory entry.
    fn list_children(&self, dir: &ImageEntry) -> Result<Vec<ImageEntry>>;

    /// Opens the content of a file entry as an independent stream.
    fn open_content(&self, file: &ImageEntry) -> Result<Box<dyn Read + '_>>;

    /// Host path of the entry's content, for adapters backed by real files.
    fn local_path(&self, _file: &ImageEntry) -> Option<PathBuf> {
        None
    }
}

impl<F: Filesystem + ?Sized> Filesystem for Box<F> {
    fn root(&self) -> Result<ImageEntry> {
        (**self).root()
    }

    fn list_children(&self, dir: &ImageEntry) -> Result<Vec<ImageEntry>> {
        (**self).list_children(dir)
    }

    fn open_content(&self, file: &ImageEntry) -> Result<Box<dyn Read + '_>> {
        (**self).open_content(file)
    }

    fn local_path(&self, file: &ImageEntry) -> Option<PathBuf> {
        (**self).local_path(file)
    }
}

/// Drops entries whose name already appeared earlier in `entries`.
pub(crate) fn dedup_siblings(entries: Vec<ImageEntry>) -> Vec<ImageEntry> {
    let mut seen = std::collections::HashSet::new();
    entries
        .into_iter()
        .filter(|entry| {
            let fresh = seen.insert(entry.name.clone());
            if !fresh {
                log::debug!("Ignoring duplicate sibling entry: {}", entry.name);
            }
            fresh
        })
        .collect()
}
