use crate::entry::{EntryHandle, Filesystem, ImageEntry};
use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// A disc tree that already lives on the host filesystem, such as a mounted
/// ISO or an unpacked copy of the media.
///
/// Children are listed sorted by name so repeated runs see the same order.
/// Symbolic links are followed; entries whose metadata cannot be read are
/// skipped.
pub struct HostDirectory {
    handles: Mutex<HandleTable>,
}

/// Paths handed out so far; an entry's handle is its index in `paths`, and a
/// path listed again gets its existing handle back.
#[derive(Default)]
struct HandleTable {
    paths: Vec<PathBuf>,
    ids: HashMap<PathBuf, u64>,
}

impl HandleTable {
    fn handle_for(&mut self, path: PathBuf) -> EntryHandle {
        if let Some(&id) = self.ids.get(&path) {
            return EntryHandle(id);
        }
        let id = self.paths.len() as u64;
        self.ids.insert(path.clone(), id);
        self.paths.push(path);
        EntryHandle(id)
    }
}

impl HostDirectory {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(anyhow!("Path is not a directory: {}", root.display()));
        }
        let mut handles = HandleTable::default();
        handles.handle_for(root.to_path_buf());
        Ok(Self {
            handles: Mutex::new(handles),
        })
    }

    fn path_of(&self, entry: &ImageEntry) -> Result<PathBuf> {
        let handles = self
            .handles
            .lock()
            .map_err(|_| anyhow!("host directory state poisoned"))?;
        usize::try_from(entry.handle.0)
            .ok()
            .and_then(|id| handles.paths.get(id))
            .cloned()
            .ok_or_else(|| anyhow!("Unknown entry handle for {}", entry.name))
    }
}

impl Filesystem for HostDirectory {
    fn root(&self) -> Result<ImageEntry> {
        Ok(ImageEntry::dir("", EntryHandle(0)))
    }

    fn list_children(&self, dir: &ImageEntry) -> Result<Vec<ImageEntry>> {
        let dir_path = self.path_of(dir)?;
        let mut children: Vec<(String, PathBuf)> = fs::read_dir(&dir_path)
            .with_context(|| format!("Failed to read directory: {}", dir_path.display()))?
            .map(|entry| {
                entry.map(|entry| (entry.file_name().to_string_lossy().into_owned(), entry.path()))
            })
            .collect::<std::io::Result<_>>()
            .with_context(|| format!("Failed to read directory: {}", dir_path.display()))?;
        children.sort_by(|a, b| a.0.cmp(&b.0));

        let mut handles = self
            .handles
            .lock()
            .map_err(|_| anyhow!("host directory state poisoned"))?;
        let mut entries = Vec::with_capacity(children.len());
        for (name, path) in children {
            let metadata = match fs::metadata(&path) {
                Ok(metadata) => metadata,
                Err(e) => {
                    log::debug!("Skipping {}: {}", path.display(), e);
                    continue;
                }
            };
            let handle = handles.handle_for(path);
            entries.push(if metadata.is_dir() {
                ImageEntry::dir(name, handle)
            } else {
                ImageEntry::file(name, Some(metadata.len()), handle)
            });
        }
        Ok(entries)
    }

    fn open_content(&self, file: &ImageEntry) -> Result<Box<dyn Read + '_>> {
        let path = self.path_of(file)?;
        let file = File::open(&path)
            .with_context(|| format!("Failed to open file: {}", path.display()))?;
        Ok(Box::new(file))
    }

    fn local_path(&self, file: &ImageEntry) -> Option<PathBuf> {
        self.path_of(file).ok()
    }
}
