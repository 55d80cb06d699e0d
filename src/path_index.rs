//! In-memory directory tree built from a flat list of archive paths.
//!
//! Archives such as tar or a WIM listing report full paths rather than
//! per-directory records. [`PathIndex`] turns such a listing into an arena of
//! nodes with ordered children, creating directories that are only implied by
//! a deeper path. Node ids double as [`EntryHandle`] values.

use crate::entry::{EntryHandle, ImageEntry};
use anyhow::{anyhow, Result};
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone)]
struct Node<T> {
    name: String,
    is_dir: bool,
    size: Option<u64>,
    payload: Option<T>,
    parent: usize,
    children: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct PathIndex<T> {
    nodes: Vec<Node<T>>,
}

impl<T> Default for PathIndex<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PathIndex<T> {
    pub const ROOT: usize = 0;

    pub fn new() -> Self {
        Self {
            nodes: vec![Node {
                name: String::new(),
                is_dir: true,
                size: None,
                payload: None,
                parent: 0,
                children: Vec::new(),
            }],
        }
    }

    /// Adds a path. Missing parent directories are created on the way.
    ///
    /// A path that repeats an existing sibling name is ignored, except that a
    /// directory record fills in the payload of a directory that was only
    /// implied so far. Returns the id of the node now at `path`, if any.
    pub fn insert(
        &mut self,
        path: &Path,
        is_dir: bool,
        size: Option<u64>,
        payload: T,
    ) -> Option<usize> {
        let components = normalize_path(path);
        let (last, parents) = components.split_last()?;

        let mut current = Self::ROOT;
        for name in parents {
            current = match self.child_named(current, name) {
                Some(id) if self.nodes[id].is_dir => id,
                // A file already owns this name; the deeper path is shadowed.
                Some(_) => return None,
                None => self.push_child(current, name, true, None, None),
            };
        }

        match self.child_named(current, last) {
            Some(id) => {
                let node = &mut self.nodes[id];
                if is_dir && node.is_dir && node.payload.is_none() {
                    node.payload = Some(payload);
                } else {
                    log::debug!("Ignoring duplicate archive path: {}", path.display());
                }
                Some(id)
            }
            None => Some(self.push_child(current, last, is_dir, size, Some(payload))),
        }
    }

    pub fn entry(&self, id: usize) -> Option<ImageEntry> {
        self.nodes.get(id).map(|node| ImageEntry {
            name: node.name.clone(),
            is_dir: node.is_dir,
            size: node.size,
            handle: EntryHandle(id as u64),
        })
    }

    pub fn root_entry(&self) -> ImageEntry {
        ImageEntry::dir("", EntryHandle(Self::ROOT as u64))
    }

    pub fn children(&self, dir: &ImageEntry) -> Result<Vec<ImageEntry>> {
        let node = self.node(dir)?;
        if !node.is_dir {
            return Err(anyhow!("Not a directory: {}", dir.name));
        }
        Ok(node
            .children
            .iter()
            .filter_map(|&id| self.entry(id))
            .collect())
    }

    pub fn payload(&self, entry: &ImageEntry) -> Result<Option<&T>> {
        Ok(self.node(entry)?.payload.as_ref())
    }

    /// Full path of a node inside the archive, `/`-separated with a leading `/`.
    pub fn full_path(&self, entry: &ImageEntry) -> Result<String> {
        self.node(entry)?;
        let mut id = entry.handle.0 as usize;
        let mut segments = Vec::new();
        while id != Self::ROOT {
            segments.push(self.nodes[id].name.as_str());
            id = self.nodes[id].parent;
        }
        segments.reverse();
        Ok(format!("/{}", segments.join("/")))
    }

    pub fn len(&self) -> usize {
        self.nodes.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn node(&self, entry: &ImageEntry) -> Result<&Node<T>> {
        usize::try_from(entry.handle.0)
            .ok()
            .and_then(|id| self.nodes.get(id))
            .ok_or_else(|| anyhow!("Unknown entry handle for {}", entry.name))
    }

    fn child_named(&self, parent: usize, name: &str) -> Option<usize> {
        self.nodes[parent]
            .children
            .iter()
            .copied()
            .find(|&id| self.nodes[id].name == name)
    }

    fn push_child(
        &mut self,
        parent: usize,
        name: &str,
        is_dir: bool,
        size: Option<u64>,
        payload: Option<T>,
    ) -> usize {
        let id = self.nodes.len();
        self.nodes.push(Node {
            name: name.to_string(),
            is_dir,
            size,
            payload,
            parent,
            children: Vec::new(),
        });
        self.nodes[parent].children.push(id);
        id
    }
}

/// Splits an archive path into safe components: `.` is dropped, `..` pops,
/// and absolute prefixes are ignored so nothing can escape the root.
pub fn normalize_path(p: &Path) -> Vec<String> {
    let mut out = PathBuf::new();

    for comp in p.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(c) => out.push(c),
            Component::RootDir | Component::Prefix(_) => {}
        }
    }

    out.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect()
}
