//! Lazy depth-first traversal over any [`Filesystem`].
//!
//! [`TreeWalker`] yields every descendant of a root entry in pre-order: a
//! directory comes out before its children, and directories are yielded
//! themselves so callers filter with [`ImageEntry::is_dir`]. The root itself is
//! not yielded.
//!
//! Listing is deferred: a directory's children are requested from the
//! filesystem only when the consumer pulls the item after it. Stopping early
//! (dropping the walker) therefore never touches unread subtrees. When a
//! listing fails the walker yields that error once, skips the directory's
//! subtree, and carries on with its siblings.

use crate::entry::{Filesystem, ImageEntry};
use anyhow::{Context, Result};
use std::vec;

pub struct TreeWalker<'a, F: Filesystem + ?Sized> {
    fs: &'a F,
    /// Unvisited siblings, one level per open directory.
    stack: Vec<vec::IntoIter<ImageEntry>>,
    /// Directory yielded last whose children have not been listed yet.
    pending: Option<ImageEntry>,
}

impl<'a, F: Filesystem + ?Sized> TreeWalker<'a, F> {
    pub fn new(fs: &'a F, root: ImageEntry) -> Self {
        Self {
            fs,
            stack: Vec::new(),
            pending: Some(root),
        }
    }

    /// Starts a walk at the filesystem's own root.
    pub fn from_root(fs: &'a F) -> Result<Self> {
        let root = fs.root().context("Failed to open filesystem root")?;
        Ok(Self::new(fs, root))
    }
}

impl<F: Filesystem + ?Sized> Iterator for TreeWalker<'_, F> {
    type Item = Result<ImageEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(dir) = self.pending.take() {
            match self.fs.list_children(&dir) {
                Ok(children) => self.stack.push(children.into_iter()),
                Err(e) => {
                    return Some(Err(
                        e.context(format!("Failed to list directory: {}", dir.name))
                    ))
                }
            }
        }

        loop {
            let level = self.stack.last_mut()?;
            match level.next() {
                Some(entry) => {
                    if entry.is_dir {
                        self.pending = Some(entry.clone());
                    }
                    return Some(Ok(entry));
                }
                None => {
                    self.stack.pop();
                }
            }
        }
    }
}
