//! Windows imaging (WIM) archives through the `wimlib-imagex` tool.
//!
//! WIM resources are LZX/XPRESS compressed; rather than decoding them here the
//! decoder drives `wimlib-imagex`:
//! - `info <wim>` enumerates the embedded images,
//! - `dir <wim> <index> --detailed` lists every path of one image with its
//!   attributes and stream sizes (parsed into a [`PathIndex`]),
//! - `extract <wim> <index> <path> --to-stdout` streams one file.

use super::{Container, ContainerDecoder, EmbeddedImage};
use crate::entry::{Filesystem, ImageEntry};
use crate::path_index::PathIndex;
use anyhow::{anyhow, Context, Result};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::thread::{self, JoinHandle};

const DEFAULT_PROGRAM: &str = "wimlib-imagex";
const FILE_ATTRIBUTE_DIRECTORY: u32 = 0x10;

#[derive(Debug, Clone)]
pub struct WimlibDecoder {
    program: PathBuf,
}

impl WimlibDecoder {
    /// Uses `wimlib-imagex` from `PATH`, failing when it cannot be run.
    pub fn new() -> Result<Self> {
        Self::with_program(DEFAULT_PROGRAM)
    }

    pub fn with_program(program: impl Into<PathBuf>) -> Result<Self> {
        let program = program.into();
        let output = Command::new(&program)
            .arg("--version")
            .output()
            .with_context(|| {
                format!(
                    "Failed to execute {}. Is wimlib installed?",
                    program.display()
                )
            })?;

        if !output.status.success() {
            return Err(anyhow!("{} is not available", program.display()));
        }

        Ok(Self { program })
    }

    fn run_command(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .with_context(|| format!("Failed to execute wimlib-imagex command: {:?}", args))?;

        if !output.status.success() {
            let error = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("wimlib-imagex command failed: {}", error.trim()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl ContainerDecoder for WimlibDecoder {
    fn name(&self) -> &str {
        "wimlib"
    }

    fn open(&self, path: &Path) -> Result<Box<dyn Container>> {
        let wim_path = path
            .to_str()
            .ok_or_else(|| anyhow!("WIM path is not valid UTF-8: {}", path.display()))?;
        let info = self.run_command(&["info", wim_path])?;
        let images = parse_info(&info);
        log::debug!("wimlib reports {} image(s) in {}", images.len(), path.display());

        Ok(Box::new(WimContainer {
            decoder: self.clone(),
            path: wim_path.to_string(),
            images,
        }))
    }
}

pub struct WimContainer {
    decoder: WimlibDecoder,
    path: String,
    images: Vec<EmbeddedImage>,
}

impl Container for WimContainer {
    fn images(&self) -> &[EmbeddedImage] {
        &self.images
    }

    fn open_image(&self, index: usize) -> Result<Box<dyn Filesystem + '_>> {
        let index_arg = index.to_string();
        let listing = self
            .decoder
            .run_command(&["dir", &self.path, &index_arg, "--detailed"])
            .with_context(|| format!("Failed to list image {}", index))?;

        Ok(Box::new(WimImage {
            container: self,
            index_arg,
            tree: parse_dir_listing(&listing),
        }))
    }
}

struct WimImage<'a> {
    container: &'a WimContainer,
    index_arg: String,
    tree: PathIndex<()>,
}

impl Filesystem for WimImage<'_> {
    fn root(&self) -> Result<ImageEntry> {
        Ok(self.tree.root_entry())
    }

    fn list_children(&self, dir: &ImageEntry) -> Result<Vec<ImageEntry>> {
        self.tree.children(dir)
    }

    fn open_content(&self, file: &ImageEntry) -> Result<Box<dyn Read + '_>> {
        let member = self.tree.full_path(file)?;
        let mut child = Command::new(&self.container.decoder.program)
            .args([
                "extract",
                self.container.path.as_str(),
                self.index_arg.as_str(),
                member.as_str(),
                "--to-stdout",
                "--no-globs",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to start extraction of {}", member))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("wimlib-imagex stdout was not captured"))?;
        // Drained on its own thread so a chatty child never blocks on a full pipe.
        let stderr = child.stderr.take().map(|mut stderr| {
            thread::spawn(move || {
                let mut text = Vec::new();
                let _ = stderr.read_to_end(&mut text);
                String::from_utf8_lossy(&text).into_owned()
            })
        });

        Ok(Box::new(ChildReader {
            child,
            stdout,
            stderr,
            finished: false,
        }))
    }
}

/// Streams a child's stdout and turns a non-zero exit into a read error
/// carrying the child's stderr. Dropping an unfinished reader kills the child.
struct ChildReader {
    child: Child,
    stdout: ChildStdout,
    stderr: Option<JoinHandle<String>>,
    finished: bool,
}

impl ChildReader {
    fn error_output(&mut self) -> String {
        self.stderr
            .take()
            .and_then(|handle| handle.join().ok())
            .map(|text| text.trim().to_string())
            .unwrap_or_default()
    }
}

impl Read for ChildReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.finished {
            return Ok(0);
        }
        let n = self.stdout.read(buf)?;
        if n == 0 && !buf.is_empty() {
            self.finished = true;
            let status = self.child.wait()?;
            if !status.success() {
                let detail = self.error_output();
                let message = if detail.is_empty() {
                    format!("wimlib-imagex extract exited with {}", status)
                } else {
                    format!("wimlib-imagex extract exited with {}: {}", status, detail)
                };
                return Err(io::Error::new(io::ErrorKind::Other, message));
            }
        }
        Ok(n)
    }
}

impl Drop for ChildReader {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Parses the `Available Images` section of `wimlib-imagex info`.
fn parse_info(info: &str) -> Vec<EmbeddedImage> {
    let mut images: Vec<EmbeddedImage> = Vec::new();
    let mut image_count = None;

    for line in info.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "Image Count" => image_count = value.parse::<usize>().ok(),
            "Index" => {
                if let Ok(index) = value.parse::<usize>() {
                    images.push(EmbeddedImage {
                        index,
                        name: format!("Image {}", index),
                    });
                }
            }
            "Name" => {
                if let Some(image) = images.last_mut() {
                    image.name = value.to_string();
                }
            }
            _ => {}
        }
    }

    if images.is_empty() {
        if let Some(count) = image_count {
            images = (1..=count)
                .map(|index| EmbeddedImage {
                    index,
                    name: format!("Image {}", index),
                })
                .collect();
        }
    }

    images
}

/// One path block of `wimlib-imagex dir --detailed`.
#[derive(Debug, Default)]
struct ListedPath {
    path: String,
    attributes: u32,
    size: Option<u64>,
}

impl ListedPath {
    fn is_dir(&self) -> bool {
        self.attributes & FILE_ATTRIBUTE_DIRECTORY != 0
    }

    fn insert_into(self, tree: &mut PathIndex<()>) {
        if self.path.is_empty() || self.path == "/" {
            return;
        }
        let is_dir = self.is_dir();
        let size = if is_dir { None } else { self.size.or(Some(0)) };
        tree.insert(Path::new(&self.path), is_dir, size, ());
    }
}

/// Splits `Key: value` and `Key = value` lines.
fn split_field(line: &str) -> Option<(&str, &str)> {
    let at = line.find([':', '='])?;
    Some((line[..at].trim(), line[at + 1..].trim()))
}

fn parse_attributes(value: &str) -> u32 {
    let hex = value
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .trim_start_matches("0x");
    u32::from_str_radix(hex, 16).unwrap_or(0)
}

/// Builds a tree from `wimlib-imagex dir --detailed` output. A path is a
/// directory when its attributes carry `FILE_ATTRIBUTE_DIRECTORY`; its size
/// is the first stream's uncompressed size.
fn parse_dir_listing(listing: &str) -> PathIndex<()> {
    let mut tree = PathIndex::new();
    let mut current: Option<ListedPath> = None;

    for line in listing.lines() {
        let line = line.trim_end_matches('\r');
        if line.trim() == "FILE_ATTRIBUTE_DIRECTORY is set" {
            if let Some(listed) = current.as_mut() {
                listed.attributes |= FILE_ATTRIBUTE_DIRECTORY;
            }
            continue;
        }
        let Some((key, value)) = split_field(line) else {
            continue;
        };
        match key {
            "Full Path" => {
                if let Some(listed) = current.take() {
                    listed.insert_into(&mut tree);
                }
                current = Some(ListedPath {
                    path: value.trim_matches('"').to_string(),
                    ..ListedPath::default()
                });
            }
            "Attributes" => {
                if let Some(listed) = current.as_mut() {
                    listed.attributes |= parse_attributes(value);
                }
            }
            "Uncompressed size" => {
                if let Some(listed) = current.as_mut().filter(|l| l.size.is_none()) {
                    listed.size = value
                        .split_whitespace()
                        .next()
                        .and_then(|bytes| bytes.parse().ok());
                }
            }
            _ => {}
        }
    }
    if let Some(listed) = current {
        listed.insert_into(&mut tree);
    }
    tree
}
