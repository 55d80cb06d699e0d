//! Disc image adapters.
//!
//! [`open_disc`] accepts a UDF or ISO 9660 image file, or a directory holding
//! the disc's files (for example a loop-mounted image), and returns it as a
//! [`Filesystem`]. Images carrying a UDF volume are read through it, since
//! Windows media keep their ISO 9660 tree down to a single readme.

pub mod host;
pub mod iso9660;
pub mod udf;

pub use host::HostDirectory;
pub use iso9660::Iso9660Image;
pub use udf::UdfImage;

use crate::entry::Filesystem;
use anyhow::{anyhow, Context, Result};
use std::fs::File;
use std::path::Path;

/// Opens `path` as a disc image.
pub fn open_disc(path: &Path) -> Result<Box<dyn Filesystem>> {
    if !path.exists() {
        return Err(anyhow!("Disc image does not exist: {}", path.display()));
    }

    if path.is_dir() {
        log::info!("Reading disc tree from directory {}", path.display());
        return Ok(Box::new(HostDirectory::new(path)?));
    }

    let open = || {
        File::open(path).with_context(|| format!("Failed to open disc image: {}", path.display()))
    };

    let mut file = open()?;
    let has_udf = udf::has_nsr_descriptor(&mut file)
        .with_context(|| format!("Failed to read disc image: {}", path.display()))?;
    if has_udf {
        match UdfImage::new(file) {
            Ok(image) => {
                log::info!("Opened UDF volume '{}'", image.volume_id());
                return Ok(Box::new(image));
            }
            Err(e) => log::warn!(
                "{} announces a UDF volume that cannot be read ({:#}); falling back to ISO 9660",
                path.display(),
                e
            ),
        }
    }

    let image = Iso9660Image::new(open()?)
        .with_context(|| format!("Failed to read disc image: {}", path.display()))?;
    log::info!("Opened ISO 9660 volume '{}'", image.volume_id());
    Ok(Box::new(image))
}
