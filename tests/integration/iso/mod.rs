//! ISO 9660 discs built in memory, read through the disc adapter.

use crate::integration::common::iso_builder::IsoBuilder;
use crate::integration::common::list_output;
use crate::integration::tar::tar_bytes;
use anyhow::Result;
use std::fs;
use std::io::{Cursor, Read};
use tempfile::TempDir;
use winfonts::events::RecordingObserver;
use winfonts::{
    open_disc, AutoDecoder, ExtractConfig, ExtractionPipeline, Filesystem, Iso9660Image,
    TreeWalker,
};

fn names(fs: &dyn Filesystem) -> Vec<String> {
    TreeWalker::from_root(fs)
        .unwrap()
        .map(|entry| entry.unwrap().name)
        .collect()
}

#[test]
fn test_joliet_names_are_preferred() {
    let image = IsoBuilder::new("CCCOMA_X64FRE")
        .joliet(true)
        .file("/sources/install.wim", b"wim")
        .file("/setup.exe", b"MZ")
        .build();

    let iso = Iso9660Image::new(Cursor::new(image)).unwrap();
    assert!(iso.is_joliet());
    assert_eq!(iso.volume_id(), "CCCOMA_X64FRE");
    assert!(!iso.has_udf());
    assert_eq!(names(&iso), vec!["sources", "install.wim", "setup.exe"]);
}

#[test]
fn test_primary_names_drop_version_suffix() {
    let image = IsoBuilder::new("BOOTDISC")
        .file("/sources/boot.wim", b"wim")
        .file("/readme", b"no extension")
        .build();

    let iso = Iso9660Image::new(Cursor::new(image)).unwrap();
    assert!(!iso.is_joliet());
    assert_eq!(names(&iso), vec!["SOURCES", "BOOT.WIM", "README"]);
}

#[test]
fn test_file_content_streams_exactly() {
    let large: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    let image = IsoBuilder::new("DATA")
        .joliet(true)
        .file("/big.bin", &large)
        .file("/small.txt", b"tiny")
        .build();

    let iso = Iso9660Image::new(Cursor::new(image)).unwrap();
    let root = iso.root().unwrap();
    let children = iso.list_children(&root).unwrap();

    let mut content = Vec::new();
    iso.open_content(&children[0])
        .unwrap()
        .read_to_end(&mut content)
        .unwrap();
    assert_eq!(children[0].size, Some(5000));
    assert_eq!(content, large);

    let mut small = String::new();
    iso.open_content(&children[1])
        .unwrap()
        .read_to_string(&mut small)
        .unwrap();
    assert_eq!(small, "tiny");
}

#[test]
fn test_directory_spanning_several_sectors() {
    let mut builder = IsoBuilder::new("MANY").joliet(true);
    for i in 0..60 {
        builder = builder.file(
            &format!("/Fonts/font_with_a_rather_long_name_{:03}.ttf", i),
            b"x",
        );
    }
    let iso = Iso9660Image::new(Cursor::new(builder.build())).unwrap();

    let all = names(&iso);
    assert_eq!(all.len(), 61);
    assert_eq!(all[1], "font_with_a_rather_long_name_000.ttf");
    assert_eq!(all[60], "font_with_a_rather_long_name_059.ttf");
}

#[test]
fn test_extract_from_iso_file() -> Result<()> {
    let container = tar_bytes(&[
        ("Windows/Fonts/arial.ttf", b"arial"),
        ("Windows/Fonts/calibri.ttf", b"calibri"),
        ("Windows/notepad.exe", b"MZ"),
    ]);
    let image = IsoBuilder::new("WINFONTS")
        .joliet(true)
        .file("/sources/fonts.tar", &container)
        .file("/readme.txt", b"readme")
        .build();

    let work = TempDir::new()?;
    let iso_path = work.path().join("windows.iso");
    fs::write(&iso_path, image)?;
    let output = work.path().join("fonts");
    fs::create_dir(&output)?;

    let disc = open_disc(&iso_path)?;
    let decoder = AutoDecoder::with_wimlib(None);
    let config = ExtractConfig::new(&output).with_container_suffix(".tar");
    let outcome =
        ExtractionPipeline::new(config, &decoder, &RecordingObserver::new()).run(disc.as_ref())?;

    assert_eq!(outcome.summary().containers_found, 1);
    assert_eq!(outcome.summary().files_extracted, 2);
    assert_eq!(list_output(&output), vec!["arial.ttf", "calibri.ttf"]);
    assert_eq!(fs::read(output.join("arial.ttf"))?, b"arial");
    Ok(())
}

#[test]
fn test_open_disc_rejects_non_iso_files() -> Result<()> {
    let work = TempDir::new()?;
    let path = work.path().join("not-a-disc.iso");
    fs::write(&path, vec![0u8; 40 * 2048])?;

    assert!(open_disc(&path).is_err());
    assert!(open_disc(&work.path().join("missing.iso")).is_err());
    Ok(())
}
