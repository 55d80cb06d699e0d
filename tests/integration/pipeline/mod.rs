//! Pipeline behaviour over mock discs and containers: traversal, failure
//! isolation, collisions and cancellation.

use crate::integration::common::{list_output, ImageSpec, MemoryFs, MockDecoder};
use anyhow::Result;
use std::cell::{Cell, RefCell};
use std::fs;
use tempfile::TempDir;
use winfonts::events::RecordingObserver;
use winfonts::{
    CancellationToken, ExtractConfig, ExtractionEvent, ExtractionObserver, ExtractionPipeline,
    FailureStage, ImageEntry, RunOutcome,
};

fn boot_decoder() -> MockDecoder {
    MockDecoder::new().with_container(
        "boot",
        vec![
            ImageSpec::new("Setup")
                .file("/Windows/Fonts/arial.ttf", b"arial")
                .file("/readme.txt", b"readme"),
            ImageSpec::new("Core").file("/Windows/Fonts/calibri.ttf", b"calibri"),
        ],
    )
}

fn boot_disc() -> MemoryFs {
    MemoryFs::new()
        .with_file("/sources/BOOT.CONTAINER", b"boot")
        .with_file("/readme.txt", b"disc readme")
}

#[test]
fn test_boot_container_scenario() -> Result<()> {
    let output = TempDir::new()?;
    let decoder = boot_decoder();
    let observer = RecordingObserver::new();
    let config = ExtractConfig::new(output.path())
        .with_container_suffix("CONTAINER")
        .with_extensions([".ttf"]);

    let outcome = ExtractionPipeline::new(config, &decoder, &observer).run(&boot_disc())?;

    assert!(!outcome.is_cancelled());
    assert_eq!(list_output(output.path()), vec!["arial.ttf", "calibri.ttf"]);
    assert_eq!(fs::read(output.path().join("calibri.ttf"))?, b"calibri");

    let summary = outcome.summary();
    assert_eq!(summary.containers_found, 1);
    assert_eq!(summary.containers_failed, 0);
    assert_eq!(summary.images_processed, 2);
    assert_eq!(summary.files_extracted, 2);
    assert_eq!(summary.bytes_written, 12);
    assert!(summary.finished_at.is_some());

    let events = observer.events();
    assert_eq!(
        events[0],
        ExtractionEvent::ContainerDiscovered {
            name: "BOOT.CONTAINER".to_string()
        }
    );
    let started: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ExtractionEvent::ImageStarted { name, count, .. } => Some((name.clone(), *count)),
            _ => None,
        })
        .collect();
    assert_eq!(
        started,
        vec![("Setup".to_string(), 2), ("Core".to_string(), 2)]
    );
    Ok(())
}

#[test]
fn test_disc_without_containers() -> Result<()> {
    let output = TempDir::new()?;
    let decoder = MockDecoder::new();
    let observer = RecordingObserver::new();
    let disc = MemoryFs::new()
        .with_file("/readme.txt", b"readme")
        .with_file("/fonts/arial.ttf", b"not inside a container");

    let outcome =
        ExtractionPipeline::new(ExtractConfig::new(output.path()), &decoder, &observer).run(&disc)?;

    let summary = outcome.summary();
    assert_eq!(summary.containers_found, 0);
    assert_eq!(summary.results_recorded(), 0);
    assert!(!summary.has_structural_failures());
    assert!(decoder.opened().is_empty());
    assert!(observer.events().is_empty());
    assert!(list_output(output.path()).is_empty());
    Ok(())
}

#[test]
fn test_unmatched_container_suffix_extracts_nothing() -> Result<()> {
    let output = TempDir::new()?;
    let decoder = boot_decoder();
    let config = ExtractConfig::new(output.path()).with_container_suffix(".esd");

    let outcome = ExtractionPipeline::new(config, &decoder, &RecordingObserver::new())
        .run(&boot_disc())?;

    assert_eq!(outcome.summary().containers_found, 0);
    assert_eq!(outcome.summary().files_extracted, 0);
    assert_eq!(outcome.summary().files_failed, 0);
    assert!(list_output(output.path()).is_empty());
    Ok(())
}

#[test]
fn test_failing_container_does_not_stop_siblings() -> Result<()> {
    let output = TempDir::new()?;
    let decoder = MockDecoder::new().with_container(
        "good",
        vec![ImageSpec::new("Pro").file("/Windows/Fonts/segoeui.ttf", b"segoe")],
    );
    let disc = MemoryFs::new()
        .with_file("/sources/a.wim", b"garbage")
        .with_file("/sources/b.wim", b"good")
        .with_file("/sources/c.wim", b"more garbage");
    let observer = RecordingObserver::new();

    let outcome =
        ExtractionPipeline::new(ExtractConfig::new(output.path()), &decoder, &observer).run(&disc)?;

    let summary = outcome.summary();
    assert_eq!(summary.containers_found, 3);
    assert_eq!(summary.containers_failed, 2);
    assert_eq!(summary.structural_failures.len(), 2);
    assert_eq!(summary.structural_failures[0].subject, "a.wim");
    assert!(summary.structural_failures[0].cause.contains("corrupt container"));
    assert_eq!(summary.files_extracted, 1);
    assert_eq!(list_output(output.path()), vec!["segoeui.ttf"]);
    assert_eq!(decoder.opened(), vec!["garbage", "good", "more garbage"]);

    let failed: Vec<_> = observer
        .events()
        .into_iter()
        .filter(|e| matches!(e, ExtractionEvent::ContainerFailed { .. }))
        .collect();
    assert_eq!(failed.len(), 2);
    Ok(())
}

#[test]
fn test_unopenable_image_abandons_its_container() -> Result<()> {
    let output = TempDir::new()?;
    let decoder = MockDecoder::new()
        .with_container(
            "damaged",
            vec![
                ImageSpec::new("Home").file("/Windows/Fonts/arial.ttf", b"arial"),
                ImageSpec::new("Pro").broken(),
                ImageSpec::new("Education").file("/Windows/Fonts/times.ttf", b"times"),
            ],
        )
        .with_container(
            "fine",
            vec![ImageSpec::new("Server").file("/Windows/Fonts/consola.ttf", b"consola")],
        );
    let disc = MemoryFs::new()
        .with_file("/install.wim", b"damaged")
        .with_file("/server.wim", b"fine");

    let outcome = ExtractionPipeline::new(
        ExtractConfig::new(output.path()),
        &decoder,
        &RecordingObserver::new(),
    )
    .run(&disc)?;

    let summary = outcome.summary();
    assert_eq!(summary.containers_failed, 1);
    assert_eq!(summary.images_processed, 2);
    assert_eq!(list_output(output.path()), vec!["arial.ttf", "consola.ttf"]);
    Ok(())
}

#[test]
fn test_listing_error_inside_image_abandons_its_container() -> Result<()> {
    let output = TempDir::new()?;
    let decoder = MockDecoder::new()
        .with_container(
            "mixed",
            vec![
                ImageSpec::new("Home").file("/Windows/Fonts/arial.ttf", b"arial"),
                ImageSpec::new("Pro")
                    .file("/Windows/Fonts/segoeui.ttf", b"segoe")
                    .unlistable("/Windows"),
                ImageSpec::new("Education").file("/Windows/Fonts/times.ttf", b"times"),
            ],
        )
        .with_container(
            "fine",
            vec![ImageSpec::new("Server").file("/Windows/Fonts/consola.ttf", b"consola")],
        );
    let disc = MemoryFs::new()
        .with_file("/sources/install.wim", b"mixed")
        .with_file("/sources/server.wim", b"fine");
    let observer = RecordingObserver::new();

    let outcome =
        ExtractionPipeline::new(ExtractConfig::new(output.path()), &decoder, &observer).run(&disc)?;

    let summary = outcome.summary();
    assert_eq!(summary.containers_found, 2);
    assert_eq!(summary.containers_failed, 1);
    assert_eq!(summary.images_processed, 2);
    assert_eq!(summary.structural_failures.len(), 1);
    assert_eq!(summary.structural_failures[0].subject, "install.wim");
    assert!(summary.structural_failures[0]
        .cause
        .contains("I/O error listing /Windows"));
    assert_eq!(list_output(output.path()), vec!["arial.ttf", "consola.ttf"]);

    let started: Vec<_> = observer
        .events()
        .into_iter()
        .filter_map(|e| match e {
            ExtractionEvent::ImageStarted { name, .. } => Some(name),
            _ => None,
        })
        .collect();
    assert_eq!(started, vec!["Home", "Pro", "Server"]);
    Ok(())
}

#[test]
fn test_unreadable_file_is_recorded_and_skipped() -> Result<()> {
    let output = TempDir::new()?;
    let decoder = MockDecoder::new().with_container(
        "fonts",
        vec![ImageSpec::new("Pro")
            .file("/Windows/Fonts/arial.ttf", b"arial")
            .file("/Windows/Fonts/bad.ttf", b"bad")
            .file("/Windows/Fonts/calibri.ttf", b"calibri")
            .unreadable("/Windows/Fonts/bad.ttf")],
    );
    let disc = MemoryFs::new().with_file("/sources/install.wim", b"fonts");
    let observer = RecordingObserver::new();

    let outcome =
        ExtractionPipeline::new(ExtractConfig::new(output.path()), &decoder, &observer).run(&disc)?;

    let summary = outcome.summary();
    assert_eq!(summary.files_matched, 3);
    assert_eq!(summary.files_extracted, 2);
    assert_eq!(summary.files_failed, 1);
    assert_eq!(summary.file_failures[0].subject, "bad.ttf");
    assert_eq!(summary.file_failures[0].stage, "open");
    assert!(!summary.has_structural_failures());
    assert_eq!(list_output(output.path()), vec!["arial.ttf", "calibri.ttf"]);

    assert!(observer.events().iter().any(|e| matches!(
        e,
        ExtractionEvent::FileFailed {
            stage: FailureStage::Open,
            ..
        }
    )));
    Ok(())
}

#[test]
fn test_collision_keeps_the_last_image() -> Result<()> {
    let output = TempDir::new()?;
    let decoder = MockDecoder::new().with_container(
        "editions",
        vec![
            ImageSpec::new("Home").file("/Windows/Fonts/arial.ttf", b"from home"),
            ImageSpec::new("Pro").file("/Windows/Fonts/arial.ttf", b"from pro"),
        ],
    );
    let disc = MemoryFs::new().with_file("/sources/install.wim", b"editions");

    let outcome = ExtractionPipeline::new(
        ExtractConfig::new(output.path()),
        &decoder,
        &RecordingObserver::new(),
    )
    .run(&disc)?;

    assert_eq!(outcome.summary().files_extracted, 2);
    assert_eq!(list_output(output.path()), vec!["arial.ttf"]);
    assert_eq!(fs::read(output.path().join("arial.ttf"))?, b"from pro");
    Ok(())
}

#[test]
fn test_reruns_give_equal_counts() -> Result<()> {
    let decoder = boot_decoder();
    let disc = boot_disc();
    let config = |dir: &TempDir| {
        ExtractConfig::new(dir.path())
            .with_container_suffix(".CONTAINER")
            .with_extensions([".ttf", ".txt"])
    };

    let first_dir = TempDir::new()?;
    let first = ExtractionPipeline::new(config(&first_dir), &decoder, &RecordingObserver::new())
        .run(&disc)?
        .into_summary();
    let second_dir = TempDir::new()?;
    let second =
        ExtractionPipeline::new(config(&second_dir), &decoder, &RecordingObserver::new())
            .run(&disc)?
            .into_summary();

    assert_eq!(first.files_extracted, 3);
    assert_eq!(first.files_matched, second.files_matched);
    assert_eq!(first.files_extracted, second.files_extracted);
    assert_eq!(first.bytes_written, second.bytes_written);
    assert_eq!(list_output(first_dir.path()), list_output(second_dir.path()));
    Ok(())
}

#[test]
fn test_custom_predicate_sees_every_entry_once() -> Result<()> {
    let output = TempDir::new()?;
    let decoder = boot_decoder();
    let seen = RefCell::new(Vec::new());
    let predicate = |entry: &ImageEntry| {
        seen.borrow_mut().push(entry.name.clone());
        !entry.is_dir && entry.name.starts_with("calibri")
    };
    let config = ExtractConfig::new(output.path()).with_container_suffix(".CONTAINER");

    let outcome = ExtractionPipeline::new(config, &decoder, &RecordingObserver::new())
        .with_predicate(predicate)
        .run(&boot_disc())?;

    assert_eq!(outcome.summary().files_extracted, 1);
    assert_eq!(list_output(output.path()), vec!["calibri.ttf"]);
    assert_eq!(
        *seen.borrow(),
        vec![
            "Windows",
            "Fonts",
            "arial.ttf",
            "readme.txt",
            "Windows",
            "Fonts",
            "calibri.ttf"
        ]
    );
    Ok(())
}

/// Cancels the shared token once `limit` files have been written.
struct CancelAfter {
    token: CancellationToken,
    limit: usize,
    extracted: Cell<usize>,
}

impl ExtractionObserver for CancelAfter {
    fn on_event(&self, event: &ExtractionEvent) {
        if let ExtractionEvent::FileExtracted { .. } = event {
            self.extracted.set(self.extracted.get() + 1);
            if self.extracted.get() == self.limit {
                self.token.cancel();
            }
        }
    }
}

#[test]
fn test_cancellation_stops_further_extraction() -> Result<()> {
    let output = TempDir::new()?;
    let image = (0..5).fold(ImageSpec::new("Pro"), |spec, i| {
        spec.file(&format!("/Windows/Fonts/font{}.ttf", i), b"glyphs")
    });
    let decoder = MockDecoder::new()
        .with_container("first", vec![image])
        .with_container(
            "second",
            vec![ImageSpec::new("Home").file("/Windows/Fonts/later.ttf", b"later")],
        );
    let disc = MemoryFs::new()
        .with_file("/sources/a.wim", b"first")
        .with_file("/sources/b.wim", b"second");

    let token = CancellationToken::new();
    let observer = CancelAfter {
        token: token.clone(),
        limit: 2,
        extracted: Cell::new(0),
    };

    let outcome = ExtractionPipeline::new(ExtractConfig::new(output.path()), &decoder, &observer)
        .with_cancellation(token)
        .run(&disc)?;

    let summary = match outcome {
        RunOutcome::Cancelled(summary) => summary,
        RunOutcome::Completed(_) => panic!("run should have been cancelled"),
    };
    assert_eq!(summary.files_extracted, 2);
    assert_eq!(list_output(output.path()), vec!["font0.ttf", "font1.ttf"]);
    assert_eq!(decoder.opened(), vec!["first"]);
    Ok(())
}

#[test]
fn test_cancelled_before_start_does_nothing() -> Result<()> {
    let output = TempDir::new()?;
    let decoder = boot_decoder();
    let observer = RecordingObserver::new();
    let pipeline = ExtractionPipeline::new(
        ExtractConfig::new(output.path()).with_container_suffix(".CONTAINER"),
        &decoder,
        &observer,
    );
    pipeline.cancellation_token().cancel();

    let outcome = pipeline.run(&boot_disc())?;

    assert!(outcome.is_cancelled());
    assert_eq!(outcome.summary().results_recorded(), 0);
    assert!(decoder.opened().is_empty());
    assert_eq!(observer.events(), vec![ExtractionEvent::Cancelled]);
    Ok(())
}

#[test]
fn test_unlistable_disc_directory_is_skipped() -> Result<()> {
    let output = TempDir::new()?;
    let decoder = boot_decoder();
    let disc = MemoryFs::new()
        .with_dir("/boot")
        .with_file("/boot/bcd", b"bcd")
        .with_file("/sources/BOOT.CONTAINER", b"boot")
        .with_unlistable("/boot");
    let observer = RecordingObserver::new();

    let outcome = ExtractionPipeline::new(
        ExtractConfig::new(output.path()).with_container_suffix(".CONTAINER"),
        &decoder,
        &observer,
    )
    .run(&disc)?;

    let summary = outcome.summary();
    assert_eq!(summary.files_extracted, 2);
    assert_eq!(summary.containers_failed, 0);
    assert_eq!(summary.structural_failures.len(), 1);
    assert_eq!(summary.structural_failures[0].subject, "disc");
    assert!(observer
        .events()
        .iter()
        .any(|e| matches!(e, ExtractionEvent::DirectoryFailed { .. })));
    Ok(())
}

#[test]
fn test_unreadable_disc_root_fails_the_run() {
    let output = TempDir::new().unwrap();
    let decoder = boot_decoder();
    let disc = boot_disc().with_unlistable("/");

    let result = ExtractionPipeline::new(
        ExtractConfig::new(output.path()),
        &decoder,
        &RecordingObserver::new(),
    )
    .run(&disc);

    assert!(result.is_err());
}

#[test]
fn test_summary_serializes_to_json() -> Result<()> {
    let output = TempDir::new()?;
    let decoder = boot_decoder();
    let config = ExtractConfig::new(output.path()).with_container_suffix(".CONTAINER");

    let summary = ExtractionPipeline::new(config, &decoder, &RecordingObserver::new())
        .run(&boot_disc())?
        .into_summary();
    let json = serde_json::to_value(&summary)?;

    assert_eq!(json["files_extracted"], 2);
    assert_eq!(json["containers_found"], 1);
    assert!(json["started_at"].is_string());
    assert!(json["file_failures"].as_array().unwrap().is_empty());
    Ok(())
}
