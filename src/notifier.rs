//! Unified logging and progress UI.
//!
//! [`Notifier`] wraps `env_logger` (text logs) and `indicatif` (spinners/bars) under a single
//! verbosity switch:
//! - [`VerbosityLevel::Quiet`] → no text logs; shows a live spinner and optional progress bars.
//! - [`VerbosityLevel::Info`]/[`VerbosityLevel::Debug`]/[`VerbosityLevel::Trace`] → standard logs.
//!
//! The notifier also implements [`ExtractionObserver`]: in Quiet mode pipeline events drive the
//! spinner, otherwise they are emitted as trace records next to the pipeline's own logs.

use crate::events::{ExtractionEvent, ExtractionObserver};
use env_logger::Env;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::{Level, LevelFilter, Log, Record};
use std::cell::{Cell, RefCell};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VerbosityLevel {
    Quiet = 0, // Beautiful progress, no text logs
    Info = 1,  // Text logs at info level
    Debug = 2, // Text logs at debug level
    Trace = 3, // Text logs at trace level
}

impl From<u8> for VerbosityLevel {
    fn from(level: u8) -> Self {
        match level {
            0 => VerbosityLevel::Quiet,
            1 => VerbosityLevel::Info,
            2 => VerbosityLevel::Debug,
            _ => VerbosityLevel::Trace,
        }
    }
}

impl VerbosityLevel {
    pub fn to_log_level(self) -> LevelFilter {
        match self {
            VerbosityLevel::Quiet => LevelFilter::Warn,
            VerbosityLevel::Info => LevelFilter::Info,
            VerbosityLevel::Debug => LevelFilter::Debug,
            VerbosityLevel::Trace => LevelFilter::Trace,
        }
    }
}

pub struct Notifier {
    verbosity: VerbosityLevel,
    logger: env_logger::Logger,
    multi_progress: Option<Arc<MultiProgress>>,
    active_spinner: RefCell<Option<ProgressBar>>,
    extracted: Cell<u64>,
    failed: Cell<u64>,
}

impl Notifier {
    pub fn new(verbosity_level: u8) -> Self {
        let verbosity = VerbosityLevel::from(verbosity_level);

        let logger = env_logger::Builder::from_env(Env::default())
            .filter_level(verbosity.to_log_level())
            .build();

        let multi_progress = if verbosity == VerbosityLevel::Quiet {
            Some(Arc::new(MultiProgress::new()))
        } else {
            None
        };

        Self {
            verbosity,
            logger,
            multi_progress,
            active_spinner: RefCell::new(None),
            extracted: Cell::new(0),
            failed: Cell::new(0),
        }
    }

    pub fn info(&self, message: &str) {
        match self.verbosity {
            VerbosityLevel::Quiet => {
                // Lazy initialize spinner on first info call
                if self.active_spinner.borrow().is_none() {
                    if let Some(multi_progress) = &self.multi_progress {
                        let spinner_style = ProgressStyle::default_spinner()
                            .template("{spinner:.green} {msg}")
                            .unwrap_or_else(|_| ProgressStyle::default_spinner());

                        let spinner = multi_progress.add(ProgressBar::new_spinner());
                        spinner.set_style(spinner_style);
                        spinner.enable_steady_tick(Duration::from_millis(100));

                        *self.active_spinner.borrow_mut() = Some(spinner);
                    }
                }

                if let Some(spinner) = self.active_spinner.borrow().as_ref() {
                    spinner.set_message(message.to_string());
                }
            }
            _ => self.log(Level::Info, message),
        }
    }

    pub fn debug(&self, message: &str) {
        if self.verbosity != VerbosityLevel::Quiet {
            self.log(Level::Debug, message);
        }
    }

    /// Warnings are shown in every mode; in Quiet mode they are printed above the bars.
    pub fn warn(&self, message: &str) {
        match &self.multi_progress {
            Some(multi_progress) => {
                let _ = multi_progress.println(format!("warning: {}", message));
            }
            None => self.log(Level::Warn, message),
        }
    }

    pub fn trace(&self, message: &str) {
        if self.verbosity != VerbosityLevel::Quiet {
            self.log(Level::Trace, message);
        }
    }

    /// Prints a line that stays on screen in every mode.
    pub fn println_above(&self, message: impl AsRef<str>) {
        match &self.multi_progress {
            Some(multi_progress) => {
                let _ = multi_progress.println(message.as_ref());
            }
            None => println!("{}", message.as_ref()),
        }
    }

    pub fn create_progress_bar(&self, length: u64, message: &str) -> Option<ProgressBar> {
        if self.verbosity == VerbosityLevel::Quiet {
            if let Some(multi_progress) = &self.multi_progress {
                let progress_style = ProgressStyle::default_bar()
                    .template(
                        "{spinner:.green} [{elapsed_precise}] {bar:40.cyan/blue} {bytes:>10}/{total_bytes:10} {msg}",
                    )
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("=> ");

                let progress_bar = multi_progress.add(ProgressBar::new(length));
                progress_bar.set_style(progress_style);
                progress_bar.set_message(message.to_string());
                return Some(progress_bar);
            }
        }
        None
    }

    pub fn progress(&self, current: u64, total: u64, message: &str) {
        const STEP: u64 = 64 * 1024 * 1024;
        if self.verbosity != VerbosityLevel::Quiet
            && (current / STEP != current.saturating_sub(1) / STEP || current == total)
        {
            self.info(&format!("{}: {}/{}", message, current, total));
        }
    }

    /// Clears the spinner, leaving printed lines in place.
    pub fn finish(&self) {
        if let Some(spinner) = self.active_spinner.borrow_mut().take() {
            spinner.finish_and_clear();
        }
    }

    /// Files reported extracted and failed through the observer so far.
    pub fn file_counts(&self) -> (u64, u64) {
        (self.extracted.get(), self.failed.get())
    }

    pub fn use_beautiful_progress(&self) -> bool {
        self.verbosity == VerbosityLevel::Quiet
    }

    pub fn verbosity_level(&self) -> VerbosityLevel {
        self.verbosity
    }

    fn log(&self, level: Level, message: &str) {
        self.logger.log(
            &Record::builder()
                .args(format_args!("{}", message))
                .level(level)
                .target(module_path!())
                .build(),
        );
    }
}

impl ExtractionObserver for Notifier {
    fn on_event(&self, event: &ExtractionEvent) {
        match event {
            ExtractionEvent::FileExtracted { .. } => self.extracted.set(self.extracted.get() + 1),
            ExtractionEvent::FileFailed { .. } => self.failed.set(self.failed.get() + 1),
            _ => {}
        }

        // The pipeline logs these itself; text mode only adds a trace record.
        if !self.use_beautiful_progress() {
            self.trace(&format!("event: {:?}", event));
            return;
        }

        match event {
            ExtractionEvent::ContainerDiscovered { name } => {
                self.info(&format!("Opening {}", name));
            }
            ExtractionEvent::ImageStarted {
                container,
                index,
                count,
                name,
            } => {
                self.info(&format!(
                    "{} [{}/{}] {} ({} extracted)",
                    container,
                    index,
                    count,
                    name,
                    self.extracted.get()
                ));
            }
            ExtractionEvent::FileExtracted { name, .. } => {
                self.info(&format!("{} extracted, last: {}", self.extracted.get(), name));
            }
            ExtractionEvent::Cancelled => self.info("Cancelled"),
            // Warnings already reach stderr through the log facade.
            ExtractionEvent::ContainerFailed { .. }
            | ExtractionEvent::DirectoryFailed { .. }
            | ExtractionEvent::FileFailed { .. } => {}
        }
    }
}
