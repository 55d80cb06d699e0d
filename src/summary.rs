use crate::sink::ExtractionResult;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// One failure kept for the end-of-run report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureRecord {
    /// Container, directory or file the failure belongs to.
    pub subject: String,
    pub stage: String,
    pub cause: String,
}

/// Counters and failures collected over one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub containers_found: usize,
    pub containers_failed: usize,
    pub images_processed: usize,
    pub files_matched: usize,
    pub files_extracted: usize,
    pub files_failed: usize,
    pub bytes_written: u64,
    pub structural_failures: Vec<FailureRecord>,
    pub file_failures: Vec<FailureRecord>,
}

impl RunSummary {
    pub fn start() -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            containers_found: 0,
            containers_failed: 0,
            images_processed: 0,
            files_matched: 0,
            files_extracted: 0,
            files_failed: 0,
            bytes_written: 0,
            structural_failures: Vec::new(),
            file_failures: Vec::new(),
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    /// Number of per-file results recorded so far.
    pub fn results_recorded(&self) -> usize {
        self.files_extracted + self.files_failed
    }

    pub fn has_structural_failures(&self) -> bool {
        !self.structural_failures.is_empty()
    }

    pub fn record_result(&mut self, result: &ExtractionResult) {
        match result {
            ExtractionResult::Extracted { bytes, .. } => {
                self.files_extracted += 1;
                self.bytes_written += bytes;
            }
            ExtractionResult::Failed { name, stage, cause } => {
                self.files_failed += 1;
                self.file_failures.push(FailureRecord {
                    subject: name.clone(),
                    stage: stage.to_string(),
                    cause: format!("{:#}", cause),
                });
            }
        }
    }

    pub fn record_structural(&mut self, subject: &str, stage: &str, cause: &anyhow::Error) {
        self.structural_failures.push(FailureRecord {
            subject: subject.to_string(),
            stage: stage.to_string(),
            cause: format!("{:#}", cause),
        });
    }
}
