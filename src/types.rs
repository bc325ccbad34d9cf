use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{IngestError, TaskFailure};

pub const DEFAULT_PACKAGE: &str = "ear-diario-por-reservatorio";

/// Input of one pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionFilter {
    pub start_year: Option<i32>,
    pub end_year: Option<i32>,
    pub package: Option<String>,
    pub bucket: Option<String>,
}

impl SelectionFilter {
    /// Resolves the inclusive year range. If either bound is missing both
    /// default to `current_year`.
    pub fn year_range(&self, current_year: i32) -> Result<(i32, i32), IngestError> {
        match (self.start_year, self.end_year) {
            (Some(start), Some(end)) if start > end => {
                Err(IngestError::InvalidYearRange { start, end })
            }
            (Some(start), Some(end)) => Ok((start, end)),
            _ => Ok((current_year, current_year)),
        }
    }

    pub fn package(&self) -> &str {
        self.package
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .unwrap_or(DEFAULT_PACKAGE)
    }
}

/// One resource entry of a catalog package.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResourceDescriptor {
    pub format: String,
    pub url: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    Parquet,
    Csv,
    Xlsx,
}

impl FileFormat {
    pub const DEFAULT_PREFERENCE: [FileFormat; 3] =
        [FileFormat::Parquet, FileFormat::Csv, FileFormat::Xlsx];

    pub fn as_str(&self) -> &'static str {
        match self {
            FileFormat::Parquet => "parquet",
            FileFormat::Csv => "csv",
            FileFormat::Xlsx => "xlsx",
        }
    }
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PARQUET" => Ok(FileFormat::Parquet),
            "CSV" => Ok(FileFormat::Csv),
            "XLSX" | "XLS" => Ok(FileFormat::Xlsx),
            other => Err(format!("unsupported format: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTask {
    pub url: String,
    pub year: i32,
    pub package: String,
    pub format: FileFormat,
    pub bucket: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadOutcome {
    pub success: bool,
    pub url: String,
    pub year: i32,
    pub package: String,
    pub format: FileFormat,
    pub bucket: Option<String>,
    /// Object path inside the bucket. Empty if the task failed before it was computed.
    pub destination: String,
    /// Final `gs://` location on success.
    pub location: String,
    /// Failure reason, empty on success.
    pub error: String,
    pub bytes_downloaded: u64,
    pub duration: Duration,
}

impl DownloadOutcome {
    pub fn pending(task: &DownloadTask) -> Self {
        Self {
            success: false,
            url: task.url.clone(),
            year: task.year,
            package: task.package.clone(),
            format: task.format,
            bucket: task.bucket.clone(),
            destination: String::new(),
            location: String::new(),
            error: String::new(),
            bytes_downloaded: 0,
            duration: Duration::ZERO,
        }
    }

    pub fn failed(task: &DownloadTask, failure: TaskFailure) -> Self {
        let mut outcome = Self::pending(task);
        outcome.error = failure.to_string();
        outcome
    }

    pub fn finish(&mut self, result: Result<String, TaskFailure>, duration: Duration) {
        self.duration = duration;
        match result {
            Ok(location) => {
                self.success = true;
                self.location = location;
                self.error.clear();
            }
            Err(failure) => {
                self.success = false;
                self.error = failure.to_string();
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestionReport {
    pub success_downloads: Vec<DownloadOutcome>,
    pub failed_downloads: Vec<DownloadOutcome>,
    pub total_processed: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub total_bytes_downloaded: u64,
    pub total_duration: Duration,
}

impl IngestionReport {
    /// Splits outcomes into successes and failures, keeping their relative order.
    pub fn from_outcomes(outcomes: Vec<DownloadOutcome>, total_duration: Duration) -> Self {
        let total_processed = outcomes.len();
        let total_bytes_downloaded = outcomes.iter().map(|o| o.bytes_downloaded).sum();
        let (success_downloads, failed_downloads): (Vec<_>, Vec<_>) =
            outcomes.into_iter().partition(|o| o.success);

        Self {
            success_count: success_downloads.len(),
            failure_count: failed_downloads.len(),
            success_downloads,
            failed_downloads,
            total_processed,
            total_bytes_downloaded,
            total_duration,
        }
    }
}
