use std::path::Path;

use thiserror::Error;

use crate::types::{DownloadOutcome, IngestionReport};

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

fn status(outcome: &DownloadOutcome) -> &'static str {
    if outcome.success {
        "Success"
    } else {
        "Failed"
    }
}

/// One row per processed resource, successes first, in task order within each group.
pub fn write_stats_csv(report: &IngestionReport, path: &Path) -> Result<(), ReportError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let mut wtr = csv::WriterBuilder::new().from_path(path)?;

    wtr.write_record([
        "Status",
        "Year",
        "Format",
        "Destination",
        "Location",
        "Size (MB)",
        "Duration (s)",
        "URL",
        "Error",
    ])?;

    for outcome in report
        .success_downloads
        .iter()
        .chain(report.failed_downloads.iter())
    {
        let size_mb = outcome.bytes_downloaded as f64 / 1_048_576.0;
        wtr.write_record([
            status(outcome).to_string(),
            outcome.year.to_string(),
            outcome.format.to_string(),
            outcome.destination.clone(),
            outcome.location.clone(),
            format!("{:.2}", size_mb),
            format!("{:.2}", outcome.duration.as_secs_f64()),
            outcome.url.clone(),
            outcome.error.clone(),
        ])?;
    }

    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskFailure;
    use crate::types::{DownloadTask, FileFormat};
    use std::time::Duration;

    #[test]
    fn writes_one_row_per_outcome() {
        let task = DownloadTask {
            url: "https://cdn/ear_2022.parquet".to_string(),
            year: 2022,
            package: "pkg".to_string(),
            format: FileFormat::Parquet,
            bucket: None,
        };
        let mut ok = DownloadOutcome::pending(&task);
        ok.destination = "pkg/2022/ear_2022.parquet".to_string();
        ok.finish(Ok("gs://b/pkg/2022/ear_2022.parquet".to_string()), Duration::from_secs(1));
        let failed = DownloadOutcome::failed(&task, TaskFailure::AlreadyExists);
        let report = IngestionReport::from_outcomes(vec![failed, ok], Duration::from_secs(2));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ingest_stats.csv");
        write_stats_csv(&report, &path).unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[0][0], "Success");
        assert_eq!(&rows[0][4], "gs://b/pkg/2022/ear_2022.parquet");
        assert_eq!(&rows[1][0], "Failed");
        assert_eq!(&rows[1][8], "data already exists");
    }
}
