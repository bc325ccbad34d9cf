//! Ingestion of ONS open-data catalog resources into cloud storage.
//!
//! A run lists the resources of a catalog package, picks one file per year in
//! the requested range, downloads and normalizes each of them to an all-text
//! Parquet file, skips files whose latest date is already in the warehouse and
//! uploads the rest. See [`pipeline::Pipeline::process_filter`].

pub mod catalog;
pub mod cli;
pub mod error;
pub mod fetcher;
pub mod pipeline;
pub mod report;
pub mod selector;
pub mod storage;
pub mod transcode;
pub mod types;
pub mod warehouse;

pub use error::{IngestError, TaskFailure};
pub use pipeline::{Pipeline, PipelineConfig};
pub use types::{DownloadOutcome, DownloadTask, FileFormat, IngestionReport, SelectionFilter};
