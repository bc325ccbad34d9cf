use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};

use crate::storage::DEFAULT_BUCKET;
use crate::types::SelectionFilter;
use crate::warehouse::{DEFAULT_LOCATION, DEFAULT_RAW_DATASET};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub settings: Settings,

    #[command(subcommand)]
    pub command: Command,
}

/// Process-wide settings, read-only during a run.
#[derive(Args, Debug, Clone)]
pub struct Settings {
    /// Base URL of the catalog package endpoint
    #[arg(long, env = "ONS_API_URL", global = true)]
    pub ons_api_url: Option<String>,

    /// Bucket used when a run does not name one
    #[arg(long, env = "GCS_BUCKET_NAME", default_value = DEFAULT_BUCKET, global = true)]
    pub default_bucket: String,

    /// Google Cloud project holding the warehouse
    #[arg(long, env = "GOOGLE_CLOUD_PROJECT", global = true)]
    pub project_id: Option<String>,

    /// BigQuery location
    #[arg(long, env = "BIGQUERY_LOCATION", default_value = DEFAULT_LOCATION, global = true)]
    pub bigquery_location: String,

    /// Dataset holding the raw tables used for deduplication
    #[arg(long, env = "BIGQUERY_RAW_DATASET", default_value = DEFAULT_RAW_DATASET, global = true)]
    pub raw_dataset: String,

    /// OAuth bearer token for BigQuery requests
    #[arg(long, env = "GOOGLE_OAUTH_ACCESS_TOKEN", hide_env_values = true, global = true)]
    pub access_token: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Download, normalize and store catalog resources
    Ingest(IngestArgs),
    /// Read a page of the curated reservoir table
    Reservoir(ReservoirArgs),
}

#[derive(Args, Debug)]
pub struct IngestArgs {
    /// First year to ingest (defaults to the current year)
    #[arg(long)]
    pub start_year: Option<i32>,

    /// Last year to ingest (defaults to the current year)
    #[arg(long)]
    pub end_year: Option<i32>,

    /// Catalog package id
    #[arg(long)]
    pub package: Option<String>,

    /// Destination bucket for this run
    #[arg(long)]
    pub bucket: Option<String>,

    /// Number of concurrent downloads
    #[arg(short, long, default_value = "4")]
    pub parallelism: usize,

    /// Cancel unfinished downloads after this many seconds
    #[arg(long)]
    pub run_timeout_secs: Option<u64>,

    /// Print the report as JSON instead of a summary
    #[arg(long)]
    pub json: bool,

    /// Write per-resource stats to this CSV file
    #[arg(long)]
    pub stats_csv: Option<PathBuf>,
}

impl IngestArgs {
    pub fn filter(&self) -> SelectionFilter {
        SelectionFilter {
            start_year: self.start_year,
            end_year: self.end_year,
            package: self.package.clone(),
            bucket: self.bucket.clone(),
        }
    }
}

#[derive(Args, Debug)]
pub struct ReservoirArgs {
    /// Start date (YYYY-MM-DD)
    #[arg(long)]
    pub start_date: NaiveDate,

    /// End date (YYYY-MM-DD)
    #[arg(long)]
    pub end_date: NaiveDate,

    /// Page number
    #[arg(long, default_value = "1")]
    pub page: u32,

    /// Records per page
    #[arg(long, default_value = "100")]
    pub page_size: u32,
}
