use thiserror::Error;

/// Run-level failures. These abort a pipeline invocation and are returned to the caller.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("catalog API unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("catalog API returned status {status}: {message}")]
    UpstreamError { status: u16, message: String },

    #[error("no resources selected for package {package} in {start}..={end}")]
    NoResourcesSelected {
        package: String,
        start: i32,
        end: i32,
    },

    #[error("start year {start} is after end year {end}")]
    InvalidYearRange { start: i32, end: i32 },

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("warehouse error: {0}")]
    Warehouse(#[from] crate::warehouse::WarehouseError),
}

/// Per-task failures. Never propagated: each one ends up as the `error`
/// string of a failed `DownloadOutcome`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TaskFailure {
    #[error("failed to fetch: {0}")]
    Fetch(String),

    #[error("failed to read source file: {0}")]
    Read(String),

    #[error("failed to encode parquet: {0}")]
    Encode(String),

    #[error("no date column found")]
    NoDateColumn,

    #[error("data already exists")]
    AlreadyExists,

    #[error("failed to save to storage: {0}")]
    Save(String),

    #[error("unexpected error: {0}")]
    Unexpected(String),

    #[error("cancelled before completion")]
    Cancelled,
}
