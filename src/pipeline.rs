use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Datelike, Local, NaiveDate};
use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::catalog::Catalog;
use crate::error::{IngestError, TaskFailure};
use crate::fetcher::SourceFetcher;
use crate::selector::Selection;
use crate::storage::BlobStore;
use crate::transcode::{destination_path, transcode};
use crate::types::{DownloadOutcome, DownloadTask, FileFormat, IngestionReport, SelectionFilter};
use crate::warehouse::DedupCheck;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Maximum number of resources processed at once.
    pub parallelism: usize,
    /// Format ranking, best first.
    pub preferences: Vec<FileFormat>,
    /// Cancels tasks still running after this long.
    pub run_timeout: Option<Duration>,
    pub show_progress: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            parallelism: 4,
            preferences: FileFormat::DEFAULT_PREFERENCE.to_vec(),
            run_timeout: None,
            show_progress: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStage {
    Idle,
    Fetching,
    Selecting,
    Downloading,
    Aggregated,
}

impl RunStage {
    fn advance(self, next: RunStage) -> RunStage {
        info!("Pipeline stage: {:?} -> {:?}", self, next);
        next
    }
}

/// Handles shared read-only by every task of a run.
struct TaskContext {
    fetcher: Arc<dyn SourceFetcher>,
    dedup: DedupCheck,
    storage: Arc<dyn BlobStore>,
}

pub struct Pipeline {
    config: PipelineConfig,
    catalog: Arc<dyn Catalog>,
    ctx: Arc<TaskContext>,
    clock: Arc<dyn Fn() -> NaiveDate + Send + Sync>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        catalog: Arc<dyn Catalog>,
        fetcher: Arc<dyn SourceFetcher>,
        dedup: DedupCheck,
        storage: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            config,
            catalog,
            ctx: Arc::new(TaskContext {
                fetcher,
                dedup,
                storage,
            }),
            clock: Arc::new(|| Local::now().date_naive()),
        }
    }

    /// Replaces the source of "today" used for year defaults and destination paths.
    pub fn with_clock(mut self, clock: impl Fn() -> NaiveDate + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Runs one ingestion. Only catalog, configuration and selection problems are
    /// returned as errors; per-resource failures are recorded in the report.
    pub async fn process_filter(
        &self,
        filter: SelectionFilter,
    ) -> Result<IngestionReport, IngestError> {
        self.process_filter_with_cancel(filter, CancellationToken::new())
            .await
    }

    /// Like [`Pipeline::process_filter`], but cancelling `cancel` marks every
    /// unfinished task of this run as failed. The token only affects this run.
    pub async fn process_filter_with_cancel(
        &self,
        filter: SelectionFilter,
        cancel: CancellationToken,
    ) -> Result<IngestionReport, IngestError> {
        let start_time = Instant::now();
        let today = (self.clock)();
        let (start_year, end_year) = filter.year_range(today.year())?;
        let package = filter.package().to_string();

        let stage = RunStage::Idle.advance(RunStage::Fetching);
        let resources = self.catalog.list_resources(&package).await?;

        let stage = stage.advance(RunStage::Selecting);
        let selection = Selection {
            start_year,
            end_year,
            preferences: &self.config.preferences,
            package: &package,
            bucket: filter.bucket.as_deref(),
            current_year: today.year(),
        };
        let tasks = selection.select_tasks(&resources)?;

        let stage = stage.advance(RunStage::Downloading);
        let outcomes = self.download_all(tasks, today, &cancel).await;

        stage.advance(RunStage::Aggregated);
        let report = IngestionReport::from_outcomes(outcomes, start_time.elapsed());
        info!(
            "Processed {} resources for {}: {} succeeded, {} failed",
            report.total_processed, package, report.success_count, report.failure_count
        );
        Ok(report)
    }

    /// Runs every task with bounded concurrency and waits for all of them.
    /// Outcomes come back in task order.
    async fn download_all(
        &self,
        tasks: Vec<DownloadTask>,
        today: NaiveDate,
        run: &CancellationToken,
    ) -> Vec<DownloadOutcome> {
        let pb = self.create_progress_bar(tasks.len());
        let cancel = run.child_token();

        let deadline = self.config.run_timeout.map(|timeout| {
            let token = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                warn!("Run timeout of {:?} reached, cancelling remaining tasks", timeout);
                token.cancel();
            })
        });

        let outcomes: Vec<DownloadOutcome> = stream::iter(tasks)
            .map(|task| {
                let ctx = Arc::clone(&self.ctx);
                let cancel = cancel.clone();
                let pb = pb.clone();
                async move {
                    let fallback = task.clone();
                    let handle = tokio::spawn(async move {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => {
                                DownloadOutcome::failed(&task, TaskFailure::Cancelled)
                            }
                            outcome = process_task(&ctx, &task, today) => outcome,
                        }
                    });

                    let outcome = match handle.await {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            error!("Task for {} aborted: {}", fallback.url, e);
                            DownloadOutcome::failed(&fallback, TaskFailure::Unexpected(e.to_string()))
                        }
                    };
                    pb.inc(1);
                    outcome
                }
            })
            .buffered(self.config.parallelism.max(1))
            .collect()
            .await;

        if let Some(handle) = deadline {
            handle.abort();
        }
        pb.finish_with_message("done");
        outcomes
    }

    fn create_progress_bar(&self, len: usize) -> ProgressBar {
        if !self.config.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len as u64);
        let style = ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] {msg} [{bar:40.cyan/blue}] {pos}/{len}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
        pb.set_style(style);
        pb.set_message("Ingesting");
        pb
    }
}

async fn process_task(ctx: &TaskContext, task: &DownloadTask, today: NaiveDate) -> DownloadOutcome {
    let start_time = Instant::now();
    let mut outcome = DownloadOutcome::pending(task);

    let result = ingest(ctx, task, today, &mut outcome).await;
    if let Err(failure) = &result {
        error!("Ingestion failed for {}: {}", task.url, failure);
    }
    outcome.finish(result, start_time.elapsed());
    outcome
}

/// Fetch, transcode, dedup and upload one resource. Progress that matters for the
/// report (bytes, destination) is recorded on `outcome` as it happens.
async fn ingest(
    ctx: &TaskContext,
    task: &DownloadTask,
    today: NaiveDate,
    outcome: &mut DownloadOutcome,
) -> Result<String, TaskFailure> {
    let raw = ctx
        .fetcher
        .fetch(&task.url)
        .await
        .map_err(|e| TaskFailure::Fetch(e.to_string()))?;
    outcome.bytes_downloaded = raw.len() as u64;

    let format = task.format;
    let transcoded = tokio::task::spawn_blocking(move || transcode(raw, format))
        .await
        .map_err(|e| TaskFailure::Unexpected(e.to_string()))??;

    let date_column = transcoded
        .date_column
        .as_deref()
        .ok_or(TaskFailure::NoDateColumn)?;

    let destination = destination_path(&task.package, task.year, &task.url, today);
    outcome.destination = destination.clone();

    match transcoded.max_date.as_deref() {
        Some(max_date) => {
            if ctx
                .dedup
                .raw_table_has_value(&task.package, date_column, max_date)
                .await
            {
                info!("{} = {} already in the raw table, skipping {}", date_column, max_date, task.url);
                return Err(TaskFailure::AlreadyExists);
            }
        }
        None => warn!("Column {} of {} has no values, skipping dedup", date_column, task.url),
    }

    ctx.storage
        .upload(transcoded.parquet, &destination, task.bucket.as_deref())
        .await
        .map_err(|e| TaskFailure::Save(e.to_string()))
}
