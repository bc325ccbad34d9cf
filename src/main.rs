use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use colored::*;
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use ons_ingest::catalog::CatalogClient;
use ons_ingest::cli::{Cli, Command, IngestArgs, ReservoirArgs, Settings};
use ons_ingest::fetcher::HttpFetcher;
use ons_ingest::report::write_stats_csv;
use ons_ingest::storage::ObjectStoreWriter;
use ons_ingest::warehouse::{fetch_reservoir_page, BigQueryWarehouse, DedupCheck, ReservoirQuery};
use ons_ingest::{IngestionReport, Pipeline, PipelineConfig};

const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    info!("Starting ONS ingestion");

    let cli = Cli::parse();
    match cli.command {
        Command::Ingest(args) => ingest(&cli.settings, args).await,
        Command::Reservoir(args) => reservoir(&cli.settings, args).await,
    }
}

fn warehouse(settings: &Settings) -> anyhow::Result<Arc<BigQueryWarehouse>> {
    let warehouse = BigQueryWarehouse::new(
        settings.project_id.clone(),
        settings.bigquery_location.clone(),
        settings.access_token.clone(),
        CLIENT_TIMEOUT,
    )
    .context("failed to create BigQuery client")?;
    Ok(Arc::new(warehouse))
}

async fn ingest(settings: &Settings, args: IngestArgs) -> anyhow::Result<()> {
    info!("CLI arguments parsed: parallelism={}", args.parallelism);

    let catalog = CatalogClient::new(settings.ons_api_url.as_deref(), CLIENT_TIMEOUT)?;
    let fetcher = HttpFetcher::new(HttpFetcher::DEFAULT_TIMEOUT)
        .context("failed to create download client")?;
    let dedup = DedupCheck::new(warehouse(settings)?, settings.raw_dataset.clone());
    let storage = ObjectStoreWriter::gcs(settings.default_bucket.clone());

    let config = PipelineConfig {
        parallelism: args.parallelism,
        run_timeout: args.run_timeout_secs.map(Duration::from_secs),
        show_progress: !args.json,
        ..Default::default()
    };
    let pipeline = Pipeline::new(
        config,
        Arc::new(catalog),
        Arc::new(fetcher),
        dedup,
        Arc::new(storage),
    );

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling unfinished downloads");
            token.cancel();
        }
    });

    let report = match pipeline.process_filter_with_cancel(args.filter(), cancel).await {
        Ok(report) => report,
        Err(e) => {
            error!("Ingestion failed: {}", e);
            eprintln!("{}", "Ingestion failed".red());
            return Err(e.into());
        }
    };

    if let Some(path) = &args.stats_csv {
        if let Err(e) = write_stats_csv(&report, path) {
            error!("Failed to write stats CSV: {}", e);
        }
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_summary(&report);
    }

    if report.failure_count > 0 {
        bail!("{} of {} resources failed", report.failure_count, report.total_processed);
    }
    Ok(())
}

fn print_summary(report: &IngestionReport) {
    let mb = report.total_bytes_downloaded as f64 / 1_048_576.0;
    println!("\n{}", "Ingestion Summary:".bold());
    println!("Total processed: {} resources", report.total_processed);
    println!("Succeeded: {}", report.success_count.to_string().green());
    println!("Failed: {}", report.failure_count.to_string().red());
    println!("Total data downloaded: {:.2} MB", mb);
    println!("Total duration: {:.2?}", report.total_duration);

    if report.success_count > 0 {
        println!("\n{}", "Stored:".green().bold());
        for outcome in &report.success_downloads {
            println!(
                "✓ {} ({}, {:.2} MB in {:.2?})",
                outcome.location.green(),
                outcome.year,
                outcome.bytes_downloaded as f64 / 1_048_576.0,
                outcome.duration
            );
        }
    }

    if report.failure_count > 0 {
        println!("\n{}", "Failed:".red().bold());
        for outcome in &report.failed_downloads {
            println!("✗ {} - Error: {}", outcome.url.red(), outcome.error);
            if !outcome.destination.is_empty() {
                println!("  Destination: {}", outcome.destination);
            }
        }
    } else {
        println!("\n{}", "All resources ingested successfully".green());
    }
}

async fn reservoir(settings: &Settings, args: ReservoirArgs) -> anyhow::Result<()> {
    let warehouse = warehouse(settings)?;
    let query = ReservoirQuery {
        start_date: args.start_date,
        end_date: args.end_date,
        page: args.page,
        page_size: args.page_size,
    };

    let page = fetch_reservoir_page(warehouse.as_ref(), &query)
        .await
        .context("reservoir query failed")?;
    println!("{}", serde_json::to_string_pretty(&page)?);
    Ok(())
}
