use anyhow::{anyhow, bail, Context};
use cinephile_importer::common::constants::{
    BASICS_DATASET_FILE, DATASET_DOWNLOAD_TIMEOUT_SECS, DEFAULT_DATASET_BASE_URL, DEFAULT_MIN_VOTES,
    DEFAULT_TOP_N, ENV_QUEUE_DB, RATINGS_DATASET_FILE,
};
use cinephile_importer::config::AppConfig;
use cinephile_importer::infra::{DatasetDownloader, DatasetLocation, OmdbClient};
use cinephile_importer::logging;
use cinephile_importer::observability;
use cinephile_importer::pipeline::import::{backfill_missing, ImportOptions, Importer};
use cinephile_importer::pipeline::processing::Enricher;
use cinephile_importer::pipeline::storage::traits::RecordFilter;
use cinephile_importer::queue::{
    BackendKind, DurableQueue, InsertRecordHandler, JobQueue, QueueService,
};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "cinephile_importer")]
#[command(about = "Imports ranked titles from tab-separated dumps, with optional OMDb enrichment")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join, rank, optionally enrich, and upsert the top titles
    Import {
        /// Title basics dump (.tsv or .tsv.gz)
        #[arg(long, conflicts_with = "basics_url")]
        basics: Option<PathBuf>,
        /// Title ratings dump (.tsv or .tsv.gz)
        #[arg(long, conflicts_with = "ratings_url")]
        ratings: Option<PathBuf>,
        /// Download the basics dump from this URL instead of reading a file
        #[arg(long)]
        basics_url: Option<String>,
        /// Download the ratings dump from this URL instead of reading a file
        #[arg(long)]
        ratings_url: Option<String>,
        /// Fetch any dump not given above from the public dataset host
        #[arg(long)]
        remote: bool,
        /// How many titles to keep
        #[arg(long, default_value_t = DEFAULT_TOP_N)]
        top: usize,
        /// Minimum vote count for a title to be considered
        #[arg(long, default_value_t = DEFAULT_MIN_VOTES)]
        min_votes: u64,
        /// Fill missing fields from OMDb (needs OMDB_API_KEY)
        #[arg(long)]
        enrich: bool,
    },
    /// Enrich stored records that lack a poster or description
    EnrichMissing {
        /// Consider at most this many records
        #[arg(long)]
        limit: Option<u64>,
    },
    /// Delete stored records without an imdbId
    Cleanup,
    /// Submit a record-creation request through the job queue
    Enqueue {
        /// JSON document, or @path to read it from a file
        #[arg(long)]
        payload: String,
    },
    /// Run durable queue workers until Ctrl-C
    Worker,
    /// Requeue durable jobs whose lease expired
    QueueMaintenance {
        /// Repeat every N seconds instead of running once
        #[arg(long)]
        interval_secs: Option<u64>,
    },
    /// Show the state of a durable job
    Job {
        #[arg(long)]
        id: String,
    },
}

fn build_enricher(config: &AppConfig, api_key: &str) -> anyhow::Result<Enricher> {
    let tuning = &config.tuning.enrichment;
    let client = OmdbClient::new(
        tuning.base_url.clone(),
        api_key,
        Duration::from_secs(tuning.timeout_secs),
    )?;
    Ok(Enricher::new(Arc::new(client), tuning.settings()))
}

/// Resolves one dump from its path, URL or `--remote` default
fn dataset_location(
    flag: &str,
    path: Option<PathBuf>,
    url: Option<String>,
    remote: bool,
    file: &str,
) -> anyhow::Result<DatasetLocation> {
    match (path, url) {
        (Some(path), _) => Ok(DatasetLocation::Path(path)),
        (None, Some(url)) => Ok(DatasetLocation::Url(url)),
        (None, None) if remote => Ok(DatasetLocation::on_host(DEFAULT_DATASET_BASE_URL, file)),
        (None, None) => bail!("One of --{flag}, --{flag}-url or --remote is required"),
    }
}

fn read_payload(raw: &str) -> anyhow::Result<Value> {
    let text = match raw.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path).with_context(|| format!("Failed to read payload file {path}"))?,
        None => raw.to_string(),
    };
    serde_json::from_str(&text).context("Payload is not valid JSON")
}

fn durable_queue(config: &AppConfig) -> anyhow::Result<DurableQueue> {
    let Some(broker) = config.queue_db.as_deref() else {
        bail!("{ENV_QUEUE_DB} is not set; the durable queue is not configured");
    };
    let store = config.database.open().context("Failed to open record store")?;
    let handler = Arc::new(InsertRecordHandler::new(store));
    Ok(DurableQueue::open(broker, config.tuning.queue.settings(), handler)?)
}

/// Flips the returned receiver to true on Ctrl-C
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            let _ = tx.send(true);
        }
    });
    rx
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let config = AppConfig::load().context("Failed to load configuration")?;
    let _log_guard = logging::init_logging(&config.log_dir)?;

    if let Some(port) = config.metrics_port {
        observability::init(port).map_err(|e| anyhow!("{e}"))?;
    }

    match cli.command {
        Commands::Import {
            basics,
            ratings,
            basics_url,
            ratings_url,
            remote,
            top,
            min_votes,
            enrich,
        } => {
            let basics = dataset_location("basics", basics, basics_url, remote, BASICS_DATASET_FILE)?;
            let ratings = dataset_location("ratings", ratings, ratings_url, remote, RATINGS_DATASET_FILE)?;

            // Held until the import finishes; dropping it removes the downloads
            let downloader = DatasetDownloader::new(Duration::from_secs(DATASET_DOWNLOAD_TIMEOUT_SECS))?;
            let ratings = downloader
                .materialize(&ratings)
                .await
                .context("Failed to fetch ratings dump")?;
            let basics = downloader
                .materialize(&basics)
                .await
                .context("Failed to fetch basics dump")?;

            let store = config.database.open().context("Failed to open record store")?;
            let mut importer = Importer::new(store, config.tuning.writer.batch_size);

            if enrich {
                match config.omdb_api_key.as_deref() {
                    Some(key) => importer = importer.with_enricher(build_enricher(&config, key)?),
                    None => warn!("OMDB_API_KEY not set; continuing without enrichment"),
                }
            }

            let report = importer
                .run(&ImportOptions {
                    basics,
                    ratings,
                    top_n: top,
                    min_votes,
                })
                .await?;

            println!("\n📊 Import results:");
            println!("   Ratings indexed: {}", report.ratings_indexed);
            println!("   Candidates: {}", report.assembly.assembled);
            println!("   Selected: {}", report.selected);
            if let Some(e) = &report.enrichment {
                println!(
                    "   Enrichment: {} succeeded, {} failed, {} skipped",
                    e.succeeded, e.failed, e.skipped
                );
            }
            println!(
                "   Written: {} inserted, {} updated, {} failed",
                report.totals.inserted, report.totals.matched, report.totals.failed_items
            );

            drop(downloader);
            if report.all_batches_failed() {
                bail!("All {} write batches failed", report.batches);
            }
        }
        Commands::EnrichMissing { limit } => {
            let key = config.require_api_key()?;
            let enricher = build_enricher(&config, key)?;
            let store = config.database.open().context("Failed to open record store")?;

            let report = backfill_missing(store.as_ref(), &enricher, limit).await?;
            println!(
                "✅ Enrichment completed: {} scanned, {} updated, {} lookups failed",
                report.scanned, report.updated, report.enrichment.failed
            );
        }
        Commands::Cleanup => {
            let store = config.database.open().context("Failed to open record store")?;
            let removed = store.delete_matching(RecordFilter::MissingExternalId).await?;
            println!("🧹 Deleted {} records without imdbId", removed);
        }
        Commands::Enqueue { payload } => {
            let payload = read_payload(&payload)?;
            let store = config.database.open().context("Failed to open record store")?;
            let handler = Arc::new(InsertRecordHandler::new(store));
            let service = QueueService::from_settings(
                config.tuning.queue.settings(),
                config.queue_db.as_deref(),
                handler,
            )?;

            let id = service.enqueue(payload).await?;
            println!("{id}");

            // In-process jobs die with the process, so see them through here
            if service.backend_kind() == BackendKind::Ephemeral {
                service.drain().await?;
                if let Some(job) = service.job(&id).await? {
                    info!("Job {} finished as {} after {} attempt(s)", job.id, job.state, job.attempts);
                }
            }
        }
        Commands::Worker => {
            let queue = durable_queue(&config)?;
            queue.run_workers(shutdown_signal()).await?;
        }
        Commands::QueueMaintenance { interval_secs } => {
            let queue = durable_queue(&config)?;
            match interval_secs {
                None => {
                    let sweep = queue.requeue_expired_leases().await?;
                    println!("♻️  Requeued {}, failed {}", sweep.requeued, sweep.failed);
                }
                Some(secs) => {
                    let mut shutdown = shutdown_signal();
                    info!("Sweeping expired leases every {}s", secs);
                    loop {
                        if let Err(e) = queue.requeue_expired_leases().await {
                            warn!("Lease sweep failed: {}", e);
                        }
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_secs(secs.max(1))) => {}
                            _ = shutdown.changed() => break,
                        }
                    }
                }
            }
        }
        Commands::Job { id } => {
            let queue = durable_queue(&config)?;
            match queue.job(&id).await? {
                Some(job) => {
                    println!("id:       {}", job.id);
                    println!("state:    {}", job.state);
                    println!("attempts: {}", job.attempts);
                    if let Some(err) = &job.last_error {
                        println!("error:    {}", err);
                    }
                    println!("updated:  {}", job.updated_at.to_rfc3339());
                }
                None => bail!("No job with id {id}"),
            }
        }
    }

    Ok(())
}
