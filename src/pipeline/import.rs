//! Batch import: ratings pass, basics pass, ranking, optional enrichment and
//! the bulk write, in that order.

use crate::common::constants::{BASICS_COLUMNS, FIELD_DESCRIPTION, FIELD_DIRECTOR, FIELD_DURATION, FIELD_POSTER_URL, RATINGS_COLUMNS};
use crate::common::error::{ImporterError, Result};
use crate::observability::metrics;
use crate::pipeline::ingestion::{RatingIndex, TsvReader};
use crate::pipeline::processing::candidate::{assemble, AssemblyStats, CandidateRecord};
use crate::pipeline::processing::enrich::{EnrichReport, Enricher};
use crate::pipeline::processing::ranker;
use crate::pipeline::storage::traits::{Document, RecordFilter, RecordStore, SortSpec};
use crate::pipeline::storage::{BulkWriter, WriteTotals};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument, warn};

/// Page size used when scanning stored records for backfill
const BACKFILL_PAGE: u64 = 500;

#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub basics: PathBuf,
    pub ratings: PathBuf,
    pub top_n: usize,
    pub min_votes: u64,
}

#[derive(Debug)]
pub struct ImportReport {
    pub ratings_indexed: usize,
    pub assembly: AssemblyStats,
    pub selected: usize,
    /// `None` when enrichment did not run
    pub enrichment: Option<EnrichReport>,
    pub batches: usize,
    pub totals: WriteTotals,
}

impl ImportReport {
    /// True when there was something to write and no batch made it
    pub fn all_batches_failed(&self) -> bool {
        self.batches > 0 && self.totals.failed_batches == self.batches
    }
}

/// Runs the import against one record store
pub struct Importer {
    store: Arc<dyn RecordStore>,
    enricher: Option<Enricher>,
    batch_size: usize,
}

impl Importer {
    pub fn new(store: Arc<dyn RecordStore>, batch_size: usize) -> Self {
        Self {
            store,
            enricher: None,
            batch_size,
        }
    }

    pub fn with_enricher(mut self, enricher: Enricher) -> Self {
        self.enricher = Some(enricher);
        self
    }

    #[instrument(skip(self), fields(top_n = options.top_n, min_votes = options.min_votes))]
    pub async fn run(&self, options: &ImportOptions) -> Result<ImportReport> {
        let started = Instant::now();

        let opts = options.clone();
        let (mut selected, ratings_indexed, assembly) =
            tokio::task::spawn_blocking(move || select_candidates(&opts))
                .await
                .map_err(|e| ImporterError::Io(std::io::Error::other(format!("selection task failed: {e}"))))??;

        info!(
            "Selected {} of {} candidates ({} ratings indexed)",
            selected.len(),
            assembly.assembled,
            ratings_indexed
        );

        let enrichment = match &self.enricher {
            Some(enricher) => Some(enricher.enrich(&mut selected).await),
            None => None,
        };

        let writer = BulkWriter::new(Arc::clone(&self.store), self.batch_size);
        let reports = writer.write(&selected).await;
        let totals = WriteTotals::from_reports(&reports);

        info!(
            "Import finished in {:.1}s: {} inserted, {} matched, {} failed items, {} failed batches",
            started.elapsed().as_secs_f64(),
            totals.inserted,
            totals.matched,
            totals.failed_items,
            totals.failed_batches
        );

        Ok(ImportReport {
            ratings_indexed,
            assembly,
            selected: selected.len(),
            enrichment,
            batches: reports.len(),
            totals,
        })
    }
}

/// Both source passes plus ranking. Blocking; run off the async workers.
fn select_candidates(options: &ImportOptions) -> Result<(Vec<CandidateRecord>, usize, AssemblyStats)> {
    // Open both sources up front so a bad basics path fails before the long ratings pass.
    let ratings = TsvReader::open(&options.ratings, RATINGS_COLUMNS)?;
    let basics = TsvReader::open(&options.basics, BASICS_COLUMNS)?;

    let index = RatingIndex::build(ratings, options.min_votes)?;

    let mut assembler = assemble(basics, &index);
    let selected = ranker::select(assembler.by_ref(), options.top_n)?;
    let stats = assembler.stats();

    info!(
        "Basics pass: {} rows, {} wrong category, {} restricted, {} unrated, {} unnamed",
        stats.scanned, stats.wrong_category, stats.restricted, stats.unrated, stats.unnamed
    );
    metrics::ingest::rows_read("basics", stats.scanned);
    metrics::ingest::candidates_assembled(stats.assembled);
    metrics::ingest::candidates_selected(selected.len());

    Ok((selected, index.len(), stats))
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BackfillReport {
    pub scanned: usize,
    pub enrichment: EnrichReport,
    pub updated: usize,
    pub update_errors: usize,
}

/// Enriches already-stored records that lack a poster or description and
/// writes back only the fields that were filled. `limit` caps how many
/// records are considered.
pub async fn backfill_missing(
    store: &dyn RecordStore,
    enricher: &Enricher,
    limit: Option<u64>,
) -> Result<BackfillReport> {
    let cap = limit.unwrap_or(u64::MAX);
    let mut stored = Vec::new();
    let mut skip = 0;

    while (stored.len() as u64) < cap {
        let want = BACKFILL_PAGE.min(cap - stored.len() as u64);
        let page = store
            .find_page(RecordFilter::MissingEnrichment, SortSpec::default(), skip, want)
            .await?;
        if page.items.is_empty() {
            break;
        }
        skip += page.items.len() as u64;
        stored.extend(page.items);
    }

    let mut report = BackfillReport {
        scanned: stored.len(),
        ..Default::default()
    };
    let before: Vec<CandidateRecord> = stored.iter().filter_map(CandidateRecord::from_stored).collect();
    info!("{} stored records missing enrichment, {} with an external id", stored.len(), before.len());

    let mut after = before.clone();
    report.enrichment = enricher.enrich(&mut after).await;

    for (old, new) in before.iter().zip(&after) {
        let patch = filled_fields(old, new);
        if patch.is_empty() {
            continue;
        }
        match store.upsert_by_key(&new.external_id, patch, Document::new()).await {
            Ok(_) => report.updated += 1,
            Err(e) => {
                warn!("Failed to update {}: {}", new.external_id, e);
                report.update_errors += 1;
            }
        }
    }

    info!("Backfill updated {} records", report.updated);
    Ok(report)
}

/// Document fields that went from missing to known between two versions
fn filled_fields(before: &CandidateRecord, after: &CandidateRecord) -> Document {
    let mut set = Document::new();
    let pairs = [
        (FIELD_DESCRIPTION, &before.description, &after.description),
        (FIELD_POSTER_URL, &before.poster_url, &after.poster_url),
        (FIELD_DIRECTOR, &before.director, &after.director),
    ];
    for (field, old, new) in pairs {
        if let (None, Some(v)) = (old, new) {
            set.insert(field.to_string(), json!(v));
        }
    }
    if let (None, Some(m)) = (before.duration_minutes, after.duration_minutes) {
        set.insert(FIELD_DURATION.to_string(), json!(m));
    }
    set
}
