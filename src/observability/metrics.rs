//! Metrics for the importer and the job queue.
//!
//! Recording goes through the `metrics` facade; without an installed recorder
//! every call is a no-op, so library code records unconditionally.

use std::fmt;
use std::net::SocketAddr;
use tracing::info;

/// Every metric name used by the crate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricName {
    // Ingest metrics
    IngestRowsRead,
    IngestRatingsIndexed,
    IngestCandidatesAssembled,
    IngestCandidatesSelected,

    // Enrichment metrics
    EnrichSuccess,
    EnrichFailure,
    EnrichSkipped,
    EnrichLookupDuration,

    // Writer metrics
    WriterBatches,
    WriterBatchErrors,
    WriterDocumentsMatched,
    WriterDocumentsInserted,
    WriterDocumentsFailed,

    // Queue metrics
    QueueJobsEnqueued,
    QueueJobsSucceeded,
    QueueJobsRetried,
    QueueJobsFailed,
    QueueLeasesRequeued,
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl MetricName {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::IngestRowsRead => "cinephile_ingest_rows_read_total",
            MetricName::IngestRatingsIndexed => "cinephile_ingest_ratings_indexed",
            MetricName::IngestCandidatesAssembled => "cinephile_ingest_candidates_assembled_total",
            MetricName::IngestCandidatesSelected => "cinephile_ingest_candidates_selected",

            MetricName::EnrichSuccess => "cinephile_enrich_success_total",
            MetricName::EnrichFailure => "cinephile_enrich_failure_total",
            MetricName::EnrichSkipped => "cinephile_enrich_skipped_total",
            MetricName::EnrichLookupDuration => "cinephile_enrich_lookup_duration_seconds",

            MetricName::WriterBatches => "cinephile_writer_batches_total",
            MetricName::WriterBatchErrors => "cinephile_writer_batch_errors_total",
            MetricName::WriterDocumentsMatched => "cinephile_writer_documents_matched_total",
            MetricName::WriterDocumentsInserted => "cinephile_writer_documents_inserted_total",
            MetricName::WriterDocumentsFailed => "cinephile_writer_documents_failed_total",

            MetricName::QueueJobsEnqueued => "cinephile_queue_jobs_enqueued_total",
            MetricName::QueueJobsSucceeded => "cinephile_queue_jobs_succeeded_total",
            MetricName::QueueJobsRetried => "cinephile_queue_jobs_retried_total",
            MetricName::QueueJobsFailed => "cinephile_queue_jobs_failed_total",
            MetricName::QueueLeasesRequeued => "cinephile_queue_leases_requeued_total",
        }
    }

    pub fn all_metrics() -> impl Iterator<Item = MetricName> {
        use MetricName::*;
        [
            IngestRowsRead,
            IngestRatingsIndexed,
            IngestCandidatesAssembled,
            IngestCandidatesSelected,
            EnrichSuccess,
            EnrichFailure,
            EnrichSkipped,
            EnrichLookupDuration,
            WriterBatches,
            WriterBatchErrors,
            WriterDocumentsMatched,
            WriterDocumentsInserted,
            WriterDocumentsFailed,
            QueueJobsEnqueued,
            QueueJobsSucceeded,
            QueueJobsRetried,
            QueueJobsFailed,
            QueueLeasesRequeued,
        ]
        .into_iter()
    }
}

/// Installs the Prometheus recorder with an HTTP scrape listener on `port`.
pub fn init(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {}", e))?;
    info!("Metrics exporter listening on {}", addr);
    Ok(())
}

// ============================================================================
// Ingest Metrics
// ============================================================================

pub mod ingest {
    use super::MetricName;

    /// Rows consumed from one source (`ratings` or `basics`)
    pub fn rows_read(source: &'static str, rows: u64) {
        ::metrics::counter!(MetricName::IngestRowsRead.as_str(), "source" => source).increment(rows);
    }

    pub fn ratings_indexed(count: usize) {
        ::metrics::gauge!(MetricName::IngestRatingsIndexed.as_str()).set(count as f64);
    }

    pub fn candidates_assembled(count: u64) {
        ::metrics::counter!(MetricName::IngestCandidatesAssembled.as_str()).increment(count);
    }

    pub fn candidates_selected(count: usize) {
        ::metrics::gauge!(MetricName::IngestCandidatesSelected.as_str()).set(count as f64);
    }
}

// ============================================================================
// Enrichment Metrics
// ============================================================================

pub mod enrich {
    use super::MetricName;
    use crate::pipeline::processing::enrich::EnrichReport;

    pub fn lookup_duration(secs: f64) {
        ::metrics::histogram!(MetricName::EnrichLookupDuration.as_str()).record(secs);
    }

    /// Adds the totals of one finished enrichment pass
    pub fn batch_finished(report: &EnrichReport) {
        ::metrics::counter!(MetricName::EnrichSuccess.as_str()).increment(report.succeeded as u64);
        ::metrics::counter!(MetricName::EnrichFailure.as_str()).increment(report.failed as u64);
        ::metrics::counter!(MetricName::EnrichSkipped.as_str()).increment(report.skipped as u64);
    }
}

// ============================================================================
// Writer Metrics
// ============================================================================

pub mod writer {
    use super::MetricName;
    use crate::pipeline::storage::traits::BulkUpsertSummary;

    pub fn batch_written(summary: &BulkUpsertSummary) {
        ::metrics::counter!(MetricName::WriterBatches.as_str()).increment(1);
        ::metrics::counter!(MetricName::WriterDocumentsMatched.as_str()).increment(summary.matched as u64);
        ::metrics::counter!(MetricName::WriterDocumentsInserted.as_str()).increment(summary.inserted as u64);
        ::metrics::counter!(MetricName::WriterDocumentsFailed.as_str()).increment(summary.failed as u64);
    }

    pub fn batch_error() {
        ::metrics::counter!(MetricName::WriterBatches.as_str()).increment(1);
        ::metrics::counter!(MetricName::WriterBatchErrors.as_str()).increment(1);
    }
}

// ============================================================================
// Queue Metrics
// ============================================================================

pub mod queue {
    use super::MetricName;

    pub fn job_enqueued(backend: &'static str) {
        ::metrics::counter!(MetricName::QueueJobsEnqueued.as_str(), "backend" => backend).increment(1);
    }

    pub fn job_succeeded(backend: &'static str) {
        ::metrics::counter!(MetricName::QueueJobsSucceeded.as_str(), "backend" => backend).increment(1);
    }

    pub fn job_retried(backend: &'static str) {
        ::metrics::counter!(MetricName::QueueJobsRetried.as_str(), "backend" => backend).increment(1);
    }

    pub fn job_failed(backend: &'static str) {
        ::metrics::counter!(MetricName::QueueJobsFailed.as_str(), "backend" => backend).increment(1);
    }

    pub fn leases_requeued(count: usize) {
        ::metrics::counter!(MetricName::QueueLeasesRequeued.as_str()).increment(count as u64);
    }
}
