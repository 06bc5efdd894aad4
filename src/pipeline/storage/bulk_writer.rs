use super::traits::{BulkUpsertSummary, Document, RecordStore, UpsertOp};
use crate::common::constants::*;
use crate::common::error::Result;
use crate::observability::metrics;
use crate::pipeline::processing::candidate::CandidateRecord;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

impl CandidateRecord {
    /// Keyed upsert for this candidate. Known values go to `set`; defaults for
    /// the unknown optional fields go to `on_insert` so they never blank a
    /// value an earlier run already filled.
    pub fn to_upsert_op(&self) -> UpsertOp {
        let mut set = Document::new();
        set.insert(FIELD_NAME.into(), json!(self.name));
        set.insert(FIELD_RATING.into(), json!(self.average_score));
        set.insert(FIELD_NUM_VOTES.into(), json!(self.vote_count));
        set.insert(FIELD_GENRES.into(), json!(self.genres));
        set.insert(
            FIELD_RELEASE_DATE.into(),
            self.release_date
                .map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
                .unwrap_or(Value::Null),
        );

        let mut on_insert = Document::new();
        let mut text = |field: &str, value: &Option<String>| match value {
            Some(v) => set.insert(field.into(), json!(v)),
            None => on_insert.insert(field.into(), json!("")),
        };
        text(FIELD_DESCRIPTION, &self.description);
        text(FIELD_POSTER_URL, &self.poster_url);
        text(FIELD_DIRECTOR, &self.director);

        match self.duration_minutes {
            Some(m) => set.insert(FIELD_DURATION.into(), json!(m)),
            None => on_insert.insert(FIELD_DURATION.into(), json!(0)),
        };

        UpsertOp {
            key: self.external_id.clone(),
            set,
            on_insert,
        }
    }
}

/// Outcome of one submitted batch
#[derive(Debug)]
pub struct BatchReport {
    pub index: usize,
    pub size: usize,
    pub result: Result<BulkUpsertSummary>,
}

/// Totals across every batch of one write
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriteTotals {
    pub matched: usize,
    pub inserted: usize,
    pub failed_items: usize,
    pub failed_batches: usize,
}

impl WriteTotals {
    pub fn from_reports(reports: &[BatchReport]) -> Self {
        reports.iter().fold(Self::default(), |mut acc, r| {
            match &r.result {
                Ok(s) => {
                    acc.matched += s.matched;
                    acc.inserted += s.inserted;
                    acc.failed_items += s.failed;
                }
                Err(_) => acc.failed_batches += 1,
            }
            acc
        })
    }
}

/// Upserts candidates in fixed-size, independent batches
pub struct BulkWriter {
    store: Arc<dyn RecordStore>,
    batch_size: usize,
}

impl BulkWriter {
    pub fn new(store: Arc<dyn RecordStore>, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Writes every batch in order. A failing batch is reported and the
    /// remaining batches are still submitted.
    pub async fn write(&self, candidates: &[CandidateRecord]) -> Vec<BatchReport> {
        let mut reports = Vec::new();

        for (index, chunk) in candidates.chunks(self.batch_size).enumerate() {
            let ops = chunk.iter().map(CandidateRecord::to_upsert_op).collect();
            let result = self.store.bulk_upsert(ops).await;

            match &result {
                Ok(summary) => {
                    info!(
                        "Batch {} ({} records): {} matched, {} inserted, {} failed",
                        index,
                        chunk.len(),
                        summary.matched,
                        summary.inserted,
                        summary.failed
                    );
                    for err in &summary.errors {
                        warn!("Batch {} item failed: {}", index, err);
                    }
                    metrics::writer::batch_written(summary);
                }
                Err(e) => {
                    warn!("Batch {} ({} records) failed: {}", index, chunk.len(), e);
                    metrics::writer::batch_error();
                }
            }

            reports.push(BatchReport {
                index,
                size: chunk.len(),
                result,
            });
        }
        reports
    }
}
