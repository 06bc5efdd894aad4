use crate::common::constants::{COL_AVERAGE_RATING, COL_NUM_VOTES, COL_TCONST};
use crate::common::error::Result;
use crate::observability::metrics;
use crate::pipeline::ingestion::tsv_reader::Row;
use std::collections::HashMap;
use tracing::info;

/// Score statistics for a single title
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RatingRecord {
    pub average_score: f64,
    pub vote_count: u64,
}

/// In-memory lookup from external id to rating, built once per run and
/// read-only afterwards.
#[derive(Debug, Default)]
pub struct RatingIndex {
    entries: HashMap<String, RatingRecord>,
}

impl RatingIndex {
    /// Consumes every row of the ratings source. Rows whose vote count is
    /// missing, not a finite number, or below `min_votes` are left out.
    pub fn build<I>(rows: I, min_votes: u64) -> Result<Self>
    where
        I: IntoIterator<Item = Result<Row>>,
    {
        let mut entries = HashMap::new();
        let mut scanned: u64 = 0;

        for row in rows {
            let row = row?;
            scanned += 1;

            let Some(id) = row.get(COL_TCONST) else { continue };
            let Some(vote_count) = row.get(COL_NUM_VOTES).and_then(parse_vote_count) else {
                continue;
            };
            if vote_count < min_votes {
                continue;
            }

            let average_score = row
                .get(COL_AVERAGE_RATING)
                .and_then(|s| s.trim().parse::<f64>().ok())
                .filter(|v| v.is_finite())
                .unwrap_or(0.0);

            entries.insert(
                id.to_string(),
                RatingRecord {
                    average_score,
                    vote_count,
                },
            );
        }

        info!(
            "Ratings loaded: {} of {} rows with at least {} votes",
            entries.len(),
            scanned,
            min_votes
        );
        metrics::ingest::rows_read("ratings", scanned);
        metrics::ingest::ratings_indexed(entries.len());

        Ok(Self { entries })
    }

    pub fn get(&self, external_id: &str) -> Option<&RatingRecord> {
        self.entries.get(external_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn parse_vote_count(raw: &str) -> Option<u64> {
    let value = raw.trim().parse::<f64>().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some(value as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::constants::RATINGS_COLUMNS;
    use crate::pipeline::ingestion::tsv_reader::TsvReader;
    use tempfile::tempdir;

    fn index_from(contents: &str, min_votes: u64) -> RatingIndex {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ratings.tsv");
        std::fs::write(&path, contents).unwrap();
        RatingIndex::build(TsvReader::open(&path, RATINGS_COLUMNS).unwrap(), min_votes).unwrap()
    }

    #[test]
    fn threshold_is_inclusive() {
        let index = index_from(
            "tconst\taverageRating\tnumVotes\ntt1\t7.1\t50000\ntt2\t8.0\t49999\n",
            50_000,
        );
        assert_eq!(index.len(), 1);
        assert_eq!(
            index.get("tt1"),
            Some(&RatingRecord {
                average_score: 7.1,
                vote_count: 50_000
            })
        );
        assert!(index.get("tt2").is_none());
    }

    #[test]
    fn missing_or_garbage_vote_counts_are_excluded() {
        let index = index_from(
            "tconst\taverageRating\tnumVotes\ntt1\t7.0\t\\N\ntt2\t7.0\tabc\ntt3\t7.0\tinf\ntt4\t7.0\t10\n",
            0,
        );
        assert_eq!(index.len(), 1);
        assert!(index.get("tt4").is_some());
    }

    #[test]
    fn unparsable_score_defaults_to_zero_and_last_row_wins() {
        let index = index_from(
            "tconst\taverageRating\tnumVotes\ntt1\t\\N\t10\ntt1\tNaN\t20\n",
            0,
        );
        let rec = index.get("tt1").unwrap();
        assert_eq!(rec.average_score, 0.0);
        assert_eq!(rec.vote_count, 20);
    }
}
