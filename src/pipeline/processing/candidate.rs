use crate::common::constants::*;
use crate::common::error::Result;
use crate::pipeline::ingestion::rating_index::RatingIndex;
use crate::pipeline::ingestion::tsv_reader::Row;
use crate::pipeline::storage::traits::{Document, StoredRecord};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A joined, filtered title eligible for ranking and persistence.
///
/// Optional descriptive fields are `None` while unknown; enrichment only ever
/// fills a `None`, it never replaces a value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub external_id: String,
    pub name: String,
    pub release_date: Option<NaiveDate>,
    pub duration_minutes: Option<u32>,
    pub genres: Vec<String>,
    pub average_score: f64,
    pub vote_count: u64,
    pub description: Option<String>,
    pub poster_url: Option<String>,
    pub director: Option<String>,
}

impl CandidateRecord {
    /// True when at least one field that a lookup can supply is still missing
    pub fn needs_enrichment(&self) -> bool {
        self.description.is_none()
            || self.poster_url.is_none()
            || self.director.is_none()
            || self.duration_minutes.is_none()
    }

    /// Rebuilds a candidate from a stored document. Empty strings, zero
    /// durations and the OMDb placeholder all count as missing. Returns `None`
    /// for documents without an external id or a name.
    pub fn from_stored(record: &StoredRecord) -> Option<Self> {
        let doc = &record.fields;
        let external_id = record.external_id.clone().filter(|s| !s.is_empty())?;
        let name = known_str(doc, FIELD_NAME)?;

        Some(Self {
            external_id,
            name,
            release_date: doc
                .get(FIELD_RELEASE_DATE)
                .and_then(Value::as_str)
                .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()),
            duration_minutes: doc
                .get(FIELD_DURATION)
                .and_then(Value::as_u64)
                .and_then(|d| u32::try_from(d).ok())
                .filter(|d| *d > 0),
            genres: doc
                .get(FIELD_GENRES)
                .and_then(Value::as_array)
                .map(|a| a.iter().filter_map(|g| g.as_str().map(str::to_string)).collect())
                .unwrap_or_default(),
            average_score: doc.get(FIELD_RATING).and_then(Value::as_f64).unwrap_or(0.0),
            vote_count: doc.get(FIELD_NUM_VOTES).and_then(Value::as_u64).unwrap_or(0),
            description: known_str(doc, FIELD_DESCRIPTION),
            poster_url: known_str(doc, FIELD_POSTER_URL),
            director: known_str(doc, FIELD_DIRECTOR),
        })
    }
}

fn known_str(doc: &Document, field: &str) -> Option<String> {
    doc.get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty() && *s != OMDB_PLACEHOLDER)
        .map(str::to_string)
}

/// Counts of rows dropped by each assembler filter
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AssemblyStats {
    pub scanned: u64,
    pub wrong_category: u64,
    pub restricted: u64,
    pub unrated: u64,
    pub unnamed: u64,
    pub assembled: u64,
}

/// Lazy join of the basics stream against a [`RatingIndex`].
pub struct Assembler<'a, I> {
    rows: I,
    index: &'a RatingIndex,
    stats: AssemblyStats,
}

/// Streams `rows`, keeping feature films that are not restricted, have a
/// rating entry and resolve to a non-empty name.
pub fn assemble<I>(rows: I, index: &RatingIndex) -> Assembler<'_, I::IntoIter>
where
    I: IntoIterator<Item = Result<Row>>,
{
    Assembler {
        rows: rows.into_iter(),
        index,
        stats: AssemblyStats::default(),
    }
}

impl<I> Assembler<'_, I> {
    pub fn stats(&self) -> AssemblyStats {
        self.stats
    }

    fn candidate_from(&mut self, row: &Row) -> Option<CandidateRecord> {
        self.stats.scanned += 1;

        if row.get(COL_TITLE_TYPE) != Some(TARGET_TITLE_TYPE) {
            self.stats.wrong_category += 1;
            return None;
        }
        if row.get(COL_IS_ADULT) == Some(RESTRICTED_FLAG) {
            self.stats.restricted += 1;
            return None;
        }

        let index = self.index;
        let external_id = row.get(COL_TCONST)?;
        let Some(rating) = index.get(external_id) else {
            self.stats.unrated += 1;
            return None;
        };

        let name = row
            .get(COL_PRIMARY_TITLE)
            .or_else(|| row.get(COL_ORIGINAL_TITLE))
            .map(str::trim)
            .unwrap_or_default();
        if name.is_empty() {
            self.stats.unnamed += 1;
            return None;
        }

        self.stats.assembled += 1;
        Some(CandidateRecord {
            external_id: external_id.to_string(),
            name: name.to_string(),
            release_date: row
                .get(COL_START_YEAR)
                .and_then(|y| y.trim().parse::<i32>().ok())
                .and_then(|y| NaiveDate::from_ymd_opt(y, 1, 1)),
            duration_minutes: row
                .get(COL_RUNTIME_MINUTES)
                .and_then(|m| m.trim().parse::<u32>().ok())
                .filter(|m| *m > 0),
            genres: row
                .get(COL_GENRES)
                .map(|g| {
                    g.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            average_score: rating.average_score,
            vote_count: rating.vote_count,
            description: None,
            poster_url: None,
            director: None,
        })
    }
}

impl<I> Iterator for Assembler<'_, I>
where
    I: Iterator<Item = Result<Row>>,
{
    type Item = Result<CandidateRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let row = match self.rows.next()? {
                Ok(row) => row,
                Err(e) => return Some(Err(e)),
            };
            if let Some(candidate) = self.candidate_from(&row) {
                return Some(Ok(candidate));
            }
        }
    }
}
