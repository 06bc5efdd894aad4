use crate::common::constants::{
    FIELD_DESCRIPTION, FIELD_DURATION, FIELD_EXTERNAL_ID, FIELD_NAME, FIELD_POSTER_URL,
    FIELD_RATING, FIELD_RELEASE_DATE, OMDB_PLACEHOLDER,
};
use crate::common::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::cmp::Ordering;

/// A stored record body: a JSON object keyed by document field name
pub type Document = serde_json::Map<String, Value>;

/// A document as held by a [`RecordStore`]
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub id: String,
    /// Business key, mirrored from the document's `imdbId`
    pub external_id: Option<String>,
    pub fields: Document,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredRecord {
    /// Full document view including the store-maintained timestamps
    pub fn to_document(&self) -> Document {
        let mut doc = self.fields.clone();
        doc.insert("_id".to_string(), Value::String(self.id.clone()));
        doc.insert("createdAt".to_string(), Value::String(self.created_at.to_rfc3339()));
        doc.insert("updatedAt".to_string(), Value::String(self.updated_at.to_rfc3339()));
        doc
    }
}

/// One keyed write inside a bulk upsert
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertOp {
    pub key: String,
    /// Merged into the document whether it exists or not
    pub set: Document,
    /// Written only when the document is created
    pub on_insert: Document,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Matched,
    Inserted,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkUpsertSummary {
    pub matched: usize,
    pub inserted: usize,
    pub failed: usize,
    /// One message per failed item, prefixed with its key
    pub errors: Vec<String>,
}

impl BulkUpsertSummary {
    pub fn record(&mut self, key: &str, result: Result<UpsertOutcome>) {
        match result {
            Ok(UpsertOutcome::Matched) => self.matched += 1,
            Ok(UpsertOutcome::Inserted) => self.inserted += 1,
            Err(e) => {
                self.failed += 1;
                self.errors.push(format!("{key}: {e}"));
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyExists,
}

/// Named record selections understood by every store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordFilter {
    All,
    /// Poster or description is absent, empty or the lookup placeholder
    MissingEnrichment,
    /// No business key; these are leftovers from mock seeding
    MissingExternalId,
}

impl RecordFilter {
    pub fn matches(&self, record: &StoredRecord) -> bool {
        match self {
            RecordFilter::All => true,
            RecordFilter::MissingEnrichment => {
                is_missing_text(&record.fields, FIELD_POSTER_URL)
                    || is_missing_text(&record.fields, FIELD_DESCRIPTION)
            }
            RecordFilter::MissingExternalId => record.external_id.is_none(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    Name,
    Rating,
    ReleaseDate,
    Duration,
    CreatedAt,
}

impl SortField {
    /// Document field backing this sort, `None` for store-maintained columns
    pub fn document_field(&self) -> Option<&'static str> {
        match self {
            SortField::Name => Some(FIELD_NAME),
            SortField::Rating => Some(FIELD_RATING),
            SortField::ReleaseDate => Some(FIELD_RELEASE_DATE),
            SortField::Duration => Some(FIELD_DURATION),
            SortField::CreatedAt => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortSpec {
    pub field: SortField,
    pub descending: bool,
}

impl Default for SortSpec {
    fn default() -> Self {
        Self {
            field: SortField::CreatedAt,
            descending: false,
        }
    }
}

impl SortSpec {
    /// Orders two records; ties fall back to the record id so pages are stable.
    pub fn compare(&self, a: &StoredRecord, b: &StoredRecord) -> Ordering {
        let primary = match self.field.document_field() {
            Some(field) => compare_values(a.fields.get(field), b.fields.get(field)),
            None => a.created_at.cmp(&b.created_at),
        };
        let primary = if self.descending { primary.reverse() } else { primary };
        primary.then_with(|| a.id.cmp(&b.id))
    }
}

/// Null and absent sort first, then numbers, then strings.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None | Some(Value::Null) => 0,
            Some(Value::Number(_)) => 1,
            Some(Value::String(_)) => 2,
            Some(_) => 3,
        }
    }

    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.total_cmp(&y)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub items: Vec<StoredRecord>,
    /// Matching records before skip/limit
    pub total: u64,
}

/// True when `field` is absent, not a string, blank or the lookup placeholder
pub fn is_missing_text(doc: &Document, field: &str) -> bool {
    match doc.get(field).and_then(Value::as_str).map(str::trim) {
        Some(s) => s.is_empty() || s == OMDB_PLACEHOLDER,
        None => true,
    }
}

/// Non-empty `imdbId` of a document, if any
pub fn external_id_of(doc: &Document) -> Option<String> {
    doc.get(FIELD_EXTERNAL_ID)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Body of a document created by an upsert: `on_insert` underneath `set`,
/// with the key written as `imdbId`.
pub fn document_for_insert(key: &str, set: Document, on_insert: Document) -> Document {
    let mut doc = on_insert;
    doc.extend(set);
    doc.insert(FIELD_EXTERNAL_ID.to_string(), Value::String(key.to_string()));
    doc
}

/// Persistence boundary for title documents.
///
/// Implementations must be safe under concurrent calls; a single upsert is
/// atomic per key.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Merges `set` into the document keyed by `key`, creating it (with
    /// `on_insert` underneath `set`) when absent.
    async fn upsert_by_key(&self, key: &str, set: Document, on_insert: Document) -> Result<UpsertOutcome>;

    /// Applies every op independently; item failures are counted, not raised.
    async fn bulk_upsert(&self, ops: Vec<UpsertOp>) -> Result<BulkUpsertSummary>;

    /// Creates a document under `id`. A second call with the same id is a no-op.
    async fn insert_one(&self, id: &str, fields: Document) -> Result<InsertOutcome>;

    async fn find_by_id(&self, id: &str) -> Result<Option<StoredRecord>>;
    async fn find_by_key(&self, key: &str) -> Result<Option<StoredRecord>>;
    async fn delete_by_id(&self, id: &str) -> Result<bool>;

    async fn find_page(&self, filter: RecordFilter, sort: SortSpec, skip: u64, limit: u64) -> Result<Page>;

    /// Deletes every matching document and returns how many were removed
    async fn delete_matching(&self, filter: RecordFilter) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str, fields: Value) -> StoredRecord {
        let fields = fields.as_object().cloned().unwrap_or_default();
        StoredRecord {
            id: id.to_string(),
            external_id: external_id_of(&fields),
            fields,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn missing_enrichment_treats_placeholder_as_missing() {
        let filter = RecordFilter::MissingEnrichment;
        assert!(filter.matches(&record("a", json!({"posterUrl": "N/A", "description": "x"}))));
        assert!(filter.matches(&record("b", json!({"posterUrl": "p"}))));
        assert!(!filter.matches(&record("c", json!({"posterUrl": "p", "description": "x"}))));
    }

    #[test]
    fn blank_imdb_id_counts_as_missing_key() {
        assert!(RecordFilter::MissingExternalId.matches(&record("a", json!({"imdbId": ""}))));
        assert!(!RecordFilter::MissingExternalId.matches(&record("b", json!({"imdbId": "tt1"}))));
    }

    #[test]
    fn rating_sort_puts_unrated_first_ascending() {
        let a = record("a", json!({"rating": 7.5}));
        let b = record("b", json!({}));
        let c = record("c", json!({"rating": 9}));
        let mut all = vec![a, b, c];

        all.sort_by(|x, y| SortSpec { field: SortField::Rating, descending: false }.compare(x, y));
        let ids: Vec<_> = all.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);

        all.sort_by(|x, y| SortSpec { field: SortField::Rating, descending: true }.compare(x, y));
        let ids: Vec<_> = all.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }
}
