use super::traits::{
    document_for_insert, external_id_of, BulkUpsertSummary, Document, InsertOutcome, Page,
    RecordFilter, RecordStore, SortSpec, StoredRecord, UpsertOp, UpsertOutcome,
};
use crate::common::error::{ImporterError, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

#[derive(Default)]
struct State {
    records: HashMap<String, StoredRecord>,
    /// external id -> record id
    by_key: HashMap<String, String>,
}

/// In-memory record store for development/testing
#[derive(Clone, Default)]
pub struct InMemoryRecordStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().map(|s| s.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| ImporterError::database("in-memory store lock poisoned"))
    }

    fn upsert_locked(state: &mut State, key: &str, set: Document, on_insert: Document) -> Result<UpsertOutcome> {
        if key.trim().is_empty() {
            return Err(ImporterError::MissingField("imdbId".to_string()));
        }
        let now = Utc::now();

        if let Some(id) = state.by_key.get(key).cloned() {
            if let Some(existing) = state.records.get_mut(&id) {
                existing.fields.extend(set);
                existing.updated_at = now;
                return Ok(UpsertOutcome::Matched);
            }
        }

        let id = Uuid::new_v4().to_string();
        let fields = document_for_insert(key, set, on_insert);
        state.by_key.insert(key.to_string(), id.clone());
        state.records.insert(
            id.clone(),
            StoredRecord {
                id,
                external_id: Some(key.to_string()),
                fields,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(UpsertOutcome::Inserted)
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn upsert_by_key(&self, key: &str, set: Document, on_insert: Document) -> Result<UpsertOutcome> {
        let mut state = self.lock()?;
        Self::upsert_locked(&mut state, key, set, on_insert)
    }

    async fn bulk_upsert(&self, ops: Vec<UpsertOp>) -> Result<BulkUpsertSummary> {
        let mut state = self.lock()?;
        let mut summary = BulkUpsertSummary::default();
        for op in ops {
            let result = Self::upsert_locked(&mut state, &op.key, op.set, op.on_insert);
            summary.record(&op.key, result);
        }
        debug!(
            "Bulk upsert: {} matched, {} inserted, {} failed",
            summary.matched, summary.inserted, summary.failed
        );
        Ok(summary)
    }

    async fn insert_one(&self, id: &str, fields: Document) -> Result<InsertOutcome> {
        let mut state = self.lock()?;
        if state.records.contains_key(id) {
            return Ok(InsertOutcome::AlreadyExists);
        }

        let external_id = external_id_of(&fields);
        if let Some(key) = &external_id {
            if state.by_key.contains_key(key) {
                return Err(ImporterError::database(format!(
                    "a record with imdbId {key} already exists"
                )));
            }
            state.by_key.insert(key.clone(), id.to_string());
        }

        let now = Utc::now();
        state.records.insert(
            id.to_string(),
            StoredRecord {
                id: id.to_string(),
                external_id,
                fields,
                created_at: now,
                updated_at: now,
            },
        );
        debug!("Inserted record {}", id);
        Ok(InsertOutcome::Inserted)
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<StoredRecord>> {
        Ok(self.lock()?.records.get(id).cloned())
    }

    async fn find_by_key(&self, key: &str) -> Result<Option<StoredRecord>> {
        let state = self.lock()?;
        Ok(state
            .by_key
            .get(key)
            .and_then(|id| state.records.get(id))
            .cloned())
    }

    async fn delete_by_id(&self, id: &str) -> Result<bool> {
        let mut state = self.lock()?;
        match state.records.remove(id) {
            Some(removed) => {
                if let Some(key) = removed.external_id {
                    state.by_key.remove(&key);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn find_page(&self, filter: RecordFilter, sort: SortSpec, skip: u64, limit: u64) -> Result<Page> {
        let state = self.lock()?;
        let mut matching: Vec<&StoredRecord> =
            state.records.values().filter(|r| filter.matches(r)).collect();
        matching.sort_by(|a, b| sort.compare(a, b));

        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(usize::try_from(skip).unwrap_or(usize::MAX))
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(Page { items, total })
    }

    async fn delete_matching(&self, filter: RecordFilter) -> Result<u64> {
        let mut state = self.lock()?;
        let doomed: Vec<String> = state
            .records
            .values()
            .filter(|r| filter.matches(r))
            .map(|r| r.id.clone())
            .collect();
        for id in &doomed {
            if let Some(removed) = state.records.remove(id) {
                if let Some(key) = removed.external_id {
                    state.by_key.remove(&key);
                }
            }
        }
        Ok(doomed.len() as u64)
    }
}
