use super::{JobHandler, JobOutcome};
use crate::common::constants::FIELD_NAME;
use crate::pipeline::storage::traits::{external_id_of, Document, InsertOutcome, RecordStore};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Creates one title record per job, using the job id as the record id so
/// that a redelivered job finds its own earlier insert.
pub struct InsertRecordHandler {
    store: Arc<dyn RecordStore>,
}

impl InsertRecordHandler {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }
}

/// Checks the payload shape: an object with a non-empty string `name`
pub fn validate_payload(payload: &Value) -> Result<Document, String> {
    let Some(fields) = payload.as_object() else {
        return Err("payload must be a JSON object".to_string());
    };
    match fields.get(FIELD_NAME).and_then(Value::as_str) {
        Some(name) if !name.trim().is_empty() => Ok(fields.clone()),
        _ => Err(format!("payload is missing a non-empty `{FIELD_NAME}`")),
    }
}

#[async_trait]
impl JobHandler for InsertRecordHandler {
    async fn process(&self, job_id: &str, payload: &Value) -> JobOutcome {
        let fields = match validate_payload(payload) {
            Ok(fields) => fields,
            Err(e) => return JobOutcome::Fatal(e),
        };

        // A different record already owning this imdbId will never accept the insert
        if let Some(key) = external_id_of(&fields) {
            match self.store.find_by_key(&key).await {
                Ok(Some(existing)) if existing.id != job_id => {
                    return JobOutcome::Fatal(format!("imdbId {key} already belongs to record {}", existing.id));
                }
                Ok(_) => {}
                Err(e) => return JobOutcome::Retryable(e.to_string()),
            }
        }

        match self.store.insert_one(job_id, fields).await {
            Ok(InsertOutcome::Inserted) => JobOutcome::Success,
            Ok(InsertOutcome::AlreadyExists) => {
                debug!("Record {} already exists; treating redelivery as done", job_id);
                JobOutcome::Success
            }
            Err(e) => JobOutcome::Retryable(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::storage::InMemoryRecordStore;
    use serde_json::json;

    #[tokio::test]
    async fn inserts_once_per_job_id() {
        let store = Arc::new(InMemoryRecordStore::new());
        let handler = InsertRecordHandler::new(store.clone());
        let payload = json!({"name": "Heat", "imdbId": "tt0113277"});

        assert_eq!(handler.process("job-1", &payload).await, JobOutcome::Success);
        assert_eq!(handler.process("job-1", &payload).await, JobOutcome::Success);
        assert_eq!(store.len(), 1);
        assert_eq!(store.find_by_id("job-1").await.unwrap().unwrap().fields["name"], json!("Heat"));
    }

    #[tokio::test]
    async fn invalid_payloads_are_fatal() {
        let handler = InsertRecordHandler::new(Arc::new(InMemoryRecordStore::new()));
        for payload in [json!([1, 2]), json!({"name": ""}), json!({"rating": 9})] {
            assert!(matches!(handler.process("j", &payload).await, JobOutcome::Fatal(_)));
        }
    }

    #[tokio::test]
    async fn duplicate_business_key_is_fatal() {
        let store = Arc::new(InMemoryRecordStore::new());
        let handler = InsertRecordHandler::new(store.clone());
        let payload = json!({"name": "Heat", "imdbId": "tt1"});

        assert_eq!(handler.process("job-1", &payload).await, JobOutcome::Success);
        assert!(matches!(handler.process("job-2", &payload).await, JobOutcome::Fatal(_)));
    }
}
