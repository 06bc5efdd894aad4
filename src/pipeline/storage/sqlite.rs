use super::traits::{
    document_for_insert, external_id_of, BulkUpsertSummary, Document, InsertOutcome, Page,
    RecordFilter, RecordStore, SortField, SortSpec, StoredRecord, UpsertOp, UpsertOutcome,
};
use crate::common::constants::{OMDB_PLACEHOLDER, SQLITE_BUSY_TIMEOUT_MS};
use crate::common::error::{ImporterError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

const SELECT_COLUMNS: &str = "id, external_id, doc, created_at, updated_at";

/// Durable record store on a local SQLite file.
///
/// Documents live as JSON text; the business key is mirrored into a unique
/// `external_id` column so upserts and lookups by key are indexed.
#[derive(Clone)]
pub struct SqliteRecordStore {
    conn: Arc<Mutex<Connection>>,
}

type RawRow = (String, Option<String>, String, String, String);

impl SqliteRecordStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_millis(SQLITE_BUSY_TIMEOUT_MS))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            CREATE TABLE IF NOT EXISTS records (
                id           TEXT PRIMARY KEY,
                external_id  TEXT UNIQUE,
                doc          TEXT NOT NULL,
                created_at   TEXT NOT NULL,
                updated_at   TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS records_created_at ON records (created_at);
            "#,
        )?;
        info!("Opened record store at {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| ImporterError::database("record store connection lock poisoned"))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| ImporterError::database(format!("record store task failed: {e}")))?
    }
}

fn now_text() -> String {
    Utc::now().to_rfc3339()
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| ImporterError::database(format!("bad timestamp {raw:?}: {e}")))
}

fn read_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn into_record(raw: RawRow) -> Result<StoredRecord> {
    let (id, external_id, doc, created_at, updated_at) = raw;
    Ok(StoredRecord {
        id,
        external_id,
        fields: serde_json::from_str(&doc)?,
        created_at: parse_time(&created_at)?,
        updated_at: parse_time(&updated_at)?,
    })
}

fn upsert_in(conn: &Connection, key: &str, set: Document, on_insert: Document) -> Result<UpsertOutcome> {
    if key.trim().is_empty() {
        return Err(ImporterError::MissingField("imdbId".to_string()));
    }

    let existing: Option<(String, String)> = conn
        .query_row(
            "SELECT id, doc FROM records WHERE external_id = ?1",
            params![key],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    match existing {
        Some((id, doc)) => {
            let mut fields: Document = serde_json::from_str(&doc)?;
            fields.extend(set);
            conn.execute(
                "UPDATE records SET doc = ?1, updated_at = ?2 WHERE id = ?3",
                params![serde_json::to_string(&fields)?, now_text(), id],
            )?;
            Ok(UpsertOutcome::Matched)
        }
        None => {
            let fields = document_for_insert(key, set, on_insert);
            let now = now_text();
            conn.execute(
                "INSERT INTO records (id, external_id, doc, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?4)",
                params![Uuid::new_v4().to_string(), key, serde_json::to_string(&fields)?, now],
            )?;
            Ok(UpsertOutcome::Inserted)
        }
    }
}

fn filter_sql(filter: RecordFilter) -> String {
    match filter {
        RecordFilter::All => "1 = 1".to_string(),
        RecordFilter::MissingExternalId => "external_id IS NULL".to_string(),
        RecordFilter::MissingEnrichment => {
            let missing = |field: &str| {
                format!(
                    "TRIM(COALESCE(json_extract(doc, '$.{field}'), '')) IN ('', '{OMDB_PLACEHOLDER}')"
                )
            };
            format!("({} OR {})", missing("posterUrl"), missing("description"))
        }
    }
}

fn order_sql(sort: SortSpec) -> String {
    let expr = match sort.field {
        SortField::CreatedAt => "created_at".to_string(),
        other => format!(
            "json_extract(doc, '$.{}')",
            other.document_field().unwrap_or("name")
        ),
    };
    let dir = if sort.descending { "DESC" } else { "ASC" };
    format!("{expr} {dir}, id ASC")
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn upsert_by_key(&self, key: &str, set: Document, on_insert: Document) -> Result<UpsertOutcome> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let outcome = upsert_in(&tx, &key, set, on_insert)?;
            tx.commit()?;
            Ok(outcome)
        })
        .await
    }

    async fn bulk_upsert(&self, ops: Vec<UpsertOp>) -> Result<BulkUpsertSummary> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut summary = BulkUpsertSummary::default();
            for op in ops {
                let result = upsert_in(&tx, &op.key, op.set, op.on_insert);
                summary.record(&op.key, result);
            }
            tx.commit()?;
            debug!(
                "Bulk upsert committed: {} matched, {} inserted, {} failed",
                summary.matched, summary.inserted, summary.failed
            );
            Ok(summary)
        })
        .await
    }

    async fn insert_one(&self, id: &str, fields: Document) -> Result<InsertOutcome> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let now = now_text();
            let changed = conn.execute(
                "INSERT INTO records (id, external_id, doc, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(id) DO NOTHING",
                params![id, external_id_of(&fields), serde_json::to_string(&fields)?, now],
            )?;
            Ok(if changed == 0 {
                InsertOutcome::AlreadyExists
            } else {
                InsertOutcome::Inserted
            })
        })
        .await
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<StoredRecord>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let raw = conn
                .query_row(
                    &format!("SELECT {SELECT_COLUMNS} FROM records WHERE id = ?1"),
                    params![id],
                    read_raw,
                )
                .optional()?;
            raw.map(into_record).transpose()
        })
        .await
    }

    async fn find_by_key(&self, key: &str) -> Result<Option<StoredRecord>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let raw = conn
                .query_row(
                    &format!("SELECT {SELECT_COLUMNS} FROM records WHERE external_id = ?1"),
                    params![key],
                    read_raw,
                )
                .optional()?;
            raw.map(into_record).transpose()
        })
        .await
    }

    async fn delete_by_id(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.with_conn(move |conn| Ok(conn.execute("DELETE FROM records WHERE id = ?1", params![id])? > 0))
            .await
    }

    async fn find_page(&self, filter: RecordFilter, sort: SortSpec, skip: u64, limit: u64) -> Result<Page> {
        self.with_conn(move |conn| {
            let where_sql = filter_sql(filter);
            let total: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM records WHERE {where_sql}"),
                [],
                |row| row.get(0),
            )?;

            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM records WHERE {where_sql} ORDER BY {} LIMIT ?1 OFFSET ?2",
                order_sql(sort)
            ))?;
            let raws = stmt
                .query_map(
                    params![i64::try_from(limit).unwrap_or(i64::MAX), i64::try_from(skip).unwrap_or(i64::MAX)],
                    read_raw,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            let items = raws.into_iter().map(into_record).collect::<Result<Vec<_>>>()?;

            Ok(Page {
                items,
                total: total.max(0) as u64,
            })
        })
        .await
    }

    async fn delete_matching(&self, filter: RecordFilter) -> Result<u64> {
        self.with_conn(move |conn| {
            let removed = conn.execute(&format!("DELETE FROM records WHERE {}", filter_sql(filter)), [])?;
            Ok(removed as u64)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tempfile::tempdir;

    fn doc(v: Value) -> Document {
        v.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn upsert_roundtrip_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("records.db");
        {
            let store = SqliteRecordStore::open(&path).unwrap();
            let outcome = store
                .upsert_by_key("tt1", doc(json!({"name": "Heat"})), doc(json!({"posterUrl": ""})))
                .await
                .unwrap();
            assert_eq!(outcome, UpsertOutcome::Inserted);
            let outcome = store
                .upsert_by_key("tt1", doc(json!({"posterUrl": "https://img/heat.jpg"})), Document::new())
                .await
                .unwrap();
            assert_eq!(outcome, UpsertOutcome::Matched);
        }

        let store = SqliteRecordStore::open(&path).unwrap();
        let rec = store.find_by_key("tt1").await.unwrap().unwrap();
        assert_eq!(rec.external_id.as_deref(), Some("tt1"));
        assert_eq!(rec.fields["name"], json!("Heat"));
        assert_eq!(rec.fields["posterUrl"], json!("https://img/heat.jpg"));
        assert_eq!(store.find_by_id(&rec.id).await.unwrap(), Some(rec));
    }

    #[tokio::test]
    async fn bulk_upsert_is_unordered() {
        let dir = tempdir().unwrap();
        let store = SqliteRecordStore::open(dir.path().join("r.db")).unwrap();
        let ops = vec![
            UpsertOp { key: "tt1".into(), set: doc(json!({"name": "A"})), on_insert: Document::new() },
            UpsertOp { key: "".into(), set: doc(json!({"name": "B"})), on_insert: Document::new() },
            UpsertOp { key: "tt2".into(), set: doc(json!({"name": "C"})), on_insert: Document::new() },
        ];
        let summary = store.bulk_upsert(ops.clone()).await.unwrap();
        assert_eq!((summary.inserted, summary.matched, summary.failed), (2, 0, 1));

        let again = store.bulk_upsert(ops).await.unwrap();
        assert_eq!((again.inserted, again.matched, again.failed), (0, 2, 1));

        let page = store.find_page(RecordFilter::All, SortSpec::default(), 0, 100).await.unwrap();
        assert_eq!(page.total, 2);
    }

    #[tokio::test]
    async fn insert_one_keeps_first_write_and_rejects_duplicate_key() {
        let dir = tempdir().unwrap();
        let store = SqliteRecordStore::open(dir.path().join("r.db")).unwrap();
        let fields = doc(json!({"name": "Heat", "imdbId": "tt1"}));

        assert_eq!(store.insert_one("job-1", fields.clone()).await.unwrap(), InsertOutcome::Inserted);
        assert_eq!(
            store.insert_one("job-1", doc(json!({"name": "Other"}))).await.unwrap(),
            InsertOutcome::AlreadyExists
        );
        assert!(matches!(
            store.insert_one("job-2", fields).await,
            Err(ImporterError::Database { .. })
        ));
        let rec = store.find_by_id("job-1").await.unwrap().unwrap();
        assert_eq!(rec.fields["name"], json!("Heat"));
    }

    #[tokio::test]
    async fn filters_sort_and_delete() {
        let dir = tempdir().unwrap();
        let store = SqliteRecordStore::open(dir.path().join("r.db")).unwrap();
        store.insert_one("mock", doc(json!({"name": "Mock"}))).await.unwrap();
        store
            .upsert_by_key("tt1", doc(json!({"name": "Zeta", "posterUrl": "N/A", "description": "d"})), Document::new())
            .await
            .unwrap();
        store
            .upsert_by_key("tt2", doc(json!({"name": "Alpha", "posterUrl": "p", "description": "d"})), Document::new())
            .await
            .unwrap();

        let missing = store
            .find_page(RecordFilter::MissingEnrichment, SortSpec::default(), 0, 10)
            .await
            .unwrap();
        let names: Vec<_> = missing.items.iter().map(|r| r.fields["name"].clone()).collect();
        assert_eq!(missing.total, 2);
        assert!(names.contains(&json!("Zeta")) && names.contains(&json!("Mock")));

        let by_name = store
            .find_page(RecordFilter::All, SortSpec { field: SortField::Name, descending: false }, 1, 1)
            .await
            .unwrap();
        assert_eq!(by_name.total, 3);
        assert_eq!(by_name.items[0].fields["name"], json!("Mock"));

        assert_eq!(store.delete_matching(RecordFilter::MissingExternalId).await.unwrap(), 1);
        assert!(!store.delete_by_id("mock").await.unwrap());
        let key_id = store.find_by_key("tt2").await.unwrap().unwrap().id;
        assert!(store.delete_by_id(&key_id).await.unwrap());
        assert!(store.find_by_key("tt2").await.unwrap().is_none());
    }
}
