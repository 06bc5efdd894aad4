pub mod bulk_writer;
pub mod in_memory;
pub mod sqlite;
pub mod traits;

pub use bulk_writer::{BatchReport, BulkWriter, WriteTotals};
pub use in_memory::InMemoryRecordStore;
pub use sqlite::SqliteRecordStore;
pub use traits::{Document, RecordStore, StoredRecord};
