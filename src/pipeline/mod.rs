// Import pipeline: ingestion, processing, and storage

pub mod import;
pub mod ingestion;
pub mod processing;
pub mod storage;

pub use import::{ImportOptions, ImportReport};
