// Pipeline ingestion: tabular source reading and the rating index

pub mod rating_index;
pub mod tsv_reader;

pub use rating_index::{RatingIndex, RatingRecord};
pub use tsv_reader::{Row, TsvReader};
