// Infrastructure adapters

pub mod dataset_download;
pub mod omdb_client;
pub mod rate_limiter;

pub use dataset_download::{DatasetDownloader, DatasetLocation};
pub use omdb_client::OmdbClient;
pub use rate_limiter::FixedWindowLimiter;
