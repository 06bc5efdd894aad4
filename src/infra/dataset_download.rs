use crate::common::error::{ImporterError, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tracing::info;

/// Where a dataset dump comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatasetLocation {
    Path(PathBuf),
    Url(String),
}

impl DatasetLocation {
    /// `{base}/{file}` on a dataset host
    pub fn on_host(base_url: &str, file: &str) -> Self {
        DatasetLocation::Url(format!("{}/{}", base_url.trim_end_matches('/'), file))
    }
}

/// Streams remote dumps into a scratch directory so they can be read with
/// [`crate::pipeline::ingestion::TsvReader`] like local files. The directory
/// and everything fetched into it is removed when the downloader is dropped.
pub struct DatasetDownloader {
    client: reqwest::Client,
    scratch: TempDir,
    fetched: AtomicUsize,
}

impl DatasetDownloader {
    pub fn new(timeout: Duration) -> Result<Self> {
        // Keep the body bytes as served; `.gz` dumps are decoded by the reader.
        let client = reqwest::Client::builder().timeout(timeout).no_gzip().build()?;
        let scratch = tempfile::Builder::new().prefix("cinephile-datasets-").tempdir()?;
        Ok(Self {
            client,
            scratch,
            fetched: AtomicUsize::new(0),
        })
    }

    pub fn scratch_dir(&self) -> &Path {
        self.scratch.path()
    }

    /// Local path for `location`, downloading it first when it is a URL
    pub async fn materialize(&self, location: &DatasetLocation) -> Result<PathBuf> {
        match location {
            DatasetLocation::Path(path) => Ok(path.clone()),
            DatasetLocation::Url(url) => self.fetch(url).await,
        }
    }

    /// Downloads `url` chunk by chunk. The file keeps the URL's last path
    /// segment so a `.gz` suffix still selects decompression.
    pub async fn fetch(&self, url: &str) -> Result<PathBuf> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| ImporterError::Config(format!("invalid dataset URL {url:?}: {e}")))?;
        let name = parsed
            .path_segments()
            .and_then(|segments| segments.last())
            .filter(|s| !s.is_empty())
            .unwrap_or("dataset");
        let n = self.fetched.fetch_add(1, Ordering::SeqCst);
        let target = self.scratch.path().join(format!("{n}-{name}"));

        info!("Downloading {}", url);
        let mut resp = self.client.get(parsed).send().await?.error_for_status()?;
        let mut file = tokio::fs::File::create(&target).await?;
        let mut bytes: u64 = 0;
        while let Some(chunk) = resp.chunk().await? {
            file.write_all(&chunk).await?;
            bytes += chunk.len() as u64;
        }
        file.flush().await?;

        info!("Downloaded {} bytes to {}", bytes, target.display());
        Ok(target)
    }
}
