use crate::app::ports::{LookupOutcome, TitleDetails, TitleLookup};
use crate::common::constants::OMDB_PLACEHOLDER;
use crate::common::error::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Raw OMDb title payload. Every field is optional because error responses
/// carry only `Response` and `Error`.
#[derive(Debug, Deserialize)]
struct OmdbResponse {
    #[serde(rename = "Response")]
    response: Option<String>,
    #[serde(rename = "Error")]
    error: Option<String>,
    #[serde(rename = "Plot")]
    plot: Option<String>,
    #[serde(rename = "Poster")]
    poster: Option<String>,
    #[serde(rename = "Director")]
    director: Option<String>,
    #[serde(rename = "Runtime")]
    runtime: Option<String>,
}

impl OmdbResponse {
    /// Only an explicit `"Response": "True"` counts as a match. A body without
    /// the flag carries no title, so it is treated like `"False"`.
    fn into_outcome(self) -> LookupOutcome {
        match self.response.as_deref() {
            Some(flag) if flag.eq_ignore_ascii_case("true") => LookupOutcome::Found(TitleDetails {
                plot: known(self.plot),
                poster: known(self.poster),
                director: known(self.director),
                runtime: known(self.runtime),
            }),
            _ => {
                debug!("OMDb reported no match: {}", self.error.as_deref().unwrap_or("unknown"));
                LookupOutcome::NotFound
            }
        }
    }
}

fn known(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty() && v != OMDB_PLACEHOLDER)
}

/// Parses an OMDb JSON body into a lookup outcome. Bodies that are not valid
/// JSON are reported as errors, never as matches.
pub fn parse_omdb_body(body: &str) -> LookupOutcome {
    match serde_json::from_str::<OmdbResponse>(body) {
        Ok(resp) => resp.into_outcome(),
        Err(e) => LookupOutcome::Error(format!("malformed OMDb response: {e}")),
    }
}

/// [`TitleLookup`] backed by the OMDb HTTP API
pub struct OmdbClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OmdbClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl TitleLookup for OmdbClient {
    async fn lookup(&self, external_id: &str) -> LookupOutcome {
        let resp = match self
            .client
            .get(&self.base_url)
            .query(&[("i", external_id), ("apikey", self.api_key.as_str())])
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => return LookupOutcome::Error(e.to_string()),
        };

        let status = resp.status();
        let body = match resp.text().await {
            Ok(body) => body,
            Err(e) => return LookupOutcome::Error(e.to_string()),
        };
        if !status.is_success() {
            debug!("OMDb returned HTTP {} for {}", status.as_u16(), external_id);
        }
        parse_omdb_body(&body)
    }
}
