use async_trait::async_trait;

/// Fields a title lookup may supply. Placeholders are already stripped, so
/// `None` always means "unknown".
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TitleDetails {
    pub plot: Option<String>,
    pub poster: Option<String>,
    pub director: Option<String>,
    pub runtime: Option<String>,
}

/// Result of one external lookup
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LookupOutcome {
    Found(TitleDetails),
    NotFound,
    Error(String),
}

/// Enrichment-side port: resolves an external id to descriptive fields
#[async_trait]
pub trait TitleLookup: Send + Sync {
    async fn lookup(&self, external_id: &str) -> LookupOutcome;
}
