//! Best-effort field filling through an external title lookup.
//!
//! Every candidate with a missing descriptive field gets one lookup. Lookups run
//! on a bounded set of tasks, are started no faster than the configured
//! fixed-window rate, and each one is cut off by its own timeout. Failures of
//! any kind leave the candidate untouched and are only counted.

use crate::app::ports::{LookupOutcome, TitleDetails, TitleLookup};
use crate::common::constants::ENRICH_PROGRESS_EVERY;
use crate::infra::rate_limiter::FixedWindowLimiter;
use crate::observability::metrics;
use crate::pipeline::processing::candidate::CandidateRecord;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

static DIGIT_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").expect("static regex"));

/// Sparse set of fields to fill on a candidate
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnrichmentPatch {
    pub description: Option<String>,
    pub poster_url: Option<String>,
    pub director: Option<String>,
    pub duration_minutes: Option<u32>,
}

impl EnrichmentPatch {
    /// Keeps only the looked-up values whose target field is still missing on
    /// `candidate`.
    pub fn from_details(candidate: &CandidateRecord, details: &TitleDetails) -> Self {
        Self {
            description: candidate
                .description
                .is_none()
                .then(|| details.plot.clone())
                .flatten(),
            poster_url: candidate
                .poster_url
                .is_none()
                .then(|| details.poster.clone())
                .flatten(),
            director: candidate
                .director
                .is_none()
                .then(|| details.director.clone())
                .flatten(),
            duration_minutes: candidate
                .duration_minutes
                .is_none()
                .then(|| details.runtime.as_deref().and_then(parse_runtime_minutes))
                .flatten(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.description.is_none()
            && self.poster_url.is_none()
            && self.director.is_none()
            && self.duration_minutes.is_none()
    }
}

impl CandidateRecord {
    /// Fills missing fields from `patch`; present fields are never replaced.
    /// Returns how many fields changed.
    pub fn apply(&mut self, patch: EnrichmentPatch) -> usize {
        fn fill<T>(slot: &mut Option<T>, value: Option<T>) -> usize {
            match (slot.is_none(), value) {
                (true, Some(v)) => {
                    *slot = Some(v);
                    1
                }
                _ => 0,
            }
        }

        fill(&mut self.description, patch.description)
            + fill(&mut self.poster_url, patch.poster_url)
            + fill(&mut self.director, patch.director)
            + fill(&mut self.duration_minutes, patch.duration_minutes)
    }
}

/// Minutes from a free-text runtime such as `"142 min"`: the first digit run,
/// if it fits a `u32` and is non-zero.
pub fn parse_runtime_minutes(runtime: &str) -> Option<u32> {
    DIGIT_RUN
        .find(runtime)
        .and_then(|m| m.as_str().parse::<u32>().ok())
        .filter(|m| *m > 0)
}

#[derive(Debug, Clone)]
pub struct EnrichmentSettings {
    pub concurrency: usize,
    pub rate_capacity: u32,
    pub rate_window: Duration,
    pub timeout: Duration,
}

impl Default for EnrichmentSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            rate_capacity: 4,
            rate_window: Duration::from_millis(1000),
            timeout: Duration::from_secs(15),
        }
    }
}

/// Final tally of an enrichment pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EnrichReport {
    /// Lookups that found the title
    pub succeeded: usize,
    /// Lookups that failed, timed out, or did not find the title
    pub failed: usize,
    /// Candidates with nothing missing, never looked up
    pub skipped: usize,
    /// Individual fields filled across all candidates
    pub fields_filled: usize,
}

pub struct Enricher {
    lookup: Arc<dyn TitleLookup>,
    limiter: FixedWindowLimiter,
    settings: EnrichmentSettings,
}

impl Enricher {
    pub fn new(lookup: Arc<dyn TitleLookup>, settings: EnrichmentSettings) -> Self {
        let limiter = FixedWindowLimiter::new(settings.rate_capacity, settings.rate_window);
        Self {
            lookup,
            limiter,
            settings,
        }
    }

    pub fn settings(&self) -> &EnrichmentSettings {
        &self.settings
    }

    /// Looks up every candidate that is missing a field and merges the
    /// results in place. Returns only after every started lookup has finished.
    pub async fn enrich(&self, candidates: &mut [CandidateRecord]) -> EnrichReport {
        let mut report = EnrichReport::default();
        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let finished = Arc::new(AtomicUsize::new(0));
        let mut tasks: JoinSet<(usize, LookupOutcome)> = JoinSet::new();
        let started_at = Instant::now();

        info!(
            "Enriching {} candidates (concurrency={}, {} starts per {:?})",
            candidates.len(),
            self.settings.concurrency,
            self.limiter.capacity(),
            self.limiter.window()
        );

        let wanted = candidates.iter().filter(|c| c.needs_enrichment()).count();
        report.skipped = candidates.len() - wanted;

        for (idx, candidate) in candidates.iter().enumerate() {
            if !candidate.needs_enrichment() {
                continue;
            }

            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            self.limiter.acquire().await;

            let lookup = Arc::clone(&self.lookup);
            let finished = Arc::clone(&finished);
            let external_id = candidate.external_id.clone();
            let timeout = self.settings.timeout;
            tasks.spawn(async move {
                let t0 = Instant::now();
                let outcome = match tokio::time::timeout(timeout, lookup.lookup(&external_id)).await {
                    Ok(outcome) => outcome,
                    Err(_) => LookupOutcome::Error(format!("lookup timed out after {timeout:?}")),
                };
                metrics::enrich::lookup_duration(t0.elapsed().as_secs_f64());
                drop(permit);

                let done = finished.fetch_add(1, Ordering::Relaxed) + 1;
                if done % ENRICH_PROGRESS_EVERY == 0 {
                    info!("Enriched {}/{}", done, wanted);
                }
                (idx, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (idx, outcome) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("Enrichment task aborted: {}", e);
                    report.failed += 1;
                    continue;
                }
            };
            let Some(candidate) = candidates.get_mut(idx) else {
                continue;
            };

            match outcome {
                LookupOutcome::Found(details) => {
                    let patch = EnrichmentPatch::from_details(candidate, &details);
                    report.fields_filled += candidate.apply(patch);
                    report.succeeded += 1;
                }
                LookupOutcome::NotFound => {
                    debug!("No match for {}", candidate.external_id);
                    report.failed += 1;
                }
                LookupOutcome::Error(e) => {
                    debug!("Lookup failed for {}: {}", candidate.external_id, e);
                    report.failed += 1;
                }
            }
        }

        metrics::enrich::batch_finished(&report);
        if report.failed > 0 {
            warn!(
                "Enrichment finished in {:.1}s: {} succeeded, {} failed, {} skipped",
                started_at.elapsed().as_secs_f64(),
                report.succeeded,
                report.failed,
                report.skipped
            );
        } else {
            info!(
                "Enrichment finished in {:.1}s: {} succeeded, {} skipped, {} fields filled",
                started_at.elapsed().as_secs_f64(),
                report.succeeded,
                report.skipped,
                report.fields_filled
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn candidate(id: &str) -> CandidateRecord {
        CandidateRecord {
            external_id: id.to_string(),
            name: format!("Title {id}"),
            release_date: None,
            duration_minutes: None,
            genres: Vec::new(),
            average_score: 8.0,
            vote_count: 1000,
            description: None,
            poster_url: None,
            director: None,
        }
    }

    fn details(plot: &str, director: &str, runtime: &str) -> TitleDetails {
        TitleDetails {
            plot: Some(plot.to_string()),
            poster: Some(format!("https://img/{plot}.jpg")),
            director: Some(director.to_string()),
            runtime: Some(runtime.to_string()),
        }
    }

    /// Scripted lookup that tracks peak in-flight calls
    struct FakeLookup {
        answers: HashMap<String, LookupOutcome>,
        delay: Duration,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        calls: Mutex<Vec<String>>,
    }

    impl FakeLookup {
        fn new(answers: Vec<(&str, LookupOutcome)>, delay: Duration) -> Self {
            Self {
                answers: answers.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
                delay,
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TitleLookup for FakeLookup {
        async fn lookup(&self, external_id: &str) -> LookupOutcome {
            self.calls.lock().unwrap().push(external_id.to_string());
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.answers
                .get(external_id)
                .cloned()
                .unwrap_or(LookupOutcome::NotFound)
        }
    }

    fn settings(concurrency: usize, capacity: u32, window_ms: u64) -> EnrichmentSettings {
        EnrichmentSettings {
            concurrency,
            rate_capacity: capacity,
            rate_window: Duration::from_millis(window_ms),
            timeout: Duration::from_secs(15),
        }
    }

    #[test]
    fn runtime_uses_leading_digit_run() {
        assert_eq!(parse_runtime_minutes("142 min"), Some(142));
        assert_eq!(parse_runtime_minutes("  90min"), Some(90));
        assert_eq!(parse_runtime_minutes("N/A"), None);
        assert_eq!(parse_runtime_minutes("0 min"), None);
        assert_eq!(parse_runtime_minutes("99999999999 min"), None);
    }

    #[test]
    fn patch_never_overwrites_present_fields() {
        let mut c = candidate("tt1");
        c.director = Some("Nolan".to_string());
        let found = TitleDetails {
            plot: Some("A story".to_string()),
            poster: None,
            director: Some("Other".to_string()),
            runtime: None,
        };

        let patch = EnrichmentPatch::from_details(&c, &found);
        assert_eq!(patch.director, None);
        let changed = c.apply(patch);

        assert_eq!(changed, 1);
        assert_eq!(c.director.as_deref(), Some("Nolan"));
        assert_eq!(c.description.as_deref(), Some("A story"));
        assert_eq!(c.poster_url, None);
    }

    #[test]
    fn apply_ignores_values_for_filled_slots() {
        let mut c = candidate("tt1");
        c.duration_minutes = Some(120);
        let changed = c.apply(EnrichmentPatch {
            duration_minutes: Some(5),
            ..Default::default()
        });
        assert_eq!(changed, 0);
        assert_eq!(c.duration_minutes, Some(120));
    }

    #[tokio::test]
    async fn merges_found_and_counts_failures() {
        let lookup = Arc::new(FakeLookup::new(
            vec![
                ("tt1", LookupOutcome::Found(details("Plot one", "Kurosawa", "207 min"))),
                ("tt2", LookupOutcome::NotFound),
                ("tt3", LookupOutcome::Error("connection reset".into())),
            ],
            Duration::from_millis(1),
        ));
        let enricher = Enricher::new(lookup.clone(), settings(4, 100, 10));

        let mut complete = candidate("tt4");
        complete.description = Some("d".into());
        complete.poster_url = Some("p".into());
        complete.director = Some("x".into());
        complete.duration_minutes = Some(1);

        let mut batch = vec![candidate("tt1"), candidate("tt2"), candidate("tt3"), complete.clone()];
        let report = enricher.enrich(&mut batch).await;

        assert_eq!(
            report,
            EnrichReport {
                succeeded: 1,
                failed: 2,
                skipped: 1,
                fields_filled: 4,
            }
        );
        assert_eq!(batch[0].director.as_deref(), Some("Kurosawa"));
        assert_eq!(batch[0].duration_minutes, Some(207));
        assert_eq!(batch[1], candidate("tt2"));
        assert_eq!(batch[2], candidate("tt3"));
        assert_eq!(batch[3], complete);
        assert!(!lookup.calls.lock().unwrap().contains(&"tt4".to_string()));
    }

    #[tokio::test]
    async fn in_flight_lookups_never_exceed_limit() {
        let lookup = Arc::new(FakeLookup::new(Vec::new(), Duration::from_millis(20)));
        let enricher = Enricher::new(lookup.clone(), settings(3, 1000, 10));

        let mut batch: Vec<_> = (0..12).map(|i| candidate(&format!("tt{i}"))).collect();
        let report = enricher.enrich(&mut batch).await;

        assert_eq!(report.failed, 12);
        assert_eq!(lookup.calls.lock().unwrap().len(), 12);
        let peak = lookup.peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak in-flight was {peak}");
        assert_eq!(lookup.in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn starts_are_rate_limited_per_window() {
        let lookup = Arc::new(FakeLookup::new(Vec::new(), Duration::from_millis(1)));
        let enricher = Enricher::new(lookup, settings(10, 2, 1000));

        let t0 = tokio::time::Instant::now();
        let mut batch: Vec<_> = (0..5).map(|i| candidate(&format!("tt{i}"))).collect();
        enricher.enrich(&mut batch).await;

        // 5 starts at 2 per window need three windows
        assert!(t0.elapsed() >= Duration::from_millis(2000));
        assert!(t0.elapsed() < Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_lookup_times_out_without_aborting_batch() {
        let lookup = Arc::new(FakeLookup::new(
            vec![("tt1", LookupOutcome::Found(details("p", "d", "90 min")))],
            Duration::from_secs(60),
        ));
        let mut s = settings(2, 100, 10);
        s.timeout = Duration::from_secs(15);
        let enricher = Enricher::new(lookup, s);

        let mut batch = vec![candidate("tt1"), candidate("tt2")];
        let report = enricher.enrich(&mut batch).await;

        assert_eq!(report.failed, 2);
        assert_eq!(report.succeeded, 0);
        assert_eq!(batch[0], candidate("tt1"));
    }
}
