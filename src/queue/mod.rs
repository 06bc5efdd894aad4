//! Deferred record-creation queue.
//!
//! [`QueueService`] hands out a job id immediately and executes the payload
//! later through a [`JobHandler`], retrying up to a fixed attempt budget.
//! The backend is chosen once, when the service is built: a SQLite-backed
//! durable queue when a broker path is configured, an in-process queue
//! otherwise. Both run at most `concurrency` handler calls at a time.

pub mod durable;
pub mod ephemeral;
pub mod handlers;

use crate::common::error::{ImporterError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::Value;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub use durable::{DurableQueue, LeaseSweep};
pub use ephemeral::EphemeralQueue;
pub use handlers::InsertRecordHandler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "pending" => Ok(JobState::Pending),
            "running" => Ok(JobState::Running),
            "succeeded" => Ok(JobState::Succeeded),
            "failed" => Ok(JobState::Failed),
            other => Err(ImporterError::queue(format!("unknown job state {other:?}"))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: String,
    pub payload: Value,
    /// Attempts started so far
    pub attempts: u32,
    pub state: JobState,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    fn new(id: String, payload: Value) -> Self {
        let now = Utc::now();
        Self {
            id,
            payload,
            attempts: 0,
            state: JobState::Pending,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Result of one handler attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Success,
    /// Worth another attempt if the budget allows
    Retryable(String),
    /// Never retried
    Fatal(String),
}

/// Executes job payloads. Must tolerate being called more than once for the
/// same job id.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn process(&self, job_id: &str, payload: &Value) -> JobOutcome;
}

/// Submission side shared by every backend
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Records the job and returns its id without waiting for execution
    async fn enqueue(&self, payload: Value) -> Result<String>;
    async fn job(&self, id: &str) -> Result<Option<Job>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    pub concurrency: usize,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub lease_timeout: Duration,
    pub poll_interval: Duration,
    /// Finished jobs the in-process backend keeps around for inspection
    pub retain_finished: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_attempts: 3,
            backoff_base: Duration::from_millis(1000),
            backoff_max: Duration::from_millis(30_000),
            lease_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_millis(500),
            retain_finished: 1000,
        }
    }
}

impl QueueSettings {
    /// Delay before retrying after failed attempt number `attempt` (1-based):
    /// `backoff_base * 2^(attempt-1)`, capped at `backoff_max`, then jittered
    /// by up to 25% either way.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let nominal = self
            .backoff_base
            .saturating_mul(1u32 << exp)
            .min(self.backoff_max);
        let factor = rand::thread_rng().gen_range(0.75..=1.25);
        nominal.mul_f64(factor)
    }

    /// Whether a job that has started `attempts` attempts may run again
    pub fn has_attempts_left(&self, attempts: u32) -> bool {
        attempts < self.max_attempts.max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Ephemeral,
    Durable,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Ephemeral => "ephemeral",
            BackendKind::Durable => "durable",
        }
    }
}

/// The queue a process uses for its whole lifetime
pub enum QueueService {
    Ephemeral(EphemeralQueue),
    Durable(DurableQueue),
}

impl QueueService {
    /// Durable iff `broker` is a non-empty path
    pub fn from_settings(
        settings: QueueSettings,
        broker: Option<&Path>,
        handler: Arc<dyn JobHandler>,
    ) -> Result<Self> {
        match broker.filter(|p| !p.as_os_str().is_empty()) {
            Some(path) => {
                info!("Using durable job queue at {}", path.display());
                Ok(QueueService::Durable(DurableQueue::open(path, settings, handler)?))
            }
            None => {
                info!("No queue broker configured; using in-process job queue");
                Ok(QueueService::Ephemeral(EphemeralQueue::new(settings, handler)))
            }
        }
    }

    pub fn backend_kind(&self) -> BackendKind {
        match self {
            QueueService::Ephemeral(_) => BackendKind::Ephemeral,
            QueueService::Durable(_) => BackendKind::Durable,
        }
    }

    /// Ephemeral: waits for every submitted job to reach a terminal state.
    /// Durable: processes pending jobs in this process until none remain.
    pub async fn drain(&self) -> Result<()> {
        match self {
            QueueService::Ephemeral(q) => {
                q.drain().await;
                Ok(())
            }
            QueueService::Durable(q) => q.work_until_idle().await.map(|_| ()),
        }
    }
}

#[async_trait]
impl JobQueue for QueueService {
    async fn enqueue(&self, payload: Value) -> Result<String> {
        match self {
            QueueService::Ephemeral(q) => q.enqueue(payload).await,
            QueueService::Durable(q) => q.enqueue(payload).await,
        }
    }

    async fn job(&self, id: &str) -> Result<Option<Job>> {
        match self {
            QueueService::Ephemeral(q) => q.job(id).await,
            QueueService::Durable(q) => q.job(id).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_within_jitter_and_caps() {
        let settings = QueueSettings {
            backoff_base: Duration::from_millis(1000),
            backoff_max: Duration::from_millis(3000),
            ..Default::default()
        };
        for _ in 0..50 {
            let first = settings.backoff_delay(1);
            assert!(first >= Duration::from_millis(750) && first <= Duration::from_millis(1250));
            let second = settings.backoff_delay(2);
            assert!(second >= Duration::from_millis(1500) && second <= Duration::from_millis(2500));
            let capped = settings.backoff_delay(10);
            assert!(capped >= Duration::from_millis(2250) && capped <= Duration::from_millis(3750));
        }
    }

    #[test]
    fn attempt_budget() {
        let settings = QueueSettings::default();
        assert!(settings.has_attempts_left(2));
        assert!(!settings.has_attempts_left(3));
    }

    #[test]
    fn state_names_round_trip() {
        for state in [JobState::Pending, JobState::Running, JobState::Succeeded, JobState::Failed] {
            assert_eq!(JobState::parse(state.as_str()).unwrap(), state);
        }
        assert!(JobState::parse("paused").is_err());
    }

    #[tokio::test]
    async fn blank_broker_selects_ephemeral() {
        struct Noop;
        #[async_trait]
        impl JobHandler for Noop {
            async fn process(&self, _: &str, _: &Value) -> JobOutcome {
                JobOutcome::Success
            }
        }

        let service = QueueService::from_settings(QueueSettings::default(), Some(Path::new("")), Arc::new(Noop)).unwrap();
        assert_eq!(service.backend_kind(), BackendKind::Ephemeral);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        let service = QueueService::from_settings(QueueSettings::default(), Some(&path), Arc::new(Noop)).unwrap();
        assert_eq!(service.backend_kind(), BackendKind::Durable);
    }
}
