use super::{Job, JobHandler, JobOutcome, JobQueue, JobState, QueueSettings};
use crate::common::constants::SQLITE_BUSY_TIMEOUT_MS;
use crate::common::error::{ImporterError, Result};
use crate::observability::metrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

const BACKEND: &str = "durable";

/// A job taken by this process, with the attempt number it is running
#[derive(Debug, Clone)]
struct Claim {
    id: String,
    payload: Value,
    attempt: u32,
}

/// Result of one lease-expiry sweep
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LeaseSweep {
    /// Returned to pending for another attempt
    pub requeued: usize,
    /// Out of attempts, marked failed
    pub failed: usize,
}

/// Job queue persisted in a SQLite `jobs` table.
///
/// Claiming flips `pending` to `running` inside an immediate transaction and
/// stamps a lease, so several processes can share one broker file. A worker
/// that dies mid-job leaves the row `running` until
/// [`DurableQueue::requeue_expired_leases`] reclaims it.
#[derive(Clone)]
pub struct DurableQueue {
    conn: Arc<Mutex<Connection>>,
    handler: Arc<dyn JobHandler>,
    settings: QueueSettings,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| ImporterError::queue(format!("bad timestamp {raw:?}: {e}")))
}

impl DurableQueue {
    pub fn open<P: AsRef<Path>>(path: P, settings: QueueSettings, handler: Arc<dyn JobHandler>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_millis(SQLITE_BUSY_TIMEOUT_MS))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            CREATE TABLE IF NOT EXISTS jobs (
                id                TEXT PRIMARY KEY,
                payload           TEXT NOT NULL,
                state             TEXT NOT NULL,
                attempts          INTEGER NOT NULL DEFAULT 0,
                last_error        TEXT,
                run_at            INTEGER NOT NULL,
                lease_expires_at  INTEGER,
                created_at        TEXT NOT NULL,
                updated_at        TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS jobs_ready ON jobs (state, run_at);
            "#,
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            handler,
            settings,
        })
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| ImporterError::queue("queue connection lock poisoned"))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| ImporterError::queue(format!("queue task failed: {e}")))?
    }

    /// Takes the oldest ready job, if any
    async fn claim(&self) -> Result<Option<Claim>> {
        let lease = millis(self.settings.lease_timeout);
        self.with_conn(move |conn| {
            // Take the write lock up front; a deferred read cannot be upgraded
            // while another connection holds it.
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now = now_ms();
            let row: Option<(String, String, u32)> = tx
                .query_row(
                    "SELECT id, payload, attempts FROM jobs
                     WHERE state = 'pending' AND run_at <= ?1
                     ORDER BY run_at, created_at LIMIT 1",
                    params![now],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;
            let Some((id, payload, attempts)) = row else {
                return Ok(None);
            };

            let changed = tx.execute(
                "UPDATE jobs SET state = 'running', attempts = attempts + 1,
                     lease_expires_at = ?1, updated_at = ?2
                 WHERE id = ?3 AND state = 'pending'",
                params![now.saturating_add(lease), Utc::now().to_rfc3339(), id],
            )?;
            tx.commit()?;
            if changed == 0 {
                return Ok(None);
            }

            Ok(Some(Claim {
                id,
                payload: serde_json::from_str(&payload)?,
                attempt: attempts + 1,
            }))
        })
        .await
    }

    /// Records the outcome of `claim` and returns the state written. Returns
    /// `None` without touching the row if the lease was reclaimed and the job
    /// has moved on to another attempt.
    async fn finish(&self, claim: &Claim, outcome: &JobOutcome) -> Result<Option<JobState>> {
        let (state, error, run_at) = match outcome {
            JobOutcome::Success => (JobState::Succeeded, None, now_ms()),
            JobOutcome::Fatal(e) => (JobState::Failed, Some(e.clone()), now_ms()),
            JobOutcome::Retryable(e) if self.settings.has_attempts_left(claim.attempt) => {
                let delay = self.settings.backoff_delay(claim.attempt);
                (JobState::Pending, Some(e.clone()), now_ms().saturating_add(millis(delay)))
            }
            JobOutcome::Retryable(e) => (JobState::Failed, Some(e.clone()), now_ms()),
        };

        let id = claim.id.clone();
        let attempt = claim.attempt;
        let changed = self
            .with_conn(move |conn| {
                Ok(conn.execute(
                    "UPDATE jobs SET state = ?1, last_error = COALESCE(?2, last_error), run_at = ?3,
                         lease_expires_at = NULL, updated_at = ?4
                     WHERE id = ?5 AND state = 'running' AND attempts = ?6",
                    params![state.as_str(), error, run_at, Utc::now().to_rfc3339(), id, attempt],
                )?)
            })
            .await?;

        if changed == 0 {
            warn!("Job {} attempt {} finished after its lease was reclaimed", claim.id, attempt);
            return Ok(None);
        }
        Ok(Some(state))
    }

    /// Claims and runs one job. Returns false when nothing was ready.
    pub async fn process_one(&self) -> Result<bool> {
        let Some(claim) = self.claim().await? else {
            return Ok(false);
        };

        let outcome = self.handler.process(&claim.id, &claim.payload).await;
        match self.finish(&claim, &outcome).await? {
            None => {}
            Some(JobState::Succeeded) => {
                debug!("Job {} succeeded on attempt {}", claim.id, claim.attempt);
                metrics::queue::job_succeeded(BACKEND);
            }
            Some(JobState::Pending) => {
                debug!("Job {} attempt {} failed, will retry", claim.id, claim.attempt);
                metrics::queue::job_retried(BACKEND);
            }
            Some(_) => {
                warn!("Job {} failed on attempt {}: {:?}", claim.id, claim.attempt, outcome);
                metrics::queue::job_failed(BACKEND);
            }
        }
        Ok(true)
    }

    /// Pending jobs and the earliest time one becomes ready
    async fn pending_summary(&self) -> Result<(u64, Option<i64>)> {
        self.with_conn(|conn| {
            let (count, next): (i64, Option<i64>) = conn.query_row(
                "SELECT COUNT(*), MIN(run_at) FROM jobs WHERE state = 'pending'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            Ok((count.max(0) as u64, next))
        })
        .await
    }

    /// Runs `concurrency` workers until no pending job is left, waiting out
    /// retry backoff. Jobs stuck `running` under another process's lease are
    /// not waited for. Returns how many attempts were executed.
    pub async fn work_until_idle(&self) -> Result<usize> {
        let mut executed = 0;
        loop {
            let mut workers = JoinSet::new();
            for _ in 0..self.settings.concurrency.max(1) {
                let queue = self.clone();
                workers.spawn(async move {
                    let mut done = 0usize;
                    while queue.process_one().await? {
                        done += 1;
                    }
                    Ok::<usize, ImporterError>(done)
                });
            }
            while let Some(joined) = workers.join_next().await {
                executed += joined.map_err(|e| ImporterError::queue(format!("worker aborted: {e}")))??;
            }

            let (pending, next_run) = self.pending_summary().await?;
            if pending == 0 {
                return Ok(executed);
            }
            let wait = next_run
                .map(|at| at.saturating_sub(now_ms()).max(1))
                .map(|ms| Duration::from_millis(ms as u64))
                .unwrap_or(self.settings.poll_interval)
                .min(self.settings.poll_interval);
            tokio::time::sleep(wait).await;
        }
    }

    /// Runs `concurrency` polling workers until `shutdown` flips to true.
    /// Workers finish their current job before exiting.
    pub async fn run_workers(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            "Starting {} queue workers (poll every {:?})",
            self.settings.concurrency, self.settings.poll_interval
        );
        let mut workers = JoinSet::new();
        for worker in 0..self.settings.concurrency.max(1) {
            let queue = self.clone();
            let mut shutdown = shutdown.clone();
            workers.spawn(async move {
                loop {
                    let stop = *shutdown.borrow();
                    if stop {
                        break;
                    }
                    match queue.process_one().await {
                        Ok(true) => continue,
                        Ok(false) => {}
                        Err(e) => warn!("Worker {} error: {}", worker, e),
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(queue.settings.poll_interval) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
                debug!("Worker {} stopped", worker);
            });
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                warn!("Queue worker aborted: {}", e);
            }
        }
        info!("Queue workers stopped");
        Ok(())
    }

    /// Sends expired `running` jobs back to `pending`, or to `failed` when
    /// they have used their last attempt.
    pub async fn requeue_expired_leases(&self) -> Result<LeaseSweep> {
        let max_attempts = self.settings.max_attempts.max(1);
        let sweep = self
            .with_conn(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let now = now_ms();
                let stamp = Utc::now().to_rfc3339();
                let failed = tx.execute(
                    "UPDATE jobs SET state = 'failed', lease_expires_at = NULL, updated_at = ?1,
                         last_error = COALESCE(last_error, 'lease expired')
                     WHERE state = 'running' AND lease_expires_at < ?2 AND attempts >= ?3",
                    params![stamp, now, max_attempts],
                )?;
                let requeued = tx.execute(
                    "UPDATE jobs SET state = 'pending', lease_expires_at = NULL, run_at = ?2, updated_at = ?1,
                         last_error = COALESCE(last_error, 'lease expired')
                     WHERE state = 'running' AND lease_expires_at < ?2",
                    params![stamp, now],
                )?;
                tx.commit()?;
                Ok(LeaseSweep { requeued, failed })
            })
            .await?;

        if sweep.requeued > 0 || sweep.failed > 0 {
            info!("Lease sweep: {} requeued, {} failed", sweep.requeued, sweep.failed);
        }
        metrics::queue::leases_requeued(sweep.requeued);
        Ok(sweep)
    }
}

#[async_trait]
impl JobQueue for DurableQueue {
    async fn enqueue(&self, payload: Value) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let body = serde_json::to_string(&payload)?;
        let job_id = id.clone();
        self.with_conn(move |conn| {
            let stamp = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO jobs (id, payload, state, attempts, run_at, created_at, updated_at)
                 VALUES (?1, ?2, 'pending', 0, ?3, ?4, ?4)",
                params![job_id, body, now_ms(), stamp],
            )?;
            Ok(())
        })
        .await?;

        metrics::queue::job_enqueued(BACKEND);
        debug!("Enqueued durable job {}", id);
        Ok(id)
    }

    async fn job(&self, id: &str) -> Result<Option<Job>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let row: Option<(String, String, String, u32, Option<String>, String, String)> = conn
                .query_row(
                    "SELECT id, payload, state, attempts, last_error, created_at, updated_at
                     FROM jobs WHERE id = ?1",
                    params![id],
                    |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                            row.get(6)?,
                        ))
                    },
                )
                .optional()?;

            row.map(|(id, payload, state, attempts, last_error, created_at, updated_at)| {
                Ok(Job {
                    id,
                    payload: serde_json::from_str(&payload)?,
                    attempts,
                    state: JobState::parse(&state)?,
                    last_error,
                    created_at: parse_time(&created_at)?,
                    updated_at: parse_time(&updated_at)?,
                })
            })
            .transpose()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::{tempdir, TempDir};

    struct Counting {
        fail_first: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl JobHandler for Counting {
        async fn process(&self, _job_id: &str, _payload: &Value) -> JobOutcome {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_first {
                JobOutcome::Retryable(format!("attempt {n} failed"))
            } else {
                JobOutcome::Success
            }
        }
    }

    fn settings() -> QueueSettings {
        QueueSettings {
            concurrency: 2,
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(5),
            poll_interval: Duration::from_millis(10),
            lease_timeout: Duration::from_secs(60),
            ..Default::default()
        }
    }

    fn queue(dir: &TempDir, fail_first: usize, settings: QueueSettings) -> (DurableQueue, Arc<Counting>) {
        let handler = Arc::new(Counting {
            fail_first,
            calls: AtomicUsize::new(0),
        });
        let q = DurableQueue::open(dir.path().join("jobs.db"), settings, handler.clone()).unwrap();
        (q, handler)
    }

    #[tokio::test]
    async fn enqueue_returns_before_execution() {
        let dir = tempdir().unwrap();
        let (q, handler) = queue(&dir, 0, settings());
        let id = q.enqueue(json!({"name": "Heat"})).await.unwrap();

        let job = q.job(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.payload, json!({"name": "Heat"}));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let dir = tempdir().unwrap();
        let (q, _) = queue(&dir, 2, settings());
        let id = q.enqueue(json!({})).await.unwrap();

        assert_eq!(q.work_until_idle().await.unwrap(), 3);
        let job = q.job(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Succeeded);
        assert_eq!(job.attempts, 3);
    }

    #[tokio::test]
    async fn exhausted_jobs_fail_and_stay_failed() {
        let dir = tempdir().unwrap();
        let (q, handler) = queue(&dir, 100, settings());
        let id = q.enqueue(json!({})).await.unwrap();

        q.work_until_idle().await.unwrap();
        let job = q.job(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts, 3);
        assert_eq!(job.last_error.as_deref(), Some("attempt 3 failed"));

        assert_eq!(q.work_until_idle().await.unwrap(), 0);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn jobs_survive_reopen() {
        let dir = tempdir().unwrap();
        let id = {
            let (q, _) = queue(&dir, 0, settings());
            q.enqueue(json!({"n": 1})).await.unwrap()
        };
        let (q, handler) = queue(&dir, 0, settings());
        q.work_until_idle().await.unwrap();
        assert_eq!(q.job(&id).await.unwrap().unwrap().state, JobState::Succeeded);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_lease_is_requeued_or_failed() {
        let dir = tempdir().unwrap();
        let mut s = settings();
        s.lease_timeout = Duration::from_millis(0);
        s.max_attempts = 2;
        let (q, _) = queue(&dir, 0, s);

        let a = q.enqueue(json!({"n": "a"})).await.unwrap();
        // Simulate a crashed worker: claimed but never finished
        let first = q.claim().await.unwrap().unwrap();
        assert_eq!(first.id, a);
        tokio::time::sleep(Duration::from_millis(5)).await;

        let sweep = q.requeue_expired_leases().await.unwrap();
        assert_eq!(sweep, LeaseSweep { requeued: 1, failed: 0 });
        let job = q.job(&a).await.unwrap().unwrap();
        assert_eq!((job.state, job.attempts), (JobState::Pending, 1));
        assert_eq!(job.last_error.as_deref(), Some("lease expired"));

        q.claim().await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let sweep = q.requeue_expired_leases().await.unwrap();
        assert_eq!(sweep, LeaseSweep { requeued: 0, failed: 1 });
        assert_eq!(q.job(&a).await.unwrap().unwrap().state, JobState::Failed);
    }

    #[tokio::test]
    async fn late_finish_after_reclaim_is_ignored() {
        let dir = tempdir().unwrap();
        let mut s = settings();
        s.lease_timeout = Duration::from_millis(0);
        let (q, _) = queue(&dir, 0, s);
        let id = q.enqueue(json!({})).await.unwrap();

        let stale = q.claim().await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        q.requeue_expired_leases().await.unwrap();
        let fresh = q.claim().await.unwrap().unwrap();
        assert_eq!(fresh.attempt, 2);

        let applied = q.finish(&stale, &JobOutcome::Fatal("too late".into())).await.unwrap();
        assert_eq!(applied, None);
        let job = q.job(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Running);

        let applied = q.finish(&fresh, &JobOutcome::Success).await.unwrap();
        assert_eq!(applied, Some(JobState::Succeeded));
        assert_eq!(q.job(&id).await.unwrap().unwrap().state, JobState::Succeeded);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn queues_sharing_one_file_split_the_work() {
        let dir = tempdir().unwrap();
        let (a, calls_a) = queue(&dir, 0, settings());
        let (b, calls_b) = queue(&dir, 0, settings());
        let (c, calls_c) = queue(&dir, 0, settings());

        let mut ids = Vec::new();
        for i in 0..150 {
            let q = [&a, &b, &c][i % 3];
            ids.push(q.enqueue(json!({"n": i})).await.unwrap());
        }

        let (ra, rb, rc) = tokio::join!(a.work_until_idle(), b.work_until_idle(), c.work_until_idle());
        let executed = ra.unwrap() + rb.unwrap() + rc.unwrap();
        assert_eq!(executed, 150);

        let calls = [&calls_a, &calls_b, &calls_c]
            .iter()
            .map(|h| h.calls.load(Ordering::SeqCst))
            .sum::<usize>();
        assert_eq!(calls, 150);
        for id in &ids {
            let job = a.job(id).await.unwrap().unwrap();
            assert_eq!((job.state, job.attempts), (JobState::Succeeded, 1));
        }
    }

    #[tokio::test]
    async fn claim_of_an_already_taken_job_yields_nothing() {
        let dir = tempdir().unwrap();
        let (a, _) = queue(&dir, 0, settings());
        let (b, _) = queue(&dir, 0, settings());
        a.enqueue(json!({})).await.unwrap();

        assert!(a.claim().await.unwrap().is_some());
        assert!(b.claim().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn workers_stop_on_shutdown() {
        let dir = tempdir().unwrap();
        let (q, handler) = queue(&dir, 0, settings());
        for i in 0..5 {
            q.enqueue(json!({"n": i})).await.unwrap();
        }

        let (tx, rx) = watch::channel(false);
        let runner = {
            let q = q.clone();
            tokio::spawn(async move { q.run_workers(rx).await })
        };
        for _ in 0..200 {
            if handler.calls.load(Ordering::SeqCst) == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        runner.await.unwrap().unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 5);
    }
}
