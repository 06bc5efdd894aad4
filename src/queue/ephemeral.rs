use super::{Job, JobHandler, JobOutcome, JobQueue, JobState, QueueSettings};
use crate::common::constants::EPHEMERAL_JOB_PREFIX;
use crate::common::error::{ImporterError, Result};
use crate::observability::metrics;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};
use uuid::Uuid;

const BACKEND: &str = "ephemeral";

/// Job records plus the order in which they finished, oldest first
#[derive(Default)]
struct JobTable {
    jobs: HashMap<String, Job>,
    finished: VecDeque<String>,
}

struct Shared {
    table: Mutex<JobTable>,
    permits: Semaphore,
    handler: Arc<dyn JobHandler>,
    settings: QueueSettings,
}

impl Shared {
    /// Applies `f` to a job. Once the job is terminal it joins the finished
    /// list, and the oldest finished jobs beyond `retain_finished` are dropped.
    fn update<F: FnOnce(&mut Job)>(&self, id: &str, f: F) -> Option<Job> {
        let mut table = self.table.lock().ok()?;
        let job = table.jobs.get_mut(id)?;
        f(job);
        job.updated_at = Utc::now();
        let snapshot = job.clone();

        if snapshot.state.is_terminal() {
            table.finished.push_back(snapshot.id.clone());
            while table.finished.len() > self.settings.retain_finished {
                if let Some(old) = table.finished.pop_front() {
                    table.jobs.remove(&old);
                }
            }
        }
        Some(snapshot)
    }
}

/// In-process queue. Jobs live only as long as the process; each one runs on
/// its own task and takes a permit for every attempt. Only the most recent
/// `retain_finished` terminal jobs stay visible through [`JobQueue::job`].
pub struct EphemeralQueue {
    shared: Arc<Shared>,
    tasks: Mutex<JoinSet<()>>,
}

impl EphemeralQueue {
    pub fn new(settings: QueueSettings, handler: Arc<dyn JobHandler>) -> Self {
        Self {
            shared: Arc::new(Shared {
                table: Mutex::new(JobTable::default()),
                permits: Semaphore::new(settings.concurrency.max(1)),
                handler,
                settings,
            }),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Collects tasks that already finished. Returns how many are still running.
    fn reap_finished(&self) -> Result<usize> {
        let mut tasks = self
            .tasks
            .lock()
            .map_err(|_| ImporterError::queue("task set lock poisoned"))?;
        while let Some(joined) = tasks.try_join_next() {
            if let Err(e) = joined {
                warn!("Queue task aborted: {}", e);
            }
        }
        Ok(tasks.len())
    }

    /// Waits until every job submitted so far has finished, including jobs
    /// enqueued while draining.
    pub async fn drain(&self) {
        loop {
            let mut batch = match self.tasks.lock() {
                Ok(mut tasks) => std::mem::take(&mut *tasks),
                Err(_) => return,
            };
            if batch.is_empty() {
                return;
            }
            while let Some(joined) = batch.join_next().await {
                if let Err(e) = joined {
                    warn!("Queue task aborted: {}", e);
                }
            }
        }
    }
}

async fn run_job(shared: Arc<Shared>, id: String, payload: Value) {
    loop {
        let outcome = {
            let Ok(_permit) = shared.permits.acquire().await else {
                return;
            };
            shared.update(&id, |job| {
                job.state = JobState::Running;
                job.attempts += 1;
            });
            shared.handler.process(&id, &payload).await
        };

        let Some(job) = shared.update(&id, |job| match &outcome {
            JobOutcome::Success => {
                job.state = JobState::Succeeded;
                job.last_error = None;
            }
            JobOutcome::Fatal(e) => {
                job.state = JobState::Failed;
                job.last_error = Some(e.clone());
            }
            JobOutcome::Retryable(e) => {
                job.last_error = Some(e.clone());
                job.state = if shared.settings.has_attempts_left(job.attempts) {
                    JobState::Pending
                } else {
                    JobState::Failed
                };
            }
        }) else {
            return;
        };

        match job.state {
            JobState::Succeeded => {
                debug!("Job {} succeeded after {} attempt(s)", id, job.attempts);
                metrics::queue::job_succeeded(BACKEND);
                return;
            }
            JobState::Pending => {
                let delay = shared.settings.backoff_delay(job.attempts);
                debug!("Job {} attempt {} failed, retrying in {:?}", id, job.attempts, delay);
                metrics::queue::job_retried(BACKEND);
                tokio::time::sleep(delay).await;
            }
            _ => {
                warn!(
                    "Job {} failed after {} attempt(s): {}",
                    id,
                    job.attempts,
                    job.last_error.as_deref().unwrap_or("unknown error")
                );
                metrics::queue::job_failed(BACKEND);
                return;
            }
        }
    }
}

#[async_trait]
impl JobQueue for EphemeralQueue {
    async fn enqueue(&self, payload: Value) -> Result<String> {
        let id = format!("{}{}", EPHEMERAL_JOB_PREFIX, Uuid::new_v4());
        self.reap_finished()?;
        self.shared
            .table
            .lock()
            .map_err(|_| ImporterError::queue("job table lock poisoned"))?
            .jobs
            .insert(id.clone(), Job::new(id.clone(), payload.clone()));

        self.tasks
            .lock()
            .map_err(|_| ImporterError::queue("task set lock poisoned"))?
            .spawn(run_job(Arc::clone(&self.shared), id.clone(), payload));

        metrics::queue::job_enqueued(BACKEND);
        debug!("Enqueued job {}", id);
        Ok(id)
    }

    async fn job(&self, id: &str) -> Result<Option<Job>> {
        Ok(self
            .shared
            .table
            .lock()
            .map_err(|_| ImporterError::queue("job table lock poisoned"))?
            .jobs
            .get(id)
            .cloned())
    }
}
