//! Background job queue
//!
//! `federate` and every remote delivery run as independent jobs on a pool of
//! tokio workers fed by an mpsc channel. Failed jobs are re-queued with
//! exponential backoff until the attempt budget is spent, then dead-lettered.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::config::QueueConfig;
use crate::data::EntityId;
use crate::error::AppError;
use crate::metrics;

/// One remote delivery of an already serialized activity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteDelivery {
    pub activity_id: String,
    /// Public serialization, shared by every recipient
    pub payload: serde_json::Value,
    /// Local user ID of the sender
    pub sender_id: String,
    /// Recipient handle (`user@host`)
    pub recipient: String,
    pub distribution_id: String,
}

/// Unit of background work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Job {
    Federate { activity_id: String },
    DeliverRemote(RemoteDelivery),
}

impl Job {
    pub fn name(&self) -> &'static str {
        match self {
            Job::Federate { .. } => "federate",
            Job::DeliverRemote(_) => "deliver_remote",
        }
    }
}

/// Receipt for a submitted job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub id: String,
    pub job: &'static str,
}

/// Executes jobs
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<(), AppError>;
}

/// Accepts jobs for at-least-once execution
pub trait JobQueue: Send + Sync {
    fn submit(&self, job: Job) -> Result<JobHandle, AppError>;
}

/// Exponential backoff with a cap and an attempt budget
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Base delay for exponential backoff (milliseconds).
    pub base_backoff_ms: u64,
    /// Maximum backoff delay (milliseconds).
    pub max_backoff_ms: u64,
    /// Total attempts, including the first.
    pub max_attempts: u32,
}

impl From<&QueueConfig> for RetryPolicy {
    fn from(config: &QueueConfig) -> Self {
        Self {
            base_backoff_ms: config.base_backoff_ms,
            max_backoff_ms: config.max_backoff_ms,
            max_attempts: config.max_attempts,
        }
    }
}

impl RetryPolicy {
    /// Backoff for a retry number (0-indexed).
    pub fn compute_backoff_ms(&self, retry: u32) -> u64 {
        let exp = retry.min(30);
        let delay = self.base_backoff_ms.saturating_mul(1u64 << exp);
        delay.min(self.max_backoff_ms)
    }

    /// Delay before the next attempt, given how many attempts have run.
    ///
    /// Returns `None` once the attempt budget is spent.
    pub fn next_delay(&self, attempts_made: u32) -> Option<Duration> {
        if attempts_made >= self.max_attempts {
            return None;
        }
        Some(Duration::from_millis(
            self.compute_backoff_ms(attempts_made.saturating_sub(1)),
        ))
    }
}

/// A job that exhausted its retries or failed permanently
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub handle: JobHandle,
    pub job: Job,
    pub attempts: u32,
    pub error: String,
}

struct Envelope {
    handle: JobHandle,
    job: Job,
    attempt: u32,
}

struct Shared {
    sender: mpsc::UnboundedSender<Envelope>,
    policy: RetryPolicy,
    pending: AtomicUsize,
    /// Set by `shutdown`; retries and submissions stop once it is set
    closed: AtomicBool,
    dead_letters: std::sync::Mutex<Vec<DeadLetter>>,
}

impl Shared {
    fn finish(&self) {
        // `shutdown` may already have written the count off
        if self
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            metrics::JOBS_PENDING.dec();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// In-process worker pool
pub struct WorkerPool {
    shared: Arc<Shared>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<Envelope>>>,
    workers: usize,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(config: &QueueConfig) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                sender,
                policy: RetryPolicy::from(config),
                pending: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                dead_letters: std::sync::Mutex::new(Vec::new()),
            }),
            receiver: Arc::new(Mutex::new(receiver)),
            workers: config.workers.max(1),
            tasks: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Spawn the workers. Jobs submitted earlier are picked up now.
    pub fn start(&self, handler: Arc<dyn JobHandler>) {
        let mut tasks = match self.tasks.lock() {
            Ok(tasks) => tasks,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !tasks.is_empty() {
            tracing::warn!("Worker pool already started");
            return;
        }

        for worker_id in 0..self.workers {
            let receiver = self.receiver.clone();
            let shared = self.shared.clone();
            let handler = handler.clone();

            tasks.push(tokio::spawn(async move {
                loop {
                    let envelope = { receiver.lock().await.recv().await };
                    let Some(envelope) = envelope else {
                        break;
                    };
                    run_job(worker_id, &shared, handler.as_ref(), envelope).await;
                }
                tracing::debug!(worker_id, "Worker stopped");
            }));
        }

        tracing::info!(workers = self.workers, "Worker pool started");
    }

    /// Jobs submitted but not yet finished or dead-lettered
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }

    /// Wait until no jobs are pending.
    ///
    /// # Returns
    /// `false` if `timeout` elapsed first
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let started = Instant::now();
        while self.pending() > 0 {
            if started.elapsed() >= timeout {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        match self.shared.dead_letters.lock() {
            Ok(letters) => letters.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Stop all workers and refuse further jobs.
    ///
    /// Jobs still queued, running, or waiting for a retry are dropped and no
    /// longer count as pending.
    pub fn shutdown(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);

        let mut tasks = match self.tasks.lock() {
            Ok(tasks) => tasks,
            Err(poisoned) => poisoned.into_inner(),
        };
        for task in tasks.drain(..) {
            task.abort();
        }

        let dropped = self.shared.pending.swap(0, Ordering::SeqCst);
        metrics::JOBS_PENDING.sub(dropped as i64);
        tracing::info!(dropped, "Worker pool stopped");
    }
}

impl JobQueue for WorkerPool {
    fn submit(&self, job: Job) -> Result<JobHandle, AppError> {
        if self.shared.is_closed() {
            return Err(AppError::Queue("worker pool is closed".to_string()));
        }

        let handle = JobHandle {
            id: EntityId::new().0,
            job: job.name(),
        };

        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        metrics::JOBS_PENDING.inc();

        self.shared
            .sender
            .send(Envelope {
                handle: handle.clone(),
                job,
                attempt: 1,
            })
            .map_err(|_| {
                self.shared.finish();
                AppError::Queue("worker pool is closed".to_string())
            })?;

        // Lost a race with `shutdown`: nothing will run the job
        if self.shared.is_closed() {
            self.shared.finish();
            return Err(AppError::Queue("worker pool is closed".to_string()));
        }

        tracing::debug!(job_id = %handle.id, job = handle.job, "Job submitted");
        Ok(handle)
    }
}

async fn run_job(worker_id: usize, shared: &Arc<Shared>, handler: &dyn JobHandler, envelope: Envelope) {
    let Envelope {
        handle,
        job,
        attempt,
    } = envelope;

    let error = match handler.handle(&job).await {
        Ok(()) => {
            metrics::JOBS_TOTAL
                .with_label_values(&[handle.job, "success"])
                .inc();
            tracing::debug!(worker_id, job_id = %handle.id, job = handle.job, attempt, "Job succeeded");
            shared.finish();
            return;
        }
        Err(e) => e,
    };

    metrics::ERRORS_TOTAL
        .with_label_values(&[error.kind(), "job"])
        .inc();

    let delay = if error.is_retryable() {
        shared.policy.next_delay(attempt)
    } else {
        None
    };

    match delay {
        Some(delay) => {
            metrics::JOBS_TOTAL
                .with_label_values(&[handle.job, "retry"])
                .inc();
            tracing::warn!(
                worker_id,
                job_id = %handle.id,
                job = handle.job,
                attempt,
                retry_in_ms = delay.as_millis() as u64,
                error = %error,
                "Job failed, scheduling retry"
            );

            let shared = shared.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if shared.is_closed() {
                    tracing::debug!(job_id = %handle.id, job = handle.job, "Worker pool closed, dropping retry");
                    shared.finish();
                    return;
                }
                let retry = Envelope {
                    handle,
                    job,
                    attempt: attempt + 1,
                };
                if shared.sender.send(retry).is_err() {
                    shared.finish();
                }
            });
        }
        None => {
            metrics::JOBS_TOTAL
                .with_label_values(&[handle.job, "dead_letter"])
                .inc();
            tracing::error!(
                worker_id,
                job_id = %handle.id,
                job = handle.job,
                attempts = attempt,
                error = %error,
                "Job dead-lettered"
            );

            let letter = DeadLetter {
                handle,
                job,
                attempts: attempt,
                error: error.to_string(),
            };
            match shared.dead_letters.lock() {
                Ok(mut letters) => letters.push(letter),
                Err(poisoned) => poisoned.into_inner().push(letter),
            }
            shared.finish();
        }
    }
}

/// Queue that only records submitted jobs
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingQueue {
    pub jobs: std::sync::Mutex<Vec<Job>>,
}

#[cfg(test)]
impl RecordingQueue {
    pub fn jobs(&self) -> Vec<Job> {
        self.jobs.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl JobQueue for RecordingQueue {
    fn submit(&self, job: Job) -> Result<JobHandle, AppError> {
        let handle = JobHandle {
            id: EntityId::new().0,
            job: job.name(),
        };
        self.jobs.lock().unwrap().push(job);
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn config(max_attempts: u32) -> QueueConfig {
        QueueConfig {
            workers: 2,
            max_attempts,
            base_backoff_ms: 5,
            max_backoff_ms: 20,
        }
    }

    /// Fails the first `failures` calls
    struct FlakyHandler {
        failures: u32,
        calls: AtomicU32,
        error: fn() -> AppError,
    }

    #[async_trait]
    impl JobHandler for FlakyHandler {
        async fn handle(&self, _job: &Job) -> Result<(), AppError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err((self.error)())
            } else {
                Ok(())
            }
        }
    }

    fn delivery_error() -> AppError {
        AppError::Delivery {
            status: Some(503),
            message: "unavailable".to_string(),
        }
    }

    fn job() -> Job {
        Job::Federate {
            activity_id: "act-1".to_string(),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            base_backoff_ms: 100,
            max_backoff_ms: 1000,
            max_attempts: 10,
        };
        assert_eq!(policy.compute_backoff_ms(0), 100);
        assert_eq!(policy.compute_backoff_ms(1), 200);
        assert_eq!(policy.compute_backoff_ms(3), 800);
        assert_eq!(policy.compute_backoff_ms(4), 1000);
        assert_eq!(policy.compute_backoff_ms(64), 1000);
    }

    #[test]
    fn next_delay_respects_attempt_budget() {
        let policy = RetryPolicy {
            base_backoff_ms: 100,
            max_backoff_ms: 1000,
            max_attempts: 3,
        };
        assert_eq!(policy.next_delay(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.next_delay(2), Some(Duration::from_millis(200)));
        assert_eq!(policy.next_delay(3), None);
    }

    #[tokio::test]
    async fn failed_job_is_retried_until_success() {
        let pool = WorkerPool::new(&config(5));
        let handler = Arc::new(FlakyHandler {
            failures: 2,
            calls: AtomicU32::new(0),
            error: delivery_error,
        });
        pool.start(handler.clone());

        pool.submit(job()).unwrap();

        assert!(pool.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert!(pool.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn exhausted_job_is_dead_lettered() {
        let pool = WorkerPool::new(&config(3));
        let handler = Arc::new(FlakyHandler {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
            error: delivery_error,
        });
        pool.start(handler.clone());

        pool.submit(job()).unwrap();

        assert!(pool.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);

        let letters = pool.dead_letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].attempts, 3);
        assert_eq!(letters[0].job, job());
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let pool = WorkerPool::new(&config(5));
        let handler = Arc::new(FlakyHandler {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
            error: || AppError::NotFound,
        });
        pool.start(handler.clone());

        pool.submit(job()).unwrap();

        assert!(pool.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(pool.dead_letters().len(), 1);
    }

    #[tokio::test]
    async fn jobs_submitted_before_start_run_after_start() {
        let pool = WorkerPool::new(&config(1));
        pool.submit(job()).unwrap();
        pool.submit(job()).unwrap();
        assert_eq!(pool.pending(), 2);

        let handler = Arc::new(FlakyHandler {
            failures: 0,
            calls: AtomicU32::new(0),
            error: delivery_error,
        });
        pool.start(handler.clone());

        assert!(pool.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn shutdown_drops_scheduled_retries() {
        let pool = WorkerPool::new(&QueueConfig {
            workers: 1,
            max_attempts: 5,
            base_backoff_ms: 50,
            max_backoff_ms: 50,
        });
        let handler = Arc::new(FlakyHandler {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
            error: delivery_error,
        });
        pool.start(handler.clone());

        pool.submit(job()).unwrap();
        while handler.calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        pool.shutdown();
        assert_eq!(pool.pending(), 0);
        assert!(pool.wait_idle(Duration::from_millis(100)).await);

        // Past the retry delay: the retry neither runs nor revives the count
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(pool.pending(), 0);
        assert!(pool.dead_letters().is_empty());

        assert!(matches!(pool.submit(job()), Err(AppError::Queue(_))));
        assert_eq!(pool.pending(), 0);
    }
}
