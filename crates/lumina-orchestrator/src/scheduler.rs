//! Batch scheduler for generation tasks.
//!
//! Every task runs in its own tokio task. Concurrency is bounded by a
//! semaphore sized to the worker pool; each dispatched task leases a worker,
//! prepares its request, waits on the worker's limiter and issues the call.
//! A failing or panicking task only ever produces a failed result for itself.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use lumina_abstraction::{GenerationError, GenerationOutput};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::pool::WorkerPool;
use crate::retry::RetryPolicy;
use crate::task::{FailureKind, Task, TaskFailure, TaskGenerator, TaskResult};

/// Progress callback: `(completed, total, label)`.
pub type ProgressCallback = Arc<dyn Fn(usize, usize, &str) + Send + Sync>;

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Extra sleep, holding the worker, after a quota-exceeded signal.
    pub quota_backoff: Duration,
    /// Retries for transient failures.
    pub retry_policy: RetryPolicy,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self { quota_backoff: Duration::from_secs(10), retry_policy: RetryPolicy::none() }
    }
}

/// Runs generation tasks across the worker pool.
#[derive(Debug, Clone)]
pub struct BatchScheduler {
    pool: Arc<WorkerPool>,
    generator: Arc<TaskGenerator>,
    settings: SchedulerSettings,
}

enum Attempt {
    Done(TaskResult),
    Retry(TaskResult),
}

impl BatchScheduler {
    /// Create a new scheduler.
    pub fn new(pool: Arc<WorkerPool>, generator: Arc<TaskGenerator>, settings: SchedulerSettings) -> Self {
        Self { pool, generator, settings }
    }

    /// The pool this scheduler dispatches to.
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Runs every task and returns their results in input order.
    ///
    /// Tasks not yet dispatched when `cancel` fires produce no result; tasks
    /// already dispatched run to completion.
    pub async fn run(
        &self,
        tasks: Vec<Task>,
        cancel: &CancellationToken,
        on_progress: Option<ProgressCallback>,
    ) -> Vec<TaskResult> {
        let total = tasks.len();
        if total == 0 {
            return Vec::new();
        }

        let start_time = Instant::now();
        let semaphore = Arc::new(Semaphore::new(self.pool.len()));
        let completed = Arc::new(AtomicUsize::new(0));

        info!(total_tasks = total, concurrency = self.pool.len(), "Starting generation batch");

        let mut handles = Vec::with_capacity(total);
        for (index, task) in tasks.into_iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let completed = Arc::clone(&completed);
            let on_progress = on_progress.clone();
            let cancel = cancel.clone();
            let scheduler = self.clone();
            let fallback = TaskResult::failure(
                &task,
                TaskFailure::new(FailureKind::Internal, "task panicked"),
            );

            let handle = tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return None;
                };
                if cancel.is_cancelled() {
                    debug!(task_id = %task.id, "Skipping task after cancellation");
                    return None;
                }

                let label = task.label();
                let result = scheduler.execute(task).await;

                let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                if let Some(cb) = &on_progress {
                    cb(done, total, &label);
                }
                Some(result)
            });
            handles.push((index, fallback, handle));
        }

        let mut results = Vec::with_capacity(total);
        for (index, fallback, handle) in handles {
            match handle.await {
                Ok(Some(result)) => results.push((index, result)),
                Ok(None) => {}
                Err(e) => {
                    error!(task_id = %fallback.task_id, "Task join error: {}", e);
                    results.push((index, fallback));
                }
            }
        }
        results.sort_by_key(|(index, _)| *index);

        let succeeded = results.iter().filter(|(_, r)| r.is_success()).count();
        info!(
            total_tasks = total,
            returned = results.len(),
            succeeded,
            failed = results.len() - succeeded,
            duration_secs = start_time.elapsed().as_secs(),
            "Generation batch completed"
        );

        results.into_iter().map(|(_, result)| result).collect()
    }

    /// Runs one task with the configured retry policy.
    async fn execute(&self, task: Task) -> TaskResult {
        let started = Instant::now();
        let policy = &self.settings.retry_policy;
        let mut retry_count = 0;

        loop {
            let mut result = match self.attempt(&task, retry_count).await {
                Attempt::Done(result) => result,
                Attempt::Retry(result) if retry_count < policy.max_retries => {
                    let delay = policy.calculate_delay(retry_count);
                    debug!(
                        task_id = %task.id,
                        retry_count = retry_count + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = ?result.failure,
                        "Retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                    retry_count += 1;
                    continue;
                }
                Attempt::Retry(result) => result,
            };
            result.attempts = retry_count + 1;
            result.elapsed = started.elapsed();
            return result;
        }
    }

    /// One lease-prepare-call-classify cycle. Retries rotate the reference
    /// through the item's photos.
    async fn attempt(&self, task: &Task, retry_count: u32) -> Attempt {
        let lease = self.pool.checkout().await;
        let worker = lease.worker();
        let credential = worker.credential().id.clone();

        let request = self.generator.prepare_attempt(task, retry_count).await;
        let used_reference = request.reference.is_some();
        let reference_url = task.reference_url_for(retry_count).map(str::to_string);
        let (outcome, waited) = worker.generate(&request).await;

        let (mut result, retryable) = match outcome {
            Ok(GenerationOutput::Image(image)) => {
                debug!(
                    task_id = %task.id,
                    credential = %credential,
                    bytes = image.data.len(),
                    wait_ms = waited.as_millis() as u64,
                    "Task succeeded"
                );
                (TaskResult::success(task, image), false)
            }
            Ok(GenerationOutput::NoOutput { reason }) => {
                let message = reason.unwrap_or_else(|| "no image returned".to_string());
                warn!(task_id = %task.id, credential = %credential, reason = %message, "Content policy rejection");
                (TaskResult::failure(task, TaskFailure::new(FailureKind::ContentPolicy, message)), false)
            }
            Err(e) => {
                let retryable = e.is_retryable();
                warn!(task_id = %task.id, credential = %credential, error = %e, retryable, "Generation failed");
                if e.is_quota_exceeded() && !self.settings.quota_backoff.is_zero() {
                    debug!(
                        credential = %credential,
                        backoff_secs = self.settings.quota_backoff.as_secs(),
                        "Quota exceeded, backing off"
                    );
                    tokio::time::sleep(self.settings.quota_backoff).await;
                }
                (TaskResult::failure(task, classify(&e)), retryable)
            }
        };
        drop(lease);

        result.credential = Some(credential);
        result.used_reference = used_reference;
        result.reference_url = reference_url.filter(|_| used_reference);
        if retryable { Attempt::Retry(result) } else { Attempt::Done(result) }
    }
}

fn classify(error: &GenerationError) -> TaskFailure {
    let kind = if error.is_retryable() { FailureKind::Transient } else { FailureKind::Permanent };
    TaskFailure::new(kind, error.to_string())
}
