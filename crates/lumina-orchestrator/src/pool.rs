//! Worker pool with round-robin checkout.
//!
//! Workers are handed out from a FIFO of indices. A checked-in worker goes
//! to the back of the queue, so under sustained load every credential gets a
//! turn, and slow (low-tier) credentials are naturally held longer by their
//! own limiter.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::{CredentialConfig, LimitsConfig, QuotaTier};
use crate::error::{OrchestratorError, Result};
use crate::worker::{GeneratorFactory, Worker, WorkerStats};

#[derive(Debug, Default)]
struct IndexQueue {
    seeded: bool,
    indices: VecDeque<usize>,
}

/// Aggregate throughput of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolCapacity {
    /// Number of workers.
    pub workers: usize,
    /// Sum of all ceilings.
    pub total_per_window: u32,
    /// Sum of high-tier ceilings.
    pub high_tier_per_window: u32,
    /// Sum of low-tier ceilings.
    pub low_tier_per_window: u32,
    /// Length of the quota window.
    pub window: Duration,
}

impl PoolCapacity {
    /// Rough wall-clock estimate for `tasks` requests at full capacity.
    pub fn estimated_duration(&self, tasks: usize) -> Duration {
        if self.total_per_window == 0 {
            return Duration::ZERO;
        }
        self.window.mul_f64(tasks as f64 / f64::from(self.total_per_window))
    }
}

/// Fixed set of workers with exclusive checkout.
#[derive(Debug)]
pub struct WorkerPool {
    workers: Vec<Arc<Worker>>,
    queue: Mutex<IndexQueue>,
    available: Semaphore,
    window: Duration,
}

impl WorkerPool {
    /// Creates a pool from initialised workers.
    ///
    /// # Errors
    /// Returns `NoUsableCredentials` if `workers` is empty.
    pub fn new(workers: Vec<Worker>, window: Duration) -> Result<Self> {
        if workers.is_empty() {
            return Err(OrchestratorError::NoUsableCredentials(
                "worker pool needs at least one worker".to_string(),
            ));
        }

        let pool = Self {
            available: Semaphore::new(workers.len()),
            workers: workers.into_iter().map(Arc::new).collect(),
            queue: Mutex::new(IndexQueue::default()),
            window,
        };

        let capacity = pool.capacity();
        info!(
            workers = capacity.workers,
            total_per_window = capacity.total_per_window,
            high_tier = capacity.high_tier_per_window,
            low_tier = capacity.low_tier_per_window,
            "Worker pool ready"
        );
        Ok(pool)
    }

    /// Builds one worker per credential. Credentials that fail to initialise
    /// are dropped with a warning.
    ///
    /// # Errors
    /// Returns `NoUsableCredentials` if none initialise.
    pub fn from_config(
        credentials: &[CredentialConfig],
        limits: &LimitsConfig,
        factory: &dyn GeneratorFactory,
    ) -> Result<Self> {
        let mut workers = Vec::with_capacity(credentials.len());
        let mut rejected = Vec::new();

        for config in credentials {
            match Worker::from_config(config, limits, factory) {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    warn!(credential = %config.id, error = %e, "Dropping credential");
                    rejected.push(format!("{}: {}", config.id, e));
                }
            }
        }

        if workers.is_empty() {
            return Err(OrchestratorError::NoUsableCredentials(if rejected.is_empty() {
                "no credentials configured".to_string()
            } else {
                rejected.join("; ")
            }));
        }
        Self::new(workers, limits.window())
    }

    /// Number of workers.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Always false; an empty pool cannot be constructed.
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Takes the next idle worker, waiting if all are checked out.
    ///
    /// The returned lease checks the worker back in when dropped.
    pub async fn checkout(self: &Arc<Self>) -> WorkerLease {
        // The semaphore is never closed.
        if let Ok(permit) = self.available.acquire().await {
            permit.forget();
        }

        let index = {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            if !queue.seeded {
                queue.indices.extend(0..self.workers.len());
                queue.seeded = true;
            }
            // One permit per queued index, so a granted permit implies an entry.
            debug_assert!(!queue.indices.is_empty(), "permit granted with an empty worker queue");
            match queue.indices.pop_front() {
                Some(index) => index,
                None => {
                    warn!(workers = self.workers.len(), "Worker queue empty after permit; reusing worker 0");
                    0
                }
            }
        };

        debug!(index, credential = %self.workers[index].credential().id, "Worker checked out");
        WorkerLease { pool: Arc::clone(self), index, worker: Arc::clone(&self.workers[index]) }
    }

    /// Returns a worker to the back of the queue.
    fn checkin(&self, index: usize) {
        {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            queue.indices.push_back(index);
        }
        self.available.add_permits(1);
        debug!(index, "Worker checked in");
    }

    /// Tier-aware throughput summary.
    pub fn capacity(&self) -> PoolCapacity {
        let mut capacity = PoolCapacity {
            workers: self.workers.len(),
            total_per_window: 0,
            high_tier_per_window: 0,
            low_tier_per_window: 0,
            window: self.window,
        };
        for worker in &self.workers {
            let credential = worker.credential();
            capacity.total_per_window += credential.ceiling;
            match credential.tier {
                QuotaTier::High => capacity.high_tier_per_window += credential.ceiling,
                QuotaTier::Low => capacity.low_tier_per_window += credential.ceiling,
            }
        }
        capacity
    }

    /// Counters for every worker, in configuration order.
    pub fn stats(&self) -> Vec<WorkerStats> {
        self.workers.iter().map(|w| w.stats()).collect()
    }

    /// Worker by index.
    pub fn worker(&self, index: usize) -> Option<&Arc<Worker>> {
        self.workers.get(index)
    }
}

/// Exclusive use of one worker until dropped.
#[derive(Debug)]
pub struct WorkerLease {
    pool: Arc<WorkerPool>,
    index: usize,
    worker: Arc<Worker>,
}

impl WorkerLease {
    /// Position of the worker in the pool.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The leased worker.
    pub fn worker(&self) -> &Worker {
        &self.worker
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        self.pool.checkin(self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::Credential;
    use lumina_abstraction::{GenerationError, ImageGenerator};
    use lumina_models::MockImageGenerator;

    fn limits() -> LimitsConfig {
        LimitsConfig::default()
    }

    fn worker(id: &str, tier: QuotaTier) -> Worker {
        let config = CredentialConfig::inline(id, tier, "k");
        Worker::new(Credential::from_config(&config, &limits()), Arc::new(MockImageGenerator::new(id)))
    }

    fn mock_factory(
        config: &CredentialConfig,
        _: &str,
    ) -> std::result::Result<Arc<dyn ImageGenerator>, GenerationError> {
        Ok(Arc::new(MockImageGenerator::new(config.id.clone())))
    }

    #[test]
    fn test_empty_pool_is_rejected() {
        let err = WorkerPool::new(Vec::new(), Duration::from_secs(60)).unwrap_err();
        assert!(matches!(err, OrchestratorError::NoUsableCredentials(_)));
    }

    #[test]
    fn test_from_config_drops_bad_credentials() {
        let credentials = vec![
            CredentialConfig::inline("good", QuotaTier::High, "k1"),
            CredentialConfig::inline("blank", QuotaTier::High, " "),
            CredentialConfig::inline("free", QuotaTier::Low, "k2"),
        ];
        let pool = WorkerPool::from_config(&credentials, &limits(), &mock_factory).unwrap();
        assert_eq!(pool.len(), 2);

        let all_bad = vec![CredentialConfig::inline("blank", QuotaTier::High, "")];
        let err = WorkerPool::from_config(&all_bad, &limits(), &mock_factory).unwrap_err();
        assert!(matches!(err, OrchestratorError::NoUsableCredentials(msg) if msg.contains("blank")));
    }

    #[test]
    fn test_capacity_sums_by_tier() {
        let pool = WorkerPool::new(
            vec![
                worker("a", QuotaTier::High),
                worker("b", QuotaTier::High),
                worker("c", QuotaTier::Low),
            ],
            Duration::from_secs(60),
        )
        .unwrap();
        let capacity = pool.capacity();
        assert_eq!(capacity.total_per_window, 22);
        assert_eq!(capacity.high_tier_per_window, 20);
        assert_eq!(capacity.low_tier_per_window, 2);
        assert_eq!(capacity.estimated_duration(11), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_checkout_is_round_robin() {
        let pool = Arc::new(
            WorkerPool::new(
                vec![worker("a", QuotaTier::High), worker("b", QuotaTier::High)],
                Duration::from_secs(60),
            )
            .unwrap(),
        );

        let mut order = Vec::new();
        for _ in 0..4 {
            let lease = pool.checkout().await;
            order.push(lease.worker().credential().id.clone());
        }
        assert_eq!(order, vec!["a", "b", "a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_checkout_blocks_until_checkin() {
        let pool = Arc::new(
            WorkerPool::new(vec![worker("only", QuotaTier::Low)], Duration::from_secs(60)).unwrap(),
        );
        let first = pool.checkout().await;

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.checkout().await.index() })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(first);
        assert_eq!(waiter.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_queue_matches_permits_after_churn() {
        let pool = Arc::new(
            WorkerPool::new(
                vec![worker("a", QuotaTier::High), worker("b", QuotaTier::High), worker("c", QuotaTier::Low)],
                Duration::from_secs(60),
            )
            .unwrap(),
        );

        for _ in 0..5 {
            let first = pool.checkout().await;
            let second = pool.checkout().await;
            {
                let queue = pool.queue.lock().unwrap();
                assert_eq!(queue.indices.len(), pool.available.available_permits());
                assert_eq!(queue.indices.len(), 1);
            }
            assert_ne!(first.index(), second.index());
        }

        let queue = pool.queue.lock().unwrap();
        assert_eq!(queue.indices.len(), 3);
        assert_eq!(pool.available.available_permits(), 3);
        let mut indices: Vec<usize> = queue.indices.iter().copied().collect();
        indices.sort_unstable();
        assert_eq!(indices, vec![0, 1, 2]);
    }
}
