//! Dispatch executor for service handlers
//!
//! Handlers are plain synchronous functions. Running them inline on the
//! connection reader serializes handler execution with frame decoding, so the
//! default is a bounded worker pool on the blocking thread pool.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{trace, warn};

use crate::error::Error;

/// Executor selection as it appears in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorKind {
    /// Run handlers on the I/O task that decoded the request
    Inline,
    /// Run handlers on a bounded pool of blocking workers
    WorkerPool,
}

impl FromStr for ExecutorKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "inline" => Ok(ExecutorKind::Inline),
            "pool" | "worker_pool" | "workerpool" => Ok(ExecutorKind::WorkerPool),
            other => Err(Error::Configuration(format!("Unknown executor kind '{}'", other))),
        }
    }
}

/// Statistics of a worker pool
#[derive(Debug, Default)]
struct PoolStats {
    submitted: AtomicU64,
    completed: AtomicU64,
    panicked: AtomicU64,
}

/// Bounded pool running jobs on tokio's blocking threads
#[derive(Clone)]
pub struct WorkerPool {
    workers: usize,
    permits: Arc<Semaphore>,
    stats: Arc<PoolStats>,
}

impl WorkerPool {
    /// Create a pool that runs at most `workers` jobs at the same time
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            workers,
            permits: Arc::new(Semaphore::new(workers)),
            stats: Arc::new(PoolStats::default()),
        }
    }

    /// Pool sized to the available parallelism of the host
    pub fn with_default_size() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self::new(workers)
    }

    /// Submit a job; must be called from within a tokio runtime
    pub fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        let permits = self.permits.clone();
        let stats = self.stats.clone();
        tokio::spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    warn!("Worker pool closed, dropping job");
                    return;
                }
            };
            match tokio::task::spawn_blocking(job).await {
                Ok(()) => {
                    stats.completed.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    stats.panicked.fetch_add(1, Ordering::Relaxed);
                    warn!("Worker pool job failed: {}", e);
                }
            }
        });
    }

    /// Maximum number of concurrently running jobs
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Jobs waiting for a permit or running
    pub fn in_flight(&self) -> u64 {
        let submitted = self.stats.submitted.load(Ordering::Relaxed);
        let done = self.stats.completed.load(Ordering::Relaxed)
            + self.stats.panicked.load(Ordering::Relaxed);
        submitted.saturating_sub(done)
    }

    /// Jobs that ran to completion
    pub fn completed(&self) -> u64 {
        self.stats.completed.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// Where service handler bodies are executed
#[derive(Debug, Clone)]
pub enum DispatchExecutor {
    Inline,
    WorkerPool(WorkerPool),
}

impl DispatchExecutor {
    pub fn inline() -> Self {
        DispatchExecutor::Inline
    }

    pub fn worker_pool(workers: usize) -> Self {
        DispatchExecutor::WorkerPool(WorkerPool::new(workers))
    }

    /// Build from configuration; a worker count of 0 means "size to the host"
    pub fn from_kind(kind: ExecutorKind, workers: usize) -> Self {
        match kind {
            ExecutorKind::Inline => DispatchExecutor::Inline,
            ExecutorKind::WorkerPool if workers == 0 => {
                DispatchExecutor::WorkerPool(WorkerPool::with_default_size())
            }
            ExecutorKind::WorkerPool => DispatchExecutor::worker_pool(workers),
        }
    }

    pub fn kind(&self) -> ExecutorKind {
        match self {
            DispatchExecutor::Inline => ExecutorKind::Inline,
            DispatchExecutor::WorkerPool(_) => ExecutorKind::WorkerPool,
        }
    }

    /// Run a job according to the executor policy
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match self {
            DispatchExecutor::Inline => {
                trace!("Executing job inline");
                job()
            }
            DispatchExecutor::WorkerPool(pool) => pool.submit(job),
        }
    }
}

impl Default for DispatchExecutor {
    fn default() -> Self {
        DispatchExecutor::WorkerPool(WorkerPool::with_default_size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_executor_kind_parsing() {
        assert_eq!("inline".parse::<ExecutorKind>().unwrap(), ExecutorKind::Inline);
        assert_eq!("Pool".parse::<ExecutorKind>().unwrap(), ExecutorKind::WorkerPool);
        assert!("threads".parse::<ExecutorKind>().is_err());
    }

    #[test]
    fn test_inline_runs_immediately() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        DispatchExecutor::inline().execute(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_worker_pool_bounds_concurrency() {
        let pool = WorkerPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..6 {
            let running = running.clone();
            let peak = peak.clone();
            pool.submit(move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(30));
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }

        for _ in 0..50 {
            if pool.completed() == 6 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(pool.completed(), 6);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.in_flight(), 0);
    }

    #[test]
    fn test_zero_workers_sizes_to_host() {
        let executor = DispatchExecutor::from_kind(ExecutorKind::WorkerPool, 0);
        match executor {
            DispatchExecutor::WorkerPool(pool) => assert!(pool.workers() >= 1),
            DispatchExecutor::Inline => panic!("expected a worker pool"),
        }
    }
}
