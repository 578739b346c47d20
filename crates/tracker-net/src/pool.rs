//! Bounded worker pool for request handlers
//!
//! Submission follows the classic executor rules: `core_workers` workers
//! are started up front and live until shutdown; jobs queue in a bounded
//! backlog; when the backlog is full an extra worker is started for the job
//! as long as fewer than `max_workers` exist. Extra workers exit after
//! `keep_alive` without work. Past that point the configured
//! [`Backpressure`] policy decides.

use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tracker_common::config::{Backpressure, DispatcherConfig};
use tracker_common::{Error, Result};

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Pool counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub workers: usize,
    pub busy: usize,
    pub queued: usize,
    pub completed: u64,
    pub rejected: u64,
}

struct PoolInner {
    name: String,
    max_workers: usize,
    backlog: usize,
    keep_alive: Duration,
    backpressure: Backpressure,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<Job>>,
    workers: AtomicUsize,
    busy: AtomicUsize,
    completed: AtomicU64,
    rejected: AtomicU64,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Shared handle to a worker pool
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Create the pool and start its core workers
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(name: impl Into<String>, config: &DispatcherConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.backlog.max(1));
        let pool = Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                max_workers: config.max_workers.max(config.core_workers),
                backlog: config.backlog.max(1),
                keep_alive: config.keep_alive(),
                backpressure: config.backpressure,
                sender: Mutex::new(Some(tx)),
                receiver: tokio::sync::Mutex::new(rx),
                workers: AtomicUsize::new(0),
                busy: AtomicUsize::new(0),
                completed: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
                handles: Mutex::new(Vec::new()),
            }),
        };

        for _ in 0..config.core_workers {
            pool.inner.workers.fetch_add(1, Ordering::SeqCst);
            pool.spawn_worker(None, true);
        }
        info!(
            "Worker pool '{}' started: {} core, {} max, backlog {}",
            pool.inner.name, config.core_workers, pool.inner.max_workers, pool.inner.backlog
        );
        pool
    }

    /// Run `job` on the pool
    ///
    /// Fails with [`Error::Overloaded`] when neither the backlog nor a new
    /// worker can take it (after waiting, under the blocking policy), and
    /// with [`Error::ShuttingDown`] once shutdown has started.
    pub async fn submit<F>(&self, job: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Some(sender) = self.inner.sender.lock().clone() else {
            return Err(Error::ShuttingDown);
        };

        let job: Job = Box::pin(job);
        let job = match sender.try_send(job) {
            Ok(()) => return Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => return Err(Error::ShuttingDown),
            Err(mpsc::error::TrySendError::Full(job)) => job,
        };

        // Backlog full: grow if allowed
        if self.try_reserve_worker() {
            debug!("Pool '{}' growing to serve a full backlog", self.inner.name);
            self.spawn_worker(Some(job), false);
            return Ok(());
        }

        match self.inner.backpressure {
            Backpressure::Reject => {
                self.inner.rejected.fetch_add(1, Ordering::Relaxed);
                warn!("Pool '{}' saturated, rejecting job", self.inner.name);
                Err(Error::Overloaded)
            }
            Backpressure::Block { timeout_ms } => {
                let timeout = Duration::from_millis(timeout_ms);
                match tokio::time::timeout(timeout, sender.send(job)).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(_)) => Err(Error::ShuttingDown),
                    Err(_) => {
                        self.inner.rejected.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            "Pool '{}' saturated for {:?}, rejecting job",
                            self.inner.name, timeout
                        );
                        Err(Error::Overloaded)
                    }
                }
            }
        }
    }

    fn try_reserve_worker(&self) -> bool {
        self.inner
            .workers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.inner.max_workers).then_some(n + 1)
            })
            .is_ok()
    }

    /// The worker count has already been incremented for this worker
    fn spawn_worker(&self, first: Option<Job>, core: bool) {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            if let Some(job) = first {
                run_job(&inner, job).await;
            }
            loop {
                let next = if core {
                    inner.receiver.lock().await.recv().await
                } else {
                    let recv = async { inner.receiver.lock().await.recv().await };
                    match tokio::time::timeout(inner.keep_alive, recv).await {
                        Ok(next) => next,
                        Err(_) => {
                            debug!("Pool '{}' retiring idle worker", inner.name);
                            break;
                        }
                    }
                };
                match next {
                    Some(job) => run_job(&inner, job).await,
                    None => break,
                }
            }
            inner.workers.fetch_sub(1, Ordering::SeqCst);
        });

        let mut handles = self.inner.handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    pub fn stats(&self) -> PoolStats {
        let queued = self
            .inner
            .sender
            .lock()
            .as_ref()
            .map_or(0, |s| s.max_capacity() - s.capacity());
        PoolStats {
            workers: self.inner.workers.load(Ordering::SeqCst),
            busy: self.inner.busy.load(Ordering::SeqCst),
            queued,
            completed: self.inner.completed.load(Ordering::Relaxed),
            rejected: self.inner.rejected.load(Ordering::Relaxed),
        }
    }

    /// Stop taking jobs, let queued ones finish and wait for every worker
    pub async fn shutdown(&self) {
        self.inner.sender.lock().take();
        let handles: Vec<_> = std::mem::take(&mut *self.inner.handles.lock());
        for handle in handles {
            let _ = handle.await;
        }
        info!(
            "Worker pool '{}' stopped ({} jobs completed)",
            self.inner.name,
            self.inner.completed.load(Ordering::Relaxed)
        );
    }
}

async fn run_job(inner: &PoolInner, job: Job) {
    inner.busy.fetch_add(1, Ordering::SeqCst);
    if AssertUnwindSafe(job).catch_unwind().await.is_err() {
        error!("Job on pool '{}' panicked", inner.name);
    }
    inner.busy.fetch_sub(1, Ordering::SeqCst);
    inner.completed.fetch_add(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::{Barrier, oneshot};

    fn config(core: usize, max: usize, backlog: usize, backpressure: Backpressure) -> DispatcherConfig {
        DispatcherConfig {
            core_workers: core,
            max_workers: max,
            backlog,
            keep_alive_ms: 50,
            backpressure,
            ..DispatcherConfig::default()
        }
    }

    /// Occupy every worker and the backlog until the returned senders fire
    async fn saturate(pool: &WorkerPool, jobs: usize) -> Vec<oneshot::Sender<()>> {
        let mut gates = Vec::new();
        for _ in 0..jobs {
            let (tx, rx) = oneshot::channel::<()>();
            pool.submit(async move {
                let _ = rx.await;
            })
            .await
            .unwrap();
            gates.push(tx);
            // let an idle worker pick the job up before the next one
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        gates
    }

    #[tokio::test]
    async fn test_jobs_run() {
        let pool = WorkerPool::new("test", &config(2, 4, 8, Backpressure::Reject));
        let barrier = Arc::new(Barrier::new(3));
        for _ in 0..2 {
            let barrier = Arc::clone(&barrier);
            pool.submit(async move {
                barrier.wait().await;
            })
            .await
            .unwrap();
        }
        barrier.wait().await;
        pool.shutdown().await;
        assert_eq!(pool.stats().completed, 2);
    }

    #[tokio::test]
    async fn test_reject_when_saturated() {
        let pool = WorkerPool::new("test", &config(1, 2, 1, Backpressure::Reject));
        // core worker busy, one job queued, surge worker busy
        let gates = saturate(&pool, 3).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let result = pool.submit(async {}).await;
        assert!(matches!(result, Err(Error::Overloaded)));
        assert_eq!(pool.stats().rejected, 1);
        assert_eq!(pool.stats().workers, 2);

        drop(gates);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_block_policy_waits_then_times_out() {
        let pool = WorkerPool::new(
            "test",
            &config(1, 1, 1, Backpressure::Block { timeout_ms: 50 }),
        );
        let mut gates = saturate(&pool, 2).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = std::time::Instant::now();
        let result = pool.submit(async {}).await;
        assert!(matches!(result, Err(Error::Overloaded)));
        assert!(started.elapsed() >= Duration::from_millis(50));

        // free one slot while a submitter is blocked
        let pending = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.submit(async {}).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(gates.remove(0));
        assert!(pending.await.unwrap().is_ok());

        drop(gates);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_surge_workers_retire() {
        let pool = WorkerPool::new("test", &config(1, 3, 1, Backpressure::Reject));
        let gates = saturate(&pool, 4).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.stats().workers, 3);

        drop(gates);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(pool.stats().workers, 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_panicking_job_keeps_worker() {
        let pool = WorkerPool::new("test", &config(1, 1, 4, Backpressure::Reject));
        pool.submit(async { panic!("boom") }).await.unwrap();

        let (tx, rx) = oneshot::channel();
        pool.submit(async move {
            let _ = tx.send(42);
        })
        .await
        .unwrap();
        assert_eq!(rx.await.unwrap(), 42);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_after_shutdown() {
        let pool = WorkerPool::new("test", &config(1, 1, 1, Backpressure::Reject));
        pool.shutdown().await;
        assert!(matches!(pool.submit(async {}).await, Err(Error::ShuttingDown)));
    }
}
