//! Deferred and periodic task execution
//!
//! Every scheduled task is its own Tokio task. A run is never overlapped by
//! the next one: ticks missed while a run is in progress are delayed, not
//! bunched. Shutdown lets a run in progress finish and then stops the task.

use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Runs named tasks after a delay or at a fixed period
pub struct TaskScheduler {
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskScheduler {
    #[must_use]
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Run `task` every `period`, first after `initial_delay`
    pub fn schedule<F, Fut>(&self, name: &str, initial_delay: Duration, period: Duration, mut task: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut stop = self.shutdown.subscribe();
        let label = name.to_string();
        let period = period.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            if *stop.borrow_and_update() {
                return;
            }
            tokio::select! {
                () = tokio::time::sleep(initial_delay) => {}
                _ = stop.changed() => return,
            }

            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = stop.changed() => break,
                    _ = ticker.tick() => {}
                }
                if *stop.borrow() {
                    break;
                }
                task().await;
            }
            debug!("Scheduled task '{}' stopped", label);
        });
        self.track(name, handle);
        debug!("Scheduled '{}' every {:?} after {:?}", name, period, initial_delay);
    }

    /// Run `task` once after `delay` unless shutdown comes first
    pub fn schedule_once<Fut>(&self, name: &str, delay: Duration, task: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut stop = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            if *stop.borrow_and_update() {
                return;
            }
            tokio::select! {
                () = tokio::time::sleep(delay) => task.await,
                _ = stop.changed() => {}
            }
        });
        self.track(name, handle);
    }

    fn track(&self, name: &str, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|(_, h)| !h.is_finished());
        tasks.push((name.to_string(), handle));
    }

    /// Names of tasks that have not finished
    pub fn active_tasks(&self) -> Vec<String> {
        self.tasks
            .lock()
            .iter()
            .filter(|(_, h)| !h.is_finished())
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Stop every task and wait for them
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        let count = tasks.len();
        for (name, handle) in tasks {
            if let Err(e) = handle.await {
                debug!("Scheduled task '{}' ended abnormally: {}", name, e);
            }
        }
        info!("Task scheduler stopped ({} tasks)", count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_periodic_task_runs_until_shutdown() {
        let scheduler = TaskScheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        {
            let runs = Arc::clone(&runs);
            scheduler.schedule(
                "count",
                Duration::from_millis(100),
                Duration::from_millis(50),
                move || {
                    let runs = Arc::clone(&runs);
                    async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                    }
                },
            );
        }

        tokio::time::sleep(Duration::from_millis(90)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        // first run at 100ms, then 150, 200, 250
        tokio::time::sleep(Duration::from_millis(170)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 4);

        scheduler.shutdown().await;
        let after = runs.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(runs.load(Ordering::SeqCst), after);
        assert!(scheduler.active_tasks().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_once() {
        let scheduler = TaskScheduler::new();
        let (tx, rx) = tokio::sync::oneshot::channel();
        scheduler.schedule_once("once", Duration::from_secs(1), async move {
            let _ = tx.send(());
        });
        assert!(rx.await.is_ok());
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_pending_once() {
        let scheduler = TaskScheduler::new();
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let ran = Arc::clone(&ran);
            scheduler.schedule_once("later", Duration::from_secs(60), async move {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }
        scheduler.shutdown().await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(scheduler.is_shutdown());
    }
}
