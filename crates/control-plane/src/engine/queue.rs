//! Run queue and worker loop.
//!
//! Runs are queued by id on an unbounded channel. The worker takes one
//! permit per run from a semaphore sized by `worker_concurrency` and spawns
//! one task per run. A run already executing in this process is never
//! started a second time; a request that arrives meanwhile is replayed once
//! the current execution ends.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;

use super::runner::WorkflowRunner;

/// Handle used to enqueue runs. Cheap to clone.
#[derive(Clone)]
pub struct RunQueue {
    tx: mpsc::UnboundedSender<i64>,
}

impl RunQueue {
    /// Create a queue and the receiving end the worker consumes.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<i64>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn enqueue(&self, run_id: i64) -> bool {
        match self.tx.send(run_id) {
            Ok(()) => {
                tracing::debug!(run_id, "Run queued");
                true
            }
            Err(_) => {
                tracing::error!(run_id, "Run queue closed, run not queued");
                false
            }
        }
    }
}

#[derive(Default)]
struct ActiveRuns {
    running: HashSet<i64>,
    requeue: HashSet<i64>,
}

/// Ids of runs executing in this process.
#[derive(Clone, Default)]
pub struct ActiveSet {
    inner: Arc<Mutex<ActiveRuns>>,
}

impl ActiveSet {
    fn lock(&self) -> std::sync::MutexGuard<'_, ActiveRuns> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim `run_id`. When it is already executing, remember to run it
    /// again afterwards and return false.
    fn claim(&self, run_id: i64) -> bool {
        let mut active = self.lock();
        if active.running.insert(run_id) {
            true
        } else {
            active.requeue.insert(run_id);
            false
        }
    }

    /// Release `run_id`; returns whether it was requested again meanwhile.
    fn release(&self, run_id: i64) -> bool {
        let mut active = self.lock();
        active.running.remove(&run_id);
        active.requeue.remove(&run_id)
    }

    pub fn contains(&self, run_id: i64) -> bool {
        self.lock().running.contains(&run_id)
    }

    pub fn len(&self) -> usize {
        self.lock().running.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Consumes the run queue.
pub struct RunWorker {
    runner: WorkflowRunner,
    queue: RunQueue,
    rx: mpsc::UnboundedReceiver<i64>,
    semaphore: Arc<Semaphore>,
    active: ActiveSet,
}

impl RunWorker {
    pub fn new(
        runner: WorkflowRunner,
        queue: RunQueue,
        rx: mpsc::UnboundedReceiver<i64>,
        concurrency: usize,
    ) -> Self {
        Self {
            runner,
            queue,
            rx,
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            active: ActiveSet::default(),
        }
    }

    pub fn active(&self) -> ActiveSet {
        self.active.clone()
    }

    /// Process runs until the queue closes or `shutdown` flips to true.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            concurrency = self.semaphore.available_permits(),
            "Run worker started"
        );

        loop {
            let run_id = tokio::select! {
                received = self.rx.recv() => match received {
                    Some(run_id) => run_id,
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            if !self.active.claim(run_id) {
                tracing::debug!(run_id, "Run already executing, will replay afterwards");
                continue;
            }

            let permit = match self.semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let runner = self.runner.clone();
            let active = self.active.clone();
            let queue = self.queue.clone();
            tokio::spawn(async move {
                let _permit = permit;
                match runner.execute(run_id).await {
                    Ok(exit) => tracing::debug!(run_id, ?exit, "Run execution ended"),
                    Err(e) => tracing::error!(run_id, error = %e, "Run execution failed"),
                }
                if active.release(run_id) {
                    queue.enqueue(run_id);
                }
            });
        }

        tracing::info!("Run worker stopped");
    }

    /// Spawn the worker loop.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_set_claims_once() {
        let active = ActiveSet::default();
        assert!(active.claim(1));
        assert!(!active.claim(1));
        assert!(active.contains(1));
        assert!(active.claim(2));
        assert_eq!(active.len(), 2);

        assert!(active.release(1));
        assert!(!active.release(2));
        assert!(active.is_empty());
        assert!(active.claim(1));
    }

    #[tokio::test]
    async fn test_queue_delivers_in_order() {
        let (queue, mut rx) = RunQueue::channel();
        assert!(queue.enqueue(3));
        assert!(queue.enqueue(4));
        assert_eq!(rx.recv().await, Some(3));
        assert_eq!(rx.recv().await, Some(4));
        drop(rx);
        assert!(!queue.enqueue(5));
    }
}
