//! Background staleness sweep.
//!
//! A running run whose `updated_at` is older than the threshold is flagged
//! `stale`. The flag only informs operators that force-rerun is warranted;
//! the run itself is left untouched.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::db::models::LogLevel;
use crate::result_ext::ResultExt;
use crate::store::{Store, StoreResult};

#[derive(Clone)]
pub struct StaleSweeper {
    store: Arc<dyn Store>,
    threshold: Duration,
    interval: Duration,
}

impl StaleSweeper {
    pub fn new(store: Arc<dyn Store>, threshold: Duration, interval: Duration) -> Self {
        Self {
            store,
            threshold,
            interval,
        }
    }

    /// Flag stale runs once. Returns the ids flagged.
    pub async fn sweep(&self) -> StoreResult<Vec<i64>> {
        let threshold = chrono::Duration::from_std(self.threshold)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let cutoff = Utc::now() - threshold;

        let mut flagged = Vec::new();
        for run in self.store.find_stale_runs(cutoff).await? {
            if !self.store.mark_stale(run.id).await? {
                continue;
            }
            let idle = (Utc::now() - run.updated_at).num_seconds();
            tracing::warn!(run_id = run.id, idle_seconds = idle, "Run flagged stale");
            let _ = self
                .store
                .append_log(
                    run.id,
                    LogLevel::Warn,
                    &format!("No progress for {idle}s; flagged stale, force-rerun is available"),
                )
                .await
                .warn_ok("Failed to append run log");
            flagged.push(run.id);
        }
        Ok(flagged)
    }

    /// Sweep every interval until `shutdown` flips to true.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let _ = self.sweep().await.log("Stale sweep failed");
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("Stale sweeper stopped");
        })
    }
}
