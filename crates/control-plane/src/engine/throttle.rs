//! Central per-integration throttle.
//!
//! Every third-party call made for an integration (action invocations and
//! resource searches) passes through here: at most `concurrency` calls are in
//! flight per integration, and an HTTP 429 pauses that integration for the
//! cooldown period.

use funnelflow_actions::ActionError;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;

struct ThrottleInner {
    concurrency: usize,
    cooldown: Duration,
    permits: Mutex<HashMap<i64, Arc<Semaphore>>>,
    paused_until: Mutex<HashMap<i64, Instant>>,
}

#[derive(Clone)]
pub struct IntegrationThrottle {
    inner: Arc<ThrottleInner>,
}

impl IntegrationThrottle {
    pub fn new(concurrency: usize, cooldown: Duration) -> Self {
        Self {
            inner: Arc::new(ThrottleInner {
                concurrency: concurrency.max(1),
                cooldown,
                permits: Mutex::new(HashMap::new()),
                paused_until: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn semaphore(&self, integration_id: i64) -> Arc<Semaphore> {
        let mut permits = self
            .inner
            .permits
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        permits
            .entry(integration_id)
            .or_insert_with(|| Arc::new(Semaphore::new(self.inner.concurrency)))
            .clone()
    }

    fn paused_until(&self, integration_id: i64) -> Option<Instant> {
        let paused = self
            .inner
            .paused_until
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        paused
            .get(&integration_id)
            .copied()
            .filter(|until| *until > Instant::now())
    }

    fn pause(&self, integration_id: i64) {
        let until = Instant::now() + self.inner.cooldown;
        let mut paused = self
            .inner
            .paused_until
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        paused.insert(integration_id, until);
    }

    pub fn is_paused(&self, integration_id: i64) -> bool {
        self.paused_until(integration_id).is_some()
    }

    /// Run `call` under the throttle of `integration_id`. Calls without an
    /// integration are not throttled.
    pub async fn run<T, F>(&self, integration_id: Option<i64>, call: F) -> Result<T, ActionError>
    where
        F: Future<Output = Result<T, ActionError>>,
    {
        let Some(id) = integration_id else {
            return call.await;
        };

        while let Some(until) = self.paused_until(id) {
            tracing::debug!(integration_id = id, "Integration rate limited, waiting");
            tokio::time::sleep_until(until).await;
        }

        let _permit = self
            .semaphore(id)
            .acquire_owned()
            .await
            .map_err(|_| ActionError::Internal("Integration throttle closed".into()))?;

        let result = call.await;
        if let Err(ref e) = result {
            if e.is_rate_limited() {
                tracing::warn!(
                    integration_id = id,
                    cooldown_ms = self.inner.cooldown.as_millis() as u64,
                    "Integration returned 429, pausing calls"
                );
                self.pause(id);
            }
        }
        result
    }
}
