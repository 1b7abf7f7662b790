//! Operator recovery of runs: rerun, force-rerun and cancel.
//!
//! Each operation is a compare-and-set on the run status. Calling one twice
//! is harmless: the second call finds the run in another status and reports
//! `performed: false` with the reason.

use std::sync::Arc;

use super::queue::RunQueue;
use crate::db::models::{LogLevel, RecoveryOutcome, RunStatus, WorkflowRun};
use crate::nats::{RunNotification, RunPublisher};
use crate::result_ext::ResultExt;
use crate::store::{Store, StoreError, StoreResult};

const RERUN_FROM: &[RunStatus] = &[RunStatus::Failed, RunStatus::Waiting];
const FORCE_RERUN_FROM: &[RunStatus] = &[RunStatus::Pending, RunStatus::Running];
const CANCEL_FROM: &[RunStatus] = &[RunStatus::Pending, RunStatus::Running, RunStatus::Waiting];

fn performed(run: &WorkflowRun) -> RecoveryOutcome {
    RecoveryOutcome {
        performed: true,
        reason: None,
        run_id: run.id,
        status: run.status,
        attempt: run.attempt,
    }
}

fn refused(run: &WorkflowRun, reason: String) -> RecoveryOutcome {
    RecoveryOutcome {
        performed: false,
        reason: Some(reason),
        run_id: run.id,
        status: run.status,
        attempt: run.attempt,
    }
}

fn names(statuses: &[RunStatus]) -> String {
    statuses
        .iter()
        .map(RunStatus::as_str)
        .collect::<Vec<_>>()
        .join(" or ")
}

#[derive(Clone)]
pub struct RecoveryController {
    store: Arc<dyn Store>,
    queue: RunQueue,
    publisher: Option<RunPublisher>,
}

impl RecoveryController {
    pub fn new(store: Arc<dyn Store>, queue: RunQueue, publisher: Option<RunPublisher>) -> Self {
        Self {
            store,
            queue,
            publisher,
        }
    }

    async fn load(&self, run_id: i64) -> StoreResult<WorkflowRun> {
        self.store
            .get_run(run_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("Workflow run {run_id}")))
    }

    /// Refusal for a run that left `from` between the read and the update.
    async fn lost_race(&self, run_id: i64, operation: &str) -> StoreResult<RecoveryOutcome> {
        let run = self.load(run_id).await?;
        Ok(refused(
            &run,
            format!("Run changed to {} before {operation} could apply", run.status),
        ))
    }

    async fn log(&self, run_id: i64, level: LogLevel, message: &str) {
        let _ = self
            .store
            .append_log(run_id, level, message)
            .await
            .warn_ok("Failed to append run log");
    }

    async fn notify(&self, run: &WorkflowRun) {
        if let Some(publisher) = &self.publisher {
            let _ = publisher
                .publish(RunNotification::from(run))
                .await
                .warn_ok("Failed to publish run notification");
        }
    }

    /// Resume a failed or waiting run from its first unfinished action.
    /// Completed rows of the current attempt are kept.
    pub async fn rerun(&self, run_id: i64) -> StoreResult<RecoveryOutcome> {
        let run = self.load(run_id).await?;
        if !RERUN_FROM.contains(&run.status) {
            return Ok(refused(
                &run,
                format!("Run is {}; rerun requires {}", run.status, names(RERUN_FROM)),
            ));
        }

        let Some(run) = self
            .store
            .transition_run(run_id, RERUN_FROM, RunStatus::Running)
            .await?
        else {
            return self.lost_race(run_id, "rerun").await;
        };

        self.log(
            run_id,
            LogLevel::Info,
            &format!("Rerun requested, resuming attempt {}", run.attempt),
        )
        .await;
        self.notify(&run).await;
        self.queue.enqueue(run_id);

        tracing::info!(run_id, attempt = run.attempt, "Run rerun");
        Ok(performed(&run))
    }

    /// Abort a pending or running run and start it over as a new attempt.
    pub async fn force_rerun(&self, run_id: i64) -> StoreResult<RecoveryOutcome> {
        let run = self.load(run_id).await?;
        if !FORCE_RERUN_FROM.contains(&run.status) {
            return Ok(refused(
                &run,
                format!(
                    "Run is {}; force-rerun requires {}",
                    run.status,
                    names(FORCE_RERUN_FROM)
                ),
            ));
        }

        let Some(failed) = self
            .store
            .transition_run(run_id, FORCE_RERUN_FROM, RunStatus::Failed)
            .await?
        else {
            return self.lost_race(run_id, "force-rerun").await;
        };

        let aborted = self
            .store
            .abort_running_steps(run_id, "Aborted by force-rerun")
            .await?;

        let Some(run) = self.store.begin_attempt(run_id, failed.attempt).await? else {
            return self.lost_race(run_id, "force-rerun").await;
        };

        self.log(
            run_id,
            LogLevel::Warn,
            &format!(
                "Force-rerun requested: attempt {} aborted ({aborted} running steps), starting attempt {}",
                failed.attempt, run.attempt
            ),
        )
        .await;
        self.notify(&run).await;
        self.queue.enqueue(run_id);

        tracing::warn!(run_id, attempt = run.attempt, aborted, "Run force-rerun");
        Ok(performed(&run))
    }

    /// Stop a run. Running steps are marked aborted at once. An action
    /// already in flight finishes, but its output is not recorded and no
    /// further action is dispatched.
    pub async fn cancel(&self, run_id: i64) -> StoreResult<RecoveryOutcome> {
        let run = self.load(run_id).await?;
        if !CANCEL_FROM.contains(&run.status) {
            return Ok(refused(
                &run,
                format!("Run is {}; cancel requires {}", run.status, names(CANCEL_FROM)),
            ));
        }

        let Some(run) = self
            .store
            .transition_run(run_id, CANCEL_FROM, RunStatus::Failed)
            .await?
        else {
            return self.lost_race(run_id, "cancel").await;
        };

        let aborted = self
            .store
            .abort_running_steps(run_id, "Cancelled by operator")
            .await?;

        self.log(
            run_id,
            LogLevel::Warn,
            &format!("Run cancelled by operator ({aborted} running steps aborted)"),
        )
        .await;
        self.notify(&run).await;

        tracing::info!(run_id, aborted, "Run cancelled");
        Ok(performed(&run))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{NewRun, NewStep, StepStatus};
    use crate::store::{MemoryStore, RunLedger};
    use funnelflow_actions::ErrorCode;
    use serde_json::json;

    async fn setup() -> (RecoveryController, Arc<MemoryStore>, tokio::sync::mpsc::UnboundedReceiver<i64>, WorkflowRun) {
        let store = Arc::new(MemoryStore::new());
        let (queue, rx) = RunQueue::channel();
        let run = store
            .create_run(NewRun {
                sequence_id: 1,
                trigger_id: 1,
                event_id: 1,
                arguments: json!({}),
            })
            .await
            .unwrap();
        (RecoveryController::new(store.clone(), queue, None), store, rx, run)
    }

    #[tokio::test]
    async fn test_rerun_requires_failed_or_waiting() {
        let (controller, store, mut rx, run) = setup().await;
        let outcome = controller.rerun(run.id).await.unwrap();
        assert!(!outcome.performed);
        assert_eq!(
            outcome.reason.as_deref(),
            Some("Run is pending; rerun requires failed or waiting")
        );

        store.transition_run(run.id, &[RunStatus::Pending], RunStatus::Running).await.unwrap();
        store.transition_run(run.id, &[RunStatus::Running], RunStatus::Waiting).await.unwrap();

        let outcome = controller.rerun(run.id).await.unwrap();
        assert!(outcome.performed);
        assert_eq!(outcome.status, RunStatus::Running);
        assert_eq!(outcome.attempt, 1);
        assert_eq!(rx.try_recv().ok(), Some(run.id));

        let again = controller.rerun(run.id).await.unwrap();
        assert!(!again.performed);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_force_rerun_aborts_and_opens_attempt() {
        let (controller, store, mut rx, run) = setup().await;
        store.transition_run(run.id, &[RunStatus::Pending], RunStatus::Running).await.unwrap();
        store.record_output(run.id, 1, 1, json!({"id": 1})).await.unwrap();
        let step = store
            .insert_step(NewStep {
                run_id: run.id,
                attempt: 1,
                node_id: 9,
                node_name: "Send".into(),
                node_type: "webhook.send".into(),
                position: 1,
                status: StepStatus::Running,
                input_data: json!({}),
                debug_info: json!({}),
            })
            .await
            .unwrap();

        let outcome = controller.force_rerun(run.id).await.unwrap();
        assert!(outcome.performed);
        assert_eq!(outcome.status, RunStatus::Running);
        assert_eq!(outcome.attempt, 2);
        assert_eq!(rx.try_recv().ok(), Some(run.id));

        let steps = store.list_steps(run.id, Some(1)).await.unwrap();
        assert_eq!(steps[0].id, step.id);
        assert_eq!(steps[0].status, StepStatus::Failed);
        assert_eq!(steps[0].error_code, Some(ErrorCode::AbortedError));

        let run = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(run.output, json!({}));

        let logs = store.list_logs(run.id).await.unwrap();
        assert!(logs.iter().any(|l| l.message.contains("starting attempt 2")));
    }

    #[tokio::test]
    async fn test_force_rerun_refused_for_settled_run() {
        let (controller, store, _rx, run) = setup().await;
        store.transition_run(run.id, &[RunStatus::Pending], RunStatus::Running).await.unwrap();
        store.transition_run(run.id, &[RunStatus::Running], RunStatus::Completed).await.unwrap();

        let outcome = controller.force_rerun(run.id).await.unwrap();
        assert!(!outcome.performed);
        assert_eq!(outcome.status, RunStatus::Completed);
        let rerun = controller.rerun(run.id).await.unwrap();
        assert!(!rerun.performed);
    }

    #[tokio::test]
    async fn test_cancel() {
        let (controller, store, mut rx, run) = setup().await;
        let outcome = controller.cancel(run.id).await.unwrap();
        assert!(outcome.performed);
        assert_eq!(outcome.status, RunStatus::Failed);
        assert!(rx.try_recv().is_err());

        let again = controller.cancel(run.id).await.unwrap();
        assert!(!again.performed);
        let logs = store.list_logs(run.id).await.unwrap();
        assert_eq!(logs.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_aborts_running_step() {
        let (controller, store, _rx, run) = setup().await;
        store.transition_run(run.id, &[RunStatus::Pending], RunStatus::Running).await.unwrap();
        let step = store
            .insert_step(NewStep {
                run_id: run.id,
                attempt: 1,
                node_id: 9,
                node_name: "Send".into(),
                node_type: "webhook.send".into(),
                position: 1,
                status: StepStatus::Running,
                input_data: json!({}),
                debug_info: json!({}),
            })
            .await
            .unwrap();

        let outcome = controller.cancel(run.id).await.unwrap();
        assert!(outcome.performed);

        let steps = store.list_steps(run.id, None).await.unwrap();
        assert_eq!(steps[0].id, step.id);
        assert_eq!(steps[0].status, StepStatus::Failed);
        assert_eq!(steps[0].error_code, Some(ErrorCode::AbortedError));
        assert_eq!(steps[0].error_message.as_deref(), Some("Cancelled by operator"));
        assert!(steps[0].completed_at.is_some());

        let logs = store.list_logs(run.id).await.unwrap();
        assert!(logs.iter().any(|l| l.message.contains("1 running steps aborted")));
    }

    #[tokio::test]
    async fn test_unknown_run() {
        let (controller, _store, _rx, _run) = setup().await;
        assert!(matches!(
            controller.rerun(999).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
