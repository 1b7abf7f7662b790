//! Sequential execution of one workflow run.
//!
//! Actions run strictly in position order inside one task. Before each
//! action the run is re-read, so a cancel or force-rerun stops the chain at
//! the next boundary. On resume (rerun) actions that already have a
//! completed or skipped row in the current attempt are not executed again.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::executor::ActionExecutor;
use crate::db::models::{LogLevel, RunStatus, StepStatus, WorkflowRun, WorkflowStep};
use crate::nats::{RunNotification, RunPublisher};
use crate::result_ext::ResultExt;
use crate::store::{Store, StoreResult};
use crate::template::ResolutionContext;

/// How a call to [`WorkflowRunner::execute`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// The run reached this settled status.
    Settled(RunStatus),
    /// Another operation moved the run while it executed.
    Superseded,
    /// The run was not in a state this runner executes.
    Skipped,
}

#[derive(Clone)]
pub struct WorkflowRunner {
    store: Arc<dyn Store>,
    executor: ActionExecutor,
    publisher: Option<RunPublisher>,
}

impl WorkflowRunner {
    pub fn new(
        store: Arc<dyn Store>,
        executor: ActionExecutor,
        publisher: Option<RunPublisher>,
    ) -> Self {
        Self {
            store,
            executor,
            publisher,
        }
    }

    pub fn executor(&self) -> &ActionExecutor {
        &self.executor
    }

    /// Execute run `run_id` from its first unfinished action.
    pub async fn execute(&self, run_id: i64) -> StoreResult<RunExit> {
        let Some(run) = self.store.get_run(run_id).await? else {
            tracing::warn!(run_id, "Queued run no longer exists");
            return Ok(RunExit::Skipped);
        };

        let run = match run.status {
            RunStatus::Pending => {
                match self
                    .store
                    .transition_run(run.id, &[RunStatus::Pending], RunStatus::Running)
                    .await?
                {
                    Some(run) => run,
                    None => return Ok(RunExit::Superseded),
                }
            }
            RunStatus::Running => run,
            status => {
                tracing::debug!(run_id, status = %status, "Run is settled, nothing to execute");
                return Ok(RunExit::Skipped);
            }
        };

        self.log(&run, LogLevel::Info, format!("Run started (attempt {})", run.attempt))
            .await;
        self.notify(&run).await;

        let actions = self.store.list_actions(run.sequence_id).await?;
        let existing = self.store.list_steps(run.id, Some(run.attempt)).await?;
        let done: HashSet<i64> = existing
            .iter()
            .filter(|s| s.status.is_done())
            .map(|s| s.node_id)
            .collect();

        let mut ctx = ResolutionContext::from_run(run.arguments.clone(), &run.output);

        for action in &actions {
            if done.contains(&action.id) {
                tracing::debug!(run_id, position = action.position, "Action already done in this attempt");
                continue;
            }

            match self.store.get_run(run.id).await? {
                Some(current) if current.status == RunStatus::Running && current.attempt == run.attempt => {}
                _ => {
                    tracing::info!(run_id, position = action.position, "Run was stopped, not dispatching further actions");
                    return Ok(RunExit::Superseded);
                }
            }
            self.store.touch_run(run.id).await?;

            let report = self.executor.execute_step(&run, action, &mut ctx).await?;
            if report.superseded {
                return Ok(RunExit::Superseded);
            }

            let step = &report.step;
            match step.status {
                StepStatus::Completed | StepStatus::Skipped => continue,
                status => {
                    let level = if status == StepStatus::Waiting {
                        LogLevel::Warn
                    } else {
                        LogLevel::Error
                    };
                    self.log(
                        &run,
                        level,
                        format!(
                            "Step {} ({}) {}: {}",
                            step.position,
                            step.node_name,
                            status,
                            step.error_message.as_deref().unwrap_or("no message")
                        ),
                    )
                    .await;
                    break;
                }
            }
        }

        self.finalize(&run).await
    }

    /// Settle the run with the worst status among the latest row of each
    /// action in the current attempt.
    async fn finalize(&self, run: &WorkflowRun) -> StoreResult<RunExit> {
        let steps = self.store.list_steps(run.id, Some(run.attempt)).await?;
        let status = match settled_status(&steps) {
            RunStatus::Pending | RunStatus::Running => RunStatus::Failed,
            status => status,
        };

        let Some(settled) = self
            .store
            .transition_run(run.id, &[RunStatus::Running], status)
            .await?
        else {
            return Ok(RunExit::Superseded);
        };
        if settled.attempt != run.attempt {
            return Ok(RunExit::Superseded);
        }

        let level = match status {
            RunStatus::Completed => LogLevel::Info,
            RunStatus::Waiting => LogLevel::Warn,
            _ => LogLevel::Error,
        };
        self.log(&settled, level, format!("Run {status}")).await;
        self.notify(&settled).await;

        tracing::info!(run_id = run.id, attempt = run.attempt, status = %status, "Run settled");
        Ok(RunExit::Settled(status))
    }

    async fn log(&self, run: &WorkflowRun, level: LogLevel, message: String) {
        let _ = self
            .store
            .append_log(run.id, level, &message)
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
}

/// The latest row of every action, in position order.
pub fn latest_steps(steps: &[WorkflowStep]) -> Vec<&WorkflowStep> {
    let mut latest: HashMap<i64, &WorkflowStep> = HashMap::new();
    for step in steps {
        latest
            .entry(step.node_id)
            .and_modify(|current| {
                if step.id > current.id {
                    *current = step;
                }
            })
            .or_insert(step);
    }
    let mut rows: Vec<&WorkflowStep> = latest.into_values().collect();
    rows.sort_by_key(|s| (s.position, s.id));
    rows
}

/// Worst status over the latest row per action; an empty attempt is
/// complete.
pub fn settled_status(steps: &[WorkflowStep]) -> RunStatus {
    if steps.is_empty() {
        return RunStatus::Completed;
    }
    RunStatus::worst_of(latest_steps(steps).into_iter().map(|s| s.status))
}
