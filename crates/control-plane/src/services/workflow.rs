//! Workflow run ledger queries and operator recovery.

use std::sync::Arc;

use crate::db::models::{RecoveryOutcome, RunDetail, RunFilter, RunListResponse, RunSummary, WorkflowStep};
use crate::engine::{latest_steps, RecoveryController};
use crate::error::{AppError, AppResult};
use crate::store::Store;

const MAX_PAGE: i64 = 500;

#[derive(Clone)]
pub struct WorkflowService {
    store: Arc<dyn Store>,
    recovery: RecoveryController,
}

impl WorkflowService {
    pub fn new(store: Arc<dyn Store>, recovery: RecoveryController) -> Self {
        Self { store, recovery }
    }

    pub async fn list(&self, mut filter: RunFilter) -> AppResult<RunListResponse> {
        if filter.limit <= 0 || filter.offset < 0 {
            return Err(AppError::BadRequest(
                "limit must be positive and offset non-negative".to_string(),
            ));
        }
        filter.limit = filter.limit.min(MAX_PAGE);
        let items = self.store.list_runs(&filter).await?;
        Ok(RunListResponse {
            items,
            limit: filter.limit,
            offset: filter.offset,
        })
    }

    /// Run with every step ever recorded, its log and a summary of the
    /// current attempt.
    pub async fn detail(&self, run_id: i64) -> AppResult<RunDetail> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Workflow run {run_id} not found")))?;
        let steps = self.store.list_steps(run_id, None).await?;
        let logs = self.store.list_logs(run_id).await?;

        let current: Vec<WorkflowStep> = steps
            .iter()
            .filter(|s| s.attempt == run.attempt)
            .cloned()
            .collect();
        let latest: Vec<WorkflowStep> = latest_steps(&current).into_iter().cloned().collect();

        Ok(RunDetail {
            summary: RunSummary::from_steps(&latest),
            run,
            steps,
            logs,
        })
    }

    pub async fn rerun(&self, run_id: i64) -> AppResult<RecoveryOutcome> {
        Ok(self.recovery.rerun(run_id).await?)
    }

    pub async fn force_rerun(&self, run_id: i64) -> AppResult<RecoveryOutcome> {
        Ok(self.recovery.force_rerun(run_id).await?)
    }

    pub async fn cancel(&self, run_id: i64) -> AppResult<RecoveryOutcome> {
        Ok(self.recovery.cancel(run_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{NewRun, NewStep, RunStatus, StepOutcome, StepStatus};
    use crate::engine::RunQueue;
    use crate::store::{MemoryStore, RunLedger};
    use serde_json::json;

    fn service(store: Arc<MemoryStore>) -> WorkflowService {
        let (queue, _rx) = RunQueue::channel();
        let recovery = RecoveryController::new(store.clone(), queue, None);
        WorkflowService::new(store, recovery)
    }

    async fn step(store: &MemoryStore, run_id: i64, node_id: i64, position: i32, status: StepStatus) {
        let row = store
            .insert_step(NewStep {
                run_id,
                attempt: 1,
                node_id,
                node_name: format!("Action {position}"),
                node_type: "utility.compose".into(),
                position,
                status: StepStatus::Running,
                input_data: json!({}),
                debug_info: json!({}),
            })
            .await
            .unwrap();
        if status != StepStatus::Running {
            store
                .finish_step(row.id, status, StepOutcome::default())
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_detail_summarizes_latest_rows() {
        let store = Arc::new(MemoryStore::new());
        let run = store
            .create_run(NewRun {
                sequence_id: 1,
                trigger_id: 1,
                event_id: 1,
                arguments: json!({}),
            })
            .await
            .unwrap();
        step(&store, run.id, 10, 1, StepStatus::Completed).await;
        step(&store, run.id, 11, 2, StepStatus::Waiting).await;
        step(&store, run.id, 11, 2, StepStatus::Completed).await;

        let detail = service(store.clone()).detail(run.id).await.unwrap();
        assert_eq!(detail.steps.len(), 3);
        assert_eq!(detail.summary.total_steps, 2);
        assert_eq!(detail.summary.completed_steps, 2);
        assert_eq!(detail.summary.waiting_steps, 0);
    }

    #[tokio::test]
    async fn test_list_and_missing_run() {
        let store = Arc::new(MemoryStore::new());
        let service = service(store.clone());
        for _ in 0..3 {
            store
                .create_run(NewRun {
                    sequence_id: 1,
                    trigger_id: 1,
                    event_id: 1,
                    arguments: json!({}),
                })
                .await
                .unwrap();
        }
        let page = service
            .list(RunFilter {
                limit: 2,
                ..RunFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(page.items.len(), 2);
        assert!(page.items.iter().all(|r| r.status == RunStatus::Pending));

        assert!(matches!(
            service
                .list(RunFilter {
                    limit: 0,
                    ..RunFilter::default()
                })
                .await,
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(service.detail(99).await, Err(AppError::NotFound(_))));
        assert!(matches!(service.rerun(99).await, Err(AppError::NotFound(_))));
    }
}
