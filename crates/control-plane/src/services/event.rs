//! Event ingestion.

use funnelflow_actions::Registry;
use serde_json::Value;
use std::sync::Arc;

use crate::db::models::{EventIngestResponse, NewEvent};
use crate::engine::SequenceResolver;
use crate::error::{AppError, AppResult};

#[derive(Clone)]
pub struct EventService {
    registry: Arc<Registry>,
    sequencer: SequenceResolver,
}

impl EventService {
    pub fn new(registry: Arc<Registry>, sequencer: SequenceResolver) -> Self {
        Self {
            registry,
            sequencer,
        }
    }

    /// Store the event and start a run for every matching trigger.
    pub async fn ingest(
        &self,
        app_key: &str,
        trigger_key: &str,
        integration_id: Option<i64>,
        event_data: Value,
    ) -> AppResult<EventIngestResponse> {
        if self.registry.trigger(app_key, trigger_key).is_none() {
            return Err(AppError::NotFound(format!(
                "Trigger '{app_key}.{trigger_key}' is not registered"
            )));
        }
        if !event_data.is_object() {
            return Err(AppError::Validation(
                "Event payload must be a JSON object".to_string(),
            ));
        }

        let (event, runs) = self
            .sequencer
            .ingest(NewEvent {
                app_key: app_key.to_string(),
                trigger_key: trigger_key.to_string(),
                integration_id,
                event_data,
            })
            .await?;

        tracing::info!(
            event_id = event.id,
            app_key,
            trigger_key,
            runs = runs.len(),
            "Event ingested"
        );
        Ok(EventIngestResponse {
            event_id: event.id,
            run_ids: runs.iter().map(|r| r.id).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{NewSequence, NewTrigger, RunStatus};
    use crate::engine::RunQueue;
    use crate::store::{MemoryStore, RunLedger, SequenceStore, Store};
    use funnelflow_actions::apps::default_registry;
    use serde_json::json;

    #[tokio::test]
    async fn test_ingest_creates_runs() {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(default_registry());
        let (queue, mut rx) = RunQueue::channel();
        let service = EventService::new(
            registry.clone(),
            SequenceResolver::new(store.clone(), registry, queue),
        );

        let sequence = store
            .create_sequence(NewSequence {
                tenant_id: "acme".into(),
                name: "Welcome".into(),
                enabled: true,
            })
            .await
            .unwrap();
        store
            .create_trigger(NewTrigger {
                sequence_id: sequence.id,
                app_key: "checkout".into(),
                integration_id: None,
                trigger_key: "purchase_completed".into(),
                configuration: json!({}),
                conditions: None,
            })
            .await
            .unwrap();

        let response = service
            .ingest("checkout", "purchase_completed", None, json!({"order_id": "o-1"}))
            .await
            .unwrap();
        assert_eq!(response.run_ids.len(), 1);
        assert_eq!(rx.recv().await, Some(response.run_ids[0]));

        let run = store.get_run(response.run_ids[0]).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.arguments["order_id"], "o-1");

        let none = service
            .ingest("checkout", "refund_issued", None, json!({}))
            .await
            .unwrap();
        assert!(none.run_ids.is_empty());
    }

    #[tokio::test]
    async fn test_ingest_rejects_unknown_and_malformed() {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(default_registry());
        let (queue, _rx) = RunQueue::channel();
        let service = EventService::new(
            registry.clone(),
            SequenceResolver::new(store, registry, queue),
        );

        assert!(matches!(
            service.ingest("checkout", "nope", None, json!({})).await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            service.ingest("checkout", "purchase_completed", None, json!([1])).await,
            Err(AppError::Validation(_))
        ));
    }
}
