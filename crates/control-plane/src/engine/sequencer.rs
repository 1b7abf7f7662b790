//! Matching of inbound events to sequence triggers.

use funnelflow_actions::Registry;
use serde_json::Map;
use std::sync::Arc;

use super::conditions::Conditions;
use super::queue::RunQueue;
use crate::db::models::{Event, NewEvent, NewRun, SequenceTrigger, WorkflowRun};
use crate::store::{Store, StoreResult};

#[derive(Clone)]
pub struct SequenceResolver {
    store: Arc<dyn Store>,
    registry: Arc<Registry>,
    queue: RunQueue,
}

impl SequenceResolver {
    pub fn new(store: Arc<dyn Store>, registry: Arc<Registry>, queue: RunQueue) -> Self {
        Self {
            store,
            registry,
            queue,
        }
    }

    /// Store the event, create one pending run per matching trigger and
    /// queue the runs.
    pub async fn ingest(&self, new: NewEvent) -> StoreResult<(Event, Vec<WorkflowRun>)> {
        let event = self.store.insert_event(new).await?;
        let runs = self.dispatch(&event).await?;
        Ok((event, runs))
    }

    /// Create and queue runs for an already stored event.
    pub async fn dispatch(&self, event: &Event) -> StoreResult<Vec<WorkflowRun>> {
        let candidates = self
            .store
            .find_triggers(&event.app_key, &event.trigger_key)
            .await?;

        let mut runs = Vec::new();
        for trigger in candidates {
            if !self.matches(&trigger, event).await? {
                continue;
            }

            let run = self
                .store
                .create_run(NewRun {
                    sequence_id: trigger.sequence_id,
                    trigger_id: trigger.id,
                    event_id: event.id,
                    arguments: event.event_data.clone(),
                })
                .await?;
            tracing::info!(
                event_id = event.id,
                trigger_id = trigger.id,
                sequence_id = trigger.sequence_id,
                run_id = run.id,
                "Event matched trigger, run created"
            );
            self.queue.enqueue(run.id);
            runs.push(run);
        }

        if runs.is_empty() {
            tracing::debug!(
                event_id = event.id,
                app_key = %event.app_key,
                trigger_key = %event.trigger_key,
                "Event matched no trigger"
            );
        }
        Ok(runs)
    }

    async fn matches(&self, trigger: &SequenceTrigger, event: &Event) -> StoreResult<bool> {
        if let (Some(expected), Some(actual)) = (trigger.integration_id, event.integration_id) {
            if expected != actual {
                return Ok(false);
            }
        }
        if trigger.integration_id.is_some() && event.integration_id.is_none() {
            return Ok(false);
        }

        match self.store.get_sequence(trigger.sequence_id).await? {
            Some(sequence) if sequence.enabled => {}
            _ => return Ok(false),
        }

        if let Some(raw) = &trigger.conditions {
            match Conditions::parse(raw) {
                Ok(conditions) if conditions.matches(&event.event_data) => {}
                Ok(_) => return Ok(false),
                Err(e) => {
                    tracing::warn!(trigger_id = trigger.id, error = %e, "Stored trigger conditions are invalid");
                    return Ok(false);
                }
            }
        }

        let Some(kind) = self.registry.trigger(&trigger.app_key, &trigger.trigger_key) else {
            tracing::warn!(
                trigger_id = trigger.id,
                app_key = %trigger.app_key,
                trigger_key = %trigger.trigger_key,
                "Trigger kind is not registered"
            );
            return Ok(false);
        };

        if kind.requires_auth() {
            let integration = match trigger.integration_id {
                Some(id) => self.store.get_integration(id).await?,
                None => None,
            };
            if !integration.is_some_and(|i| i.is_active()) {
                tracing::warn!(
                    trigger_id = trigger.id,
                    integration_id = ?trigger.integration_id,
                    "Skipping trigger: its integration is not active"
                );
                return Ok(false);
            }
        }

        let empty = Map::new();
        let config = trigger.configuration.as_object().unwrap_or(&empty);
        Ok(kind.matches(config, &event.event_data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{IntegrationState, NewIntegration, NewSequence, NewTrigger};
    use crate::store::{IntegrationStore, MemoryStore, SequenceStore};
    use funnelflow_actions::apps::default_registry;
    use serde_json::{json, Value};

    async fn setup() -> (SequenceResolver, Arc<MemoryStore>, tokio::sync::mpsc::UnboundedReceiver<i64>) {
        let store = Arc::new(MemoryStore::new());
        let (queue, rx) = RunQueue::channel();
        let resolver = SequenceResolver::new(store.clone(), Arc::new(default_registry()), queue);
        (resolver, store, rx)
    }

    async fn sequence_with_trigger(
        store: &MemoryStore,
        enabled: bool,
        app_key: &str,
        trigger_key: &str,
        integration_id: Option<i64>,
        conditions: Option<Value>,
    ) -> SequenceTrigger {
        let sequence = store
            .create_sequence(NewSequence {
                tenant_id: "t".into(),
                name: "Funnel".into(),
                enabled,
            })
            .await
            .unwrap();
        store
            .create_trigger(NewTrigger {
                sequence_id: sequence.id,
                app_key: app_key.into(),
                integration_id,
                trigger_key: trigger_key.into(),
                configuration: json!({}),
                conditions,
            })
            .await
            .unwrap()
    }

    fn purchase(integration_id: Option<i64>) -> NewEvent {
        NewEvent {
            app_key: "checkout".into(),
            trigger_key: "purchase_completed".into(),
            integration_id,
            event_data: json!({"amount": 4900, "member": {"email": "jane@example.com"}}),
        }
    }

    #[tokio::test]
    async fn test_one_run_per_matching_trigger() {
        let (resolver, store, mut rx) = setup().await;
        let first = sequence_with_trigger(&store, true, "checkout", "purchase_completed", None, None).await;
        let second = sequence_with_trigger(
            &store,
            true,
            "checkout",
            "purchase_completed",
            None,
            Some(json!({"amount": {"gte": 1000}})),
        )
        .await;
        sequence_with_trigger(&store, false, "checkout", "purchase_completed", None, None).await;
        sequence_with_trigger(&store, true, "checkout", "refund_issued", None, None).await;
        sequence_with_trigger(
            &store,
            true,
            "checkout",
            "purchase_completed",
            None,
            Some(json!({"amount": {"gt": 10000}})),
        )
        .await;

        let (event, runs) = resolver.ingest(purchase(None)).await.unwrap();
        let triggers: Vec<i64> = runs.iter().map(|r| r.trigger_id).collect();
        assert_eq!(triggers, vec![first.id, second.id]);
        assert!(runs.iter().all(|r| r.event_id == event.id));
        assert!(runs.iter().all(|r| r.arguments == event.event_data));
        assert_eq!(rx.try_recv().ok(), Some(runs[0].id));
        assert_eq!(rx.try_recv().ok(), Some(runs[1].id));
    }

    #[tokio::test]
    async fn test_integration_filter() {
        let (resolver, store, _rx) = setup().await;
        let bound = sequence_with_trigger(&store, true, "checkout", "purchase_completed", Some(4), None).await;

        let (_, runs) = resolver.ingest(purchase(Some(5))).await.unwrap();
        assert!(runs.is_empty());
        let (_, runs) = resolver.ingest(purchase(None)).await.unwrap();
        assert!(runs.is_empty());
        let (_, runs) = resolver.ingest(purchase(Some(4))).await.unwrap();
        assert_eq!(runs[0].trigger_id, bound.id);
    }

    #[tokio::test]
    async fn test_auth_trigger_requires_active_integration() {
        let (resolver, store, _rx) = setup().await;
        let integration = store
            .create_integration(NewIntegration {
                tenant_id: "t".into(),
                app_key: "rest".into(),
                name: "CRM".into(),
                credentials: Vec::new(),
                config: json!({"base_url": "https://crm.example.com"}),
            })
            .await
            .unwrap();
        sequence_with_trigger(&store, true, "rest", "record_created", Some(integration.id), None).await;
        let event = || NewEvent {
            app_key: "rest".into(),
            trigger_key: "record_created".into(),
            integration_id: Some(integration.id),
            event_data: json!({"id": 1}),
        };

        let (_, runs) = resolver.ingest(event()).await.unwrap();
        assert!(runs.is_empty());

        store
            .set_integration_state(integration.id, IntegrationState::Active, None, true)
            .await
            .unwrap();
        let (_, runs) = resolver.ingest(event()).await.unwrap();
        assert_eq!(runs.len(), 1);
    }
}
