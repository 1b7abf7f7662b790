//! End-to-end funnel scenarios: purchase events through sequence
//! resolution, template resolution, ordered execution and the run ledger.

mod common;

use common::{lab, purchase_payload, Harness};
use funnelflow_actions::ErrorCode;
use funnelflow_control_plane::db::models::{ActionCreateRequest, RunStatus, StepStatus};
use funnelflow_control_plane::engine::resources::{
    FieldSearch, ResourceSearchRequest, ResourceStatus,
};
use serde_json::json;
use std::sync::atomic::Ordering;

#[tokio::test]
async fn test_purchase_runs_sequence_with_resolved_templates() {
    let harness = Harness::start();
    harness
        .sequence(vec![
            lab(
                "welcome {{trigger.member_name}}",
                Some(json!({
                    "email": "{{trigger.member_email}}",
                    "amount": "{{trigger.amount}}",
                    "sku": "{{trigger.line_items.0.sku}}"
                })),
            ),
            ActionCreateRequest {
                app_key: "utility".into(),
                action_key: "compose".into(),
                name: Some("Contact".into()),
                position: None,
                integration_id: None,
                configuration: Some(json!({"fields": {
                    "full_name": "{{trigger.member_name}}",
                    "email": "{{1.payload.email}}"
                }})),
                max_retries: Some(0),
                enabled: true,
            },
            lab("{{2.full_name | upper}}", None),
        ])
        .await;

    let run_ids = harness.purchase(purchase_payload()).await;
    assert_eq!(run_ids.len(), 1);
    let run = harness.wait_for(run_ids[0], RunStatus::Completed, 1).await;

    let calls = harness.recorder.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].args["label"], "welcome Ada Lovelace");
    assert_eq!(
        calls[0].args["payload"],
        json!({"email": "ada@example.com", "amount": 4900, "sku": "SKU-1"})
    );
    assert_eq!(calls[1].args["label"], "ADA LOVELACE");

    assert_eq!(
        run.output["2"],
        json!({"full_name": "Ada Lovelace", "email": "ada@example.com"})
    );
    assert_eq!(run.arguments["order_id"], "ord_2001");

    let detail = harness.state.workflows.detail(run.id).await.unwrap();
    assert_eq!(detail.summary.total_steps, 3);
    assert_eq!(detail.summary.completed_steps, 3);
    assert_eq!(detail.summary.step_durations.len(), 3);
    for step in &detail.steps {
        assert_eq!(step.status, StepStatus::Completed);
        assert_eq!(step.retry_count, 0);
        assert!(step.duration_ms.is_some());
        assert!(step.processed_output.is_some());
    }
    assert_eq!(detail.steps[1].node_name, "Contact");
    assert_eq!(detail.steps[1].node_type, "utility.compose");
    assert!(detail.logs.iter().any(|l| l.message == "Run completed"));

    harness.stop().await;
}

#[tokio::test]
async fn test_actions_run_strictly_in_order() {
    let harness = Harness::start();
    harness.recorder.script(&[80, 20, 0]);
    harness
        .sequence(vec![lab("first", None), lab("second", None), lab("third", None)])
        .await;

    let run_ids = harness.purchase(purchase_payload()).await;
    harness.wait_for(run_ids[0], RunStatus::Completed, 1).await;

    let calls = harness.recorder.calls();
    let labels: Vec<&str> = calls.iter().map(|c| c.args["label"].as_str().unwrap()).collect();
    assert_eq!(labels, vec!["first", "second", "third"]);
    for pair in calls.windows(2) {
        assert!(pair[1].started >= pair[0].finished.unwrap());
    }

    let steps = harness.steps(run_ids[0]).await;
    for pair in steps.windows(2) {
        assert!(pair[1].started_at >= pair[0].completed_at.unwrap());
        assert_eq!(pair[1].position, pair[0].position + 1);
    }

    harness.stop().await;
}

#[tokio::test]
async fn test_conditions_and_disabled_sequences_start_no_runs() {
    let harness = Harness::start();
    harness
        .sequence_with_conditions(
            Some(json!({"amount": {"gte": 10000}})),
            vec![lab("big spender", None)],
        )
        .await;
    let paused = harness.sequence(vec![lab("paused", None)]).await;
    harness
        .state
        .sequences
        .set_enabled(paused.id, false)
        .await
        .unwrap();

    assert!(harness.purchase(purchase_payload()).await.is_empty());

    let mut big = purchase_payload();
    big["amount"] = json!(25000);
    let run_ids = harness.purchase(big).await;
    assert_eq!(run_ids.len(), 1);
    harness.wait_for(run_ids[0], RunStatus::Completed, 1).await;
    assert_eq!(harness.recorder.calls()[0].args["label"], "big spender");

    harness.stop().await;
}

#[tokio::test]
async fn test_auth_action_waits_until_integration_is_reconnected() {
    let harness = Harness::start();
    let integration_id = harness.crm_integration().await;
    harness
        .sequence(vec![
            lab("before", None),
            ActionCreateRequest {
                app_key: "crm".into(),
                action_key: "tag".into(),
                name: None,
                position: None,
                integration_id: Some(integration_id),
                configuration: Some(json!({"email": "{{trigger.member_email}}", "tag": "buyer"})),
                max_retries: Some(0),
                enabled: true,
            },
        ])
        .await;

    let run_ids = harness.purchase(purchase_payload()).await;
    let run = harness.wait_for(run_ids[0], RunStatus::Waiting, 1).await;
    let steps = harness.steps(run.id).await;
    assert_eq!(steps[1].status, StepStatus::Waiting);
    assert_eq!(steps[1].error_code, Some(ErrorCode::AuthError));
    assert!(steps[1]
        .error_message
        .as_deref()
        .unwrap()
        .contains("rerun the workflow"));
    assert_eq!(harness.recorder.count(), 1);

    let tested = harness.state.integrations.test(integration_id).await.unwrap();
    assert!(tested.success);

    let outcome = harness.state.workflows.rerun(run.id).await.unwrap();
    assert!(outcome.performed);
    let run = harness.wait_for(run.id, RunStatus::Completed, 1).await;

    let calls = harness.recorder.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].action, "crm.tag");
    assert_eq!(calls[1].args["email"], "ada@example.com");

    let steps = harness.steps(run.id).await;
    let tagged = steps.last().unwrap();
    assert_eq!(tagged.status, StepStatus::Completed);
    let raw = tagged.raw_response.as_ref().unwrap().to_string();
    assert!(!raw.contains("crm-secret"));

    harness.stop().await;
}

#[tokio::test]
async fn test_resource_search_never_calls_inactive_integration() {
    let harness = Harness::start();
    let integration_id = harness.crm_integration().await;
    let request = || ResourceSearchRequest {
        app_key: "crm".into(),
        integration_id: Some(integration_id),
        fields: vec![FieldSearch {
            field: "tag".into(),
            resource_key: "segments".into(),
            query: "buy".into(),
        }],
    };

    let refused = harness.state.discovery.search(request()).await.unwrap();
    assert_eq!(refused.results[0].status, ResourceStatus::Unavailable);
    assert_eq!(harness.recorder.resource_calls.load(Ordering::SeqCst), 0);

    harness.state.integrations.test(integration_id).await.unwrap();
    let found = harness.state.discovery.search(request()).await.unwrap();
    assert_eq!(found.results[0].status, ResourceStatus::Ok);
    assert_eq!(found.results[0].options[0].value, "seg_buyers");
    assert_eq!(harness.recorder.resource_calls.load(Ordering::SeqCst), 1);

    harness
        .state
        .integrations
        .set_enabled(integration_id, false)
        .await
        .unwrap();
    let disabled = harness.state.discovery.search(request()).await.unwrap();
    assert_eq!(disabled.results[0].status, ResourceStatus::Unavailable);
    assert_eq!(harness.recorder.resource_calls.load(Ordering::SeqCst), 1);

    harness.stop().await;
}

#[tokio::test]
async fn test_action_test_feeds_available_variables() {
    let harness = Harness::start();
    let sequence = harness
        .sequence(vec![lab("hello {{trigger.member_name}}", Some(json!({"vip": true})))])
        .await;
    let detail = harness.state.sequences.get(sequence.id).await.unwrap();
    let action_id = detail.actions[0].id;

    let step = harness
        .state
        .sequences
        .test_action(sequence.id, action_id)
        .await
        .unwrap();
    assert_eq!(step.status, StepStatus::Completed);
    assert_eq!(step.output_data.as_ref().unwrap()["label"], "hello Jane Doe");

    let stored = harness.state.sequences.get(sequence.id).await.unwrap();
    assert_eq!(stored.actions[0].sample_output, step.output_data);

    harness
        .state
        .sequences
        .add_action(sequence.id, lab("{{1.payload.vip}}", None))
        .await
        .unwrap();
    let rejected = harness
        .state
        .sequences
        .add_action(sequence.id, lab("{{1.payload.email}}", None))
        .await;
    assert!(rejected.is_err());

    harness.stop().await;
}
