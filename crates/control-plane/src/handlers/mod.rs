//! HTTP handlers for the Funnelflow control plane API.
//!
//! Handlers are organized by domain; [`router`] assembles them. Each domain
//! router carries its own service as state.

pub mod discovery;
pub mod events;
pub mod health;
pub mod integrations;
pub mod sequences;
pub mod workflows;

pub use health::{api_health, health_check};

use axum::{
    routing::{delete, get, post, put},
    Router,
};

use crate::state::AppState;

/// Build the application router with all routes.
pub fn router(state: &AppState) -> Router {
    let health_routes = Router::new()
        .route("/health", get(health::health_check))
        .route("/api/health", get(health::api_health))
        .with_state(state.clone());

    let integration_routes = Router::new()
        .route(
            "/integrations",
            post(integrations::create).get(integrations::list),
        )
        .route(
            "/integrations/{id}",
            get(integrations::get).delete(integrations::delete),
        )
        .route("/integrations/{id}/test", post(integrations::test))
        .route("/integrations/{id}/state", put(integrations::set_state))
        .with_state(state.integrations.clone());

    let sequence_routes = Router::new()
        .route("/sequences", post(sequences::create).get(sequences::list))
        .route(
            "/sequences/{id}",
            get(sequences::get)
                .patch(sequences::update)
                .delete(sequences::delete),
        )
        .route("/sequences/{id}/triggers", post(sequences::add_trigger))
        .route(
            "/sequences/{id}/triggers/{trigger_id}",
            delete(sequences::delete_trigger),
        )
        .route(
            "/sequences/{id}/triggers/{trigger_id}/test",
            post(sequences::test_trigger),
        )
        .route("/sequences/{id}/actions", post(sequences::add_action))
        .route(
            "/sequences/{id}/actions/{action_id}",
            delete(sequences::delete_action),
        )
        .route(
            "/sequences/{id}/actions/{action_id}/position",
            put(sequences::move_action),
        )
        .route(
            "/sequences/{id}/actions/{action_id}/test",
            post(sequences::test_action),
        )
        .route("/sequences/{id}/variables", get(sequences::variables))
        .with_state(state.sequences.clone());

    let workflow_routes = Router::new()
        .route("/workflows", get(workflows::list))
        .route("/workflows/{id}", get(workflows::get))
        .route("/workflows/{id}/rerun", post(workflows::rerun))
        .route("/workflows/{id}/force-rerun", post(workflows::force_rerun))
        .route("/workflows/{id}/cancel", post(workflows::cancel))
        .with_state(state.workflows.clone());

    let event_routes = Router::new()
        .route("/events/{app_key}/{trigger_key}", post(events::ingest))
        .with_state(state.events.clone());

    let discovery_routes = Router::new()
        .route("/discovered/apps", get(discovery::apps))
        .route("/discovered/triggers", get(discovery::triggers))
        .route("/discovered/actions", get(discovery::actions))
        .route(
            "/discovered/resources/search",
            post(discovery::search_resources),
        )
        .with_state(state.discovery.clone());

    Router::new()
        .merge(health_routes)
        .merge(integration_routes)
        .merge(sequence_routes)
        .merge(workflow_routes)
        .merge(event_routes)
        .merge(discovery_routes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::crypto::CredentialCipher;
    use crate::store::MemoryStore;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request, StatusCode};
    use funnelflow_actions::apps::default_registry;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app() -> Router {
        let cipher = CredentialCipher::from_bytes(&CredentialCipher::generate_key()).unwrap();
        let (state, _worker) = AppState::new(
            Arc::new(MemoryStore::new()),
            Arc::new(default_registry()),
            cipher,
            AppConfig::default(),
            None,
        );
        router(&state)
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_health_routes() {
        let app = app();
        let (status, body) = call(&app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = call(&app, Method::GET, "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["store"], "memory");
        assert_eq!(body["nats"], "not_configured");
    }

    #[tokio::test]
    async fn test_sequence_configuration_routes() {
        let app = app();
        let (status, sequence) = call(
            &app,
            Method::POST,
            "/sequences",
            Some(json!({"name": "Welcome", "tenant_id": "acme"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = sequence["id"].as_i64().unwrap();

        let (status, _) = call(
            &app,
            Method::POST,
            &format!("/sequences/{id}/triggers"),
            Some(json!({"app_key": "checkout", "trigger_key": "purchase_completed"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, action) = call(
            &app,
            Method::POST,
            &format!("/sequences/{id}/actions"),
            Some(json!({
                "app_key": "utility",
                "action_key": "compose",
                "configuration": {"fields": {"email": "{{trigger.member_email}}"}}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(action["position"], 1);

        let (status, body) = call(
            &app,
            Method::POST,
            &format!("/sequences/{id}/actions"),
            Some(json!({
                "app_key": "utility",
                "action_key": "compose",
                "configuration": {"fields": {"x": "{{trigger.nope}}"}}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["status"], 422);

        let (status, variables) =
            call(&app, Method::GET, &format!("/sequences/{id}/variables"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(variables[0]["position"], 1);

        let (status, detail) = call(
            &app,
            Method::PATCH,
            &format!("/sequences/{id}"),
            Some(json!({"enabled": false})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(detail["enabled"], false);

        let (status, detail) = call(&app, Method::GET, &format!("/sequences/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(detail["triggers"].as_array().unwrap().len(), 1);
        assert_eq!(detail["actions"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_ids_are_404() {
        let app = app();
        let (status, body) = call(&app, Method::GET, "/workflows/42", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["status"], 404);

        let (status, _) = call(&app, Method::POST, "/workflows/42/rerun", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&app, Method::GET, "/integrations/7", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_event_ingestion_and_discovery() {
        let app = app();
        let (status, body) = call(
            &app,
            Method::POST,
            "/events/checkout/purchase_completed",
            Some(json!({"order_id": "o-1"})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["run_ids"], json!([]));

        let (status, triggers) =
            call(&app, Method::GET, "/discovered/triggers?app_key=checkout", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(triggers.as_array().unwrap().len(), 2);

        let (status, body) = call(
            &app,
            Method::POST,
            "/discovered/resources/search",
            Some(json!({
                "app_key": "rest",
                "fields": [{"field": "record", "resource_key": "records", "query": "jane"}]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["results"][0]["status"], "unavailable");
    }

    #[tokio::test]
    async fn test_integration_routes() {
        let app = app();
        let (status, created) = call(
            &app,
            Method::POST,
            "/integrations",
            Some(json!({
                "app_key": "rest",
                "name": "CRM",
                "credentials": {"type": "bearer", "token": "secret"},
                "config": {"base_url": "https://crm.example.com"}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["state"], "created");
        assert!(!created.to_string().contains("secret"));
        let id = created["id"].as_i64().unwrap();

        let (status, updated) = call(
            &app,
            Method::PUT,
            &format!("/integrations/{id}/state"),
            Some(json!({"enabled": false})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["state"], "inactive");

        let (status, _) = call(&app, Method::DELETE, &format!("/integrations/{id}"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }
}
