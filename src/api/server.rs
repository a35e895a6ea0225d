use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::api::handlers;
use crate::engine::SessionTable;

#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionTable>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route(
            "/sessions",
            post(handlers::create_session).get(handlers::list_sessions),
        )
        .route("/sessions/:id", get(handlers::get_session))
        .route("/sessions/:id/start", post(handlers::start_session))
        .route("/sessions/:id/events", get(handlers::stream_session_events))
        .route(
            "/sessions/:id/agents",
            post(handlers::create_agent).get(handlers::list_agents),
        )
        .route(
            "/sessions/:id/agents/:agent_id",
            get(handlers::get_agent)
                .patch(handlers::update_agent)
                .delete(handlers::terminate_agent),
        )
        .route(
            "/sessions/:id/tasks",
            post(handlers::create_task).get(handlers::list_tasks),
        )
        .route("/sessions/:id/tasks/:task_id", get(handlers::get_task))
        .route("/sessions/:id/tasks/:task_id/assign", post(handlers::assign_task))
        .route("/sessions/:id/tasks/:task_id/cancel", post(handlers::cancel_task))
        .route("/emergency-stop", post(handlers::emergency_stop))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(state: AppState, port: u16) -> Result<()> {
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    log::info!("overseer API listening on port {}", port);

    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::config::Config;
    use crate::providers::execution::SimulatedEngine;
    use crate::storage::InMemoryStore;
    use crate::validation::QualityGateEvaluator;

    fn create_test_app() -> Router {
        let config = Config::default();
        let evaluator = QualityGateEvaluator::heuristic(config.quality_gate.clone());
        let sessions = Arc::new(SessionTable::new(
            config,
            Arc::new(SimulatedEngine),
            Arc::new(InMemoryStore::new()),
            evaluator,
        ));
        create_router(AppState { sessions })
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                request = request.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = app
            .clone()
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();

        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, json)
    }

    async fn create_session(app: &Router) -> String {
        let (status, json) = send(
            app,
            "POST",
            "/sessions",
            Some(serde_json::json!({ "goal": "Ship the login flow" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "staged");
        json["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = create_test_app();
        let (status, json) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "healthy");
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let app = create_test_app();
        let uri = format!("/sessions/{}", uuid::Uuid::new_v4());
        let (status, json) = send(&app, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"], "SessionNotFound");
    }

    #[tokio::test]
    async fn test_agent_and_task_mutations() {
        let app = create_test_app();
        let session = create_session(&app).await;

        let (status, agent) = send(
            &app,
            "POST",
            &format!("/sessions/{}/agents", session),
            Some(serde_json::json!({ "name": "backend", "role": "worker", "specializations": ["rust"] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(agent["status"], "idle");
        assert!(agent["timestamp"].is_string());

        let (status, task) = send(
            &app,
            "POST",
            &format!("/sessions/{}/tasks", session),
            Some(serde_json::json!({ "title": "Add login endpoint", "description": "JWT" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(task["status"], "pending");
        let task_id = task["id"].as_str().unwrap();

        let (status, assigned) = send(
            &app,
            "POST",
            &format!("/sessions/{}/tasks/{}/assign", session, task_id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(assigned["status"], "assigned");
        assert_eq!(assigned["agent_id"], agent["id"]);

        let (status, cancelled) = send(
            &app,
            "POST",
            &format!("/sessions/{}/tasks/{}/cancel", session, task_id),
            Some(serde_json::json!({ "reason": "descoped" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(cancelled["status"], "cancelled");

        let (status, agents) = send(
            &app,
            "GET",
            &format!("/sessions/{}/agents?status=idle", session),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(agents.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_dependency_is_bad_request() {
        let app = create_test_app();
        let session = create_session(&app).await;
        let (status, json) = send(
            &app,
            "POST",
            &format!("/sessions/{}/tasks", session),
            Some(serde_json::json!({
                "title": "Orphan",
                "description": "",
                "dependencies": [uuid::Uuid::new_v4()],
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "Validation");
    }

    #[tokio::test]
    async fn test_assign_without_agents_conflicts() {
        let app = create_test_app();
        let session = create_session(&app).await;
        let (_, task) = send(
            &app,
            "POST",
            &format!("/sessions/{}/tasks", session),
            Some(serde_json::json!({ "title": "Lonely", "description": "" })),
        )
        .await;
        let (status, json) = send(
            &app,
            "POST",
            &format!("/sessions/{}/tasks/{}/assign", session, task["id"].as_str().unwrap()),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["error"], "TaskAssignmentFailed");
    }

    #[tokio::test]
    async fn test_emergency_stop_archives_sessions() {
        let app = create_test_app();
        let session = create_session(&app).await;
        send(
            &app,
            "POST",
            &format!("/sessions/{}/tasks", session),
            Some(serde_json::json!({ "title": "Pending work", "description": "" })),
        )
        .await;

        let (status, json) = send(&app, "POST", "/emergency-stop", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["stopped"], 1);

        let (status, json) = send(&app, "GET", &format!("/sessions/{}", session), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["state"], "archived");
        assert_eq!(json["report"]["outcome"], "cancelled");
    }
}
