use axum::{
    extract::{Path, Query, State},
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    Json,
};
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::api::server::AppState;
use crate::engine::{AgentUpdate, SessionStatus, SessionSummary};
use crate::types::{Agent, AgentConfig, AgentFilter, Task, TaskDraft};

#[derive(Debug, Serialize, Deserialize)]
pub struct MutationResponse {
    pub id: Uuid,
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

impl MutationResponse {
    fn new(id: Uuid, status: impl Into<String>) -> Self {
        Self {
            id,
            status: status.into(),
            timestamp: Utc::now(),
        }
    }
}

impl From<&Agent> for MutationResponse {
    fn from(agent: &Agent) -> Self {
        Self {
            id: agent.id,
            status: agent.status.as_str().to_string(),
            timestamp: agent.updated_at,
        }
    }
}

impl From<&Task> for MutationResponse {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id,
            status: task.status.as_str().to_string(),
            timestamp: task.updated_at,
        }
    }
}

#[derive(Deserialize)]
pub struct CreateSessionRequest {
    pub goal: String,
    pub max_iterations: Option<u32>,
}

#[derive(Deserialize, Default)]
pub struct ReasonRequest {
    pub reason: Option<String>,
}

#[derive(Serialize)]
pub struct EmergencyStopResponse {
    pub stopped: usize,
    pub timestamp: DateTime<Utc>,
}

pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<Json<MutationResponse>, ApiError> {
    let coordinator = state.sessions.create(request.goal, request.max_iterations).await?;
    Ok(Json(MutationResponse::new(coordinator.session_id(), "staged")))
}

pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionSummary>> {
    Json(state.sessions.list().await)
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionStatus>, ApiError> {
    Ok(Json(state.sessions.status(&id).await?))
}

pub async fn start_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<MutationResponse>, ApiError> {
    state.sessions.start(&id).await?;
    Ok(Json(MutationResponse::new(id, "running")))
}

pub async fn stream_session_events(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, axum::Error>>>, ApiError> {
    let mut events = state.sessions.get(&id).await?.subscribe();

    let stream = async_stream::stream! {
        loop {
            match events.recv().await {
                Ok(event) => yield SseEvent::default().event(event.event_type.as_str()).json_data(&event),
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("event stream for session {} skipped {} events", id, skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

pub async fn create_agent(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(config): Json<AgentConfig>,
) -> Result<Json<MutationResponse>, ApiError> {
    let agent = state.sessions.get(&id).await?.create_agent(config).await?;
    Ok(Json(MutationResponse::from(&agent)))
}

pub async fn list_agents(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(filter): Query<AgentFilter>,
) -> Result<Json<Vec<Agent>>, ApiError> {
    Ok(Json(state.sessions.get(&id).await?.list_agents(&filter)))
}

pub async fn get_agent(
    State(state): State<AppState>,
    Path((id, agent_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<Agent>, ApiError> {
    Ok(Json(state.sessions.get(&id).await?.get_agent(&agent_id)?))
}

pub async fn update_agent(
    State(state): State<AppState>,
    Path((id, agent_id)): Path<(Uuid, Uuid)>,
    Json(update): Json<AgentUpdate>,
) -> Result<Json<MutationResponse>, ApiError> {
    let agent = state
        .sessions
        .get(&id)
        .await?
        .update_agent(&agent_id, update)
        .await?;
    Ok(Json(MutationResponse::from(&agent)))
}

pub async fn terminate_agent(
    State(state): State<AppState>,
    Path((id, agent_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<MutationResponse>, ApiError> {
    let agent = state.sessions.get(&id).await?.terminate_agent(&agent_id).await?;
    Ok(Json(MutationResponse::from(&agent)))
}

pub async fn create_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(draft): Json<TaskDraft>,
) -> Result<Json<MutationResponse>, ApiError> {
    let task = state.sessions.get(&id).await?.create_task(draft).await?;
    Ok(Json(MutationResponse::from(&task)))
}

pub async fn list_tasks(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Task>>, ApiError> {
    Ok(Json(state.sessions.get(&id).await?.list_tasks()))
}

pub async fn get_task(
    State(state): State<AppState>,
    Path((id, task_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<Task>, ApiError> {
    Ok(Json(state.sessions.get(&id).await?.get_task(&task_id)?))
}

pub async fn assign_task(
    State(state): State<AppState>,
    Path((id, task_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let coordinator = state.sessions.get(&id).await?;
    let agent_id = coordinator.assign_task(&task_id).await?;
    let task = coordinator.get_task(&task_id)?;
    Ok(Json(serde_json::json!({
        "id": task.id,
        "status": task.status.as_str(),
        "timestamp": task.updated_at,
        "agent_id": agent_id,
    })))
}

pub async fn cancel_task(
    State(state): State<AppState>,
    Path((id, task_id)): Path<(Uuid, Uuid)>,
    request: Option<Json<ReasonRequest>>,
) -> Result<Json<MutationResponse>, ApiError> {
    let reason = request
        .and_then(|Json(r)| r.reason)
        .unwrap_or_else(|| "cancelled by operator".to_string());
    let coordinator = state.sessions.get(&id).await?;
    coordinator.cancel_task(&task_id, &reason).await?;
    let task = coordinator.get_task(&task_id)?;
    Ok(Json(MutationResponse::from(&task)))
}

pub async fn emergency_stop(
    State(state): State<AppState>,
    request: Option<Json<ReasonRequest>>,
) -> Json<EmergencyStopResponse> {
    let reason = request
        .and_then(|Json(r)| r.reason)
        .unwrap_or_else(|| "emergency stop".to_string());
    let stopped = state.sessions.emergency_stop_all(&reason).await;
    Json(EmergencyStopResponse {
        stopped,
        timestamp: Utc::now(),
    })
}
