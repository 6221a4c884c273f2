//! Route table and handlers.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use super::error::ApiResult;
use crate::domain::models::{
    AgentStatus, ArtifactRef, CancelOutcome, MergeResult, ReleaseOutcome, Resolution, Task, TaskPriority,
};
use crate::services::{NewTask, Scheduler};

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
}

impl AppState {
    pub const fn new(scheduler: Arc<Scheduler>) -> Self {
        Self { scheduler }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/tickets", post(create_ticket))
        .route("/tickets/{id}", get(get_ticket))
        .route("/tickets/{id}/archive", post(archive_ticket))
        .route("/tasks", post(create_task))
        .route("/tasks/claim", post(claim_task))
        .route("/tasks/{id}", get(get_task))
        .route("/tasks/{id}/start", post(start_task))
        .route("/tasks/{id}/complete", post(complete_task))
        .route("/tasks/{id}/fail", post(fail_task))
        .route("/tasks/{id}/cancel", post(cancel_task))
        .route("/tasks/{id}/retry", post(retry_task))
        .route("/tasks/{id}/dependencies", post(add_dependency))
        .route("/tasks/{id}/dependencies/{blocker_id}", delete(remove_dependency))
        .route("/agents", post(register_agent))
        .route("/agents/{id}/heartbeat", post(heartbeat))
        .route("/agents/{id}", delete(terminate_agent))
        .route("/merge", post(submit_merge))
        .route("/merge/{id}/resolve", post(resolve_merge))
        .route("/state/queue", get(queue_state))
        .route("/state/blocked", get(blocked_state))
        .route("/state/agents", get(agents_state))
        .route("/state/merges", get(merges_state))
        .route("/state/circuits", get(circuits_state))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

#[derive(Debug, Deserialize)]
pub struct CreateTicketRequest {
    pub title: String,
    #[serde(default)]
    pub priority: Option<TaskPriority>,
}

async fn create_ticket(State(state): State<AppState>, Json(req): Json<CreateTicketRequest>) -> ApiResult<Response> {
    let ticket = state
        .scheduler
        .tickets()
        .create(&req.title, req.priority.unwrap_or_default())
        .await?;
    Ok((StatusCode::CREATED, Json(ticket)).into_response())
}

async fn get_ticket(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Response> {
    Ok(Json(state.scheduler.tickets().get(id).await?).into_response())
}

async fn archive_ticket(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Response> {
    Ok(Json(state.scheduler.tickets().archive(id).await?).into_response())
}

async fn create_task(State(state): State<AppState>, Json(req): Json<NewTask>) -> ApiResult<Response> {
    let task = state.scheduler.queue().create_task(req).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "task_id": task.id, "status": task.status })),
    )
        .into_response())
}

async fn get_task(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Response> {
    Ok(Json(state.scheduler.queue().get(id).await?).into_response())
}

#[derive(Debug, Deserialize)]
pub struct ClaimRequest {
    pub agent_id: String,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

async fn claim_task(State(state): State<AppState>, Json(req): Json<ClaimRequest>) -> ApiResult<Response> {
    let claimed = state
        .scheduler
        .queue()
        .claim_next(&req.agent_id, req.idempotency_key.as_deref())
        .await?;
    Ok(match claimed {
        Some(task) => Json(ClaimResponse::from(task)).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

#[derive(Debug, Serialize)]
struct ClaimResponse {
    task_id: Uuid,
    description: String,
    attempt_number: u32,
    task: Task,
}

impl From<Task> for ClaimResponse {
    fn from(task: Task) -> Self {
        Self {
            task_id: task.id,
            description: task.description.clone(),
            attempt_number: task.attempt_number(),
            task,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub agent_id: String,
}

async fn start_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<StartRequest>,
) -> ApiResult<Response> {
    Ok(Json(state.scheduler.queue().start(id, &req.agent_id).await?).into_response())
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompleteRequest {
    #[serde(default, alias = "artifact_ref")]
    pub artifact: Option<ArtifactRef>,
}

async fn complete_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<CompleteRequest>>,
) -> ApiResult<Response> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    Ok(Json(state.scheduler.queue().complete(id, req.artifact).await?).into_response())
}

#[derive(Debug, Deserialize)]
pub struct FailRequest {
    pub reason: String,
    #[serde(default)]
    pub retryable: Option<bool>,
}

#[derive(Debug, Serialize)]
struct ReleaseResponse {
    task_id: Uuid,
    outcome: ReleaseOutcome,
}

async fn fail_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<FailRequest>,
) -> ApiResult<Response> {
    let outcome = state.scheduler.queue().fail(id, &req.reason, req.retryable).await?;
    Ok(Json(ReleaseResponse { task_id: id, outcome }).into_response())
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
struct CancelResponse {
    task_id: Uuid,
    outcome: CancelOutcome,
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<CancelRequest>>,
) -> ApiResult<Response> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let outcome = state.scheduler.queue().cancel(id, req.reason.as_deref()).await?;
    Ok(Json(CancelResponse { task_id: id, outcome }).into_response())
}

async fn retry_task(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Response> {
    Ok(Json(state.scheduler.queue().retry(id).await?).into_response())
}

#[derive(Debug, Deserialize)]
pub struct DependencyRequest {
    pub blocker_id: Uuid,
}

async fn add_dependency(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<DependencyRequest>,
) -> ApiResult<Response> {
    Ok(Json(state.scheduler.queue().add_dependency(req.blocker_id, id).await?).into_response())
}

async fn remove_dependency(
    State(state): State<AppState>,
    Path((id, blocker_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Response> {
    Ok(Json(state.scheduler.queue().remove_dependency(blocker_id, id).await?).into_response())
}

#[derive(Debug, Default, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub capacity: Option<u32>,
}

async fn register_agent(
    State(state): State<AppState>,
    body: Option<Json<RegisterRequest>>,
) -> ApiResult<Response> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let agent = state
        .scheduler
        .workers()
        .register(req.agent_id.as_deref(), req.capacity.unwrap_or(1))
        .await?;
    Ok((StatusCode::CREATED, Json(agent)).into_response())
}

/// Agents only need the flag; the ids say which held task to stop.
#[derive(Debug, Serialize)]
struct HeartbeatResponse {
    cancel_requested: bool,
    cancel_task_ids: Vec<Uuid>,
    status: AgentStatus,
    tasks: Vec<Uuid>,
    lease_expires_at: DateTime<Utc>,
}

async fn heartbeat(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Response> {
    let ack = state.scheduler.workers().heartbeat(&id).await?;
    Ok(Json(HeartbeatResponse {
        cancel_requested: !ack.cancel_requested.is_empty(),
        cancel_task_ids: ack.cancel_requested,
        status: ack.status,
        tasks: ack.tasks,
        lease_expires_at: ack.lease_expires_at,
    })
    .into_response())
}

async fn terminate_agent(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Response> {
    let released = state.scheduler.workers().terminate(&id).await?;
    Ok(Json(json!({ "agent_id": id, "released": released })).into_response())
}

#[derive(Debug, Deserialize)]
pub struct MergeRequest {
    pub task_id: Uuid,
    pub base_ref: String,
    pub produced_ref: String,
}

async fn submit_merge(State(state): State<AppState>, Json(req): Json<MergeRequest>) -> ApiResult<Response> {
    let result = state
        .scheduler
        .submit_merge(req.task_id, &req.base_ref, &req.produced_ref)
        .await?;
    Ok(merge_response(result))
}

/// Conflicts answer 409 but still carry the full result so the caller can escalate.
fn merge_response(result: MergeResult) -> Response {
    if result.is_conflict() {
        (StatusCode::CONFLICT, Json(result)).into_response()
    } else {
        Json(result).into_response()
    }
}

async fn resolve_merge(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(resolution): Json<Resolution>,
) -> ApiResult<Response> {
    let result = state.scheduler.convergence().resolve(id, resolution).await?;
    Ok(merge_response(result))
}

async fn queue_state(State(state): State<AppState>) -> ApiResult<Response> {
    Ok(Json(state.scheduler.queue().stats().await?).into_response())
}

async fn blocked_state(State(state): State<AppState>) -> ApiResult<Response> {
    Ok(Json(state.scheduler.queue().graph().blocked_tasks().await).into_response())
}

async fn agents_state(State(state): State<AppState>) -> ApiResult<Response> {
    Ok(Json(state.scheduler.workers().liveness().await?).into_response())
}

async fn merges_state(State(state): State<AppState>) -> ApiResult<Response> {
    Ok(Json(state.scheduler.merge_state().await?).into_response())
}

async fn circuits_state(State(state): State<AppState>) -> ApiResult<Response> {
    Ok(Json(state.scheduler.breaker().stats().await).into_response())
}
