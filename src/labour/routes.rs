//! REST endpoints and the event WebSocket for labour requests.

use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use super::events::Actor;
use super::model::{CoordinatorId, LabourRequest, NewLabourRequest, RequestId, WorkType, WorkerId};
use super::service::LabourService;
use crate::error::LabourError;
use crate::store::RequestFilter;

/// Shared state for labour routes.
#[derive(Clone)]
pub struct LabourRouteState {
    pub service: Arc<LabourService>,
}

/// Build the labour REST + WebSocket router.
pub fn labour_routes(service: Arc<LabourService>) -> Router {
    let state = LabourRouteState { service };

    Router::new()
        .route("/health", get(health))
        .route("/ws/events", get(ws_handler))
        .route("/api/work-types", get(work_types))
        .route("/api/requests", get(list_requests).post(create_request))
        .route("/api/requests/{id}", get(get_request))
        .route("/api/requests/{id}/logs", get(request_logs))
        .route("/api/requests/{id}/suggestions", get(suggestions))
        .route("/api/requests/{id}/accept", post(accept))
        .route("/api/requests/{id}/decline", post(decline))
        .route("/api/requests/{id}/start", post(start))
        .route("/api/requests/{id}/farmer-confirm", post(farmer_confirm))
        .route("/api/requests/{id}/complete", post(complete))
        .route("/api/requests/{id}/cancel", post(cancel))
        .route("/api/requests/{id}/feedback", post(feedback))
        .route("/api/requests/{id}/workers", post(assign))
        .route("/api/requests/{id}/standby", post(standby))
        .route("/api/requests/{id}/workers/{worker_id}/confirm", post(confirm_worker))
        .route("/api/requests/{id}/workers/{worker_id}/cancel", post(cancel_worker))
        .route("/api/requests/{id}/workers/{worker_id}/no-show", post(no_show))
        .route("/api/requests/{id}/workers/{worker_id}/complete", post(complete_worker))
        .route("/api/requests/{id}/workers/{worker_id}/replace", post(replace_worker))
        .route("/api/workers/{worker_id}/assignments", get(worker_assignments))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Errors ──────────────────────────────────────────────────────────────

impl IntoResponse for LabourError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::StateTransition { .. }
            | Self::CapacityExceeded { .. }
            | Self::DoubleBooking { .. }
            | Self::DuplicateWorker { .. }
            | Self::InvalidSlotState { .. }
            | Self::StandbyEmpty { .. }
            | Self::ConcurrentModification { .. } => StatusCode::CONFLICT,
            Self::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "Labour request failed");
        }
        let body = serde_json::json!({
            "error": self.kind(),
            "message": self.to_string(),
            "retryable": self.is_retryable(),
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, LabourError>;

fn parse_request_id(raw: &str) -> Result<RequestId, LabourError> {
    RequestId::from_str(raw)
        .map_err(|_| LabourError::validation("id", format!("invalid request id: {raw}")))
}

// ── Health & catalogue ──────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "farmhand"
    }))
}

async fn work_types() -> impl IntoResponse {
    let types: Vec<serde_json::Value> = WorkType::ALL
        .iter()
        .map(|t| serde_json::json!({ "value": t.as_str(), "label": t.label() }))
        .collect();
    Json(types)
}

// ── WebSocket ───────────────────────────────────────────────────────────

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<LabourRouteState>) -> impl IntoResponse {
    info!("Event stream client connecting");
    ws.on_upgrade(|socket| handle_socket(socket, state.service))
}

async fn handle_socket(mut socket: WebSocket, service: Arc<LabourService>) {
    let mut rx = service.subscribe();
    info!("Event stream client connected");

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if let Ok(json) = serde_json::to_string(&event) {
                            if socket.send(Message::Text(json.into())).await.is_err() {
                                debug!("Client disconnected during send");
                                break;
                            }
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!(missed = n, "Event stream client lagged behind broadcast");
                        let notice = serde_json::json!({ "type": "stream.lagged", "missed": n });
                        if socket.send(Message::Text(notice.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => {
                        debug!("Event bus closed");
                        break;
                    }
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Event stream client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("Event stream connection closed");
}

// ── Requests ────────────────────────────────────────────────────────────

async fn create_request(
    State(state): State<LabourRouteState>,
    Json(input): Json<NewLabourRequest>,
) -> Result<impl IntoResponse, LabourError> {
    let request = state.service.create_request(input).await?;
    Ok((StatusCode::CREATED, Json(request)))
}

async fn list_requests(
    State(state): State<LabourRouteState>,
    Query(filter): Query<RequestFilter>,
) -> ApiResult<Vec<LabourRequest>> {
    Ok(Json(state.service.list_requests(&filter).await?))
}

async fn get_request(
    State(state): State<LabourRouteState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, LabourError> {
    let id = parse_request_id(&id)?;
    Ok(Json(state.service.get_request(id).await?))
}

async fn request_logs(
    State(state): State<LabourRouteState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, LabourError> {
    let id = parse_request_id(&id)?;
    Ok(Json(state.service.request_logs(id).await?))
}

async fn suggestions(
    State(state): State<LabourRouteState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, LabourError> {
    let id = parse_request_id(&id)?;
    Ok(Json(state.service.suggest_replacements(id).await?))
}

#[derive(Debug, Deserialize)]
struct AcceptBody {
    coordinator_id: CoordinatorId,
}

async fn accept(
    State(state): State<LabourRouteState>,
    Path(id): Path<String>,
    Json(body): Json<AcceptBody>,
) -> Result<impl IntoResponse, LabourError> {
    let id = parse_request_id(&id)?;
    Ok(Json(state.service.accept_request(id, body.coordinator_id).await?))
}

#[derive(Debug, Deserialize)]
struct DeclineBody {
    coordinator_id: CoordinatorId,
    #[serde(default)]
    reason: Option<String>,
}

async fn decline(
    State(state): State<LabourRouteState>,
    Path(id): Path<String>,
    Json(body): Json<DeclineBody>,
) -> Result<impl IntoResponse, LabourError> {
    let id = parse_request_id(&id)?;
    let request = state
        .service
        .decline_request(id, body.coordinator_id, body.reason)
        .await?;
    Ok(Json(request))
}

async fn start(
    State(state): State<LabourRouteState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, LabourError> {
    let id = parse_request_id(&id)?;
    Ok(Json(state.service.start_work(id).await?))
}

#[derive(Debug, Default, Deserialize)]
struct FarmerConfirmBody {
    #[serde(default)]
    rating: Option<u8>,
    #[serde(default)]
    feedback: Option<String>,
}

async fn farmer_confirm(
    State(state): State<LabourRouteState>,
    Path(id): Path<String>,
    body: Option<Json<FarmerConfirmBody>>,
) -> Result<impl IntoResponse, LabourError> {
    let id = parse_request_id(&id)?;
    let body = body.map(|Json(b)| b).unwrap_or_default();
    Ok(Json(
        state
            .service
            .confirm_by_farmer(id, body.rating, body.feedback)
            .await?,
    ))
}

async fn complete(
    State(state): State<LabourRouteState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, LabourError> {
    let id = parse_request_id(&id)?;
    Ok(Json(state.service.complete_work(id).await?))
}

#[derive(Debug, Deserialize)]
struct CancelBody {
    reason: String,
    #[serde(default = "default_cancel_actor")]
    actor: Actor,
}

fn default_cancel_actor() -> Actor {
    Actor::Farmer
}

async fn cancel(
    State(state): State<LabourRouteState>,
    Path(id): Path<String>,
    Json(body): Json<CancelBody>,
) -> Result<impl IntoResponse, LabourError> {
    let id = parse_request_id(&id)?;
    Ok(Json(
        state
            .service
            .cancel_request(id, body.reason, body.actor)
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
struct FeedbackBody {
    rating: u8,
    #[serde(default)]
    feedback: Option<String>,
}

async fn feedback(
    State(state): State<LabourRouteState>,
    Path(id): Path<String>,
    Json(body): Json<FeedbackBody>,
) -> Result<impl IntoResponse, LabourError> {
    let id = parse_request_id(&id)?;
    Ok(Json(
        state
            .service
            .submit_feedback(id, body.rating, body.feedback)
            .await?,
    ))
}

// ── Workers on a request ────────────────────────────────────────────────

/// Either a single `worker_id` or a batch of `worker_ids`.
#[derive(Debug, Deserialize)]
struct AssignBody {
    #[serde(default)]
    worker_id: Option<WorkerId>,
    #[serde(default)]
    worker_ids: Vec<WorkerId>,
}

async fn assign(
    State(state): State<LabourRouteState>,
    Path(id): Path<String>,
    Json(body): Json<AssignBody>,
) -> Result<impl IntoResponse, LabourError> {
    let id = parse_request_id(&id)?;
    let request = match (body.worker_id, body.worker_ids) {
        (Some(worker_id), batch) if batch.is_empty() => {
            state.service.assign_worker(id, worker_id).await?
        }
        (None, batch) if !batch.is_empty() => state.service.assign_workers(id, batch).await?,
        _ => {
            return Err(LabourError::validation(
                "worker_id",
                "provide exactly one of worker_id or worker_ids",
            ));
        }
    };
    Ok(Json(request))
}

#[derive(Debug, Deserialize)]
struct StandbyBody {
    worker_id: WorkerId,
}

async fn standby(
    State(state): State<LabourRouteState>,
    Path(id): Path<String>,
    Json(body): Json<StandbyBody>,
) -> Result<impl IntoResponse, LabourError> {
    let id = parse_request_id(&id)?;
    Ok(Json(state.service.enqueue_standby(id, body.worker_id).await?))
}

async fn confirm_worker(
    State(state): State<LabourRouteState>,
    Path((id, worker_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, LabourError> {
    let id = parse_request_id(&id)?;
    Ok(Json(state.service.confirm_worker(id, worker_id.into()).await?))
}

#[derive(Debug, Deserialize)]
struct ReasonBody {
    reason: String,
}

async fn cancel_worker(
    State(state): State<LabourRouteState>,
    Path((id, worker_id)): Path<(String, String)>,
    Json(body): Json<ReasonBody>,
) -> Result<impl IntoResponse, LabourError> {
    let id = parse_request_id(&id)?;
    Ok(Json(
        state
            .service
            .cancel_worker_slot(id, worker_id.into(), body.reason)
            .await?,
    ))
}

async fn no_show(
    State(state): State<LabourRouteState>,
    Path((id, worker_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, LabourError> {
    let id = parse_request_id(&id)?;
    Ok(Json(state.service.mark_no_show(id, worker_id.into()).await?))
}

async fn complete_worker(
    State(state): State<LabourRouteState>,
    Path((id, worker_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, LabourError> {
    let id = parse_request_id(&id)?;
    Ok(Json(
        state
            .service
            .mark_slot_completed(id, worker_id.into())
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
struct ReplaceBody {
    new_worker_id: WorkerId,
    #[serde(default)]
    reason: Option<String>,
}

async fn replace_worker(
    State(state): State<LabourRouteState>,
    Path((id, worker_id)): Path<(String, String)>,
    Json(body): Json<ReplaceBody>,
) -> Result<impl IntoResponse, LabourError> {
    let id = parse_request_id(&id)?;
    Ok(Json(
        state
            .service
            .replace_worker(id, worker_id.into(), body.new_worker_id, body.reason)
            .await?,
    ))
}

// ── Workers ─────────────────────────────────────────────────────────────

async fn worker_assignments(
    State(state): State<LabourRouteState>,
    Path(worker_id): Path<String>,
) -> Result<impl IntoResponse, LabourError> {
    let worker_id = WorkerId::from(worker_id);
    Ok(Json(state.service.assignments_for_worker(&worker_id).await?))
}
