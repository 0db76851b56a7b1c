//! Coordinator Server
//!
//! Serves an [`Ensemble`] over HTTP so nodes running as separate processes
//! share one coordination service.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use super::protocol::*;
use super::{CoordinationBackend, Ensemble, SessionId};
use crate::error::{Error, Result};

/// Longest long-poll a client may request
const MAX_POLL_WAIT: Duration = Duration::from_secs(30);

/// HTTP front end for an ensemble
pub struct CoordinatorServer {
    bind_address: String,
    ensemble: Arc<Ensemble>,
    reap_interval: Duration,
}

impl CoordinatorServer {
    /// Create a new coordinator server
    pub fn new(bind_address: String, ensemble: Arc<Ensemble>, reap_interval: Duration) -> Self {
        Self {
            bind_address,
            ensemble,
            reap_interval,
        }
    }

    /// Build the router
    pub fn router(ensemble: Arc<Ensemble>) -> Router {
        Router::new()
            .route("/sessions", post(handle_open_session))
            .route("/sessions/:id", delete(handle_close_session))
            .route("/sessions/:id/heartbeat", post(handle_heartbeat))
            .route("/sessions/:id/events", get(handle_poll_events))
            .route("/nodes", post(handle_create))
            .route("/nodes/exists", get(handle_exists))
            .route("/nodes/children", get(handle_children))
            .route("/nodes/data", get(handle_get_data).put(handle_set_data))
            .route("/elections/join", post(handle_join))
            .route("/elections/leave", post(handle_leave))
            .route("/elections/leadership", get(handle_leadership))
            .route("/elections/participants", get(handle_participants))
            .layer(TraceLayer::new_for_http())
            .with_state(ensemble)
    }

    /// Serve until `shutdown` resolves
    pub async fn start<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let reaper = self.ensemble.spawn_reaper(self.reap_interval);
        let app = Self::router(Arc::clone(&self.ensemble));

        let listener = tokio::net::TcpListener::bind(&self.bind_address).await?;
        tracing::info!("Coordinator listening on {}", self.bind_address);

        let served = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| Error::Network(format!("Coordinator server error: {}", e)));

        reaper.abort();
        served
    }
}

// ============ Error mapping ============

struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::SessionExpired(_) => StatusCode::GONE,
            Error::NodeExists(_) => StatusCode::CONFLICT,
            Error::NoNode(_) => StatusCode::NOT_FOUND,
            Error::CoordinationUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ErrorBody::from_error(&self.0))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ============ Handlers ============

async fn handle_open_session(
    State(ensemble): State<Arc<Ensemble>>,
    Json(req): Json<OpenSessionRequest>,
) -> ApiResult<Json<OpenSessionResponse>> {
    let session_id = ensemble
        .open_session(Duration::from_millis(req.timeout_ms))
        .await?;
    Ok(Json(OpenSessionResponse { session_id }))
}

async fn handle_close_session(
    State(ensemble): State<Arc<Ensemble>>,
    Path(id): Path<SessionId>,
) -> ApiResult<StatusCode> {
    ensemble.close_session(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_heartbeat(
    State(ensemble): State<Arc<Ensemble>>,
    Path(id): Path<SessionId>,
) -> ApiResult<StatusCode> {
    ensemble.heartbeat(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_poll_events(
    State(ensemble): State<Arc<Ensemble>>,
    Path(id): Path<SessionId>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Json<EventsResponse>> {
    let wait = Duration::from_millis(query.wait_ms).min(MAX_POLL_WAIT);
    let events = ensemble.poll_events(id, wait).await?;
    Ok(Json(EventsResponse { events }))
}

async fn handle_create(
    State(ensemble): State<Arc<Ensemble>>,
    Json(req): Json<CreateRequest>,
) -> ApiResult<StatusCode> {
    ensemble
        .create(req.session_id, &req.path, req.data, req.mode)
        .await?;
    Ok(StatusCode::CREATED)
}

async fn handle_exists(
    State(ensemble): State<Arc<Ensemble>>,
    Query(query): Query<PathQuery>,
) -> ApiResult<Json<ExistsResponse>> {
    let exists = ensemble.exists(&query.path).await?;
    Ok(Json(ExistsResponse { exists }))
}

async fn handle_children(
    State(ensemble): State<Arc<Ensemble>>,
    Query(query): Query<PathQuery>,
) -> ApiResult<Json<ChildrenResponse>> {
    let children = ensemble.get_children(&query.path).await?;
    Ok(Json(ChildrenResponse { children }))
}

async fn handle_get_data(
    State(ensemble): State<Arc<Ensemble>>,
    Query(query): Query<PathQuery>,
) -> ApiResult<Json<DataResponse>> {
    let data = ensemble.get_data(&query.path).await?;
    Ok(Json(DataResponse { data }))
}

async fn handle_set_data(
    State(ensemble): State<Arc<Ensemble>>,
    Json(req): Json<SetDataRequest>,
) -> ApiResult<StatusCode> {
    ensemble.set_data(&req.path, req.data).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_join(
    State(ensemble): State<Arc<Ensemble>>,
    Json(req): Json<JoinElectionRequest>,
) -> ApiResult<StatusCode> {
    ensemble
        .join_election(req.session_id, &req.path, &req.candidate_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_leave(
    State(ensemble): State<Arc<Ensemble>>,
    Json(req): Json<LeaveElectionRequest>,
) -> ApiResult<StatusCode> {
    ensemble
        .leave_election(req.session_id, &req.path, req.requeue)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_leadership(
    State(ensemble): State<Arc<Ensemble>>,
    Query(query): Query<LeadershipQuery>,
) -> ApiResult<Json<LeadershipResponse>> {
    let has_leadership = ensemble
        .has_leadership(query.session_id, &query.path)
        .await?;
    Ok(Json(LeadershipResponse { has_leadership }))
}

async fn handle_participants(
    State(ensemble): State<Arc<Ensemble>>,
    Query(query): Query<PathQuery>,
) -> ApiResult<Json<ParticipantsResponse>> {
    let participants = ensemble.participants(&query.path).await?;
    Ok(Json(ParticipantsResponse { participants }))
}
