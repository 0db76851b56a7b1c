//! HTTP API Server
//!
//! REST API for writes, reads, status queries and cluster membership.

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::{Error, Result};
use crate::id::NodeAddress;
use crate::network::REQUEST_FROM_HEADER;
use crate::replication::{self, WriteResponse};
use crate::state::{LeadershipManager, LeadershipState, MembershipRegistry};
use crate::store::WriteRecord;

/// Shared application state
pub struct AppState {
    /// Write router of this node
    pub router: Arc<replication::Router>,
    /// Leadership manager of this node
    pub leadership: Arc<LeadershipManager>,
    /// Membership registry
    pub membership: Arc<MembershipRegistry>,
}

/// HTTP API server
pub struct HttpServer {
    cors_enabled: bool,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(cors_enabled: bool, state: Arc<AppState>) -> Self {
        Self {
            cors_enabled,
            state,
        }
    }

    /// Create the router
    pub fn create_router(state: Arc<AppState>, cors_enabled: bool) -> Router {
        let router = Router::new()
            .route("/", get(handle_index))
            .route("/status", get(handle_status))
            .route("/health", get(handle_health))
            .route("/students", get(handle_list_records))
            .route("/student/:id/:name", post(handle_write))
            .route("/cluster/members", get(handle_members))
            .layer(TraceLayer::new_for_http())
            .with_state(state);

        if cors_enabled {
            router.layer(CorsLayer::permissive())
        } else {
            router
        }
    }

    /// Serve on an already bound listener until `shutdown` resolves
    pub async fn serve<F>(&self, listener: tokio::net::TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = Self::create_router(Arc::clone(&self.state), self.cors_enabled);
        tracing::info!("HTTP API listening on {}", listener.local_addr()?);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        tracing::info!("HTTP API stopped");
        Ok(())
    }
}

// ============ Request/Response Types ============

/// Status response
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub address: String,
    pub state: LeadershipState,
    pub is_leader: bool,
    /// Leader address if one has been published
    pub leader: Option<String>,
    /// Terms won by this node
    pub term: u64,
    pub members: usize,
    /// Fan-out deliveries still in flight
    pub pending_deliveries: usize,
}

/// Health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub address: String,
    pub is_leader: bool,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            Error::Routing(_) => (StatusCode::SERVICE_UNAVAILABLE, "ROUTING_FAILURE"),
            Error::NotYetElected => (StatusCode::SERVICE_UNAVAILABLE, "NO_LEADER"),
            Error::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, "SHUTTING_DOWN"),
            Error::Config(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
        };
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
                code: code.to_string(),
            }),
        )
            .into_response()
    }
}

// ============ Handlers ============

async fn handle_index(State(state): State<Arc<AppState>>) -> String {
    let address = state.router.address();
    let port = address
        .port()
        .map(|p| p.to_string())
        .unwrap_or_else(|| address.to_string());
    if state.router.is_leader() {
        format!("Running Leader on port {}", port)
    } else {
        format!("Running Follower on port {}", port)
    }
}

async fn handle_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let leader = state.router.leader().await.ok().map(|a| a.to_string());
    let members = state.membership.list_addresses().await.len();
    let leadership_state = state.leadership.state();

    Json(StatusResponse {
        address: state.router.address().to_string(),
        state: leadership_state,
        is_leader: leadership_state == LeadershipState::Leader,
        leader,
        term: state.leadership.term(),
        members,
        pending_deliveries: state.router.pending_deliveries(),
    })
}

async fn handle_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        healthy: state.router.is_accepting() && state.leadership.state() != LeadershipState::Closed,
        address: state.router.address().to_string(),
        is_leader: state.router.is_leader(),
    })
}

async fn handle_list_records(State(state): State<Arc<AppState>>) -> Json<Vec<WriteRecord>> {
    Json(state.router.store().list().await)
}

async fn handle_write(
    State(state): State<Arc<AppState>>,
    Path((id, name)): Path<(i64, String)>,
    headers: HeaderMap,
) -> std::result::Result<Json<WriteResponse>, ApiError> {
    let request_from = match headers.get(REQUEST_FROM_HEADER) {
        Some(value) => {
            let raw = value
                .to_str()
                .map_err(|_| Error::Config(format!("{} header is not valid text", REQUEST_FROM_HEADER)))?;
            Some(NodeAddress::parse(raw)?)
        }
        None => None,
    };

    let response = state
        .router
        .handle_write(WriteRecord::new(id, name), request_from)
        .await?;
    Ok(Json(response))
}

async fn handle_members(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.membership.members().await)
}
