//! REST API served by a running daemon.
//!
//! The store file is held exclusively by the daemon, so this is how other
//! processes submit node requests and read state while it runs.
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/requests` | List node requests |
//! | POST | `/api/v1/requests` | Submit a node request |
//! | GET | `/api/v1/requests/{id}` | Get a node request |
//! | DELETE | `/api/v1/requests/{id}` | Withdraw a node request |
//! | GET | `/api/v1/nodes` | List nodes |
//! | GET | `/api/v1/nodes/{id}` | Get a node |
//! | POST | `/api/v1/nodes/{id}/release` | Mark a READY node USED |
//! | GET | `/api/v1/status` | Launchers, requests and nodes |

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use fleet_state::{NodeState, StateError, StateStore};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::report::{StatusReport, submit_request};

#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
}

pub fn build_router(store: StateStore) -> Router {
    let state = ApiState { store };
    let api_routes = Router::new()
        .route("/requests", get(list_requests).post(create_request))
        .route("/requests/{id}", get(get_request).delete(delete_request))
        .route("/nodes", get(list_nodes))
        .route("/nodes/{id}", get(get_node))
        .route("/nodes/{id}/release", post(release_node))
        .route("/status", get(status))
        .with_state(state);
    Router::new().nest("/api/v1", api_routes)
}

/// Envelope of every API response.
#[derive(Debug, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> axum::response::Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

fn internal(e: impl std::fmt::Display) -> axum::response::Response {
    error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
}

/// Body of `POST /api/v1/requests`.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitRequest {
    #[serde(default = "default_requestor")]
    pub requestor: String,
    pub labels: Vec<String>,
}

fn default_requestor() -> String {
    "api".to_string()
}

// ── Requests ──────────────────────────────────────────────────────

pub async fn list_requests(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_requests() {
        Ok(requests) => ApiResponse::ok(requests).into_response(),
        Err(e) => internal(e),
    }
}

pub async fn create_request(
    State(state): State<ApiState>,
    Json(body): Json<SubmitRequest>,
) -> impl IntoResponse {
    if body.labels.is_empty() {
        return error_response("a node request needs at least one label", StatusCode::BAD_REQUEST);
    }
    match submit_request(&state.store, &body.requestor, body.labels) {
        Ok(request) => (StatusCode::CREATED, ApiResponse::ok(request)).into_response(),
        Err(e) => internal(e),
    }
}

pub async fn get_request(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.get_request(&id) {
        Ok(Some(request)) => ApiResponse::ok(request).into_response(),
        Ok(None) => error_response("node request not found", StatusCode::NOT_FOUND),
        Err(e) => internal(e),
    }
}

/// Nodes still allocated to the request are freed by the cleanup worker.
pub async fn delete_request(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.delete_request(&id) {
        Ok(true) => {
            info!(request = %id, "node request withdrawn");
            ApiResponse::ok("deleted").into_response()
        }
        Ok(false) => error_response("node request not found", StatusCode::NOT_FOUND),
        Err(e) => internal(e),
    }
}

// ── Nodes ─────────────────────────────────────────────────────────

pub async fn list_nodes(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_nodes() {
        Ok(nodes) => ApiResponse::ok(nodes).into_response(),
        Err(e) => internal(e),
    }
}

pub async fn get_node(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.store.get_node(&id) {
        Ok(Some(node)) => ApiResponse::ok(node).into_response(),
        Ok(None) => error_response("node not found", StatusCode::NOT_FOUND),
        Err(e) => internal(e),
    }
}

/// A requestor is done with a node; cleanup tears it down.
pub async fn release_node(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let mut node = match state.store.get_node(&id) {
        Ok(Some(node)) => node,
        Ok(None) => return error_response("node not found", StatusCode::NOT_FOUND),
        Err(e) => return internal(e),
    };
    if node.state != NodeState::Ready {
        return error_response(
            &format!("node {id} is {}, not ready", node.state),
            StatusCode::CONFLICT,
        );
    }
    node.set_state(NodeState::Used);
    match state.store.put_node(&node) {
        Ok(()) => {
            info!(node = %id, "node released by requestor");
            ApiResponse::ok(node).into_response()
        }
        Err(StateError::NotFound(_)) => error_response("node not found", StatusCode::NOT_FOUND),
        Err(e) => internal(e),
    }
}

// ── Status ────────────────────────────────────────────────────────

pub async fn status(State(state): State<ApiState>) -> impl IntoResponse {
    match StatusReport::collect(&state.store) {
        Ok(report) => ApiResponse::ok(report).into_response(),
        Err(e) => internal(e),
    }
}
