//! HTTP surface: the agent WebSocket endpoint plus the thin REST console
//! that drives the registry

pub mod datakits;
pub mod websocket;

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::db::DatakitRepo;
use crate::message::ResponseEnvelope;
use crate::registry::Registry;

/// Shared state for all HTTP handlers
pub struct ApiState {
    pub registry: Arc<Registry>,
    pub repo: DatakitRepo,
}

/// Build the full application router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .merge(websocket::router(Arc::clone(&state)))
        .nest("/api/datakits", datakits::router(Arc::clone(&state)))
        .route("/api/health", get(health).with_state(state))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Error wrapper mapping the crate taxonomy onto HTTP responses
///
/// Callers always receive the response envelope with `success=false` and a
/// stable `errorCode`; internal detail stays in logs.
pub struct ApiError(pub crate::Error);

impl From<crate::Error> for ApiError {
    fn from(err: crate::Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(error = %self.0, code = self.0.code(), "request failed");
        }
        (status, Json(ResponseEnvelope::from(&self.0))).into_response()
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    live_connections: usize,
}

async fn health(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        live_connections: state.registry.live_connections(),
    })
}
