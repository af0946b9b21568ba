//! REST endpoints over the device fleet
//!
//! Thin glue: list/inspect persisted records, dispatch named actions through
//! the registry, and bridge the two streaming operations onto secondary
//! connections.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, State, ws::Message as WsFrame},
    http::header,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::StreamExt;
use serde_json::{Value, json};

use super::{ApiError, ApiState};
use crate::message::{ResponseEnvelope, actions};

/// Build the datakit routes
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/", get(list_datakits))
        .route("/{conn_id}", get(get_datakit))
        .route("/{conn_id}/logtail", get(log_tail))
        .route("/{conn_id}/logdownload", get(log_download))
        .route("/{conn_id}/{action}", post(dispatch_action))
        .with_state(state)
}

/// List all persisted device records
async fn list_datakits(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<ResponseEnvelope>, ApiError> {
    let records = state.repo.list()?;
    Ok(Json(ResponseEnvelope::ok(json!(records))))
}

/// Fetch one device record
async fn get_datakit(
    State(state): State<Arc<ApiState>>,
    Path(conn_id): Path<String>,
) -> Result<Json<ResponseEnvelope>, ApiError> {
    let record = state
        .repo
        .find(&conn_id)?
        .ok_or_else(|| crate::Error::NotFound(conn_id))?;
    Ok(Json(ResponseEnvelope::ok(json!(record))))
}

/// Dispatch a named action to a live agent
///
/// Routing is generic: the action name in the path is validated against the
/// registry's routed set, the body travels as the request payload, and the
/// agent's reply comes back in the response envelope.
async fn dispatch_action(
    State(state): State<Arc<ApiState>>,
    Path((conn_id, action)): Path<(String, String)>,
    body: Option<Json<Value>>,
) -> Result<Json<ResponseEnvelope>, ApiError> {
    let payload = body.map_or(Value::Null, |Json(value)| value);
    let content = state.registry.action(&action, &conn_id, payload).await?;
    Ok(Json(ResponseEnvelope::ok(content)))
}

/// Stream the agent's log over a dedicated secondary connection
async fn log_tail(
    State(state): State<Arc<ApiState>>,
    Path(conn_id): Path<String>,
) -> Result<Response, ApiError> {
    let body = secondary_body(&state, &conn_id, actions::GET_DATAKIT_LOG_TAIL).await?;
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response())
}

/// Download the agent's log file over a dedicated secondary connection
async fn log_download(
    State(state): State<Arc<ApiState>>,
    Path(conn_id): Path<String>,
) -> Result<Response, ApiError> {
    let body = secondary_body(&state, &conn_id, actions::GET_DATAKIT_LOG_DOWNLOAD).await?;
    let disposition = format!("attachment; filename=\"{conn_id}.log\"");
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response())
}

/// Acquire a secondary socket and adapt its frames into a response body
///
/// The stream ends on the agent's close frame or any socket error; dropping
/// the body (downstream caller disconnecting) drops and thereby closes the
/// socket.
async fn secondary_body(state: &ApiState, conn_id: &str, action: &str) -> Result<Body, ApiError> {
    let socket = state.registry.open_secondary(conn_id, action).await?;

    let frames = socket
        .take_while(|frame| {
            futures::future::ready(!matches!(frame, Ok(WsFrame::Close(_)) | Err(_)))
        })
        .filter_map(|frame| {
            futures::future::ready(match frame {
                Ok(frame @ (WsFrame::Binary(_) | WsFrame::Text(_))) => {
                    Some(Ok::<_, std::convert::Infallible>(frame.into_data()))
                }
                _ => None,
            })
        });

    Ok(Body::from_stream(frames))
}
