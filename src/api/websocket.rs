//! Agent-facing WebSocket endpoint
//!
//! Every inbound socket is classified once, synchronously, before it is
//! handed anywhere: a secondary-connection header routes it to the pending
//! handshake slot, otherwise the `dca-datakit` descriptor header makes it a
//! primary registration. Sockets with neither are refused at upgrade time.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};

use super::ApiState;
use crate::message::{
    DatakitDescriptor, HEADER_DATAKIT, HEADER_NEW_WS_CONNECTION_ID, HEADER_WS_ACTION,
    ResponseEnvelope,
};

/// Build the WebSocket router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .with_state(state)
}

async fn ws_upgrade(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    // Secondary connections carry no identity handshake; they only present
    // the connect_id minted during the handshake push.
    if let Some(connect_id) = header_str(&headers, HEADER_NEW_WS_CONNECTION_ID) {
        let action = header_str(&headers, HEADER_WS_ACTION).unwrap_or_default();
        tracing::debug!(connect_id = %connect_id, action = %action, "secondary connection arriving");
        return ws.on_upgrade(move |socket| async move {
            state.registry.accept_secondary(&connect_id, socket).await;
        });
    }

    let Some(raw) = header_str(&headers, HEADER_DATAKIT) else {
        return reject(&crate::Error::Config(format!(
            "missing {HEADER_DATAKIT} header"
        )));
    };
    let descriptor = match DatakitDescriptor::from_header(&raw) {
        Ok(descriptor) => descriptor,
        Err(e) => {
            tracing::warn!(error = %e, "rejecting malformed handshake");
            return reject(&e);
        }
    };

    ws.on_upgrade(move |socket| async move {
        state.registry.run_connection(socket, descriptor).await;
    })
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(ToString::to_string)
}

fn reject(err: &crate::Error) -> Response {
    (StatusCode::BAD_REQUEST, Json(ResponseEnvelope::from(err))).into_response()
}
