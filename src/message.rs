//! Wire protocol for the agent control channel
//!
//! Every WebSocket text frame is a [`Message`] envelope: a correlation id, an
//! action name, and an action-specific payload. `id == 0` marks a one-way
//! push; `id > 0` marks a correlated request whose reply must carry the same
//! id and action. Payloads are decoded in two passes: the outer envelope
//! first, then the typed payload for the action.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::collections::HashMap;

use crate::{Error, Result};

/// Handshake header carrying the JSON device descriptor of a registering agent
pub const HEADER_DATAKIT: &str = "dca-datakit";

/// Handshake header carrying the `connect_id` of a secondary connection
pub const HEADER_NEW_WS_CONNECTION_ID: &str = "Header_New_WebSocket_Connection_ID";

/// Handshake header carrying the target action of a secondary connection
pub const HEADER_WS_ACTION: &str = "Header_Websocket_Action";

/// Reserved action names routed by the registry
pub mod actions {
    /// Server push asking the agent to dial a secondary connection
    pub const NEW_WEBSOCKET_CONNECTION: &str = "new_websocket_connection";

    /// Agent push reporting a status change
    pub const UPDATE_DATAKIT_STATUS: &str = "update_datakit_status";
    /// Agent push replacing its device record
    pub const UPDATE_DATAKIT: &str = "update_datakit";
    /// Agent push requesting removal of its device record
    pub const DELETE_DATAKIT: &str = "delete_datakit";

    /// Request: fetch runtime stats from the agent
    pub const GET_DATAKIT_STATS: &str = "get_datakit_stats_action";
    /// Request: upgrade the agent in place
    pub const UPGRADE_DATAKIT: &str = "upgrade_datakit_action";
    /// Request: restart the agent
    pub const RESTART_DATAKIT: &str = "restart_datakit_action";
    /// Streaming: tail the agent log over a secondary connection
    pub const GET_DATAKIT_LOG_TAIL: &str = "get_datakit_log_tail_action";
    /// Streaming: download the agent log over a secondary connection
    pub const GET_DATAKIT_LOG_DOWNLOAD: &str = "get_datakit_log_download_action";

    /// Request: read the agent's main config
    pub const GET_DATAKIT_CONFIG: &str = "get_datakit_config_action";
    /// Request: write a config file on the agent
    pub const SAVE_DATAKIT_CONFIG: &str = "save_datakit_config_action";
    /// Request: remove a config file from the agent
    pub const DELETE_DATAKIT_CONFIG: &str = "delete_datakit_config_action";
    /// Request: list the agent's pipelines
    pub const GET_DATAKIT_PIPELINE: &str = "get_datakit_pipeline_action";
    /// Request: fetch one pipeline body
    pub const GET_DATAKIT_PIPELINE_DETAIL: &str = "get_datakit_pipeline_detail_action";
    /// Request: write a pipeline on the agent
    pub const SAVE_DATAKIT_PIPELINE: &str = "save_datakit_pipeline_action";
    /// Request: remove a pipeline from the agent
    pub const DELETE_DATAKIT_PIPELINE: &str = "delete_datakit_pipeline_action";
    /// Request: dry-run a pipeline against sample input
    pub const TEST_DATAKIT_PIPELINE: &str = "test_datakit_pipeline_action";
    /// Request: read the agent's filter rules
    pub const GET_DATAKIT_FILTER: &str = "get_datakit_filter_action";

    /// Request actions the registry routes generically by name
    pub const ROUTED: &[&str] = &[
        GET_DATAKIT_STATS,
        UPGRADE_DATAKIT,
        RESTART_DATAKIT,
        GET_DATAKIT_LOG_TAIL,
        GET_DATAKIT_LOG_DOWNLOAD,
        GET_DATAKIT_CONFIG,
        SAVE_DATAKIT_CONFIG,
        DELETE_DATAKIT_CONFIG,
        GET_DATAKIT_PIPELINE,
        GET_DATAKIT_PIPELINE_DETAIL,
        SAVE_DATAKIT_PIPELINE,
        DELETE_DATAKIT_PIPELINE,
        TEST_DATAKIT_PIPELINE,
        GET_DATAKIT_FILTER,
    ];

    /// Whether a request action name is routable
    #[must_use]
    pub fn is_routed(name: &str) -> bool {
        ROUTED.contains(&name)
    }
}

/// Wire envelope for every frame on a control channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Correlation id; 0 for pushes
    pub id: u64,
    /// Action name
    pub action: String,
    /// Action-specific payload
    #[serde(default)]
    pub data: Value,
}

impl Message {
    /// Build a one-way push (no reply obligation)
    #[must_use]
    pub fn push(action: &str, data: Value) -> Self {
        Self {
            id: 0,
            action: action.to_string(),
            data,
        }
    }

    /// Build a correlated request
    #[must_use]
    pub fn request(id: u64, action: &str, data: Value) -> Self {
        Self {
            id,
            action: action.to_string(),
            data,
        }
    }

    /// Whether this frame is a push
    #[must_use]
    pub const fn is_push(&self) -> bool {
        self.id == 0
    }

    /// Decode the typed payload for this action
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProtocolMismatch`] if the payload does not match the
    /// declared type.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.data.clone()).map_err(|e| {
            Error::ProtocolMismatch(format!("bad payload for action {}: {e}", self.action))
        })
    }
}

/// Payload of the [`actions::NEW_WEBSOCKET_CONNECTION`] push
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecondaryConnectRequest {
    /// Opaque token the agent must present when dialing back
    pub connect_id: String,
    /// Action the secondary socket is dedicated to
    pub action: String,
}

/// Response envelope returned to REST callers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub success: bool,
    #[serde(default)]
    pub content: Value,
    #[serde(rename = "errorCode", default)]
    pub error_code: String,
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

impl ResponseEnvelope {
    /// Successful response carrying `content`
    #[must_use]
    pub fn ok(content: Value) -> Self {
        Self {
            success: true,
            content,
            error_code: String::new(),
            code: 200,
            message: String::new(),
        }
    }
}

impl From<&Error> for ResponseEnvelope {
    fn from(err: &Error) -> Self {
        Self {
            success: false,
            content: Value::Null,
            error_code: err.code().to_string(),
            code: i64::from(err.http_status()),
            message: err.to_string(),
        }
    }
}

/// Device descriptor presented in the [`HEADER_DATAKIT`] handshake header
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DatakitDescriptor {
    /// Stable identity key derived per agent + workspace + host fingerprint
    pub conn_id: String,
    /// Workspace the agent reports into
    pub workspace_uuid: String,
    #[serde(default)]
    pub runtime_id: String,
    #[serde(default)]
    pub host_name: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub run_mode: String,
    #[serde(default)]
    pub run_in_container: bool,
    #[serde(default)]
    pub usage_cores: i64,
    #[serde(default)]
    pub start_time: i64,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub global_host_tags: HashMap<String, String>,
}

impl DatakitDescriptor {
    /// Parse the descriptor from the handshake header value
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the JSON is malformed or the mandatory
    /// `conn_id` / `workspace_uuid` fields are missing.
    pub fn from_header(raw: &str) -> Result<Self> {
        let descriptor: Self = serde_json::from_str(raw)
            .map_err(|e| Error::Config(format!("invalid {HEADER_DATAKIT} header: {e}")))?;

        if descriptor.conn_id.is_empty() {
            return Err(Error::Config("missing conn_id in handshake".to_string()));
        }
        if descriptor.workspace_uuid.is_empty() {
            return Err(Error::Config(
                "missing workspace_uuid in handshake".to_string(),
            ));
        }

        Ok(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_has_zero_id() {
        let msg = Message::push(actions::UPDATE_DATAKIT_STATUS, serde_json::json!({}));
        assert!(msg.is_push());

        let req = Message::request(7, actions::GET_DATAKIT_STATS, Value::Null);
        assert!(!req.is_push());
        assert_eq!(req.id, 7);
    }

    #[test]
    fn envelope_round_trips() {
        let json = r#"{"id":42,"action":"get_datakit_stats_action","data":{"k":"v"}}"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert_eq!(msg.id, 42);
        assert_eq!(msg.action, actions::GET_DATAKIT_STATS);
        assert_eq!(msg.data["k"], "v");
    }

    #[test]
    fn missing_data_defaults_to_null() {
        let msg: Message = serde_json::from_str(r#"{"id":0,"action":"ping"}"#).unwrap();
        assert!(msg.data.is_null());
    }

    #[test]
    fn typed_payload_mismatch_is_protocol_error() {
        let msg = Message::push(
            actions::NEW_WEBSOCKET_CONNECTION,
            serde_json::json!({"connect_id": 1}),
        );
        let err = msg.payload::<SecondaryConnectRequest>().unwrap_err();
        assert!(matches!(err, Error::ProtocolMismatch(_)));
    }

    #[test]
    fn descriptor_requires_mandatory_fields() {
        let err = DatakitDescriptor::from_header(r#"{"conn_id":"c1"}"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let ok = DatakitDescriptor::from_header(
            r#"{"conn_id":"c1","workspace_uuid":"w1","host_name":"host-a","arch":"arm64"}"#,
        )
        .unwrap();
        assert_eq!(ok.conn_id, "c1");
        assert_eq!(ok.arch, "arm64");
        assert!(!ok.run_in_container);
    }

    #[test]
    fn error_envelope_carries_stable_code() {
        let err = Error::DeviceUnavailable("c1".to_string());
        let envelope = ResponseEnvelope::from(&err);
        assert!(!envelope.success);
        assert_eq!(envelope.error_code, "datakit.unavailable");
        assert_eq!(envelope.code, 404);

        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains("\"errorCode\":\"datakit.unavailable\""));
    }
}
