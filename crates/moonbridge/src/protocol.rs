//! Wire protocol codec: request envelopes for both channels and decoding
//! of raw response payloads.
//!
//! HTTP requests use plain paths plus a query string of subsystem names;
//! the websocket channel speaks JSON-RPC 2.0 with a monotonically
//! increasing request id.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{json, Map, Value};
use tracing::debug;

use crate::error::ProtocolError;

pub const SERVER_INFO_PATH: &str = "/server/info";
pub const OBJECTS_QUERY_PATH: &str = "/printer/objects/query";
pub const GCODE_SCRIPT_PATH: &str = "/printer/gcode/script";

pub const METHOD_IDENTIFY: &str = "server.connection.identify";
pub const METHOD_SUBSCRIBE: &str = "printer.objects.subscribe";
pub const NOTIFY_STATUS_UPDATE: &str = "notify_status_update";
pub const NOTIFY_PROC_STAT_UPDATE: &str = "notify_proc_stat_update";

/// Query string for the full-snapshot endpoint: subsystem names joined by
/// `&`, each with an empty value meaning "all fields".
pub fn objects_query_string(objects: &[String]) -> String {
    objects.join("&")
}

/// Identity reported in the `server.connection.identify` handshake.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub client_name: String,
    pub version: String,
    pub url: Option<String>,
}

impl Default for ClientIdentity {
    fn default() -> Self {
        Self {
            client_name: "moonbridge".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            url: None,
        }
    }
}

/// Builds JSON-RPC 2.0 request envelopes with a per-session monotonic id.
#[derive(Debug, Default)]
pub struct RpcEnvelopes {
    next_id: AtomicU64,
}

impl RpcEnvelopes {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn identify(&self, identity: &ClientIdentity) -> String {
        json!({
            "jsonrpc": "2.0",
            "method": METHOD_IDENTIFY,
            "params": {
                "client_name": identity.client_name,
                "version": identity.version,
                "type": "bot",
                "url": identity.url.clone().unwrap_or_default(),
            },
            "id": self.next_id(),
        })
        .to_string()
    }

    /// Subscribe to every listed subsystem, each mapped to null meaning
    /// "notify on any field change".
    pub fn subscribe(&self, objects: &[String]) -> String {
        let mut map = Map::new();
        for name in objects {
            map.insert(name.clone(), Value::Null);
        }
        json!({
            "jsonrpc": "2.0",
            "method": METHOD_SUBSCRIBE,
            "params": { "objects": map },
            "id": self.next_id(),
        })
        .to_string()
    }
}

/// One decoded websocket frame.
#[derive(Debug)]
pub enum Frame {
    /// Reply to a request we issued (identify, subscribe, or a query).
    Reply { id: Option<u64>, result: Value },

    /// Unsolicited field-level delta for one or more subsystems.
    StatusUpdate(Vec<Value>),

    /// Process/memory telemetry from the service itself. Applied to a
    /// separate stats sink, not to the printer state.
    ProcStat(Vec<Value>),

    /// Valid JSON with a shape we do not recognize. Logged and discarded.
    Other(Value),
}

/// Decode a raw websocket frame. Only non-JSON input is an error; any
/// recognizable JSON shape decodes to a [`Frame`] variant.
pub fn decode_frame(raw: &str) -> Result<Frame, ProtocolError> {
    let value: Value = serde_json::from_str(raw)?;

    if let Some(result) = value.get("result") {
        let id = value.get("id").and_then(Value::as_u64);
        return Ok(Frame::Reply {
            id,
            result: result.clone(),
        });
    }

    match value.get("method").and_then(Value::as_str) {
        Some(NOTIFY_STATUS_UPDATE) => {
            let params = value
                .get("params")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            Ok(Frame::StatusUpdate(params))
        }
        Some(NOTIFY_PROC_STAT_UPDATE) => {
            let params = value
                .get("params")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            Ok(Frame::ProcStat(params))
        }
        Some(method) => {
            debug!("ignoring unhandled notification: {}", method);
            Ok(Frame::Other(value))
        }
        None => Ok(Frame::Other(value)),
    }
}

/// Extract the per-subsystem status map from a full-snapshot query body:
/// `{"result": {"status": {...}}}`.
pub fn parse_query_status(body: &str) -> Result<Map<String, Value>, ProtocolError> {
    let value: Value = serde_json::from_str(body)?;
    let result = value
        .get("result")
        .ok_or(ProtocolError::MissingKey("result"))?;
    let status = result
        .get("status")
        .ok_or(ProtocolError::MissingKey("status"))?;
    status
        .as_object()
        .cloned()
        .ok_or(ProtocolError::NotAnObject("status"))
}

/// Extract the `result` object from a `/server/info` body.
pub fn parse_server_info(body: &str) -> Result<Map<String, Value>, ProtocolError> {
    let value: Value = serde_json::from_str(body)?;
    let result = value
        .get("result")
        .ok_or(ProtocolError::MissingKey("result"))?;
    result
        .as_object()
        .cloned()
        .ok_or(ProtocolError::NotAnObject("result"))
}
