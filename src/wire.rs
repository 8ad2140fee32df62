//! Payload types for the node endpoints.
//!
//! Every node speaks the same small HTTP surface: a discovery endpoint, a
//! latency endpoint, a streaming session endpoint, and a command endpoint.
//! Command responses are kept as raw `serde_json::Value` because each tool
//! returns its own shape; only the `success` flag is interpreted here.

use serde::Deserialize;
use serde_json::Value;

use crate::node::Node;

/// Well-known event pushed on the session channel: the opaque session id.
pub const EVENT_SESSION_ID: &str = "SessionId";
/// Well-known event pushed on the session channel: JSON-encoded node config.
pub const EVENT_CONFIG: &str = "Config";
/// Periodic byte-count event, emitted on the local session only.
pub const EVENT_MEMORY_USAGE: &str = "MemoryUsage";

/// `GET /nodes` response.
#[derive(Debug, Deserialize)]
pub struct NodesResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub nodes: Vec<Node>,
}

/// `GET /nodes/latency?timestamp=<ms>` response.
#[derive(Debug, Deserialize)]
pub struct LatencyResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub latency: Option<f64>,
    #[serde(default)]
    pub status: Option<String>,
}

/// True when a command response payload carries an explicit `success: true`.
/// Any other shape, missing flag, false flag, or non-object counts as failure.
pub fn is_success(payload: &Value) -> bool {
    payload.get("success").and_then(Value::as_bool) == Some(true)
}

/// Extract the display text of a tool output event. Tool events are JSON
/// fragments with an `output` field; anything else is shown verbatim.
pub fn event_output(data: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(data) {
        if let Some(output) = value.get("output").and_then(Value::as_str) {
            return output.to_string();
        }
    }
    data.to_string()
}
