//! MCP lifecycle handlers and wire constants.
//!
//! Protocol version: MCP 2024-11-05. The JSON-RPC framing itself lives in
//! `ipc` (the WebSocket server); this module owns the MCP-specific pieces:
//! capability negotiation on `initialize`, the `ping` keepalive, and the
//! error-code vocabulary tool handlers encode into `anyhow` messages.

use serde::Serialize;
use serde_json::{json, Value};

pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

// JSON-RPC standard codes.
pub const MCP_PARSE_ERROR: i32 = -32700;
pub const MCP_INVALID_REQUEST: i32 = -32600;
pub const MCP_METHOD_NOT_FOUND: i32 = -32601;
pub const MCP_INVALID_PARAMS: i32 = -32602;
pub const MCP_INTERNAL_ERROR: i32 = -32603;
// Server-defined: no credential registered on this session.
pub const MCP_UNAUTHORIZED: i32 = -32004;

/// A JSON-RPC error object ready to embed in a response frame.
#[derive(Debug, Clone, Serialize)]
pub struct McpError {
    pub code: i32,
    pub message: String,
}

impl McpError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Handle `initialize`: echo the protocol version when we support the
/// client's requested one, otherwise answer with ours and let the client
/// decide whether to proceed.
pub fn handle_initialize(params: &Value) -> Value {
    let requested = params
        .get("protocolVersion")
        .and_then(Value::as_str)
        .unwrap_or(MCP_PROTOCOL_VERSION);
    let version = if requested == MCP_PROTOCOL_VERSION {
        requested
    } else {
        MCP_PROTOCOL_VERSION
    };

    json!({
        "protocolVersion": version,
        "capabilities": {
            "tools": { "listChanged": false }
        },
        "serverInfo": {
            "name": "researchd",
            "version": env!("CARGO_PKG_VERSION"),
        }
    })
}

/// Handle `ping` — an empty result keeps the session alive.
pub fn handle_ping() -> Value {
    json!({})
}

/// Shape a tool invocation outcome as an MCP `tools/call` result: a single
/// text content block plus the error flag the host layer keys off.
pub fn tool_result(payload: &Value, is_error: bool) -> Value {
    json!({
        "content": [{
            "type": "text",
            "text": payload.to_string(),
        }],
        "isError": is_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialize_echoes_supported_version() {
        let resp = handle_initialize(&json!({"protocolVersion": MCP_PROTOCOL_VERSION}));
        assert_eq!(resp["protocolVersion"], MCP_PROTOCOL_VERSION);
        assert_eq!(resp["serverInfo"]["name"], "researchd");
    }

    #[test]
    fn initialize_counters_unknown_version_with_ours() {
        let resp = handle_initialize(&json!({"protocolVersion": "1999-01-01"}));
        assert_eq!(resp["protocolVersion"], MCP_PROTOCOL_VERSION);
    }

    #[test]
    fn tool_result_carries_error_flag() {
        let ok = tool_result(&json!({"status": "in_progress"}), false);
        assert_eq!(ok["isError"], false);
        let err = tool_result(&json!({"error": "nope"}), true);
        assert_eq!(err["isError"], true);
        assert!(err["content"][0]["text"].as_str().unwrap().contains("nope"));
    }
}
