//! MCP (Model Context Protocol) type definitions.
//!
//! Covers the JSON-RPC 2.0 envelope and the MCP message types the gateway
//! generates itself (initialize, tools/list, tools/call). Raw passthrough
//! bodies are forwarded verbatim as `serde_json::Value`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version the gateway advertises when a backend has none pinned.
pub const DEFAULT_PROTOCOL_VERSION: &str = "2025-11-25";

/// Header carrying the Streamable-HTTP session identifier (case-insensitive
/// on the wire).
pub const SESSION_HEADER: &str = "mcp-session-id";

/// Header carrying the negotiated protocol version.
pub const PROTOCOL_VERSION_HEADER: &str = "mcp-protocol-version";

// ── JSON-RPC 2.0 ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    /// Absent for notifications.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id: Some(id),
            method: method.into(),
            params,
        }
    }

    /// A notification carries no id and expects no response.
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id: None,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[allow(dead_code)]
    pub jsonrpc: String,
    /// Kept as a raw value: passthrough clients may use string ids.
    pub id: Option<Value>,
    pub result: Option<Value>,
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Whether this envelope answers the request with the given id.
    pub fn matches_id(&self, expected: &Value) -> bool {
        self.id.as_ref().map(|id| id == expected).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

// ── MCP Initialize ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct InitializeParams {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    pub capabilities: ClientCapabilities,
    #[serde(rename = "clientInfo")]
    pub client_info: Implementation,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientCapabilities {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(rename = "serverInfo")]
    pub server_info: Option<Implementation>,
}

/// Build the initialize params the gateway sends on behalf of a caller.
pub fn initialize_params(protocol_version: Option<&str>) -> InitializeParams {
    InitializeParams {
        protocol_version: protocol_version
            .unwrap_or(DEFAULT_PROTOCOL_VERSION)
            .to_string(),
        capabilities: ClientCapabilities {},
        client_info: Implementation {
            name: "mcp-gateway".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
    }
}

// ── MCP Tools ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolDef {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListToolsResult {
    pub tools: Vec<McpToolDef>,
    #[serde(rename = "nextCursor")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolParams {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

// ── Tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let req = JsonRpcRequest::new(1, "tools/list", None);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["jsonrpc"], "2.0");
        assert_eq!(json["id"], 1);
        assert_eq!(json["method"], "tools/list");
        assert!(json.get("params").is_none());
    }

    #[test]
    fn test_notification_has_no_id() {
        let req = JsonRpcRequest::notification("notifications/initialized", None);
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("id").is_none());
        assert_eq!(json["method"], "notifications/initialized");
    }

    #[test]
    fn test_response_id_matching() {
        let resp: JsonRpcResponse = serde_json::from_value(serde_json::json!({
            "jsonrpc": "2.0", "id": 7, "result": {"ok": true}
        }))
        .unwrap();
        assert!(resp.matches_id(&serde_json::json!(7)));
        assert!(!resp.matches_id(&serde_json::json!(8)));
        assert!(!resp.matches_id(&serde_json::json!("7")));
    }

    #[test]
    fn test_string_id_matching() {
        let resp: JsonRpcResponse = serde_json::from_value(serde_json::json!({
            "jsonrpc": "2.0", "id": "req-1", "result": null
        }))
        .unwrap();
        assert!(resp.matches_id(&serde_json::json!("req-1")));
    }

    #[test]
    fn test_initialize_params_default_version() {
        let params = initialize_params(None);
        assert_eq!(params.protocol_version, DEFAULT_PROTOCOL_VERSION);
        let pinned = initialize_params(Some("2025-03-26"));
        assert_eq!(pinned.protocol_version, "2025-03-26");
    }

    #[test]
    fn test_list_tools_result_deserialization() {
        let json = serde_json::json!({
            "tools": [
                {
                    "name": "fetch",
                    "description": "Fetch a URL",
                    "inputSchema": { "type": "object" }
                },
                { "name": "ping", "inputSchema": { "type": "object" } }
            ]
        });
        let result: ListToolsResult = serde_json::from_value(json).unwrap();
        assert_eq!(result.tools.len(), 2);
        assert!(result.tools[1].description.is_none());
        assert!(result.next_cursor.is_none());
    }
}
