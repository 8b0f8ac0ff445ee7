//! Integration tests for the MCP transport adapter.
//!
//! These tests verify:
//! 1. Each transport (http, sse, streamable_http) bridges a logical call
//!    correctly, including mixed JSON/SSE responses
//! 2. Streamable-HTTP session capture, header echo and single-flight
//!    initialization under concurrency
//! 3. The error taxonomy: timeouts, missing session header, upstream
//!    failures and tool-allowlist denials
//!
//! Backends are wiremock doubles; no database is required.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use gateway::errors::AppError;
use gateway::models::backend::{Backend, BackendAuth, Transport};
use gateway::proxy::session::SessionCache;
use gateway::proxy::transport::{RawOutcome, TransportAdapter};
use gateway::proxy::upstream::UpstreamClient;

fn adapter() -> TransportAdapter {
    TransportAdapter::new(
        UpstreamClient::new(),
        Arc::new(SessionCache::new()),
        Duration::from_secs(60),
    )
}

fn backend(url: &str, transport: Transport) -> Backend {
    Backend {
        id: Uuid::new_v4(),
        name: "mock".into(),
        url: url.to_string(),
        transport,
        protocol_version: Some("2025-11-25".into()),
        timeout_seconds: 5,
        max_connections: 8,
        health_check_url: None,
        health_check_interval_seconds: 30,
        auth: BackendAuth::None,
        tool_allowlist: vec![],
        is_active: true,
        tags: vec![],
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

/// Responds with a JSON envelope whose id echoes the request's id.
struct JsonEcho {
    result: Value,
}

impl Respond for JsonEcho {
    fn respond(&self, req: &Request) -> ResponseTemplate {
        let envelope: Value = serde_json::from_slice(&req.body).unwrap_or_default();
        let id = envelope.get("id").cloned().unwrap_or(Value::Null);
        ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": self.result,
        }))
    }
}

/// Responds with an SSE stream carrying one data frame, id echoed.
struct SseEcho {
    result: Value,
}

impl Respond for SseEcho {
    fn respond(&self, req: &Request) -> ResponseTemplate {
        let envelope: Value = serde_json::from_slice(&req.body).unwrap_or_default();
        let id = envelope.get("id").cloned().unwrap_or(Value::Null);
        let frame = json!({ "jsonrpc": "2.0", "id": id, "result": self.result });
        let body = format!(
            "event: message\n: keepalive\ndata: {}\n\n",
            serde_json::to_string(&frame).unwrap()
        );
        ResponseTemplate::new(200)
            .insert_header("content-type", "text/event-stream")
            .set_body_raw(body, "text/event-stream")
    }
}

/// Responds with a JSON-RPC error envelope, id echoed.
struct JsonRpcErrorEcho {
    code: i64,
    message: &'static str,
}

impl Respond for JsonRpcErrorEcho {
    fn respond(&self, req: &Request) -> ResponseTemplate {
        let envelope: Value = serde_json::from_slice(&req.body).unwrap_or_default();
        let id = envelope.get("id").cloned().unwrap_or(Value::Null);
        ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": self.code, "message": self.message }
        }))
    }
}

/// Streamable-HTTP initialize response: JSON envelope plus session header.
struct InitializeOk {
    session: &'static str,
}

impl Respond for InitializeOk {
    fn respond(&self, req: &Request) -> ResponseTemplate {
        let envelope: Value = serde_json::from_slice(&req.body).unwrap_or_default();
        let id = envelope.get("id").cloned().unwrap_or(Value::Null);
        ResponseTemplate::new(200)
            .insert_header("mcp-session-id", self.session)
            .set_body_json(json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "protocolVersion": "2025-11-25",
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": "mock", "version": "1.0" }
                }
            }))
    }
}

// ── http transport ─────────────────────────────────────────────

#[tokio::test]
async fn test_http_transport_tool_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/tools/call"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": [{ "type": "text", "text": "42" }],
            "isError": false
        })))
        .expect(1)
        .mount(&server)
        .await;

    let backend = backend(&server.uri(), Transport::Http);
    let result = adapter()
        .forward(
            &backend,
            Uuid::new_v4(),
            "tools/call",
            Some(json!({ "name": "calculator", "arguments": { "op": "add", "a": 40, "b": 2 } })),
        )
        .await
        .unwrap();

    assert_eq!(result["content"][0]["text"], "42");
}

#[tokio::test]
async fn test_http_transport_upstream_5xx() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/tools/list"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let backend = backend(&server.uri(), Transport::Http);
    let err = adapter()
        .forward(&backend, Uuid::new_v4(), "tools/list", None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::UpstreamError(_)));
}

#[tokio::test]
async fn test_http_transport_invalid_json_is_protocol_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/initialize"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>not json</html>"))
        .mount(&server)
        .await;

    let backend = backend(&server.uri(), Transport::Http);
    let err = adapter()
        .forward(&backend, Uuid::new_v4(), "initialize", None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::UpstreamProtocol(_)));
}

// ── sse transport ──────────────────────────────────────────────

#[tokio::test]
async fn test_sse_transport_parses_first_matching_frame() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(SseEcho {
            result: json!({ "tools": [{ "name": "x" }] }),
        })
        .expect(1)
        .mount(&server)
        .await;

    let backend = backend(&server.uri(), Transport::Sse);
    let result = adapter()
        .forward(&backend, Uuid::new_v4(), "tools/list", None)
        .await
        .unwrap();

    assert_eq!(result, json!({ "tools": [{ "name": "x" }] }));
}

#[tokio::test]
async fn test_sse_stream_without_frame_is_protocol_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_raw(": only keepalives here\n\n", "text/event-stream"),
        )
        .mount(&server)
        .await;

    let backend = backend(&server.uri(), Transport::Sse);
    let err = adapter()
        .forward(&backend, Uuid::new_v4(), "tools/list", None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::UpstreamProtocol(_)));
}

#[tokio::test]
async fn test_sse_timeout_maps_to_upstream_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_raw(": slow\n", "text/event-stream")
                .set_delay(Duration::from_secs(10)),
        )
        .mount(&server)
        .await;

    let mut backend = backend(&server.uri(), Transport::Sse);
    backend.timeout_seconds = 1;

    let started = std::time::Instant::now();
    let err = adapter()
        .forward(&backend, Uuid::new_v4(), "tools/list", None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::UpstreamTimeout));
    assert!(started.elapsed() < Duration::from_secs(5));
}

// ── streamable_http transport ──────────────────────────────────

#[tokio::test]
async fn test_streamable_session_captured_and_echoed() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(body_partial_json(json!({ "method": "initialize" })))
        .respond_with(InitializeOk { session: "S1" })
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(body_partial_json(json!({ "method": "notifications/initialized" })))
        .respond_with(ResponseTemplate::new(202))
        .mount(&server)
        .await;

    // The follow-up call must carry the captured session header.
    Mock::given(method("POST"))
        .and(body_partial_json(json!({ "method": "tools/list" })))
        .and(header("mcp-session-id", "S1"))
        .respond_with(JsonEcho {
            result: json!({ "tools": [] }),
        })
        .expect(1)
        .mount(&server)
        .await;

    let adapter = adapter();
    let backend = backend(&server.uri(), Transport::StreamableHttp);
    let principal = Uuid::new_v4();

    let init = adapter
        .forward(&backend, principal, "initialize", None)
        .await
        .unwrap();
    assert_eq!(init["protocolVersion"], "2025-11-25");

    let tools = adapter
        .forward(&backend, principal, "tools/list", None)
        .await
        .unwrap();
    assert_eq!(tools, json!({ "tools": [] }));
}

#[tokio::test]
async fn test_streamable_sse_response_equivalent_to_json() {
    // The same logical call answered over SSE parses to the same result as
    // a JSON answer.
    let json_server = MockServer::start().await;
    Mock::given(body_partial_json(json!({ "method": "initialize" })))
        .respond_with(InitializeOk { session: "J" })
        .mount(&json_server)
        .await;
    Mock::given(body_partial_json(json!({ "method": "notifications/initialized" })))
        .respond_with(ResponseTemplate::new(202))
        .mount(&json_server)
        .await;
    Mock::given(body_partial_json(json!({ "method": "tools/list" })))
        .respond_with(JsonEcho {
            result: json!({ "tools": [{ "name": "x" }] }),
        })
        .mount(&json_server)
        .await;

    let sse_server = MockServer::start().await;
    Mock::given(body_partial_json(json!({ "method": "initialize" })))
        .respond_with(InitializeOk { session: "S" })
        .mount(&sse_server)
        .await;
    Mock::given(body_partial_json(json!({ "method": "notifications/initialized" })))
        .respond_with(ResponseTemplate::new(202))
        .mount(&sse_server)
        .await;
    Mock::given(body_partial_json(json!({ "method": "tools/list" })))
        .respond_with(SseEcho {
            result: json!({ "tools": [{ "name": "x" }] }),
        })
        .mount(&sse_server)
        .await;

    let adapter_json = adapter();
    let adapter_sse = adapter();
    let principal = Uuid::new_v4();

    let from_json = adapter_json
        .forward(
            &backend(&json_server.uri(), Transport::StreamableHttp),
            principal,
            "tools/list",
            None,
        )
        .await
        .unwrap();
    let from_sse = adapter_sse
        .forward(
            &backend(&sse_server.uri(), Transport::StreamableHttp),
            principal,
            "tools/list",
            None,
        )
        .await
        .unwrap();

    assert_eq!(from_json, from_sse);
}

#[tokio::test]
async fn test_streamable_missing_session_header_fails() {
    let server = MockServer::start().await;
    Mock::given(body_partial_json(json!({ "method": "initialize" })))
        .respond_with(JsonEcho {
            result: json!({ "protocolVersion": "2025-11-25", "capabilities": {} }),
        })
        .mount(&server)
        .await;

    let backend = backend(&server.uri(), Transport::StreamableHttp);
    let err = adapter()
        .forward(&backend, Uuid::new_v4(), "initialize", None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::UpstreamProtocol(_)));
}

#[tokio::test]
async fn test_single_flight_initialize_under_concurrency() {
    let server = MockServer::start().await;

    // Exactly one initialize may reach the backend, no matter how many
    // concurrent first calls arrive for the same (backend, principal).
    Mock::given(body_partial_json(json!({ "method": "initialize" })))
        .respond_with(InitializeOk { session: "S1" })
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(body_partial_json(json!({ "method": "notifications/initialized" })))
        .respond_with(ResponseTemplate::new(202).set_delay(Duration::from_millis(10)))
        .mount(&server)
        .await;
    Mock::given(body_partial_json(json!({ "method": "tools/list" })))
        .and(header("mcp-session-id", "S1"))
        .respond_with(JsonEcho {
            result: json!({ "tools": [] }),
        })
        .expect(10)
        .mount(&server)
        .await;

    let adapter = Arc::new(adapter());
    let backend = Arc::new(backend(&server.uri(), Transport::StreamableHttp));
    let principal = Uuid::new_v4();

    let mut handles = Vec::new();
    for _ in 0..10 {
        let adapter = adapter.clone();
        let backend = backend.clone();
        handles.push(tokio::spawn(async move {
            adapter
                .forward(&backend, principal, "tools/list", None)
                .await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }
    // Mock expectations (1 initialize, 10 tools/list) assert on drop.
}

#[tokio::test]
async fn test_jsonrpc_error_maps_to_upstream_error() {
    let server = MockServer::start().await;
    Mock::given(body_partial_json(json!({ "method": "initialize" })))
        .respond_with(InitializeOk { session: "S1" })
        .mount(&server)
        .await;
    Mock::given(body_partial_json(json!({ "method": "notifications/initialized" })))
        .respond_with(ResponseTemplate::new(202))
        .mount(&server)
        .await;
    Mock::given(body_partial_json(json!({ "method": "tools/call" })))
        .respond_with(JsonRpcErrorEcho {
            code: -32601,
            message: "method not found",
        })
        .mount(&server)
        .await;

    let backend = backend(&server.uri(), Transport::StreamableHttp);
    let err = adapter()
        .forward(
            &backend,
            Uuid::new_v4(),
            "tools/call",
            Some(json!({ "name": "missing" })),
        )
        .await
        .unwrap_err();
    match err {
        AppError::UpstreamError(msg) => assert!(msg.contains("method not found")),
        other => panic!("expected UpstreamError, got {:?}", other),
    }
}

// ── tool allowlist ─────────────────────────────────────────────

#[tokio::test]
async fn test_tool_allowlist_denies_before_any_network_io() {
    let server = MockServer::start().await;
    // Zero requests may reach the backend.
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let mut backend = backend(&server.uri(), Transport::Http);
    backend.tool_allowlist = vec!["calculator".into()];

    let err = adapter()
        .forward(
            &backend,
            Uuid::new_v4(),
            "tools/call",
            Some(json!({ "name": "shell", "arguments": {} })),
        )
        .await
        .unwrap_err();
    match err {
        AppError::ToolNotAllowed(tool) => assert_eq!(tool, "shell"),
        other => panic!("expected ToolNotAllowed, got {:?}", other),
    }
}

#[tokio::test]
async fn test_tool_allowlist_permits_listed_tool() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/tools/call"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": [{ "type": "text", "text": "ok" }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let mut backend = backend(&server.uri(), Transport::Http);
    backend.tool_allowlist = vec!["calculator".into()];

    let result = adapter()
        .forward(
            &backend,
            Uuid::new_v4(),
            "tools/call",
            Some(json!({ "name": "calculator", "arguments": {} })),
        )
        .await
        .unwrap();
    assert_eq!(result["content"][0]["text"], "ok");
}

// ── raw passthrough ────────────────────────────────────────────

#[tokio::test]
async fn test_raw_passthrough_returns_envelope_with_caller_id() {
    let server = MockServer::start().await;
    Mock::given(body_partial_json(json!({ "method": "tools/list" })))
        .respond_with(SseEcho {
            result: json!({ "tools": [{ "name": "x" }] }),
        })
        .mount(&server)
        .await;

    let backend = backend(&server.uri(), Transport::Sse);
    let outcome = adapter()
        .forward_raw(
            &backend,
            Uuid::new_v4(),
            json!({ "jsonrpc": "2.0", "id": "client-7", "method": "tools/list" }),
        )
        .await
        .unwrap();

    match outcome {
        RawOutcome::Envelope(envelope) => {
            assert_eq!(envelope["id"], "client-7");
            assert_eq!(envelope["result"]["tools"][0]["name"], "x");
        }
        RawOutcome::Accepted => panic!("expected an envelope"),
    }
}

#[tokio::test]
async fn test_raw_notification_is_accepted() {
    let server = MockServer::start().await;
    Mock::given(body_partial_json(json!({ "method": "notifications/progress" })))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let backend = backend(&server.uri(), Transport::Http);
    let outcome = adapter()
        .forward_raw(
            &backend,
            Uuid::new_v4(),
            json!({ "jsonrpc": "2.0", "method": "notifications/progress", "params": {} }),
        )
        .await
        .unwrap();
    assert!(matches!(outcome, RawOutcome::Accepted));
}
