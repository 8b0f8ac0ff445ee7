//! Transport adapter — bridges one logical MCP call into whatever wire
//! transport the target backend speaks.
//!
//! Three contracts:
//! - `http`: REST-shaped subpaths, JSON in / JSON out, stateless.
//! - `sse`: one POST with a JSON-RPC envelope, `text/event-stream` response;
//!   the first data frame carrying the request id is the answer.
//! - `streamable_http`: JSON-RPC POSTs with a backend-issued session header;
//!   each response may be JSON or SSE.
//!
//! Every logical call runs under a single deadline derived from the
//! backend's `timeout_seconds` — SSE reads never reset it per event.

use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::errors::AppError;
use crate::mcp::sse;
use crate::mcp::types::{
    self, JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION_HEADER, SESSION_HEADER,
};
use crate::models::backend::{Backend, BackendAuth, Transport};

use super::session::SessionCache;
use super::upstream::UpstreamClient;

/// Outcome of a raw passthrough call.
#[derive(Debug)]
pub enum RawOutcome {
    /// Full JSON-RPC envelope to hand back verbatim.
    Envelope(Value),
    /// The request was a notification; the backend acknowledged it.
    Accepted,
}

pub struct TransportAdapter {
    upstream: UpstreamClient,
    pub sessions: Arc<SessionCache>,
    /// Global ceiling on any logical call, from server config. The
    /// effective deadline is min(this, backend.timeout_seconds).
    request_cap: std::time::Duration,
    next_id: AtomicU64,
}

impl TransportAdapter {
    pub fn new(
        upstream: UpstreamClient,
        sessions: Arc<SessionCache>,
        request_cap: std::time::Duration,
    ) -> Self {
        Self {
            upstream,
            sessions,
            request_cap,
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn deadline_for(&self, backend: &Backend) -> Instant {
        Instant::now() + backend.timeout().min(self.request_cap)
    }

    /// Forward one logical MCP call and return the JSON-RPC `result` object.
    ///
    /// `method` is the MCP method name (`initialize`, `tools/list`,
    /// `tools/call`, `resources/*`, `prompts/*`). The tool allowlist is
    /// enforced here, after resource RBAC has already granted execute.
    pub async fn forward(
        &self,
        backend: &Backend,
        principal_id: Uuid,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, AppError> {
        if method == "tools/call" {
            self.enforce_allowlist(backend, params.as_ref())?;
        }

        let deadline = self.deadline_for(backend);
        match backend.transport {
            Transport::Http => self.http_call(backend, method, params, deadline).await,
            Transport::Sse => {
                let id = self.next_id();
                let envelope = self
                    .sse_call(backend, JsonRpcRequest::new(id, method, params), deadline)
                    .await?;
                envelope_result(envelope)
            }
            Transport::StreamableHttp => {
                self.streamable_call(backend, principal_id, method, params, deadline)
                    .await
            }
        }
    }

    /// Raw JSON-RPC passthrough for `ANY /api/v1/gateway/:id`. The caller's
    /// envelope is forwarded as-is and the backend's envelope comes back
    /// verbatim (after transport normalisation).
    pub async fn forward_raw(
        &self,
        backend: &Backend,
        principal_id: Uuid,
        envelope: Value,
    ) -> Result<RawOutcome, AppError> {
        let method = envelope
            .get("method")
            .and_then(|m| m.as_str())
            .ok_or_else(|| AppError::Validation("missing JSON-RPC method".into()))?
            .to_string();

        if method == "tools/call" {
            self.enforce_allowlist(backend, envelope.get("params"))?;
        }

        let request_id = envelope.get("id").cloned();
        let deadline = self.deadline_for(backend);

        // Notifications get forwarded and acknowledged, never answered.
        let Some(request_id) = request_id.filter(|id| !id.is_null()) else {
            self.forward_notification(backend, principal_id, envelope, deadline)
                .await?;
            return Ok(RawOutcome::Accepted);
        };

        let envelope_out = match backend.transport {
            Transport::Http => {
                let params = envelope.get("params").cloned();
                let result = self.http_call(backend, &method, params, deadline).await?;
                json!({ "jsonrpc": "2.0", "id": request_id, "result": result })
            }
            Transport::Sse => {
                let resp = self
                    .sse_send(backend, &envelope, &request_id, None, deadline)
                    .await?;
                rebuild_envelope(resp, &request_id)?
            }
            Transport::StreamableHttp => {
                if method == "initialize" {
                    let (session, resp) = self.initialize_streamable(backend, deadline).await?;
                    self.sessions.insert((backend.id, principal_id), session);
                    rebuild_envelope(resp, &request_id)?
                } else {
                    let session = self.ensure_session(backend, principal_id).await?;
                    let resp = self
                        .streamable_send(backend, principal_id, &envelope, &request_id, &session, deadline)
                        .await?;
                    rebuild_envelope(resp, &request_id)?
                }
            }
        };
        Ok(RawOutcome::Envelope(envelope_out))
    }

    /// One-shot `initialize` + `tools/list` against a candidate backend,
    /// bypassing the session cache and persisting nothing.
    pub async fn test_connection(&self, backend: &Backend) -> Result<Value, AppError> {
        let deadline = self.deadline_for(backend);
        match backend.transport {
            Transport::Http => {
                let init = self.http_call(backend, "initialize", None, deadline).await?;
                let tools = self.http_call(backend, "tools/list", None, deadline).await?;
                Ok(json!({ "initialize": init, "tools": tools }))
            }
            Transport::Sse => {
                let init = self
                    .sse_call(
                        backend,
                        JsonRpcRequest::new(
                            self.next_id(),
                            "initialize",
                            Some(serde_json::to_value(types::initialize_params(
                                backend.protocol_version.as_deref(),
                            ))?),
                        ),
                        deadline,
                    )
                    .await
                    .and_then(envelope_result)?;
                let tools = self
                    .sse_call(
                        backend,
                        JsonRpcRequest::new(self.next_id(), "tools/list", None),
                        deadline,
                    )
                    .await
                    .and_then(envelope_result)?;
                Ok(json!({ "initialize": init, "tools": tools }))
            }
            Transport::StreamableHttp => {
                let (session, init) = self.initialize_streamable(backend, deadline).await?;
                let id = self.next_id();
                let req = JsonRpcRequest::new(id, "tools/list", None);
                let envelope = serde_json::to_value(&req)?;
                let resp = self
                    .streamable_post(backend, &envelope, &json!(id), Some(&session), deadline)
                    .await?;
                let init_result = envelope_result(init)?;
                let tools = envelope_result(resp)?;
                Ok(json!({ "initialize": init_result, "tools": tools }))
            }
        }
    }

    // ── http transport ─────────────────────────────────────────

    /// REST-shaped backend: one POST per logical call to `{url}/{method}`.
    async fn http_call(
        &self,
        backend: &Backend,
        method: &str,
        params: Option<Value>,
        deadline: Instant,
    ) -> Result<Value, AppError> {
        let url = format!("{}/{}", backend.url.trim_end_matches('/'), method);
        let body = params.unwrap_or_else(|| json!({}));

        let request = self
            .upstream
            .inner()
            .post(&url)
            .headers(self.build_headers(backend, None))
            .json(&body);

        let resp = send_with_deadline(request, deadline).await?;
        let status = resp.status();
        let text = read_with_deadline(resp, deadline).await?;

        if !status.is_success() {
            return Err(upstream_status_error(status, &text));
        }
        serde_json::from_str(&text)
            .map_err(|e| AppError::UpstreamProtocol(format!("invalid JSON from backend: {}", e)))
    }

    // ── sse transport ──────────────────────────────────────────

    async fn sse_call(
        &self,
        backend: &Backend,
        request: JsonRpcRequest,
        deadline: Instant,
    ) -> Result<JsonRpcResponse, AppError> {
        let expected_id = json!(request.id);
        let envelope = serde_json::to_value(&request)?;
        self.sse_send(backend, &envelope, &expected_id, None, deadline)
            .await
    }

    /// POST the envelope; the response body is an event stream. The overall
    /// deadline applies to the whole read, not per event.
    async fn sse_send(
        &self,
        backend: &Backend,
        envelope: &Value,
        expected_id: &Value,
        session: Option<&str>,
        deadline: Instant,
    ) -> Result<JsonRpcResponse, AppError> {
        let request = self
            .upstream
            .inner()
            .post(&backend.url)
            .headers(self.build_headers(backend, session))
            .json(envelope);

        let resp = send_with_deadline(request, deadline).await?;
        let status = resp.status();
        if !status.is_success() {
            let text = read_with_deadline(resp, deadline).await.unwrap_or_default();
            return Err(upstream_status_error(status, &text));
        }

        read_sse_response(resp, expected_id, deadline).await
    }

    // ── streamable_http transport ──────────────────────────────

    async fn streamable_call(
        &self,
        backend: &Backend,
        principal_id: Uuid,
        method: &str,
        params: Option<Value>,
        deadline: Instant,
    ) -> Result<Value, AppError> {
        if method == "initialize" {
            let (session, resp) = self.initialize_streamable(backend, deadline).await?;
            self.sessions.insert((backend.id, principal_id), session);
            return envelope_result(resp);
        }

        let session = self.ensure_session(backend, principal_id).await?;
        let id = self.next_id();
        let envelope = serde_json::to_value(&JsonRpcRequest::new(id, method, params))?;
        let resp = self
            .streamable_send(backend, principal_id, &envelope, &json!(id), &session, deadline)
            .await?;
        envelope_result(resp)
    }

    /// Cached-session lookup with single-flight initialization.
    async fn ensure_session(
        &self,
        backend: &Backend,
        principal_id: Uuid,
    ) -> Result<String, AppError> {
        let key = (backend.id, principal_id);
        self.sessions
            .get_or_init(key, || async {
                let deadline = self.deadline_for(backend);
                let (session, _) = self.initialize_streamable(backend, deadline).await?;
                Ok(session)
            })
            .await
    }

    /// The Streamable-HTTP handshake: POST `initialize`, require the session
    /// header, then fire `notifications/initialized` on the new session.
    async fn initialize_streamable(
        &self,
        backend: &Backend,
        deadline: Instant,
    ) -> Result<(String, JsonRpcResponse), AppError> {
        let id = self.next_id();
        let params = serde_json::to_value(types::initialize_params(
            backend.protocol_version.as_deref(),
        ))?;
        let envelope = serde_json::to_value(&JsonRpcRequest::new(id, "initialize", Some(params)))?;

        let request = self
            .upstream
            .inner()
            .post(&backend.url)
            .headers(self.build_headers(backend, None))
            .json(&envelope);

        let resp = send_with_deadline(request, deadline).await?;
        let status = resp.status();

        let session = resp
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        if !status.is_success() {
            let text = read_with_deadline(resp, deadline).await.unwrap_or_default();
            return Err(upstream_status_error(status, &text));
        }

        let Some(session) = session else {
            return Err(AppError::UpstreamProtocol(
                "backend did not return an MCP-Session-Id header".into(),
            ));
        };

        let rpc_resp = parse_json_or_sse(resp, &json!(id), deadline).await?;
        if let Some(err) = &rpc_resp.error {
            return Err(AppError::UpstreamError(err.to_string()));
        }

        // Fire-and-forget per protocol; a 202 is expected and any failure is
        // the backend's problem, not the caller's.
        let note = serde_json::to_value(&JsonRpcRequest::notification(
            "notifications/initialized",
            None,
        ))?;
        let request = self
            .upstream
            .inner()
            .post(&backend.url)
            .headers(self.build_headers(backend, Some(&session)))
            .json(&note);
        if let Err(e) = send_with_deadline(request, deadline).await {
            tracing::debug!(backend = %backend.name, "initialized notification failed: {}", e);
        }

        Ok((session, rpc_resp))
    }

    /// Send one session-bound call; a 404 from the backend is the session
    /// expiry signal and evicts the cache entry.
    async fn streamable_send(
        &self,
        backend: &Backend,
        principal_id: Uuid,
        envelope: &Value,
        expected_id: &Value,
        session: &str,
        deadline: Instant,
    ) -> Result<JsonRpcResponse, AppError> {
        match self
            .streamable_post(backend, envelope, expected_id, Some(session), deadline)
            .await
        {
            Err(AppError::UpstreamError(msg)) if msg.starts_with("backend returned 404") => {
                self.sessions.evict(&(backend.id, principal_id));
                Err(AppError::UpstreamError(
                    "backend session expired; retry to re-initialize".into(),
                ))
            }
            other => other,
        }
    }

    async fn streamable_post(
        &self,
        backend: &Backend,
        envelope: &Value,
        expected_id: &Value,
        session: Option<&str>,
        deadline: Instant,
    ) -> Result<JsonRpcResponse, AppError> {
        let request = self
            .upstream
            .inner()
            .post(&backend.url)
            .headers(self.build_headers(backend, session))
            .json(envelope);

        let resp = send_with_deadline(request, deadline).await?;
        let status = resp.status();
        if !status.is_success() {
            let text = read_with_deadline(resp, deadline).await.unwrap_or_default();
            return Err(upstream_status_error(status, &text));
        }

        parse_json_or_sse(resp, expected_id, deadline).await
    }

    async fn forward_notification(
        &self,
        backend: &Backend,
        principal_id: Uuid,
        envelope: Value,
        deadline: Instant,
    ) -> Result<(), AppError> {
        let session = match backend.transport {
            Transport::StreamableHttp => self.sessions.get(&(backend.id, principal_id)),
            _ => None,
        };
        let request = self
            .upstream
            .inner()
            .post(&backend.url)
            .headers(self.build_headers(backend, session.as_deref()))
            .json(&envelope);
        let resp = send_with_deadline(request, deadline).await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = read_with_deadline(resp, deadline).await.unwrap_or_default();
            return Err(upstream_status_error(status, &text));
        }
        Ok(())
    }

    // ── shared plumbing ────────────────────────────────────────

    /// Outbound header policy: JSON content type, an Accept that admits both
    /// response shapes, the backend's own auth, the pinned protocol version
    /// and the session id. Caller credentials never appear here.
    fn build_headers(&self, backend: &Backend, session: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/json, text/event-stream"),
        );

        match &backend.auth {
            BackendAuth::None => {}
            BackendAuth::Bearer { token } => {
                if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", token)) {
                    headers.insert(reqwest::header::AUTHORIZATION, value);
                }
            }
            BackendAuth::Header { name, value } => {
                if let (Ok(name), Ok(value)) = (
                    reqwest::header::HeaderName::from_bytes(name.as_bytes()),
                    HeaderValue::from_str(value),
                ) {
                    headers.insert(name, value);
                }
            }
        }

        if let Some(version) = &backend.protocol_version {
            if let Ok(value) = HeaderValue::from_str(version) {
                headers.insert(PROTOCOL_VERSION_HEADER, value);
            }
        }
        if let Some(session) = session {
            if let Ok(value) = HeaderValue::from_str(session) {
                headers.insert(SESSION_HEADER, value);
            }
        }
        headers
    }

    fn enforce_allowlist(&self, backend: &Backend, params: Option<&Value>) -> Result<(), AppError> {
        let tool = params
            .and_then(|p| p.get("name"))
            .and_then(|n| n.as_str())
            .ok_or_else(|| AppError::Validation("tools/call requires a tool name".into()))?;
        if !backend.tool_allowed(tool) {
            return Err(AppError::ToolNotAllowed(tool.to_string()));
        }
        Ok(())
    }
}

/// Unwrap a JSON-RPC envelope into its `result`, mapping a JSON-RPC error
/// onto the upstream-error taxonomy.
fn envelope_result(resp: JsonRpcResponse) -> Result<Value, AppError> {
    if let Some(err) = resp.error {
        return Err(AppError::UpstreamError(err.to_string()));
    }
    resp.result.ok_or_else(|| {
        AppError::UpstreamProtocol("JSON-RPC response missing both result and error".into())
    })
}

/// Re-serialize a parsed response as an envelope carrying the caller's id.
fn rebuild_envelope(resp: JsonRpcResponse, request_id: &Value) -> Result<Value, AppError> {
    if let Some(err) = resp.error {
        return Err(AppError::UpstreamError(err.to_string()));
    }
    let result = resp.result.ok_or_else(|| {
        AppError::UpstreamProtocol("JSON-RPC response missing both result and error".into())
    })?;
    Ok(json!({ "jsonrpc": "2.0", "id": request_id, "result": result }))
}

async fn send_with_deadline(
    request: reqwest::RequestBuilder,
    deadline: Instant,
) -> Result<reqwest::Response, AppError> {
    match tokio::time::timeout_at(deadline, request.send()).await {
        Err(_) => Err(AppError::UpstreamTimeout),
        Ok(Err(e)) if e.is_timeout() => Err(AppError::UpstreamTimeout),
        Ok(Err(e)) => Err(AppError::UpstreamError(format!("request failed: {}", e))),
        Ok(Ok(resp)) => Ok(resp),
    }
}

async fn read_with_deadline(resp: reqwest::Response, deadline: Instant) -> Result<String, AppError> {
    match tokio::time::timeout_at(deadline, resp.text()).await {
        Err(_) => Err(AppError::UpstreamTimeout),
        Ok(Err(e)) => Err(AppError::UpstreamProtocol(format!(
            "failed to read backend response: {}",
            e
        ))),
        Ok(Ok(text)) => Ok(text),
    }
}

fn upstream_status_error(status: reqwest::StatusCode, body: &str) -> AppError {
    let snippet: String = body.chars().take(200).collect();
    AppError::UpstreamError(format!("backend returned {}: {}", status.as_u16(), snippet))
}

/// A Streamable-HTTP response is JSON or an event stream — sniff the
/// Content-Type and parse accordingly.
async fn parse_json_or_sse(
    resp: reqwest::Response,
    expected_id: &Value,
    deadline: Instant,
) -> Result<JsonRpcResponse, AppError> {
    let content_type = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();

    if content_type.starts_with("text/event-stream") {
        return read_sse_response(resp, expected_id, deadline).await;
    }

    let text = read_with_deadline(resp, deadline).await?;
    serde_json::from_str(&text)
        .map_err(|e| AppError::UpstreamProtocol(format!("invalid JSON-RPC from backend: {}", e)))
}

/// Poll the event stream against the logical-call deadline until a frame
/// answers `expected_id`. Stream end without one is a protocol error.
async fn read_sse_response(
    resp: reqwest::Response,
    expected_id: &Value,
    deadline: Instant,
) -> Result<JsonRpcResponse, AppError> {
    let mut stream = resp.bytes_stream();
    let mut buffer = String::new();

    loop {
        let chunk = match tokio::time::timeout_at(deadline, stream.next()).await {
            Err(_) => return Err(AppError::UpstreamTimeout),
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                return Err(AppError::UpstreamProtocol(format!("SSE read failed: {}", e)))
            }
            Ok(Some(Ok(bytes))) => bytes,
        };
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        if let Some(resp) = sse::first_matching_frame(&buffer, expected_id) {
            return Ok(resp);
        }
    }

    if let Some(resp) = sse::first_matching_frame(&buffer, expected_id) {
        return Ok(resp);
    }
    Err(AppError::UpstreamProtocol(
        "SSE stream closed without a matching data frame".into(),
    ))
}
