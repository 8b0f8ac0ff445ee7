//! Gateway proxy handlers — `/api/v1/gateway/:server_id` and its REST
//! siblings, plus `/api/v1/servers/call-tool`.
//!
//! Each logical call resolves the backend, gates it through resource RBAC
//! (a deny is 403 when the caller can view the backend, 404 otherwise so
//! the registry cannot be probed), forwards through the transport adapter,
//! and records exactly one audit row — success or failure — carrying the
//! internal error kind even when the wire response is masked.

use axum::extract::{OriginalUri, Path, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::auth::{AuthContext, AuthMethod};
use crate::errors::AppError;
use crate::models::audit::AuditEntry;
use crate::models::backend::Backend;
use crate::models::namespace::AccessLevel;
use crate::proxy::transport::RawOutcome;
use crate::AppState;

/// Correlation id set by tower-http's `SetRequestIdLayer`. Falls back to a
/// fresh uuid if the header value is not uuid-shaped.
fn correlation_id(rid: &tower_http::request_id::RequestId) -> Uuid {
    rid.header_value()
        .to_str()
        .ok()
        .and_then(|s| Uuid::parse_str(s).ok())
        .unwrap_or_else(Uuid::new_v4)
}

/// Raw JSON-RPC passthrough: the body is a complete envelope, the answer is
/// the backend's envelope.
pub async fn gateway_raw(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Extension(request_id): Extension<tower_http::request_id::RequestId>,
    Path(server_id): Path<Uuid>,
    OriginalUri(uri): OriginalUri,
    method: Method,
    Json(envelope): Json<Value>,
) -> Response {
    let rpc_method = envelope
        .get("method")
        .and_then(|m| m.as_str())
        .unwrap_or("unknown")
        .to_string();

    let call = ProxiedCall {
        state: &state,
        ctx: &ctx,
        request_id: correlation_id(&request_id),
        http_method: method.to_string(),
        path: uri.path().to_string(),
        rpc_method,
        transport_label: std::sync::RwLock::new("unresolved"),
    };

    let adapter = state.clone();
    call.run(server_id, |backend, principal_id| async move {
        match adapter
            .transport
            .forward_raw(&backend, principal_id, envelope)
            .await?
        {
            RawOutcome::Envelope(envelope) => Ok((StatusCode::OK, Json(envelope)).into_response()),
            RawOutcome::Accepted => Ok(StatusCode::ACCEPTED.into_response()),
        }
    })
    .await
}

/// REST sibling: `POST /api/v1/gateway/:server_id/<op>` where the op path
/// maps directly onto the MCP method name.
pub async fn gateway_rest(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Extension(request_id): Extension<tower_http::request_id::RequestId>,
    Path((server_id, op)): Path<(Uuid, String)>,
    OriginalUri(uri): OriginalUri,
    method: Method,
    body: Option<Json<Value>>,
) -> Response {
    let rpc_method = match rest_op_to_method(&op) {
        Some(m) => m.to_string(),
        None => return AppError::NotFound.into_response(),
    };

    let params = body.map(|Json(v)| v).filter(|v| !v.is_null());
    let call = ProxiedCall {
        state: &state,
        ctx: &ctx,
        request_id: correlation_id(&request_id),
        http_method: method.to_string(),
        path: uri.path().to_string(),
        rpc_method: rpc_method.clone(),
        transport_label: std::sync::RwLock::new("unresolved"),
    };

    let adapter = state.clone();
    call.run(server_id, |backend, principal_id| async move {
        let result = adapter
            .transport
            .forward(&backend, principal_id, &rpc_method, params)
            .await?;
        Ok((StatusCode::OK, Json(json!({ "result": result }))).into_response())
    })
    .await
}

#[derive(Debug, Deserialize)]
pub struct CallToolRequest {
    pub server_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub arguments: Option<Value>,
}

/// Convenience endpoint used by the UI: tool call by server id.
pub async fn call_tool(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Extension(request_id): Extension<tower_http::request_id::RequestId>,
    OriginalUri(uri): OriginalUri,
    Json(req): Json<CallToolRequest>,
) -> Response {
    let params = json!({ "name": req.name, "arguments": req.arguments });
    let call = ProxiedCall {
        state: &state,
        ctx: &ctx,
        request_id: correlation_id(&request_id),
        http_method: "POST".to_string(),
        path: uri.path().to_string(),
        rpc_method: "tools/call".to_string(),
        transport_label: std::sync::RwLock::new("unresolved"),
    };

    let adapter = state.clone();
    call.run(req.server_id, |backend, principal_id| async move {
        let result = adapter
            .transport
            .forward(&backend, principal_id, "tools/call", Some(params))
            .await?;
        Ok((StatusCode::OK, Json(json!({ "result": result }))).into_response())
    })
    .await
}

/// Map a REST sibling path onto its MCP method. `tools/list` arrives as the
/// wildcard remainder `tools/list`, so the op is already slash-joined.
fn rest_op_to_method(op: &str) -> Option<&'static str> {
    match op {
        "initialize" => Some("initialize"),
        "tools/list" => Some("tools/list"),
        "tools/call" => Some("tools/call"),
        "resources/list" => Some("resources/list"),
        "resources/read" => Some("resources/read"),
        "prompts/list" => Some("prompts/list"),
        "prompts/get" => Some("prompts/get"),
        _ => None,
    }
}

/// Shared per-call plumbing: MCP-auth method gate → backend resolution →
/// RBAC execute gate (masked) → forward → one audit row.
struct ProxiedCall<'a> {
    state: &'a Arc<AppState>,
    ctx: &'a AuthContext,
    request_id: Uuid,
    http_method: String,
    path: String,
    rpc_method: String,
    transport_label: std::sync::RwLock<&'static str>,
}

impl<'a> ProxiedCall<'a> {
    async fn run<F, Fut>(self, server_id: Uuid, forward: F) -> Response
    where
        F: FnOnce(Backend, Uuid) -> Fut,
        Fut: std::future::Future<Output = Result<Response, AppError>>,
    {
        let started = Instant::now();
        let mut entry = AuditEntry::new(self.request_id, &self.http_method, &self.path);
        entry.principal_id = Some(self.ctx.principal.id).filter(|id| !id.is_nil());

        let outcome = self.execute(server_id, &mut entry, forward).await;

        let (response, status, internal_kind) = match outcome {
            Ok(response) => (response, StatusCode::OK.as_u16(), None),
            Err(err) => {
                let kind = err.kind().to_string();
                let status = err.status().as_u16();
                (err.into_response(), status, Some(kind))
            }
        };

        entry.status = status as i16;
        // A masked RBAC denial already stamped its internal kind in
        // execute(); don't overwrite it with the wire-visible one.
        if entry.error_kind.is_none() {
            entry.error_kind = internal_kind;
        }
        entry.duration_ms = started.elapsed().as_millis() as i64;

        crate::metrics::observe_proxy_call(
            *self.transport_label.read().unwrap(),
            &self.rpc_method,
            status,
            started.elapsed().as_secs_f64(),
        );
        crate::audit::record(self.state.store.pool().clone(), entry);

        response
    }

    async fn execute<F, Fut>(
        &self,
        server_id: Uuid,
        entry: &mut AuditEntry,
        forward: F,
    ) -> Result<Response, AppError>
    where
        F: FnOnce(Backend, Uuid) -> Fut,
        Fut: std::future::Future<Output = Result<Response, AppError>>,
    {
        self.check_mcp_auth()?;

        let backend = self
            .state
            .store
            .get_backend(server_id)
            .await?
            .filter(|b| b.is_active)
            .ok_or(AppError::NotFound)?;
        entry.backend_id = Some(backend.id);
        *self.transport_label.write().unwrap() = backend.transport.as_str();

        let allowed = self
            .state
            .rbac
            .can_execute(&self.state.store, &self.ctx.principal, backend.id)
            .await?;
        if !allowed {
            // A caller who can at least view the backend gets an honest 403.
            // One who cannot see it at all gets 404, so the gateway subtree
            // never confirms which ids exist; the audit row keeps the real
            // kind either way.
            let visible = match self
                .state
                .rbac
                .accessible_backends(&self.state.store, &self.ctx.principal, AccessLevel::View)
                .await?
            {
                None => true,
                Some(set) => set.contains(&backend.id),
            };
            if visible {
                return Err(AppError::Forbidden);
            }
            entry.error_kind = Some(AppError::Forbidden.kind().to_string());
            return Err(AppError::NotFound);
        }

        forward(backend, self.ctx.principal.id).await
    }

    /// Per-deployment gate: which credential kinds may drive proxied MCP
    /// calls, independent of what the management UI accepts.
    fn check_mcp_auth(&self) -> Result<(), AppError> {
        let gates = &self.state.config.auth.mcp_auth;
        let allowed = match self.ctx.method {
            AuthMethod::ApiKey => gates.api_key,
            AuthMethod::Session => gates.session,
            AuthMethod::OidcBearer => gates.oauth,
            AuthMethod::Disabled => true,
        };
        if allowed {
            Ok(())
        } else {
            Err(AppError::Unauthenticated)
        }
    }

}

// ── Tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rest_op_mapping() {
        assert_eq!(rest_op_to_method("initialize"), Some("initialize"));
        assert_eq!(rest_op_to_method("tools/list"), Some("tools/list"));
        assert_eq!(rest_op_to_method("prompts/get"), Some("prompts/get"));
        assert_eq!(rest_op_to_method("admin/shutdown"), None);
        assert_eq!(rest_op_to_method(""), None);
    }
}
