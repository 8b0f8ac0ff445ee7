//! Management handlers: backend registry CRUD, namespaces, principal
//! administration and the audit query endpoint.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::rbac::filter_by_set;
use crate::auth::AuthContext;
use crate::errors::AppError;
use crate::models::audit::AuditQuery;
use crate::models::backend::{Backend, HealthStatus};
use crate::models::namespace::AccessLevel;
use crate::registry::{health, BackendSpec};
use crate::AppState;

/// Backend as exposed over the API — auth material never leaves the server.
#[derive(Debug, Serialize)]
pub struct BackendView {
    pub id: Uuid,
    pub name: String,
    pub url: String,
    pub transport: String,
    pub protocol_version: Option<String>,
    pub timeout_seconds: i32,
    pub max_connections: i32,
    pub health_check_url: Option<String>,
    pub health_check_interval_seconds: i32,
    pub auth_type: String,
    pub tool_allowlist: Vec<String>,
    pub is_active: bool,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Backend> for BackendView {
    fn from(b: Backend) -> Self {
        BackendView {
            id: b.id,
            name: b.name,
            url: b.url,
            transport: b.transport.as_str().to_string(),
            protocol_version: b.protocol_version,
            timeout_seconds: b.timeout_seconds,
            max_connections: b.max_connections,
            health_check_url: b.health_check_url,
            health_check_interval_seconds: b.health_check_interval_seconds,
            auth_type: b.auth.kind().to_string(),
            tool_allowlist: b.tool_allowlist,
            is_active: b.is_active,
            tags: b.tags,
            created_at: b.created_at,
            updated_at: b.updated_at,
        }
    }
}

// ── Servers ──────────────────────────────────────────────────

/// Listing is filtered by the caller's view-level RBAC set; the admin
/// sentinel (no filter) passes the registry through untouched.
pub async fn list_servers(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<Value>, AppError> {
    let backends = state.registry.list().await?;
    let visible = state
        .rbac
        .accessible_backends(&state.store, &ctx.principal, AccessLevel::View)
        .await?;
    let filtered = filter_by_set(backends, &visible, |b| b.id);
    let views: Vec<BackendView> = filtered.into_iter().map(BackendView::from).collect();
    Ok(Json(json!({ "servers": views })))
}

pub async fn create_server(
    State(state): State<Arc<AppState>>,
    Json(spec): Json<BackendSpec>,
) -> Result<(StatusCode, Json<BackendView>), AppError> {
    let backend = state.registry.create(&spec).await?;
    tracing::info!(name = %backend.name, id = %backend.id, transport = %backend.transport.as_str(), "backend registered");
    Ok((StatusCode::CREATED, Json(backend.into())))
}

pub async fn get_server(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<BackendView>, AppError> {
    let visible = state
        .rbac
        .accessible_backends(&state.store, &ctx.principal, AccessLevel::View)
        .await?;
    if let Some(set) = &visible {
        if !set.contains(&id) {
            return Err(AppError::NotFound);
        }
    }
    let backend = state.registry.get(id).await?;
    Ok(Json(backend.into()))
}

pub async fn update_server(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(spec): Json<BackendSpec>,
) -> Result<Json<BackendView>, AppError> {
    let (previous, updated) = state.registry.update(id, &spec).await?;
    // A transport or URL change invalidates any session negotiated under
    // the old contract.
    if previous.transport != updated.transport || previous.url != updated.url {
        state.transport.sessions.evict_backend(id);
        tracing::info!(id = %id, "evicted proxy sessions after backend change");
    }
    Ok(Json(updated.into()))
}

pub async fn delete_server(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.registry.delete(id).await?;
    state.transport.sessions.evict_backend(id);
    Ok(StatusCode::NO_CONTENT)
}

pub async fn toggle_server(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let is_active = state.registry.toggle(id).await?;
    if !is_active {
        state.transport.sessions.evict_backend(id);
    }
    Ok(Json(json!({ "id": id, "is_active": is_active })))
}

pub async fn get_server_health(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    // 404 for unknown ids, "unknown" for known-but-unprobed.
    let _ = state.registry.get(id).await?;
    let record = state.store.get_health(id).await?;
    match record {
        Some(record) => Ok(Json(serde_json::to_value(record)?)),
        None => Ok(Json(json!({
            "backend_id": id,
            "status": HealthStatus::Unknown.as_str(),
        }))),
    }
}

/// On-demand probe, bypassing the prober cadence.
pub async fn probe_server_health(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let backend = state.registry.get(id).await?;
    let record = health::probe_backend(&state.probe_http, &backend).await;
    state.store.upsert_health(&record).await?;
    Ok(Json(serde_json::to_value(record)?))
}

pub async fn test_connection(
    State(state): State<Arc<AppState>>,
    Json(spec): Json<BackendSpec>,
) -> Result<Json<Value>, AppError> {
    let candidate = state.registry.candidate(&spec).await?;
    let result = state.transport.test_connection(&candidate).await?;
    Ok(Json(json!({ "status": "ok", "details": result })))
}

// ── Namespaces ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateNamespaceRequest {
    pub name: String,
}

pub async fn list_namespaces(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, AppError> {
    let namespaces = state.store.list_namespaces().await?;
    Ok(Json(json!({ "namespaces": namespaces })))
}

pub async fn create_namespace(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateNamespaceRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    if req.name.trim().is_empty() {
        return Err(AppError::Validation("name is required".into()));
    }
    let namespace = state
        .store
        .create_namespace(req.name.trim())
        .await
        .map_err(|e| crate::store::postgres::conflict_on_unique(e, "namespace name"))?;
    Ok((StatusCode::CREATED, Json(serde_json::to_value(namespace)?)))
}

pub async fn get_namespace(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let namespace = state.store.get_namespace(id).await?.ok_or(AppError::NotFound)?;
    Ok(Json(serde_json::to_value(namespace)?))
}

pub async fn delete_namespace(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    if !state.store.delete_namespace(id).await? {
        return Err(AppError::NotFound);
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_namespace_servers(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let _ = state.store.get_namespace(id).await?.ok_or(AppError::NotFound)?;
    let ids = state.store.backends_in_namespace(id).await?;
    Ok(Json(json!({ "server_ids": ids })))
}

#[derive(Debug, Deserialize)]
pub struct NamespaceServerRequest {
    pub server_id: Uuid,
}

pub async fn add_namespace_server(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<NamespaceServerRequest>,
) -> Result<StatusCode, AppError> {
    let _ = state.store.get_namespace(id).await?.ok_or(AppError::NotFound)?;
    let _ = state
        .store
        .get_backend(req.server_id)
        .await?
        .ok_or(AppError::NotFound)?;
    state
        .store
        .add_backend_to_namespace(id, req.server_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn remove_namespace_server(
    State(state): State<Arc<AppState>>,
    Path((id, backend_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, AppError> {
    if !state
        .store
        .remove_backend_from_namespace(id, backend_id)
        .await?
    {
        return Err(AppError::NotFound);
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct AccessRequest {
    pub role: String,
    pub level: String,
}

pub async fn list_namespace_access(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let _ = state.store.get_namespace(id).await?.ok_or(AppError::NotFound)?;
    let grants = state.store.list_namespace_access(id).await?;
    Ok(Json(json!({ "access": grants })))
}

pub async fn set_namespace_access(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<AccessRequest>,
) -> Result<StatusCode, AppError> {
    let _ = state.store.get_namespace(id).await?.ok_or(AppError::NotFound)?;
    let level = AccessLevel::parse(&req.level).ok_or_else(|| {
        AppError::Validation(format!("level must be view|execute, got '{}'", req.level))
    })?;
    state.store.set_role_access(&req.role, id, level).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn clear_namespace_access(
    State(state): State<Arc<AppState>>,
    Path((id, role)): Path<(Uuid, String)>,
) -> Result<StatusCode, AppError> {
    if !state.store.clear_role_access(&role, id).await? {
        return Err(AppError::NotFound);
    }
    Ok(StatusCode::NO_CONTENT)
}

// ── Users ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub email: String,
    pub display_name: String,
    pub password: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

pub async fn list_users(State(state): State<Arc<AppState>>) -> Result<Json<Value>, AppError> {
    let principals = state.store.list_principals().await?;
    Ok(Json(json!({ "users": principals })))
}

pub async fn create_user(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    if !req.email.contains('@') {
        return Err(AppError::Validation("a valid email is required".into()));
    }
    let roles = if req.roles.is_empty() {
        vec!["user".to_string()]
    } else {
        req.roles.clone()
    };
    let known: Vec<String> = state
        .store
        .list_roles()
        .await?
        .into_iter()
        .map(|r| r.name)
        .collect();
    for role in &roles {
        if !known.contains(role) {
            return Err(AppError::Validation(format!("unknown role '{}'", role)));
        }
    }
    let hash = state.providers.local.hash_password(&req.password).await?;
    let principal = state
        .store
        .create_local_principal(&req.email, &req.display_name, &hash, &roles)
        .await
        .map_err(|e| match e.downcast::<sqlx::Error>() {
            Ok(db) => crate::store::postgres::conflict_on_unique(db, "email"),
            Err(other) => AppError::Internal(other),
        })?;
    Ok((StatusCode::CREATED, Json(serde_json::to_value(principal)?)))
}

pub async fn toggle_user(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    if ctx.principal.id == id {
        return Err(AppError::Validation("cannot deactivate your own account".into()));
    }
    let principal = state.store.get_principal(id).await?.ok_or(AppError::NotFound)?;
    let next = !principal.is_active;
    state.store.set_principal_active(id, next).await?;
    Ok(Json(json!({ "id": id, "is_active": next })))
}

// ── Audit ────────────────────────────────────────────────────

pub async fn list_audit_logs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Value>, AppError> {
    let logs = state.store.list_audit(&query).await?;
    Ok(Json(json!({
        "logs": logs,
        "limit": query.limit(),
        "offset": query.offset(),
    })))
}
