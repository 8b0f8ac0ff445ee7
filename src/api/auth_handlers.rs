//! Authentication endpoints: login/logout, browser SSO, identity and
//! self-service API keys, plus the RFC 9728 discovery documents.

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::{apikey, AuthContext, AuthError};
use crate::errors::AppError;
use crate::AppState;

/// Attempts at regenerating an API key whose prefix collided with an
/// active key. Collisions are rare; exhausting this is a server fault.
const KEY_PREFIX_RETRIES: usize = 3;

// ── Public endpoints ─────────────────────────────────────────

/// `GET /api/v1/status` — deliberately public, nothing sensitive.
pub async fn status(State(state): State<Arc<AppState>>) -> Json<Value> {
    let connected = state.store.ping().await;
    Json(json!({
        "auth": {
            "enabled": state.config.auth.enabled,
            "sso": { "enabled": state.config.auth.oauth.enabled },
        },
        "database": { "connected": connected },
    }))
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// `POST /api/v1/auth/login` — LDAP then local, in registration order.
/// Every credential failure maps to a generic 401: no account oracle, and
/// pre-auth lockouts are indistinguishable from bad passwords.
pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Response, AppError> {
    if !state.config.auth.enabled {
        return Err(AppError::Validation("authentication is disabled".into()));
    }

    let principal = state
        .providers
        .authenticate_password(&state.store, &req.email, &req.password)
        .await
        .map_err(|e| match e {
            AuthError::ProviderUnavailable => {
                AppError::Internal(anyhow::anyhow!("auth provider unavailable"))
            }
            _ => AppError::Unauthenticated,
        })?;

    let cookie = state.providers.session.issue(principal.id);
    let set_cookie = state.providers.session.set_cookie_header(&cookie);

    tracing::info!(email = %principal.email, provider = ?principal.provider, "login succeeded");

    let mut response = Json(json!({ "user": principal })).into_response();
    response.headers_mut().insert(
        header::SET_COOKIE,
        set_cookie.parse().map_err(|_| {
            AppError::Internal(anyhow::anyhow!("invalid cookie header"))
        })?,
    );
    Ok(response)
}

pub async fn logout(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let clear = state.providers.session.clear_cookie_header();
    let mut response = Json(json!({ "status": "logged_out" })).into_response();
    response.headers_mut().insert(
        header::SET_COOKIE,
        clear
            .parse()
            .map_err(|_| AppError::Internal(anyhow::anyhow!("invalid cookie header")))?,
    );
    Ok(response)
}

/// `GET /api/v1/auth/sso` — redirect the browser to the IdP.
pub async fn sso_start(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    if !state.config.auth.oauth.enabled {
        return Err(AppError::NotFound);
    }
    // CSRF state: random value, echoed back by the IdP and checked against
    // a short-lived cookie.
    let csrf = Uuid::new_v4().simple().to_string();
    let url = state
        .providers
        .oidc
        .authorize_url(&csrf)
        .await
        .map_err(|_| AppError::Internal(anyhow::anyhow!("OIDC discovery failed")))?;

    let mut response = Redirect::temporary(&url).into_response();
    response.headers_mut().insert(
        header::SET_COOKIE,
        format!("mcp_sso_state={}; Path=/; HttpOnly; Max-Age=600; SameSite=Lax", csrf)
            .parse()
            .map_err(|_| AppError::Internal(anyhow::anyhow!("invalid cookie header")))?,
    );
    Ok(response)
}

#[derive(Debug, Deserialize)]
pub struct SsoCallbackQuery {
    pub code: String,
    pub state: String,
}

/// `GET /api/v1/auth/sso/callback` — exchange the code, resolve the
/// principal, set the session cookie and bounce to the UI.
pub async fn sso_callback(
    State(state): State<Arc<AppState>>,
    headers: axum::http::HeaderMap,
    Query(query): Query<SsoCallbackQuery>,
) -> Result<Response, AppError> {
    if !state.config.auth.oauth.enabled {
        return Err(AppError::NotFound);
    }

    let cookie_state = headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(|cookies| {
            cookies.split(';').find_map(|pair| {
                let (name, value) = pair.trim().split_once('=')?;
                (name == "mcp_sso_state").then(|| value.to_string())
            })
        });
    if cookie_state.as_deref() != Some(query.state.as_str()) {
        return Err(AppError::Unauthenticated);
    }

    let tokens = state
        .providers
        .oidc
        .exchange_code(&query.code)
        .await
        .map_err(auth_to_app)?;
    let info = state
        .providers
        .oidc
        .fetch_userinfo(&tokens.access_token)
        .await
        .map_err(auth_to_app)?;
    let principal = state
        .providers
        .oidc
        .resolve_principal(&state.store, &info)
        .await
        .map_err(auth_to_app)?;

    let cookie = state.providers.session.issue(principal.id);
    let set_cookie = state.providers.session.set_cookie_header(&cookie);

    tracing::info!(email = %principal.email, "SSO login succeeded");

    let mut response = Redirect::temporary("/").into_response();
    response.headers_mut().insert(
        header::SET_COOKIE,
        set_cookie
            .parse()
            .map_err(|_| AppError::Internal(anyhow::anyhow!("invalid cookie header")))?,
    );
    Ok(response)
}

pub async fn sso_status(State(state): State<Arc<AppState>>) -> Json<Value> {
    let issuer = state
        .config
        .auth
        .oauth
        .enabled
        .then(|| state.config.auth.oauth.issuer.clone());
    Json(json!({
        "enabled": state.config.auth.oauth.enabled,
        "issuer": issuer,
    }))
}

fn auth_to_app(e: AuthError) -> AppError {
    match e {
        AuthError::EmailDomainNotAllowed => {
            AppError::Validation("email domain is not allowed".into())
        }
        AuthError::AccountDisabled | AuthError::AccountLocked => AppError::Forbidden,
        AuthError::ProviderUnavailable => {
            AppError::Internal(anyhow::anyhow!("identity provider unavailable"))
        }
        AuthError::InvalidCredentials => AppError::Unauthenticated,
    }
}

// ── Identity ─────────────────────────────────────────────────

pub async fn me(Extension(ctx): Extension<AuthContext>) -> Json<Value> {
    Json(json!({ "user": ctx.principal }))
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

/// `PUT /api/v1/auth/password` — local principals only.
pub async fn change_password(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<ChangePasswordRequest>,
) -> Result<Json<Value>, AppError> {
    if ctx.principal.provider != crate::models::principal::Provider::Local {
        return Err(AppError::Validation(
            "password is managed by the external identity provider".into(),
        ));
    }

    let current_hash = state
        .store
        .get_password_hash(ctx.principal.id)
        .await?
        .ok_or(AppError::Unauthenticated)?;
    if !state
        .providers
        .local
        .verify_password(&req.current_password, &current_hash)
        .await
    {
        return Err(AppError::Unauthenticated);
    }

    let new_hash = state.providers.local.hash_password(&req.new_password).await?;
    state.store.set_password_hash(ctx.principal.id, &new_hash).await?;
    tracing::info!(email = %ctx.principal.email, "password changed");
    Ok(Json(json!({ "status": "password_changed" })))
}

// ── API keys (self-service) ──────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateApiKeyRequest {
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

pub async fn create_api_key(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<CreateApiKeyRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    if let Some(expires_at) = req.expires_at {
        if expires_at <= Utc::now() {
            return Err(AppError::Validation("expires_at must be in the future".into()));
        }
    }

    // Prefix uniqueness among active keys is enforced by a partial unique
    // index; a losing concurrent create regenerates.
    for _ in 0..KEY_PREFIX_RETRIES {
        let token = apikey::generate_token();
        let prefix = apikey::key_prefix(&token)
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("generated malformed key")))?;
        let digest = apikey::hash_token(&token);

        match state
            .store
            .insert_api_key(ctx.principal.id, &prefix, &digest, req.expires_at)
            .await
        {
            Ok(id) => {
                return Ok((
                    StatusCode::CREATED,
                    Json(json!({
                        "id": id,
                        "api_key": token,
                        "key_prefix": prefix,
                        "expires_at": req.expires_at,
                    })),
                ));
            }
            Err(e) => {
                let conflict = matches!(
                    &e,
                    sqlx::Error::Database(db) if db.code().as_deref() == Some("23505")
                );
                if !conflict {
                    return Err(AppError::Database(e));
                }
                tracing::debug!("api key prefix collision, regenerating");
            }
        }
    }
    Err(AppError::Internal(anyhow::anyhow!(
        "could not allocate a unique api key prefix"
    )))
}

pub async fn list_api_keys(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<Value>, AppError> {
    let keys = state.store.list_api_keys(ctx.principal.id).await?;
    Ok(Json(json!({ "api_keys": keys })))
}

pub async fn revoke_api_key(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    axum::extract::Path(id): axum::extract::Path<Uuid>,
) -> Result<StatusCode, AppError> {
    if !state.store.revoke_api_key(id, ctx.principal.id).await? {
        return Err(AppError::NotFound);
    }
    Ok(StatusCode::NO_CONTENT)
}

// ── OAuth discovery documents ────────────────────────────────

/// RFC 9728 protected-resource metadata. Served only when OAuth is an
/// accepted MCP auth method — a 404 here steers clients to API keys.
pub async fn oauth_protected_resource(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, AppError> {
    if !state.config.auth.oauth.enabled || !state.config.auth.mcp_auth.oauth {
        return Err(AppError::NotFound);
    }
    Ok(Json(json!({
        "resource": state.config.auth.oauth.base_url,
        "authorization_servers": [state.config.auth.oauth.issuer],
        "bearer_methods_supported": ["header"],
    })))
}

/// Authorization-server metadata, proxied from the configured issuer with a
/// fallback to its OIDC discovery document.
pub async fn oauth_authorization_server(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, AppError> {
    if !state.config.auth.oauth.enabled {
        return Err(AppError::NotFound);
    }
    let issuer = state.config.auth.oauth.issuer.trim_end_matches('/');

    for path in [
        "/.well-known/oauth-authorization-server",
        "/.well-known/openid-configuration",
    ] {
        let url = format!("{}{}", issuer, path);
        match reqwest::get(&url).await {
            Ok(resp) if resp.status().is_success() => {
                let doc: Value = resp.json().await.map_err(|e| {
                    AppError::UpstreamProtocol(format!("issuer metadata parse failed: {}", e))
                })?;
                return Ok(Json(doc));
            }
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!("issuer metadata fetch failed: {}", e);
                continue;
            }
        }
    }
    Err(AppError::UpstreamError(
        "issuer did not serve authorization-server metadata".into(),
    ))
}
