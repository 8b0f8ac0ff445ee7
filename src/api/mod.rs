//! Management REST surface.
//!
//! Route layout is split by trust level: `public_router` carries the login
//! and status endpoints, `protected_router` everything behind the auth
//! middleware and the path-verb policy gate.

use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, delete, get, patch, post, put};
use axum::Router;
use std::sync::Arc;

use crate::auth::AuthContext;
use crate::errors::AppError;
use crate::AppState;

pub mod auth_handlers;
pub mod handlers;

/// Routes reachable without a credential.
pub fn public_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/status", get(auth_handlers::status))
        .route("/auth/login", post(auth_handlers::login))
        .route("/auth/sso", get(auth_handlers::sso_start))
        .route("/auth/sso/callback", get(auth_handlers::sso_callback))
        .route("/auth/sso/status", get(auth_handlers::sso_status))
}

/// Routes behind authentication and the path-verb policy.
pub fn protected_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        // identity & session
        .route("/auth/logout", post(auth_handlers::logout))
        .route("/auth/password", put(auth_handlers::change_password))
        .route("/me", get(auth_handlers::me))
        // backend registry
        .route(
            "/servers",
            get(handlers::list_servers).post(handlers::create_server),
        )
        .route("/servers/test-connection", post(handlers::test_connection))
        .route("/servers/call-tool", post(crate::proxy::handler::call_tool))
        .route(
            "/servers/:id",
            get(handlers::get_server)
                .put(handlers::update_server)
                .delete(handlers::delete_server),
        )
        .route("/servers/:id/toggle", patch(handlers::toggle_server))
        .route(
            "/servers/:id/health",
            get(handlers::get_server_health).post(handlers::probe_server_health),
        )
        // proxy subtree
        .route("/gateway/:server_id", any(crate::proxy::handler::gateway_raw))
        .route(
            "/gateway/:server_id/*op",
            any(crate::proxy::handler::gateway_rest),
        )
        // namespaces
        .route(
            "/namespaces",
            get(handlers::list_namespaces).post(handlers::create_namespace),
        )
        .route(
            "/namespaces/:id",
            get(handlers::get_namespace).delete(handlers::delete_namespace),
        )
        .route(
            "/namespaces/:id/servers",
            get(handlers::list_namespace_servers).post(handlers::add_namespace_server),
        )
        .route(
            "/namespaces/:id/servers/:backend_id",
            delete(handlers::remove_namespace_server),
        )
        .route(
            "/namespaces/:id/access",
            get(handlers::list_namespace_access).post(handlers::set_namespace_access),
        )
        .route(
            "/namespaces/:id/access/:role",
            delete(handlers::clear_namespace_access),
        )
        // self-service API keys
        .route(
            "/api-keys",
            get(auth_handlers::list_api_keys).post(auth_handlers::create_api_key),
        )
        .route("/api-keys/:id", delete(auth_handlers::revoke_api_key))
        // principal administration
        .route("/users", get(handlers::list_users).post(handlers::create_user))
        .route("/users/:id/toggle", patch(handlers::toggle_user))
        // audit
        .route("/audit/logs", get(handlers::list_audit_logs))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            enforce_policy,
        ))
        .layer(middleware::from_fn_with_state(
            state,
            crate::auth::require_auth,
        ))
}

/// Path-verb policy gate. Runs after authentication; knows nothing about
/// backend identity.
pub async fn enforce_policy(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let Some(ctx) = req.extensions().get::<AuthContext>() else {
        return AppError::Unauthenticated.into_response();
    };

    let path = req
        .extensions()
        .get::<axum::extract::OriginalUri>()
        .map(|uri| uri.path().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());

    if !state
        .policy
        .allows(&ctx.principal.roles, &path, req.method().as_str())
    {
        tracing::warn!(
            principal = %ctx.principal.email,
            path = %path,
            verb = %req.method(),
            "path-verb policy denied"
        );
        return AppError::Forbidden.into_response();
    }

    next.run(req).await
}
