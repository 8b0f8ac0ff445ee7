//! Authentication pipeline — turns an inbound request into a [`Principal`].
//!
//! Providers form a closed variant set with a uniform contract; a
//! [`ProviderRegistry`] probes them in registration order against the
//! credential shape found on the request. `AccountLocked` and
//! `AccountDisabled` stop the chain; any other failure lets the next
//! matching provider run.

use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use thiserror::Error;

use crate::models::principal::Principal;
use crate::AppState;

pub mod apikey;
pub mod ldap;
pub mod local;
pub mod oidc;
pub mod policy;
pub mod rbac;
pub mod session;

/// Literal prefix carried by every gateway-issued API key token.
pub const API_KEY_PREFIX: &str = "mcpgw_";

/// Name of the signed browser session cookie.
pub const SESSION_COOKIE: &str = "mcp_session";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// Generic: wrong key, wrong password, unknown email. Never reveals
    /// which part was wrong.
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("account locked")]
    AccountLocked,

    #[error("account disabled")]
    AccountDisabled,

    /// The provider itself failed (LDAP unreachable, userinfo 5xx).
    #[error("provider unavailable")]
    ProviderUnavailable,

    #[error("email domain not allowed")]
    EmailDomainNotAllowed,
}

impl AuthError {
    /// Whether this failure terminates the provider chain.
    pub fn stops_chain(&self) -> bool {
        matches!(self, AuthError::AccountLocked | AuthError::AccountDisabled)
    }
}

/// How the caller authenticated. Gateway routes consult this against the
/// per-deployment `auth.mcp_auth` flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    ApiKey,
    Session,
    OidcBearer,
    /// `auth.enabled = false` — synthetic admin.
    Disabled,
}

/// Request extension produced by the auth middleware.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub principal: Principal,
    pub method: AuthMethod,
}

/// Credential shape pulled off the inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// `Authorization: Bearer mcpgw_…` or `X-API-Key`.
    ApiKey(String),
    /// Any other `Authorization: Bearer` token — opaque OIDC access token.
    Bearer(String),
    /// Signed `mcp_session` cookie value.
    SessionCookie(String),
}

/// Extract the credential from request headers. Precedence mirrors the
/// chain: explicit API key headers first, then bearer, then cookie.
pub fn extract_credential(headers: &axum::http::HeaderMap) -> Option<Credential> {
    if let Some(token) = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|t| !t.is_empty())
    {
        return Some(Credential::ApiKey(token.to_string()));
    }

    if let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = value.strip_prefix("Bearer ").map(str::trim) {
            if token.starts_with(API_KEY_PREFIX) {
                return Some(Credential::ApiKey(token.to_string()));
            }
            if !token.is_empty() {
                return Some(Credential::Bearer(token.to_string()));
            }
        }
    }

    if let Some(cookie_header) = headers.get(header::COOKIE).and_then(|v| v.to_str().ok()) {
        for pair in cookie_header.split(';') {
            if let Some((name, value)) = pair.trim().split_once('=') {
                if name == SESSION_COOKIE && !value.is_empty() {
                    return Some(Credential::SessionCookie(value.to_string()));
                }
            }
        }
    }

    None
}

/// The provider chain. Held on AppState, built once at startup.
pub struct ProviderRegistry {
    pub api_key: apikey::ApiKeyProvider,
    pub session: session::SessionProvider,
    pub oidc: oidc::OidcProvider,
    pub ldap: ldap::LdapProvider,
    pub local: local::LocalPasswordProvider,
}

impl ProviderRegistry {
    /// Resolve a header credential into a principal.
    pub async fn authenticate(
        &self,
        store: &crate::store::postgres::PgStore,
        credential: &Credential,
    ) -> Result<AuthContext, AuthError> {
        match credential {
            Credential::ApiKey(token) => {
                if !self.api_key.enabled {
                    return Err(AuthError::InvalidCredentials);
                }
                let principal = self.api_key.authenticate(store, token).await?;
                Ok(AuthContext {
                    principal,
                    method: AuthMethod::ApiKey,
                })
            }
            Credential::SessionCookie(value) => {
                if !self.session.enabled {
                    return Err(AuthError::InvalidCredentials);
                }
                let principal = self.session.authenticate(store, value).await?;
                Ok(AuthContext {
                    principal,
                    method: AuthMethod::Session,
                })
            }
            Credential::Bearer(token) => {
                if !self.oidc.enabled {
                    return Err(AuthError::InvalidCredentials);
                }
                let principal = self.oidc.authenticate(store, token).await?;
                Ok(AuthContext {
                    principal,
                    method: AuthMethod::OidcBearer,
                })
            }
        }
    }

    /// Login-endpoint path: try LDAP then local, in registration order.
    /// A chain-stopping failure from either is surfaced as-is.
    pub async fn authenticate_password(
        &self,
        store: &crate::store::postgres::PgStore,
        email: &str,
        password: &str,
    ) -> Result<Principal, AuthError> {
        let mut last = AuthError::InvalidCredentials;

        if self.ldap.enabled {
            match self.ldap.authenticate(store, email, password).await {
                Ok(p) => return Ok(p),
                Err(e) if e.stops_chain() => return Err(e),
                Err(e) => last = e,
            }
        }

        if self.local.enabled {
            match self.local.authenticate(store, email, password).await {
                Ok(p) => return Ok(p),
                Err(e) if e.stops_chain() => return Err(e),
                Err(e) => last = e,
            }
        }

        Err(last)
    }
}

/// Auth middleware for everything under `/api/v1` except the public routes.
/// Inserts an [`AuthContext`] extension or short-circuits with 401/403.
pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    if !state.config.auth.enabled {
        req.extensions_mut().insert(AuthContext {
            principal: Principal::synthetic_admin(),
            method: AuthMethod::Disabled,
        });
        return next.run(req).await;
    }

    let Some(credential) = extract_credential(req.headers()) else {
        return crate::errors::AppError::Unauthenticated.into_response();
    };

    let was_session = matches!(credential, Credential::SessionCookie(_));
    match state.providers.authenticate(&state.store, &credential).await {
        Ok(ctx) => {
            req.extensions_mut().insert(ctx);
            next.run(req).await
        }
        // Locked/disabled surfaces as 403 only once the caller held a real
        // session; pre-auth it stays 401 to avoid account enumeration.
        Err(e) if e.stops_chain() && was_session => {
            crate::errors::AppError::Forbidden.into_response()
        }
        Err(_) => crate::errors::AppError::Unauthenticated.into_response(),
    }
}

// ── Tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(
                axum::http::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                v.parse().unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_bearer_with_prefix_is_api_key() {
        let h = headers(&[("authorization", "Bearer mcpgw_abc123")]);
        assert_eq!(
            extract_credential(&h),
            Some(Credential::ApiKey("mcpgw_abc123".into()))
        );
    }

    #[test]
    fn test_bearer_without_prefix_is_oidc() {
        let h = headers(&[("authorization", "Bearer eyJhbGciOi")]);
        assert_eq!(
            extract_credential(&h),
            Some(Credential::Bearer("eyJhbGciOi".into()))
        );
    }

    #[test]
    fn test_x_api_key_header() {
        let h = headers(&[("x-api-key", "mcpgw_zzz")]);
        assert_eq!(
            extract_credential(&h),
            Some(Credential::ApiKey("mcpgw_zzz".into()))
        );
    }

    #[test]
    fn test_x_api_key_takes_precedence_over_bearer() {
        let h = headers(&[
            ("x-api-key", "mcpgw_first"),
            ("authorization", "Bearer second"),
        ]);
        assert_eq!(
            extract_credential(&h),
            Some(Credential::ApiKey("mcpgw_first".into()))
        );
    }

    #[test]
    fn test_session_cookie_extracted() {
        let h = headers(&[("cookie", "theme=dark; mcp_session=abc.def.ghi; other=1")]);
        assert_eq!(
            extract_credential(&h),
            Some(Credential::SessionCookie("abc.def.ghi".into()))
        );
    }

    #[test]
    fn test_no_credential() {
        let h = headers(&[("cookie", "theme=dark")]);
        assert_eq!(extract_credential(&h), None);
        assert_eq!(extract_credential(&HeaderMap::new()), None);
    }

    #[test]
    fn test_chain_stop_classification() {
        assert!(AuthError::AccountLocked.stops_chain());
        assert!(AuthError::AccountDisabled.stops_chain());
        assert!(!AuthError::InvalidCredentials.stops_chain());
        assert!(!AuthError::ProviderUnavailable.stops_chain());
        assert!(!AuthError::EmailDomainNotAllowed.stops_chain());
    }
}
