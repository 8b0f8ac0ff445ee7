//! OIDC integration — opaque bearer tokens validated against the issuer's
//! userinfo endpoint, plus the browser SSO (authorization-code) flow.
//!
//! The gateway does not verify JWTs locally: whatever the client presents
//! is sent to the configured provider's userinfo endpoint, and a 2xx with a
//! `sub` claim is the proof of validity. Discovery is fetched once from
//! `.well-known/openid-configuration` and cached for the process lifetime.

use serde::Deserialize;
use std::time::Duration;
use tokio::sync::OnceCell;

use super::AuthError;
use crate::config::OAuthConfig;
use crate::models::principal::{Principal, Provider};
use crate::store::postgres::PgStore;

/// OpenID Connect Discovery document (subset of fields we need).
#[derive(Debug, Clone, Deserialize)]
pub struct OidcDiscovery {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub userinfo_endpoint: String,
    #[serde(default)]
    pub jwks_uri: Option<String>,
}

/// Claims returned by the userinfo endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct UserInfo {
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub preferred_username: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
}

pub struct OidcProvider {
    pub enabled: bool,
    config: OAuthConfig,
    http: reqwest::Client,
    discovery: OnceCell<OidcDiscovery>,
}

impl OidcProvider {
    pub fn new(config: &OAuthConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .expect("failed to build HTTP client");
        Self {
            enabled: config.enabled,
            config: config.clone(),
            http,
            discovery: OnceCell::new(),
        }
    }

    /// Fetch (and cache) the issuer's discovery document.
    pub async fn discovery(&self) -> Result<&OidcDiscovery, AuthError> {
        self.discovery
            .get_or_try_init(|| async {
                let url = format!(
                    "{}/.well-known/openid-configuration",
                    self.config.issuer.trim_end_matches('/')
                );
                tracing::info!(url = %url, "OIDC discovery");
                let resp = self.http.get(&url).send().await.map_err(|e| {
                    tracing::warn!("OIDC discovery failed: {}", e);
                    AuthError::ProviderUnavailable
                })?;
                resp.json::<OidcDiscovery>().await.map_err(|e| {
                    tracing::warn!("OIDC discovery parse failed: {}", e);
                    AuthError::ProviderUnavailable
                })
            })
            .await
    }

    /// Validate an opaque access token via userinfo and resolve a principal.
    pub async fn authenticate(
        &self,
        store: &PgStore,
        access_token: &str,
    ) -> Result<Principal, AuthError> {
        let info = self.fetch_userinfo(access_token).await?;
        self.resolve_principal(store, &info).await
    }

    pub async fn fetch_userinfo(&self, access_token: &str) -> Result<UserInfo, AuthError> {
        let discovery = self.discovery().await?;
        let resp = self
            .http
            .get(&discovery.userinfo_endpoint)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!("userinfo request failed: {}", e);
                AuthError::ProviderUnavailable
            })?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(AuthError::InvalidCredentials);
        }
        if !status.is_success() {
            tracing::warn!(status = %status, "userinfo endpoint returned error");
            return Err(AuthError::ProviderUnavailable);
        }

        resp.json::<UserInfo>().await.map_err(|e| {
            tracing::warn!("userinfo parse failed: {}", e);
            AuthError::ProviderUnavailable
        })
    }

    /// Map userinfo claims onto a stored principal, auto-creating when
    /// allowed. Principals are keyed by the provider-side `sub`.
    pub async fn resolve_principal(
        &self,
        store: &PgStore,
        info: &UserInfo,
    ) -> Result<Principal, AuthError> {
        let existing = store
            .get_principal_by_external_id(Provider::Oidc, &info.sub)
            .await
            .map_err(|e| {
                tracing::error!("oidc principal lookup failed: {}", e);
                AuthError::ProviderUnavailable
            })?;

        if let Some(principal) = existing {
            if !principal.is_active {
                return Err(AuthError::AccountDisabled);
            }
            return Ok(principal);
        }

        if !self.config.auto_create_users {
            return Err(AuthError::InvalidCredentials);
        }

        let email = info
            .email
            .as_deref()
            .ok_or(AuthError::InvalidCredentials)?
            .to_lowercase();
        if !domain_allowed(&email, &self.config.allowed_domains) {
            return Err(AuthError::EmailDomainNotAllowed);
        }

        let display_name = info
            .name
            .clone()
            .or_else(|| info.preferred_username.clone())
            .unwrap_or_else(|| email.clone());
        let roles = vec![self.config.default_role.clone()];

        let principal = store
            .upsert_external_principal(Provider::Oidc, &info.sub, &email, &display_name, &roles)
            .await
            .map_err(|e| {
                tracing::error!("oidc principal create failed: {}", e);
                AuthError::ProviderUnavailable
            })?;

        tracing::info!(email = %email, sub = %info.sub, "auto-created OIDC principal");
        Ok(principal)
    }

    /// Build the authorization-code redirect URL for browser SSO.
    pub async fn authorize_url(&self, state: &str) -> Result<String, AuthError> {
        let discovery = self.discovery().await?;
        let redirect_uri = self.redirect_uri();
        let mut url =
            url::Url::parse(&discovery.authorization_endpoint).map_err(|_| {
                AuthError::ProviderUnavailable
            })?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &redirect_uri)
            .append_pair("scope", &self.config.scopes.join(" "))
            .append_pair("state", state);
        Ok(url.into())
    }

    /// Exchange an authorization code for an access token (SSO callback).
    pub async fn exchange_code(&self, code: &str) -> Result<TokenResponse, AuthError> {
        let discovery = self.discovery().await?;
        let redirect_uri = self.redirect_uri();
        let resp = self
            .http
            .post(&discovery.token_endpoint)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", &redirect_uri),
                ("client_id", &self.config.client_id),
                ("client_secret", &self.config.client_secret),
            ])
            .send()
            .await
            .map_err(|e| {
                tracing::warn!("token exchange failed: {}", e);
                AuthError::ProviderUnavailable
            })?;

        if !resp.status().is_success() {
            tracing::warn!(status = %resp.status(), "token endpoint rejected code");
            return Err(AuthError::InvalidCredentials);
        }
        resp.json::<TokenResponse>().await.map_err(|e| {
            tracing::warn!("token response parse failed: {}", e);
            AuthError::ProviderUnavailable
        })
    }

    pub fn redirect_uri(&self) -> String {
        format!(
            "{}/api/v1/auth/sso/callback",
            self.config.base_url.trim_end_matches('/')
        )
    }

    pub fn issuer(&self) -> &str {
        &self.config.issuer
    }
}

/// Empty allowlist admits every domain.
pub fn domain_allowed(email: &str, allowed: &[String]) -> bool {
    if allowed.is_empty() {
        return true;
    }
    let Some((_, domain)) = email.rsplit_once('@') else {
        return false;
    };
    allowed.iter().any(|d| d.eq_ignore_ascii_case(domain))
}

// ── Tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_allowlist_admits_all() {
        assert!(domain_allowed("a@anything.io", &[]));
    }

    #[test]
    fn test_allowlist_match_case_insensitive() {
        let allowed = vec!["example.com".to_string()];
        assert!(domain_allowed("a@example.com", &allowed));
        assert!(domain_allowed("a@EXAMPLE.COM", &allowed));
        assert!(!domain_allowed("a@other.com", &allowed));
    }

    #[test]
    fn test_mailless_string_rejected_when_allowlisted() {
        let allowed = vec!["example.com".to_string()];
        assert!(!domain_allowed("not-an-email", &allowed));
    }

    #[test]
    fn test_redirect_uri_strips_trailing_slash() {
        let provider = OidcProvider::new(&OAuthConfig {
            enabled: true,
            issuer: "https://idp.example.com".into(),
            client_id: "gw".into(),
            client_secret: "s".into(),
            base_url: "https://gw.example.com/".into(),
            scopes: vec!["openid".into()],
            default_role: "user".into(),
            auto_create_users: true,
            allowed_domains: vec![],
        });
        assert_eq!(
            provider.redirect_uri(),
            "https://gw.example.com/api/v1/auth/sso/callback"
        );
    }
}
