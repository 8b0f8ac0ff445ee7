//! Signed browser session cookie.
//!
//! The cookie value is `base64url(principal_id:expires_unix) . base64url(hmac)`,
//! HMAC-SHA256 over the payload with the configured session secret. No
//! server-side session table: the cookie is self-contained and the principal
//! row is re-checked on every request.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use super::{AuthError, SESSION_COOKIE};
use crate::models::principal::Principal;
use crate::store::postgres::PgStore;

type HmacSha256 = Hmac<Sha256>;

pub struct SessionProvider {
    pub enabled: bool,
    secret: Vec<u8>,
    ttl_seconds: i64,
    secure: bool,
    same_site: String,
}

impl SessionProvider {
    pub fn new(secret: &str, ttl_seconds: i64, secure: bool, same_site: &str) -> Self {
        Self {
            enabled: true,
            secret: secret.as_bytes().to_vec(),
            ttl_seconds,
            secure,
            same_site: same_site.to_string(),
        }
    }

    /// Issue a cookie value for a freshly logged-in principal.
    pub fn issue(&self, principal_id: Uuid) -> String {
        let expires = chrono::Utc::now().timestamp() + self.ttl_seconds;
        let payload = format!("{}:{}", principal_id, expires);
        let encoded = URL_SAFE_NO_PAD.encode(payload.as_bytes());
        let sig = self.sign(&encoded);
        format!("{}.{}", encoded, sig)
    }

    pub async fn authenticate(
        &self,
        store: &PgStore,
        cookie_value: &str,
    ) -> Result<Principal, AuthError> {
        let principal_id = self.verify(cookie_value)?;

        let principal = store
            .get_principal(principal_id)
            .await
            .map_err(|e| {
                tracing::error!("session principal lookup failed: {}", e);
                AuthError::ProviderUnavailable
            })?
            .ok_or(AuthError::InvalidCredentials)?;

        if !principal.is_active {
            return Err(AuthError::AccountDisabled);
        }
        Ok(principal)
    }

    /// Verify signature and expiry; returns the embedded principal id.
    pub fn verify(&self, cookie_value: &str) -> Result<Uuid, AuthError> {
        let (encoded, sig) = cookie_value
            .split_once('.')
            .ok_or(AuthError::InvalidCredentials)?;

        let expected = self.sign(encoded);
        let sig_ok: bool = sig.as_bytes().ct_eq(expected.as_bytes()).into();
        if !sig_ok {
            return Err(AuthError::InvalidCredentials);
        }

        let payload = URL_SAFE_NO_PAD
            .decode(encoded)
            .ok()
            .and_then(|b| String::from_utf8(b).ok())
            .ok_or(AuthError::InvalidCredentials)?;
        let (id_str, expires_str) = payload
            .split_once(':')
            .ok_or(AuthError::InvalidCredentials)?;

        let expires: i64 = expires_str.parse().map_err(|_| AuthError::InvalidCredentials)?;
        if expires < chrono::Utc::now().timestamp() {
            return Err(AuthError::InvalidCredentials);
        }

        id_str.parse().map_err(|_| AuthError::InvalidCredentials)
    }

    /// `Set-Cookie` header value for a login response.
    pub fn set_cookie_header(&self, cookie_value: &str) -> String {
        let mut parts = vec![
            format!("{}={}", SESSION_COOKIE, cookie_value),
            "Path=/".to_string(),
            "HttpOnly".to_string(),
            format!("Max-Age={}", self.ttl_seconds),
            format!("SameSite={}", capitalize(&self.same_site)),
        ];
        if self.secure {
            parts.push("Secure".to_string());
        }
        parts.join("; ")
    }

    /// `Set-Cookie` header value that clears the session on logout.
    pub fn clear_cookie_header(&self) -> String {
        let mut parts = vec![
            format!("{}=", SESSION_COOKIE),
            "Path=/".to_string(),
            "HttpOnly".to_string(),
            "Max-Age=0".to_string(),
            format!("SameSite={}", capitalize(&self.same_site)),
        ];
        if self.secure {
            parts.push("Secure".to_string());
        }
        parts.join("; ")
    }

    fn sign(&self, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key size");
        mac.update(payload.as_bytes());
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

// ── Tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> SessionProvider {
        SessionProvider::new("test-secret", 3600, false, "lax")
    }

    #[test]
    fn test_issue_verify_roundtrip() {
        let p = provider();
        let id = Uuid::new_v4();
        let cookie = p.issue(id);
        assert_eq!(p.verify(&cookie).unwrap(), id);
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let p = provider();
        let cookie = p.issue(Uuid::new_v4());
        let (payload, sig) = cookie.split_once('.').unwrap();
        let other = URL_SAFE_NO_PAD.encode(format!("{}:{}", Uuid::new_v4(), i64::MAX));
        let forged = format!("{}.{}", other, sig);
        assert_eq!(p.verify(&forged), Err(AuthError::InvalidCredentials));
        let _ = payload;
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let cookie = provider().issue(Uuid::new_v4());
        let other = SessionProvider::new("different-secret", 3600, false, "lax");
        assert_eq!(other.verify(&cookie), Err(AuthError::InvalidCredentials));
    }

    #[test]
    fn test_expired_cookie_rejected() {
        let p = SessionProvider::new("test-secret", -10, false, "lax");
        let cookie = p.issue(Uuid::new_v4());
        assert_eq!(p.verify(&cookie), Err(AuthError::InvalidCredentials));
    }

    #[test]
    fn test_malformed_values_rejected() {
        let p = provider();
        assert!(p.verify("").is_err());
        assert!(p.verify("no-dot-here").is_err());
        assert!(p.verify("a.b").is_err());
    }

    #[test]
    fn test_cookie_attributes() {
        let p = SessionProvider::new("s", 3600, true, "strict");
        let header = p.set_cookie_header("value");
        assert!(header.starts_with("mcp_session=value"));
        assert!(header.contains("HttpOnly"));
        assert!(header.contains("Secure"));
        assert!(header.contains("SameSite=Strict"));
        assert!(header.contains("Max-Age=3600"));
    }

    #[test]
    fn test_clear_cookie_expires_immediately() {
        let header = provider().clear_cookie_header();
        assert!(header.contains("Max-Age=0"));
        assert!(header.starts_with("mcp_session=;"));
    }
}
