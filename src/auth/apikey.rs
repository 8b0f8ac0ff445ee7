//! API-key provider.
//!
//! Tokens are `mcpgw_` + 40 random alphanumerics, shown once at issue time.
//! Only the SHA-256 digest and the deterministic 12-char prefix are stored;
//! lookup goes through the prefix index and the digest comparison is
//! constant-time.

use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use super::{AuthError, API_KEY_PREFIX};
use crate::models::principal::Principal;
use crate::store::postgres::PgStore;

/// Length of the stored lookup prefix, including `mcpgw_`.
pub const PREFIX_LEN: usize = 12;

const TOKEN_RANDOM_LEN: usize = 40;

pub struct ApiKeyProvider {
    pub enabled: bool,
}

impl ApiKeyProvider {
    pub async fn authenticate(
        &self,
        store: &PgStore,
        token: &str,
    ) -> Result<Principal, AuthError> {
        let Some(prefix) = key_prefix(token) else {
            return Err(AuthError::InvalidCredentials);
        };
        let digest = hash_token(token);

        let candidates = store
            .find_api_keys_by_prefix(&prefix)
            .await
            .map_err(|e| {
                tracing::error!("api key lookup failed: {}", e);
                AuthError::ProviderUnavailable
            })?;

        for cred in candidates {
            if !constant_time_eq(&cred.material, &digest) {
                continue;
            }
            if let Some(expires_at) = cred.expires_at {
                if expires_at < chrono::Utc::now() {
                    return Err(AuthError::InvalidCredentials);
                }
            }
            let principal = store
                .get_principal(cred.principal_id)
                .await
                .map_err(|e| {
                    tracing::error!("principal lookup failed: {}", e);
                    AuthError::ProviderUnavailable
                })?
                .ok_or(AuthError::InvalidCredentials)?;
            if !principal.is_active {
                return Err(AuthError::AccountDisabled);
            }
            return Ok(principal);
        }

        Err(AuthError::InvalidCredentials)
    }
}

/// Generate a fresh token. Returned in full exactly once.
pub fn generate_token() -> String {
    let random: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_RANDOM_LEN)
        .map(char::from)
        .collect();
    format!("{}{}", API_KEY_PREFIX, random)
}

/// Deterministic lookup prefix: the first [`PREFIX_LEN`] chars of the token.
/// `None` when the token is malformed.
pub fn key_prefix(token: &str) -> Option<String> {
    if !token.starts_with(API_KEY_PREFIX) || token.len() < PREFIX_LEN {
        return None;
    }
    Some(token[..PREFIX_LEN].to_string())
}

/// Hex SHA-256 of the full token — the only stored material.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

// ── Tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_token_shape() {
        let token = generate_token();
        assert!(token.starts_with(API_KEY_PREFIX));
        assert_eq!(token.len(), API_KEY_PREFIX.len() + TOKEN_RANDOM_LEN);
    }

    #[test]
    fn test_prefix_is_deterministic() {
        let token = "mcpgw_abcdefghij1234567890";
        assert_eq!(key_prefix(token).unwrap(), "mcpgw_abcdef");
        assert_eq!(key_prefix(token), key_prefix(token));
    }

    #[test]
    fn test_prefix_rejects_foreign_tokens() {
        assert!(key_prefix("sk-ant-something").is_none());
        assert!(key_prefix("mcpgw_").is_none()); // too short
    }

    #[test]
    fn test_hash_is_stable_and_hex() {
        let h1 = hash_token("mcpgw_test");
        let h2 = hash_token("mcpgw_test");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
        assert!(h1.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(hash_token("mcpgw_other"), h1);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "abcd"));
    }

    #[test]
    fn test_two_tokens_differ() {
        assert_ne!(generate_token(), generate_token());
    }
}
