use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Built-in role names. Custom roles are plain strings beyond these four.
pub const ROLE_ADMIN: &str = "admin";
pub const ROLE_OPERATOR: &str = "operator";
pub const ROLE_VIEWER: &str = "viewer";
pub const ROLE_USER: &str = "user";

pub const BUILT_IN_ROLES: [&str; 4] = [ROLE_ADMIN, ROLE_OPERATOR, ROLE_VIEWER, ROLE_USER];

/// Identity provider that produced a principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Local,
    Ldap,
    Oidc,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Local => "local",
            Provider::Ldap => "ldap",
            Provider::Oidc => "oidc",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "local" => Some(Provider::Local),
            "ldap" => Some(Provider::Ldap),
            "oidc" => Some(Provider::Oidc),
            _ => None,
        }
    }
}

/// Authenticated caller identity, uniform across every provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub id: Uuid,
    pub display_name: String,
    pub email: String,
    pub is_active: bool,
    pub provider: Provider,
    /// Provider-side identifier (LDAP DN, OIDC `sub`). Empty for local users.
    pub external_id: Option<String>,
    pub roles: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Principal {
    pub fn is_admin(&self) -> bool {
        self.roles.iter().any(|r| r == ROLE_ADMIN)
    }

    /// Synthetic admin injected when `auth.enabled = false`.
    pub fn synthetic_admin() -> Self {
        Principal {
            id: Uuid::nil(),
            display_name: "anonymous-admin".into(),
            email: "anonymous@localhost".into(),
            is_active: true,
            provider: Provider::Local,
            external_id: None,
            roles: vec![ROLE_ADMIN.to_string()],
            created_at: Utc::now(),
        }
    }
}

/// Role metadata row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    pub built_in: bool,
    pub description: Option<String>,
}

/// Self-service API key metadata (the token itself is shown once at issue).
#[derive(Debug, Clone, Serialize)]
pub struct ApiKeyMeta {
    pub id: Uuid,
    pub key_prefix: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

// ── Tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_roundtrip() {
        for p in [Provider::Local, Provider::Ldap, Provider::Oidc] {
            assert_eq!(Provider::parse(p.as_str()), Some(p));
        }
        assert_eq!(Provider::parse("saml"), None);
    }

    #[test]
    fn test_synthetic_admin_is_admin() {
        let p = Principal::synthetic_admin();
        assert!(p.is_admin());
        assert!(p.is_active);
        assert_eq!(p.id, Uuid::nil());
    }
}
