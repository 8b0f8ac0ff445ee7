//! LDAP provider — service-account search followed by a rebind as the
//! found entry.
//!
//! TLS is implied by `ldaps://`; plain `ldap://` may opt into StartTLS via
//! config. Group DNs from `memberOf` map to gateway roles; unmapped users
//! get the configured default role.

use ldap3::{LdapConnAsync, LdapConnSettings, Scope, SearchEntry};

use super::AuthError;
use crate::config::LdapConfig;
use crate::models::principal::{Principal, Provider};
use crate::store::postgres::PgStore;

pub struct LdapProvider {
    pub enabled: bool,
    config: LdapConfig,
}

impl LdapProvider {
    pub fn new(config: &LdapConfig) -> Self {
        Self {
            enabled: config.enabled,
            config: config.clone(),
        }
    }

    pub async fn authenticate(
        &self,
        store: &PgStore,
        login: &str,
        password: &str,
    ) -> Result<Principal, AuthError> {
        // Empty passwords would turn the rebind into an anonymous bind that
        // "succeeds" on most directories.
        if password.is_empty() {
            return Err(AuthError::InvalidCredentials);
        }

        let settings = LdapConnSettings::new().set_starttls(self.config.start_tls);
        let (conn, mut ldap) = LdapConnAsync::with_settings(settings, &self.config.url)
            .await
            .map_err(|e| {
                tracing::warn!("ldap connect failed: {}", e);
                AuthError::ProviderUnavailable
            })?;
        ldap3::drive!(conn);

        // Service-account bind for the search.
        ldap.simple_bind(&self.config.bind_dn, &self.config.bind_password)
            .await
            .and_then(|r| r.success())
            .map_err(|e| {
                tracing::warn!("ldap service bind failed: {}", e);
                AuthError::ProviderUnavailable
            })?;

        let filter = self
            .config
            .user_filter
            .replace("{login}", &ldap3::ldap_escape(login));
        let (entries, _) = ldap
            .search(
                &self.config.search_base,
                Scope::Subtree,
                &filter,
                vec!["cn", "displayName", "mail", "memberOf"],
            )
            .await
            .and_then(|r| r.success())
            .map_err(|e| {
                tracing::warn!("ldap search failed: {}", e);
                AuthError::ProviderUnavailable
            })?;

        let entry = match entries.into_iter().next() {
            Some(e) => SearchEntry::construct(e),
            None => {
                let _ = ldap.unbind().await;
                return Err(AuthError::InvalidCredentials);
            }
        };

        // Rebind as the found DN with the supplied password — the actual
        // credential check.
        let bound = ldap
            .simple_bind(&entry.dn, password)
            .await
            .and_then(|r| r.success());
        let _ = ldap.unbind().await;
        if bound.is_err() {
            return Err(AuthError::InvalidCredentials);
        }

        let display_name = first_attr(&entry, "displayName")
            .or_else(|| first_attr(&entry, "cn"))
            .unwrap_or_else(|| login.to_string());
        let email = first_attr(&entry, "mail")
            .unwrap_or_else(|| login.to_string())
            .to_lowercase();
        let roles = self.map_groups(entry.attrs.get("memberOf").map(Vec::as_slice).unwrap_or(&[]));

        let principal = store
            .upsert_external_principal(Provider::Ldap, &entry.dn, &email, &display_name, &roles)
            .await
            .map_err(|e| {
                tracing::error!("ldap principal upsert failed: {}", e);
                AuthError::ProviderUnavailable
            })?;

        if !principal.is_active {
            return Err(AuthError::AccountDisabled);
        }
        Ok(principal)
    }

    /// Map `memberOf` DNs to gateway roles; fall back to the default role.
    fn map_groups(&self, groups: &[String]) -> Vec<String> {
        let mut roles: Vec<String> = groups
            .iter()
            .filter_map(|dn| self.config.group_role_mapping.get(dn.as_str()))
            .cloned()
            .collect();
        roles.sort();
        roles.dedup();
        if roles.is_empty() {
            roles.push(self.config.default_role.clone());
        }
        roles
    }
}

fn first_attr(entry: &SearchEntry, name: &str) -> Option<String> {
    entry.attrs.get(name).and_then(|v| v.first()).cloned()
}

// ── Tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn provider_with_mapping(mapping: HashMap<String, String>) -> LdapProvider {
        LdapProvider::new(&LdapConfig {
            enabled: true,
            url: "ldaps://directory.example.com".into(),
            start_tls: false,
            bind_dn: "cn=svc,dc=example,dc=com".into(),
            bind_password: "secret".into(),
            search_base: "ou=people,dc=example,dc=com".into(),
            user_filter: "(mail={login})".into(),
            group_role_mapping: mapping,
            default_role: "user".into(),
        })
    }

    #[test]
    fn test_group_mapping_applies() {
        let mut mapping = HashMap::new();
        mapping.insert("cn=gw-admins,ou=groups,dc=example,dc=com".to_string(), "admin".to_string());
        mapping.insert("cn=gw-ops,ou=groups,dc=example,dc=com".to_string(), "operator".to_string());
        let p = provider_with_mapping(mapping);

        let roles = p.map_groups(&[
            "cn=gw-admins,ou=groups,dc=example,dc=com".to_string(),
            "cn=unrelated,ou=groups,dc=example,dc=com".to_string(),
        ]);
        assert_eq!(roles, vec!["admin"]);
    }

    #[test]
    fn test_unmapped_user_gets_default_role() {
        let p = provider_with_mapping(HashMap::new());
        let roles = p.map_groups(&["cn=whatever,dc=example,dc=com".to_string()]);
        assert_eq!(roles, vec!["user"]);
        assert_eq!(p.map_groups(&[]), vec!["user"]);
    }

    #[test]
    fn test_duplicate_roles_deduped() {
        let mut mapping = HashMap::new();
        mapping.insert("cn=a,dc=x".to_string(), "operator".to_string());
        mapping.insert("cn=b,dc=x".to_string(), "operator".to_string());
        let p = provider_with_mapping(mapping);
        let roles = p.map_groups(&["cn=a,dc=x".to_string(), "cn=b,dc=x".to_string()]);
        assert_eq!(roles, vec!["operator"]);
    }

    #[test]
    fn test_filter_substitution_escapes_login() {
        // ldap_escape neutralises filter metacharacters before substitution.
        let escaped = ldap3::ldap_escape("admin)(objectClass=*");
        assert!(!escaped.contains('('));
        assert!(!escaped.contains(')'));
    }
}
