//! Path-verb authorization — decides whether a verb is allowed on a route
//! at all. Backend identity is the resource-RBAC engine's job, not this one.
//!
//! Patterns support single-segment wildcards (`/api/v1/servers/*`) and a
//! terminal `/**` catch-all. Role inheritance is linear: admin ⊒ operator ⊒
//! viewer ⊒ user, permissions accruing down the chain. Evaluation allows on
//! the first matching rule; default is deny.

use std::sync::RwLock;

/// Linear role chain, strongest first.
const ROLE_CHAIN: [&str; 4] = ["admin", "operator", "viewer", "user"];

#[derive(Debug, Clone)]
pub struct PolicyRule {
    pub role: String,
    pub pattern: String,
    /// HTTP verb or `*`.
    pub verb: String,
}

impl PolicyRule {
    fn new(role: &str, pattern: &str, verb: &str) -> Self {
        Self {
            role: role.to_string(),
            pattern: pattern.to_string(),
            verb: verb.to_string(),
        }
    }
}

pub struct PolicyEngine {
    rules: RwLock<Vec<PolicyRule>>,
}

impl PolicyEngine {
    pub fn new(rules: Vec<PolicyRule>) -> Self {
        Self {
            rules: RwLock::new(rules),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(default_rules())
    }

    /// Replace the rule table (admin-triggered reload).
    pub fn reload(&self, rules: Vec<PolicyRule>) {
        *self.rules.write().expect("policy lock poisoned") = rules;
    }

    /// First-match allow across the caller's expanded role set.
    pub fn allows(&self, roles: &[String], path: &str, verb: &str) -> bool {
        let effective = expand_roles(roles);
        let rules = self.rules.read().expect("policy lock poisoned");
        rules.iter().any(|rule| {
            effective.iter().any(|r| r == &rule.role)
                && verb_matches(&rule.verb, verb)
                && pattern_matches(&rule.pattern, path)
        })
    }
}

/// Expand roles through the linear chain: holding a role grants every rule
/// written for that role or any weaker one.
pub fn expand_roles(roles: &[String]) -> Vec<String> {
    let mut effective: Vec<String> = Vec::new();
    for role in roles {
        match ROLE_CHAIN.iter().position(|r| r == role) {
            Some(idx) => {
                for weaker in &ROLE_CHAIN[idx..] {
                    if !effective.iter().any(|r| r == weaker) {
                        effective.push(weaker.to_string());
                    }
                }
            }
            // Custom roles sit outside the chain and match only themselves.
            None => {
                if !effective.iter().any(|r| r == role) {
                    effective.push(role.clone());
                }
            }
        }
    }
    effective
}

fn verb_matches(rule_verb: &str, verb: &str) -> bool {
    rule_verb == "*" || rule_verb.eq_ignore_ascii_case(verb)
}

/// Segment-wise match: `*` matches exactly one segment, a terminal `**`
/// matches any remainder (including none).
pub fn pattern_matches(pattern: &str, path: &str) -> bool {
    let pattern_segments: Vec<&str> = pattern.trim_matches('/').split('/').collect();
    let path_segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    let mut pi = 0;
    for (i, seg) in pattern_segments.iter().enumerate() {
        if *seg == "**" {
            // Terminal catch-all; anything deeper matches.
            return i == pattern_segments.len() - 1;
        }
        match path_segments.get(pi) {
            Some(p) if *seg == "*" || seg == p => pi += 1,
            _ => return false,
        }
    }
    pi == path_segments.len()
}

/// Built-in policy table. The chain means each tier only lists what it adds
/// over the tier below.
pub fn default_rules() -> Vec<PolicyRule> {
    vec![
        // user: proxy calls, own identity, own keys
        PolicyRule::new("user", "/api/v1/gateway/**", "*"),
        PolicyRule::new("user", "/api/v1/me", "GET"),
        PolicyRule::new("user", "/api/v1/auth/password", "PUT"),
        PolicyRule::new("user", "/api/v1/auth/logout", "POST"),
        PolicyRule::new("user", "/api/v1/api-keys", "GET"),
        PolicyRule::new("user", "/api/v1/api-keys", "POST"),
        PolicyRule::new("user", "/api/v1/api-keys/*", "DELETE"),
        PolicyRule::new("user", "/api/v1/servers", "GET"),
        PolicyRule::new("user", "/api/v1/servers/*", "GET"),
        // viewer: read-only management surface
        PolicyRule::new("viewer", "/api/v1/servers/*/health", "GET"),
        PolicyRule::new("viewer", "/api/v1/namespaces", "GET"),
        PolicyRule::new("viewer", "/api/v1/namespaces/*", "GET"),
        PolicyRule::new("viewer", "/api/v1/namespaces/*/servers", "GET"),
        PolicyRule::new("viewer", "/api/v1/namespaces/*/access", "GET"),
        PolicyRule::new("viewer", "/api/v1/audit/logs", "GET"),
        // operator: server + namespace management, probes
        PolicyRule::new("operator", "/api/v1/servers", "POST"),
        PolicyRule::new("operator", "/api/v1/servers/*", "PUT"),
        PolicyRule::new("operator", "/api/v1/servers/*", "DELETE"),
        PolicyRule::new("operator", "/api/v1/servers/*/toggle", "PATCH"),
        PolicyRule::new("operator", "/api/v1/servers/*/health", "POST"),
        PolicyRule::new("operator", "/api/v1/servers/test-connection", "POST"),
        PolicyRule::new("operator", "/api/v1/servers/call-tool", "POST"),
        PolicyRule::new("operator", "/api/v1/namespaces", "POST"),
        PolicyRule::new("operator", "/api/v1/namespaces/*", "*"),
        PolicyRule::new("operator", "/api/v1/namespaces/*/servers", "*"),
        PolicyRule::new("operator", "/api/v1/namespaces/*/servers/*", "*"),
        PolicyRule::new("operator", "/api/v1/namespaces/*/access", "*"),
        PolicyRule::new("operator", "/api/v1/namespaces/*/access/*", "*"),
        // admin: everything
        PolicyRule::new("admin", "/**", "*"),
    ]
}

// ── Tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn roles(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_single_segment_wildcard() {
        assert!(pattern_matches("/api/v1/servers/*", "/api/v1/servers/abc"));
        assert!(!pattern_matches("/api/v1/servers/*", "/api/v1/servers"));
        assert!(!pattern_matches("/api/v1/servers/*", "/api/v1/servers/abc/toggle"));
    }

    #[test]
    fn test_terminal_catch_all() {
        assert!(pattern_matches("/api/v1/gateway/**", "/api/v1/gateway/x"));
        assert!(pattern_matches("/api/v1/gateway/**", "/api/v1/gateway/x/tools/call"));
        assert!(pattern_matches("/api/v1/gateway/**", "/api/v1/gateway"));
        assert!(pattern_matches("/**", "/anything/at/all"));
    }

    #[test]
    fn test_exact_match() {
        assert!(pattern_matches("/api/v1/me", "/api/v1/me"));
        assert!(!pattern_matches("/api/v1/me", "/api/v1/men"));
    }

    #[test]
    fn test_role_expansion_accrues_down_chain() {
        let expanded = expand_roles(&roles(&["operator"]));
        assert!(expanded.contains(&"operator".to_string()));
        assert!(expanded.contains(&"viewer".to_string()));
        assert!(expanded.contains(&"user".to_string()));
        assert!(!expanded.contains(&"admin".to_string()));
    }

    #[test]
    fn test_custom_role_matches_only_itself() {
        let expanded = expand_roles(&roles(&["auditor"]));
        assert_eq!(expanded, vec!["auditor".to_string()]);
    }

    #[test]
    fn test_default_deny() {
        let engine = PolicyEngine::with_defaults();
        assert!(!engine.allows(&roles(&["user"]), "/api/v1/users", "GET"));
        assert!(!engine.allows(&[], "/api/v1/servers", "GET"));
    }

    #[test]
    fn test_user_can_proxy_but_not_manage() {
        let engine = PolicyEngine::with_defaults();
        let user = roles(&["user"]);
        assert!(engine.allows(&user, "/api/v1/gateway/abc/tools/call", "POST"));
        assert!(engine.allows(&user, "/api/v1/servers", "GET"));
        assert!(!engine.allows(&user, "/api/v1/servers", "POST"));
        assert!(!engine.allows(&user, "/api/v1/servers/abc", "DELETE"));
    }

    #[test]
    fn test_viewer_reads_audit_but_cannot_write_servers() {
        let engine = PolicyEngine::with_defaults();
        let viewer = roles(&["viewer"]);
        assert!(engine.allows(&viewer, "/api/v1/audit/logs", "GET"));
        assert!(!engine.allows(&viewer, "/api/v1/servers", "POST"));
    }

    #[test]
    fn test_operator_manages_servers_and_namespaces() {
        let engine = PolicyEngine::with_defaults();
        let operator = roles(&["operator"]);
        assert!(engine.allows(&operator, "/api/v1/servers", "POST"));
        assert!(engine.allows(&operator, "/api/v1/servers/abc", "PUT"));
        assert!(engine.allows(&operator, "/api/v1/servers/abc/toggle", "PATCH"));
        assert!(engine.allows(&operator, "/api/v1/namespaces/n1/servers/b1", "DELETE"));
        assert!(engine.allows(&operator, "/api/v1/namespaces/n1/access/viewer", "DELETE"));
        // inherited from viewer/user
        assert!(engine.allows(&operator, "/api/v1/audit/logs", "GET"));
        assert!(engine.allows(&operator, "/api/v1/gateway/abc", "POST"));
        // admin-only
        assert!(!engine.allows(&operator, "/api/v1/users", "POST"));
    }

    #[test]
    fn test_admin_catch_all() {
        let engine = PolicyEngine::with_defaults();
        let admin = roles(&["admin"]);
        assert!(engine.allows(&admin, "/api/v1/users", "POST"));
        assert!(engine.allows(&admin, "/api/v1/anything/else", "DELETE"));
    }

    #[test]
    fn test_reload_replaces_table() {
        let engine = PolicyEngine::with_defaults();
        engine.reload(vec![PolicyRule::new("user", "/only/this", "GET")]);
        let user = roles(&["user"]);
        assert!(engine.allows(&user, "/only/this", "GET"));
        assert!(!engine.allows(&user, "/api/v1/gateway/x", "POST"));
    }
}
