use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub registry: RegistryConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// Inverts the SSRF policy: only cluster-local hostnames and
    /// `internal_cidrs` addresses are accepted for backend URLs.
    pub internal_only: bool,
    pub internal_cidrs: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub read_timeout_seconds: u64,
    pub write_timeout_seconds: u64,
    pub shutdown_timeout_seconds: u64,
    /// "development" or "production". Controls cookie Secure flag and the
    /// insecure-secret startup guard.
    pub environment: String,
    pub static_dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_open: u32,
    pub max_idle: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Master switch. When off, every route is public and handlers see a
    /// synthetic admin principal.
    pub enabled: bool,
    /// Toggles the namespace-based resource filter. Off restores the legacy
    /// "all authenticated users see all servers" semantics.
    pub resource_rbac_enabled: bool,
    /// HMAC key for the session cookie. Must be overridden in production.
    pub session_secret: String,
    pub session_ttl_seconds: i64,
    pub cookie_same_site: String,
    /// Which credential kinds are accepted on /api/v1/gateway/* — independent
    /// of what the management UI accepts.
    pub mcp_auth: McpAuthConfig,
    pub oauth: OAuthConfig,
    pub ldap: LdapConfig,
    pub local: LocalAuthConfig,
    /// Password for the admin principal seeded on an empty database.
    pub bootstrap_admin_password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct McpAuthConfig {
    pub api_key: bool,
    pub session: bool,
    pub oauth: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OAuthConfig {
    pub enabled: bool,
    pub issuer: String,
    pub client_id: String,
    pub client_secret: String,
    /// External base URL of this gateway, used to build redirect URIs and
    /// the RFC 9728 resource identifier.
    pub base_url: String,
    pub scopes: Vec<String>,
    pub default_role: String,
    pub auto_create_users: bool,
    /// Empty list = every domain allowed.
    pub allowed_domains: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LdapConfig {
    pub enabled: bool,
    pub url: String,
    pub start_tls: bool,
    pub bind_dn: String,
    pub bind_password: String,
    pub search_base: String,
    /// `{login}` is substituted with the escaped login name.
    pub user_filter: String,
    /// group DN → gateway role
    pub group_role_mapping: std::collections::HashMap<String, String>,
    pub default_role: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalAuthConfig {
    pub enabled: bool,
    pub bcrypt_cost: u32,
    pub lockout: LockoutConfig,
    pub password_policy: PasswordPolicyConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LockoutConfig {
    /// Consecutive failures before the account locks.
    pub max_failures: u32,
    /// Window in which failures accumulate.
    pub window_seconds: u64,
    /// Lock duration once tripped.
    pub duration_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PasswordPolicyConfig {
    pub min_length: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub prometheus_port: u16,
}

impl Config {
    pub fn is_production(&self) -> bool {
        self.server.environment == "production"
    }

    /// Validate cross-field constraints. Called once at startup; a failure
    /// here exits the process with a non-zero code before anything binds.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database.max_open < 1 {
            anyhow::bail!("database.max_open must be >= 1");
        }
        if self.database.max_idle > self.database.max_open {
            anyhow::bail!(
                "database.max_idle ({}) must not exceed database.max_open ({})",
                self.database.max_idle,
                self.database.max_open
            );
        }
        if self.auth.session_ttl_seconds <= 0 {
            anyhow::bail!("auth.session_ttl_seconds must be positive");
        }
        if !matches!(self.auth.cookie_same_site.as_str(), "strict" | "lax" | "none") {
            anyhow::bail!(
                "auth.cookie_same_site must be one of strict|lax|none, got '{}'",
                self.auth.cookie_same_site
            );
        }
        if self.auth.oauth.enabled {
            if self.auth.oauth.issuer.is_empty() {
                anyhow::bail!("auth.oauth.issuer is required when OAuth is enabled");
            }
            if self.auth.oauth.client_id.is_empty() {
                anyhow::bail!("auth.oauth.client_id is required when OAuth is enabled");
            }
        }
        if self.auth.ldap.enabled && self.auth.ldap.url.is_empty() {
            anyhow::bail!("auth.ldap.url is required when LDAP is enabled");
        }
        if self.auth.local.bcrypt_cost < 4 || self.auth.local.bcrypt_cost > 31 {
            anyhow::bail!("auth.local.bcrypt_cost must be within 4..=31");
        }
        if self.is_production() && self.auth.session_secret == DEFAULT_SESSION_SECRET {
            anyhow::bail!(
                "MCPGW_SESSION_SECRET is still the insecure placeholder. \
                 Set a proper random secret before running in production."
            );
        }
        Ok(())
    }
}

const DEFAULT_SESSION_SECRET: &str = "CHANGE_ME_INSECURE_SESSION_SECRET";

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Parse "group1=role1,group2=role2" into a group → role map. Group names
/// containing commas are not supported through the env form.
fn env_mapping(key: &str) -> std::collections::HashMap<String, String> {
    std::env::var(key)
        .unwrap_or_default()
        .split(',')
        .filter_map(|pair| {
            let (group, role) = pair.rsplit_once('=')?;
            let group = group.trim();
            let role = role.trim();
            if group.is_empty() || role.is_empty() {
                return None;
            }
            Some((group.to_string(), role.to_string()))
        })
        .collect()
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();

    let session_secret = env_or("MCPGW_SESSION_SECRET", DEFAULT_SESSION_SECRET);
    if session_secret == DEFAULT_SESSION_SECRET {
        eprintln!(
            "⚠️  MCPGW_SESSION_SECRET is not set — using insecure placeholder. \
             Set a random secret for production."
        );
    }

    let cfg = Config {
        server: ServerConfig {
            host: env_or("MCPGW_HOST", "0.0.0.0"),
            port: env_parse("MCPGW_PORT", 8080u16),
            read_timeout_seconds: env_parse("MCPGW_READ_TIMEOUT", 30u64),
            write_timeout_seconds: env_parse("MCPGW_WRITE_TIMEOUT", 120u64),
            shutdown_timeout_seconds: env_parse("MCPGW_SHUTDOWN_TIMEOUT", 15u64),
            environment: env_or("MCPGW_ENV", "development"),
            static_dir: std::env::var("MCPGW_STATIC_DIR").ok(),
        },
        database: DatabaseConfig {
            url: env_or("DATABASE_URL", "postgres://localhost/mcpgw"),
            max_open: env_parse("MCPGW_DB_MAX_OPEN", 20u32),
            max_idle: env_parse("MCPGW_DB_MAX_IDLE", 5u32),
        },
        auth: AuthConfig {
            enabled: env_bool("MCPGW_AUTH_ENABLED", true),
            resource_rbac_enabled: env_bool("MCPGW_RESOURCE_RBAC_ENABLED", false),
            session_secret,
            session_ttl_seconds: env_parse("MCPGW_SESSION_TTL", 86_400i64),
            cookie_same_site: env_or("MCPGW_COOKIE_SAMESITE", "lax"),
            mcp_auth: McpAuthConfig {
                api_key: env_bool("MCPGW_MCP_AUTH_API_KEY", true),
                session: env_bool("MCPGW_MCP_AUTH_SESSION", true),
                oauth: env_bool("MCPGW_MCP_AUTH_OAUTH", false),
            },
            oauth: OAuthConfig {
                enabled: env_bool("MCPGW_OAUTH_ENABLED", false),
                issuer: env_or("MCPGW_OAUTH_ISSUER", ""),
                client_id: env_or("MCPGW_OAUTH_CLIENT_ID", ""),
                client_secret: env_or("MCPGW_OAUTH_CLIENT_SECRET", ""),
                base_url: env_or("MCPGW_BASE_URL", "http://localhost:8080"),
                scopes: {
                    let scopes = env_list("MCPGW_OAUTH_SCOPES");
                    if scopes.is_empty() {
                        vec!["openid".into(), "email".into(), "profile".into()]
                    } else {
                        scopes
                    }
                },
                default_role: env_or("MCPGW_OAUTH_DEFAULT_ROLE", "user"),
                auto_create_users: env_bool("MCPGW_OAUTH_AUTO_CREATE", true),
                allowed_domains: env_list("MCPGW_OAUTH_ALLOWED_DOMAINS"),
            },
            ldap: LdapConfig {
                enabled: env_bool("MCPGW_LDAP_ENABLED", false),
                url: env_or("MCPGW_LDAP_URL", ""),
                start_tls: env_bool("MCPGW_LDAP_STARTTLS", false),
                bind_dn: env_or("MCPGW_LDAP_BIND_DN", ""),
                bind_password: env_or("MCPGW_LDAP_BIND_PASSWORD", ""),
                search_base: env_or("MCPGW_LDAP_SEARCH_BASE", ""),
                user_filter: env_or("MCPGW_LDAP_USER_FILTER", "(mail={login})"),
                group_role_mapping: env_mapping("MCPGW_LDAP_GROUP_ROLES"),
                default_role: env_or("MCPGW_LDAP_DEFAULT_ROLE", "user"),
            },
            local: LocalAuthConfig {
                enabled: env_bool("MCPGW_LOCAL_AUTH_ENABLED", true),
                bcrypt_cost: env_parse("MCPGW_BCRYPT_COST", 12u32),
                lockout: LockoutConfig {
                    max_failures: env_parse("MCPGW_LOCKOUT_MAX_FAILURES", 5u32),
                    window_seconds: env_parse("MCPGW_LOCKOUT_WINDOW", 900u64),
                    duration_seconds: env_parse("MCPGW_LOCKOUT_DURATION", 900u64),
                },
                password_policy: PasswordPolicyConfig {
                    min_length: env_parse("MCPGW_PASSWORD_MIN_LENGTH", 12usize),
                },
            },
            bootstrap_admin_password: std::env::var("MCPGW_BOOTSTRAP_ADMIN_PASSWORD").ok(),
        },
        registry: RegistryConfig {
            internal_only: env_bool("MCPGW_REGISTRY_INTERNAL_ONLY", false),
            internal_cidrs: env_list("MCPGW_REGISTRY_INTERNAL_CIDRS"),
        },
        metrics: MetricsConfig {
            enabled: env_bool("MCPGW_METRICS_ENABLED", true),
            prometheus_port: env_parse("MCPGW_PROMETHEUS_PORT", 9090u16),
        },
    };

    cfg.validate()?;
    Ok(cfg)
}

// ── Tests ──────────────────────────────────────────────────────
