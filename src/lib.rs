//! MCP Gateway — library crate.
//!
//! The binary in `main.rs` wires these modules into a running server; the
//! `tests/` directory exercises them directly.

use std::sync::Arc;

pub mod api;
pub mod audit;
pub mod auth;
pub mod config;
pub mod errors;
pub mod mcp;
pub mod metrics;
pub mod models;
pub mod proxy;
pub mod registry;
pub mod store;

use auth::{
    apikey::ApiKeyProvider, ldap::LdapProvider, local::LocalPasswordProvider,
    oidc::OidcProvider, policy::PolicyEngine, rbac::RbacEngine, session::SessionProvider,
    ProviderRegistry,
};
use config::Config;
use proxy::session::SessionCache;
use proxy::transport::TransportAdapter;
use proxy::upstream::UpstreamClient;
use registry::ssrf::SsrfPolicy;
use registry::BackendRegistry;
use store::postgres::PgStore;

/// Shared application state passed to handlers and middleware.
pub struct AppState {
    pub config: Config,
    pub store: PgStore,
    pub providers: ProviderRegistry,
    pub policy: PolicyEngine,
    pub rbac: RbacEngine,
    pub registry: BackendRegistry,
    pub transport: TransportAdapter,
    pub probe_http: reqwest_middleware::ClientWithMiddleware,
}

impl AppState {
    /// Assemble every subsystem. All global mutable state (session cache,
    /// lockout table, policy table) exists before the listener binds.
    pub fn build(config: Config, store: PgStore) -> anyhow::Result<Arc<AppState>> {
        let ssrf = SsrfPolicy::from_config(
            config.registry.internal_only,
            &config.registry.internal_cidrs,
        )?;

        let providers = ProviderRegistry {
            api_key: ApiKeyProvider { enabled: true },
            session: SessionProvider::new(
                &config.auth.session_secret,
                config.auth.session_ttl_seconds,
                config.is_production(),
                &config.auth.cookie_same_site,
            ),
            oidc: OidcProvider::new(&config.auth.oauth),
            ldap: LdapProvider::new(&config.auth.ldap),
            local: LocalPasswordProvider::new(&config.auth.local),
        };

        let sessions = Arc::new(SessionCache::new());
        let transport = TransportAdapter::new(
            UpstreamClient::new(),
            sessions,
            std::time::Duration::from_secs(config.server.write_timeout_seconds.max(1)),
        );

        Ok(Arc::new(AppState {
            rbac: RbacEngine::new(config.auth.resource_rbac_enabled),
            policy: PolicyEngine::with_defaults(),
            registry: BackendRegistry::new(store.clone(), ssrf),
            providers,
            transport,
            probe_http: registry::health::probe_client(),
            store,
            config,
        }))
    }
}

/// Seed the first admin principal on an empty database so the gateway is
/// reachable before any external identity provider is wired up.
pub async fn bootstrap_admin(state: &AppState) -> anyhow::Result<()> {
    if state.store.count_principals().await? > 0 {
        return Ok(());
    }

    let password = match &state.config.auth.bootstrap_admin_password {
        Some(password) => password.clone(),
        None => {
            let generated = auth::apikey::generate_token();
            tracing::warn!(
                "no MCPGW_BOOTSTRAP_ADMIN_PASSWORD set; generated admin password: {}",
                generated
            );
            generated
        }
    };

    let hash = state.providers.local.hash_password(&password).await.map_err(|e| {
        anyhow::anyhow!("bootstrap admin password rejected: {}", e)
    })?;
    state
        .store
        .create_local_principal(
            "admin@localhost",
            "Administrator",
            &hash,
            &["admin".to_string()],
        )
        .await?;
    tracing::info!("seeded bootstrap admin principal admin@localhost");
    Ok(())
}
