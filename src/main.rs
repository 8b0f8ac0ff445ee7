use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cli;

use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};

use gateway::store::postgres::PgStore;
use gateway::{api, auth, config, metrics, registry, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::{trace as sdktrace, Resource};

    // OTLP export is opt-in via the standard env var; stdout logging always on.
    let telemetry_layer = if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic())
            .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "mcp-gateway"),
            ])))
            .install_batch(opentelemetry_sdk::runtime::Tokio)
            .expect("failed to install OpenTelemetry tracer");
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "gateway=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .with(telemetry_layer)
        .init();

    // Invalid configuration exits non-zero before anything binds.
    let cfg = config::load()?;
    let args = cli::Cli::parse();

    let result = match args.command {
        None => run_server(cfg, None).await,
        Some(cli::Commands::Serve { port }) => run_server(cfg, port).await,
        Some(cli::Commands::User { command }) => {
            let state = connect_state(cfg).await?;
            handle_user_command(command, &state).await
        }
        Some(cli::Commands::Apikey { command }) => {
            let state = connect_state(cfg).await?;
            handle_apikey_command(command, &state).await
        }
    };

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}

async fn connect_state(cfg: config::Config) -> anyhow::Result<Arc<AppState>> {
    let store = PgStore::connect(&cfg.database).await?;
    AppState::build(cfg, store)
}

async fn run_server(cfg: config::Config, port_override: Option<u16>) -> anyhow::Result<()> {
    tracing::info!("Connecting to database...");
    let store = PgStore::connect(&cfg.database).await?;

    tracing::info!("Running migrations...");
    store.migrate().await?;

    let port = port_override.unwrap_or(cfg.server.port);
    let host: std::net::IpAddr = cfg.server.host.parse()?;
    let shutdown_grace =
        std::time::Duration::from_secs(cfg.server.shutdown_timeout_seconds.max(1));

    let state = AppState::build(cfg, store.clone())?;
    gateway::bootstrap_admin(&state).await?;

    let api_v1 = api::public_router().merge(api::protected_router(state.clone()));

    let app = axum::Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/ready", get(readiness_check))
        .route(
            "/.well-known/oauth-protected-resource",
            get(api::auth_handlers::oauth_protected_resource),
        )
        .route(
            "/.well-known/oauth-protected-resource/*rest",
            get(api::auth_handlers::oauth_protected_resource),
        )
        .route(
            "/.well-known/oauth-authorization-server",
            get(api::auth_handlers::oauth_authorization_server),
        )
        .route(
            "/.well-known/oauth-authorization-server/*rest",
            get(api::auth_handlers::oauth_authorization_server),
        )
        .nest("/api/v1", api_v1)
        .with_state(state.clone())
        .layer(tower_http::trace::TraceLayer::new_for_http())
        // Browser UI origin; session cookies require credentialed CORS, so
        // the origin list stays explicit instead of a wildcard.
        .layer({
            use axum::http::{HeaderName, Method};
            use tower_http::cors::{AllowOrigin, CorsLayer};
            let ui_origin = std::env::var("MCPGW_UI_ORIGIN")
                .unwrap_or_else(|_| "http://localhost:3000".to_string());
            CorsLayer::new()
                .allow_origin(AllowOrigin::predicate(move |origin, _| {
                    let origin = origin.to_str().unwrap_or("");
                    origin == ui_origin
                        || origin.starts_with("http://localhost:")
                        || origin.starts_with("http://127.0.0.1:")
                }))
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::PUT,
                    Method::DELETE,
                    Method::PATCH,
                    Method::OPTIONS,
                ])
                .allow_headers([
                    HeaderName::from_static("content-type"),
                    HeaderName::from_static("authorization"),
                    HeaderName::from_static("x-api-key"),
                    HeaderName::from_static("x-request-id"),
                ])
                .allow_credentials(true)
        })
        // Correlation id: set on the request, echoed on the response, and
        // read by the proxy handlers for audit rows.
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    // Health prober: one cooperative task on a fixed cadence.
    let prober = registry::health::HealthProber::new(store.clone()).spawn();
    tracing::info!("Health prober started");

    // Metrics on its own listener so scrapes never contend with API auth.
    let metrics_handle = if state.config.metrics.enabled {
        let metrics_app = axum::Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/health", get(|| async { "ok" }))
            .with_state(state.clone());
        let addr = SocketAddr::from((host, state.config.metrics.prometheus_port));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("Metrics listening on {}", addr);
        Some(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, metrics_app).await {
                tracing::error!("metrics server failed: {}", e);
            }
        }))
    } else {
        None
    };

    let addr = SocketAddr::from((host, port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("MCP gateway listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_grace))
        .await?;

    // Reverse construction order: listener is down and drained; stop the
    // background tasks, then close the pool.
    if let Some(handle) = metrics_handle {
        handle.abort();
    }
    prober.abort();
    store.pool().close().await;
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn readiness_check() -> &'static str {
    "ok"
}

async fn metrics_handler(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
) -> String {
    metrics::collect_registry(&state.store).await;
    metrics::encode()
}

/// Resolves on SIGTERM or ctrl-c. A watchdog bounds the drain so a wedged
/// connection cannot hold shutdown forever.
async fn shutdown_signal(grace: std::time::Duration) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received; draining in-flight requests");
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        tracing::warn!("drain deadline exceeded; exiting");
        std::process::exit(0);
    });
}

async fn handle_user_command(
    cmd: cli::UserCommands,
    state: &Arc<AppState>,
) -> anyhow::Result<()> {
    match cmd {
        cli::UserCommands::Create {
            email,
            name,
            password,
            roles,
        } => {
            let roles = if roles.is_empty() {
                vec!["user".to_string()]
            } else {
                roles
            };
            let hash = state
                .providers
                .local
                .hash_password(&password)
                .await
                .map_err(|e| anyhow::anyhow!("{}", e))?;
            let principal = state
                .store
                .create_local_principal(&email, &name, &hash, &roles)
                .await?;
            println!(
                "User created:\n  Email: {}\n  ID:    {}\n  Roles: {}",
                principal.email,
                principal.id,
                principal.roles.join(", ")
            );
        }
        cli::UserCommands::List => {
            let principals = state.store.list_principals().await?;
            if principals.is_empty() {
                println!("No users found.");
            } else {
                println!("{:<38} {:<30} {:<8} ROLES", "ID", "EMAIL", "ACTIVE");
                for p in principals {
                    println!(
                        "{:<38} {:<30} {:<8} {}",
                        p.id,
                        p.email,
                        p.is_active,
                        p.roles.join(",")
                    );
                }
            }
        }
    }
    Ok(())
}

async fn handle_apikey_command(
    cmd: cli::ApiKeyCommands,
    state: &Arc<AppState>,
) -> anyhow::Result<()> {
    match cmd {
        cli::ApiKeyCommands::Create { email } => {
            let principal = state
                .store
                .get_principal_by_email(&email)
                .await?
                .ok_or_else(|| anyhow::anyhow!("no such user: {}", email))?;
            let token = auth::apikey::generate_token();
            let prefix = auth::apikey::key_prefix(&token)
                .ok_or_else(|| anyhow::anyhow!("generated malformed key"))?;
            let digest = auth::apikey::hash_token(&token);
            let id = state
                .store
                .insert_api_key(principal.id, &prefix, &digest, None)
                .await?;
            println!(
                "API key created:\n  ID:  {}\n  Use: Authorization: Bearer {}",
                id, token
            );
        }
        cli::ApiKeyCommands::List { email } => {
            let principal = state
                .store
                .get_principal_by_email(&email)
                .await?
                .ok_or_else(|| anyhow::anyhow!("no such user: {}", email))?;
            let keys = state.store.list_api_keys(principal.id).await?;
            if keys.is_empty() {
                println!("No active keys.");
            } else {
                println!("{:<38} {:<14} CREATED", "ID", "PREFIX");
                for key in keys {
                    println!(
                        "{:<38} {:<14} {}",
                        key.id,
                        key.key_prefix,
                        key.created_at.format("%Y-%m-%d")
                    );
                }
            }
        }
        cli::ApiKeyCommands::Revoke { email, id } => {
            let principal = state
                .store
                .get_principal_by_email(&email)
                .await?
                .ok_or_else(|| anyhow::anyhow!("no such user: {}", email))?;
            if state.store.revoke_api_key(id, principal.id).await? {
                println!("Key revoked.");
            } else {
                println!("Key not found.");
            }
        }
    }
    Ok(())
}
