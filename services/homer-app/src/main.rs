//! Homer user API
//!
//! Single-binary service that:
//! 1. Manages user accounts in a JSON file store
//! 2. Issues signed bearer tokens on password login
//! 3. Runs the OAuth2 authorization-code flow (PKCE) against one external
//!    provider
//! 4. Exposes `/health` and Prometheus `/metrics`

mod auth;
mod config;
mod error;
mod extract;
mod metrics;
mod oauth;
mod users;

#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use common::Secret;
use homer_auth::{
    CredentialVerifier, FlowCoordinator, HttpTokenExchange, PkceMode, TokenIssuer, UserStore,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{ADMIN_PASSWORD_ENV, Config, OAuth2Config};

/// Upper bound on in-flight request draining after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    users: Arc<UserStore>,
    verifier: Arc<CredentialVerifier>,
    issuer: Arc<TokenIssuer>,
    /// `None` when no `[oauth2]` section is configured
    oauth: Option<Arc<FlowCoordinator>>,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

/// Build the axum router with all routes and shared state.
///
/// A concurrency limit layer caps simultaneous requests at `max_connections`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/auth", post(auth::login))
        .route("/auth/type/list", get(auth::auth_type_list))
        .route("/oauth/redirect/{provider}", get(oauth::redirect))
        .route("/oauth/auth/{provider}", get(oauth::callback))
        .route("/users", get(users::list).post(users::create))
        .route(
            "/users/{user_guid}",
            put(users::update).delete(users::delete),
        )
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting homer-app");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle =
        metrics::install_recorder().context("failed to install Prometheus recorder")?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        users_path = %config.users.path.display(),
        oauth_provider = config.oauth2.as_ref().map_or("disabled", |o| o.provider.as_str()),
        "configuration loaded"
    );

    let users = Arc::new(
        UserStore::load(config.users.path.clone())
            .await
            .with_context(|| format!("failed to load users from {}", config.users.path.display()))?,
    );
    bootstrap_admin(&users, admin_password_from_env()).await?;

    let signing_key = config
        .auth
        .signing_key
        .as_ref()
        .context("signing key missing after config load")?;
    let issuer = TokenIssuer::new(
        signing_key,
        Duration::from_secs(config.auth.token_ttl_secs),
        config.auth.issuer.clone(),
    )
    .context("failed to initialize token issuer")?;

    let oauth = match &config.oauth2 {
        Some(oauth2) => Some(Arc::new(build_coordinator(oauth2)?)),
        None => None,
    };

    let app_state = AppState {
        verifier: Arc::new(CredentialVerifier::new(users.clone())),
        users,
        issuer: Arc::new(issuer),
        oauth,
        prometheus: prometheus_handle,
        started_at: Instant::now(),
    };

    let app = build_router(app_state, config.server.max_connections);

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts when the shutdown signal fires: the server is
    // told to drain, then the drain races DRAIN_TIMEOUT.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// HOMER_ADMIN_PASSWORD, unless unset or empty.
fn admin_password_from_env() -> Option<Secret<String>> {
    std::env::var(ADMIN_PASSWORD_ENV)
        .ok()
        .filter(|p| !p.is_empty())
        .map(Secret::new)
}

/// Create the `admin` account on an empty store when a password is given.
async fn bootstrap_admin(users: &UserStore, password: Option<Secret<String>>) -> Result<()> {
    let Some(password) = password else {
        if users.is_empty().await {
            warn!("user store is empty and {ADMIN_PASSWORD_ENV} is not set; nobody can log in");
        }
        return Ok(());
    };

    users
        .bootstrap_admin(password.expose())
        .await
        .context("failed to create bootstrap admin")?;
    Ok(())
}

fn build_coordinator(oauth2: &OAuth2Config) -> Result<FlowCoordinator> {
    let client = oauth2.client().context("invalid [oauth2] settings")?;
    let mode = oauth2.pkce_mode().context("invalid [oauth2] PKCE settings")?;
    if matches!(mode, PkceMode::Fixed { .. }) {
        warn!(
            provider = oauth2.provider,
            "pkce_mode = \"fixed\": every flow shares one state and verifier; use \"per_flow\" unless the provider setup requires it"
        );
    }
    info!(provider = oauth2.provider, pkce_mode = mode.name(), "OAuth2 login enabled");

    let exchanger = Arc::new(HttpTokenExchange::new(reqwest::Client::new()));
    Ok(FlowCoordinator::new(client, mode, exchanger)
        .with_exchange_timeout(Duration::from_secs(oauth2.exchange_timeout_secs))
        .with_flow_ttl(Duration::from_secs(oauth2.flow_ttl_secs))
        .with_max_pending_flows(oauth2.max_pending_flows))
}

/// Liveness: uptime and the OAuth provider in use.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let provider = state.oauth.as_ref().map(|o| o.provider().to_string());
    error::json_response(
        axum::http::StatusCode::OK,
        serde_json::json!({
            "status": "healthy",
            "uptime_seconds": state.started_at.elapsed().as_secs(),
            "oauth_provider": provider,
        }),
    )
}

/// Prometheus metrics endpoint: returns metrics in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
