//! Session agent
//!
//! Headless binary that:
//! 1. Restores or establishes a session with the identity provider
//! 2. Keeps it current with the background expiry poll
//! 3. Holds the realtime notification channel open and logs every event
//! 4. Serves `/health`, `/metrics` and `POST /reconnect`

mod config;
mod metrics;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use identity::{HttpIdentityProvider, IdentityProvider};
use metrics_exporter_prometheus::PrometheusHandle;
use realtime::{
    ConnectionManager, ConnectionState, EventDispatcher, RealtimeEvent, WsConnector,
};
use session_auth::{CredentialStore, RefreshCoordinator};
use session_guard::{AccessDecision, RouteAccess, SessionGuard, SessionState, spawn_expiry_poll};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

/// Time allowed for in-flight HTTP requests after shutdown starts
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    session: watch::Receiver<SessionState>,
    channel: watch::Receiver<ConnectionState>,
    connection: Arc<ConnectionManager>,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

/// Build the axum router with all routes and shared state.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/reconnect", post(reconnect_handler))
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

    info!("starting session-agent");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus = metrics::install_recorder()?;

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
    let endpoint = config.realtime.endpoint()?;

    info!(
        identity_url = %config.identity.base_url,
        realtime_url = %endpoint,
        listen_addr = %config.agent.listen_addr,
        persisted = config.session.credentials_path.is_some(),
        "configuration loaded"
    );

    let client = reqwest::Client::builder()
        .timeout(config.identity.timeout())
        .build()
        .context("failed to build HTTP client")?;
    let provider: Arc<dyn IdentityProvider> =
        Arc::new(HttpIdentityProvider::new(client, config.identity.base_url.clone()));

    let store = match &config.session.credentials_path {
        Some(path) => CredentialStore::load(path.clone(), config.session.max_age())
            .await
            .with_context(|| format!("failed to load credentials from {}", path.display()))?,
        None => CredentialStore::in_memory(),
    };
    let store = Arc::new(store);

    let coordinator = RefreshCoordinator::new(store.clone(), provider.clone());
    let guard = Arc::new(SessionGuard::new(
        store.clone(),
        provider,
        coordinator,
        config.guard_config(),
    ));

    if store.is_empty().await {
        if let Some(login) = &config.login {
            let password = login
                .password
                .as_ref()
                .context("login configured without a password")?;
            info!(username = %login.username, "no stored session, logging in");
            guard
                .login(&login.username, password.as_str())
                .await
                .context("login failed")?;
        }
    }

    let access = RouteAccess::protected(config.agent.roles.iter().copied());
    match guard.enter(access).await {
        AccessDecision::Authorized(context) => {
            info!(
                role = %context.role,
                subject_id = %context.subject_id,
                "session ready"
            );
        }
        AccessDecision::Unauthorized { landing } => {
            anyhow::bail!("session role is not permitted to run the agent (landing: {landing})");
        }
        AccessDecision::Unauthenticated | AccessDecision::Public => {
            anyhow::bail!("no valid session; configure [login] or provide a credential file");
        }
    }

    let poll = spawn_expiry_poll(guard.clone(), guard.config().poll_interval);

    let (dispatcher, events) = EventDispatcher::new(config.realtime.dedup_capacity);
    let connection = Arc::new(ConnectionManager::spawn(
        config.connection_config(),
        Arc::new(WsConnector),
        dispatcher,
        Some(store.clone()),
    ));
    connection.open(endpoint, None)?;

    let event_logger = tokio::spawn(log_events(events));
    let channel_gauge = tokio::spawn(follow_channel(connection.subscribe()));

    let app_state = AppState {
        session: guard.subscribe(),
        channel: connection.subscribe(),
        connection: connection.clone(),
        prometheus,
        started_at: Instant::now(),
    };
    let app = build_router(app_state, config.agent.max_connections);

    let listen_addr = config.agent.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    let session_lost = tokio::select! {
        _ = shutdown_signal() => false,
        _ = session_ended(guard.subscribe()) => {
            warn!("session ended, shutting down");
            true
        }
    };

    poll.cancel();
    connection.teardown().await;
    event_logger.abort();
    channel_gauge.abort();

    if config.agent.logout_on_shutdown && !session_lost {
        if let Err(e) = guard.logout().await {
            warn!(error = %e, "logout failed");
        }
    }

    let _ = shutdown_tx.send(());
    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => info!("all in-flight requests drained"),
        Ok(Ok(Err(e))) => error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "server task panicked"),
        Err(_) => warn!(
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }

    info!("shutdown complete");
    if session_lost {
        anyhow::bail!("session ended");
    }
    Ok(())
}

/// Log every dispatched event until the channel goes away.
async fn log_events(mut events: tokio::sync::mpsc::UnboundedReceiver<RealtimeEvent>) {
    while let Some(event) = events.recv().await {
        match &event {
            RealtimeEvent::NotificationCount { count } => {
                info!(count, "unread notifications");
            }
            RealtimeEvent::Notification(n) => {
                info!(
                    id = n.id.as_deref().unwrap_or_default(),
                    kind = n.kind.as_deref().unwrap_or_default(),
                    title = n.title.as_deref().unwrap_or_default(),
                    "notification"
                );
            }
            RealtimeEvent::Authenticated => info!("realtime channel authenticated"),
            RealtimeEvent::ServerError { message } => warn!(%message, "realtime server error"),
            RealtimeEvent::Other(value) => debug!(%value, "unclassified realtime event"),
        }
    }
}

/// Mirror the channel state into the `realtime_channel_open` gauge.
async fn follow_channel(mut channel: watch::Receiver<ConnectionState>) {
    loop {
        let state = channel.borrow_and_update().clone();
        metrics::record_channel_state(&state);
        if let ConnectionState::Failed { error } = &state {
            error!(%error, "realtime channel gave up; manual reconnect required");
        }
        if channel.changed().await.is_err() {
            break;
        }
    }
}

/// Resolves once the session becomes unauthenticated.
///
/// Also mirrors the session into the `session_authenticated` gauge.
async fn session_ended(mut session: watch::Receiver<SessionState>) {
    loop {
        let state = session.borrow_and_update().clone();
        metrics::record_session_state(&state);
        if matches!(state, SessionState::Unauthenticated) {
            return;
        }
        if session.changed().await.is_err() {
            return;
        }
    }
}

/// Returns 200 when the session is authenticated and the channel open,
/// 503 otherwise. The body describes both.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let session = state.session.borrow().clone();
    let channel = state.channel.borrow().clone();
    let healthy = session.is_authenticated() && channel.is_open();

    let context = session.context();
    let body = serde_json::json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "session": session.label(),
        "role": context.map(|c| c.role.label()),
        "subject_id": context.map(|c| c.subject_id.as_str()),
        "channel": channel.label(),
        "channel_error": channel.error(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    });

    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Manual reconnect, the only way out of `Failed`.
///
/// 409 before the channel was ever opened, 202 otherwise.
async fn reconnect_handler(State(state): State<AppState>) -> impl IntoResponse {
    let previous = state.channel.borrow().clone();
    let (status_code, body) = if matches!(previous, ConnectionState::Idle) {
        (
            StatusCode::CONFLICT,
            serde_json::json!({"status": "idle", "error": "channel was never opened"}),
        )
    } else {
        info!(previous = previous.label(), "manual reconnect requested over HTTP");
        state.connection.manual_reconnect();
        (
            StatusCode::ACCEPTED,
            serde_json::json!({"status": "reconnecting", "previous": previous.label()}),
        )
    };

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
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
            error!(error = %e, "failed to install Ctrl+C handler");
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
