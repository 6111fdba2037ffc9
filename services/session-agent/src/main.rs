//! Session agent
//!
//! Long-running client process that:
//! 1. Holds an API session and keeps it alive across credential expiry
//! 2. Prompts on the terminal when the session needs a fresh login
//! 3. Keeps an authenticated realtime channel open while the session is active
//! 4. Serves /health and /metrics for the operator

mod config;
mod metrics;
mod prompt;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use realtime::{ConnectionManager, ConnectionState, MessageDispatcher, WsChannelFactory};
use session_auth::CredentialStore;
use session_gate::{Session, SessionEvent};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transport::{HttpTransport, Transport};

use metrics_exporter_prometheus::PrometheusHandle;

use crate::config::Config;
use crate::prompt::LinePrompt;

/// How long the health listener gets to finish in-flight requests on shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    session: Arc<Session>,
    realtime: ConnectionManager,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

/// Build the axum router with all routes and shared state.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
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

    info!("starting session-agent");

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
        base_url = %config.api.base_url,
        realtime_url = %config.realtime.url,
        listen_addr = %config.health.listen_addr,
        headers = config.api.headers.len(),
        has_token = config.session.token.is_some(),
        "configuration loaded"
    );

    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(
        reqwest::Client::new(),
        config.api.base_url.clone(),
        config.header_injections(),
        Duration::from_secs(config.api.timeout_secs),
    ));
    let credentials = Arc::new(match &config.session.token {
        Some(token) => CredentialStore::with_token(token.expose().clone()),
        None => CredentialStore::new(),
    });
    let session = Arc::new(Session::new(
        transport,
        credentials.clone(),
        config.session_options(),
    ));
    metrics::set_session_active(session.is_active());

    let prompt = Arc::new(LinePrompt::terminal(config.session.email.clone()));
    let _reauth = session_gate::spawn_reauth_task(session.clone(), prompt);
    let _events = spawn_event_observer(session.clone());

    let dispatcher = MessageDispatcher::new();
    let _log_messages = dispatcher.subscribe_wildcard(|message| {
        info!(kind = %message.kind, timestamp = %message.timestamp, "realtime message");
    });
    let manager = ConnectionManager::new(
        Arc::new(WsChannelFactory),
        config.channel_options(),
        dispatcher,
    );

    let _identity = spawn_identity_task(
        session.clone(),
        manager.clone(),
        config.session.user_id.clone(),
    );
    let _recovery = spawn_reconnect_recovery(session.clone(), manager.clone());
    let _follower = manager.follow_session(credentials.subscribe());

    let app_state = AppState {
        session: session.clone(),
        realtime: manager.clone(),
        prometheus: prometheus_handle,
        started_at: Instant::now(),
    };
    let app = build_router(app_state, config.health.max_connections);

    let listen_addr = config.health.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "health listener ready");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;

    // Close the realtime channel first so no more frames are dispatched
    manager.disconnect().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => info!("health listener drained"),
        Ok(Ok(Err(e))) => error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "server task panicked"),
        Err(_) => warn!(
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }

    let dropped = session.queue().clear("agent shutting down");
    if dropped > 0 {
        warn!(dropped, "deferred requests dropped at shutdown");
    }

    info!("shutdown complete");
    Ok(())
}

/// Log and count every session event; keep the session gauge current.
fn spawn_event_observer(session: Arc<Session>) -> JoinHandle<()> {
    let mut events = session.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    metrics::record_session_event(&event);
                    metrics::set_session_active(session.is_active());
                    match &event {
                        SessionEvent::PlanRestricted(restriction) => {
                            warn!(path = %restriction.path, %restriction, "plan restriction")
                        }
                        SessionEvent::ForceCloseSurfaces { surfaces } => {
                            warn!(?surfaces, "surfaces asked to close")
                        }
                        SessionEvent::LoggedOut { forced } => info!(forced, "logged out"),
                        other => debug!(event = ?other, "session event observed"),
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event observer lagged behind session events");
                    metrics::set_session_active(session.is_active());
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Keep the realtime user id in step with the session.
///
/// A configured id is fixed. Otherwise the id is looked up each time the
/// session becomes active and forgotten when it ends.
fn spawn_identity_task(
    session: Arc<Session>,
    manager: ConnectionManager,
    configured: Option<String>,
) -> JoinHandle<()> {
    let mut active = session.credentials().subscribe();
    tokio::spawn(async move {
        if let Some(user_id) = configured {
            manager.update_user_id(Some(user_id)).await;
            return;
        }
        loop {
            let is_active = *active.borrow_and_update();
            let user_id = if is_active {
                resolve_user_id(&session).await
            } else {
                None
            };
            manager.update_user_id(user_id).await;
            if active.changed().await.is_err() {
                break;
            }
        }
    })
}

async fn resolve_user_id(session: &Session) -> Option<String> {
    match session.whoami().await {
        Ok(identity) => {
            info!(user_id = %identity.id, "resolved realtime identity");
            Some(identity.id)
        }
        Err(e) => {
            warn!(error = %e, "could not resolve current user, realtime stays unauthenticated");
            None
        }
    }
}

/// Retry the silent refresh whenever the realtime channel comes back while
/// a re-auth prompt is still waiting. Connectivity returning is the usual
/// reason a refresh that failed offline will now succeed.
fn spawn_reconnect_recovery(session: Arc<Session>, manager: ConnectionManager) -> JoinHandle<()> {
    let mut states = manager.subscribe_state();
    tokio::spawn(async move {
        loop {
            let state = *states.borrow_and_update();
            metrics::set_realtime_state(state);
            recover_after_reconnect(&session, state).await;
            if states.changed().await.is_err() {
                break;
            }
        }
    })
}

/// Returns the number of replayed requests when a recovery was attempted
/// and succeeded.
async fn recover_after_reconnect(session: &Session, state: ConnectionState) -> Option<usize> {
    if !state.is_connected() || !session.signals().reauth_pending() {
        return None;
    }
    match session.retry_refresh().await {
        Ok(replayed) => {
            info!(replayed, "session recovered after reconnect");
            Some(replayed)
        }
        Err(e) => {
            debug!(error = %e, "refresh after reconnect failed, prompt stays up");
            None
        }
    }
}

/// Health endpoint: realtime state, queue depth and session flags.
/// Returns 200 when there is nothing to deliver or the channel is
/// authenticated, 503 when an active session has no working channel.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let session = &state.session;
    let realtime = state.realtime.state();
    let active = session.is_active();
    let healthy = !active || realtime == ConnectionState::Authenticated;

    let body = serde_json::json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "session_active": active,
        "realtime": realtime.as_str(),
        "queue_depth": session.queue().len(),
        "reauth_pending": session.signals().reauth_pending(),
        "plan_restricted": session.restrictions().is_restricted(),
        "force_close": session.restrictions().force_close_requested(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    });
    let status_code = if healthy {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
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
            Ok(mut sigterm) => {
                sigterm.recv().await;
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
