//! Connection handlers for Relay server.
//!
//! This module wires the hub, authenticator and store into the HTTP
//! router and drives each WebSocket connection through a session.

use crate::auth::{AuthError, Authenticator, JwtAuthenticator};
use crate::config::{Config, IN_MEMORY_DATABASE};
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::rest;
use crate::store::SqliteStore;
use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocket, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use relay_core::{Hub, MessageStore, RateLimiter, Session, UserId};
use relay_transport::websocket;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Shared server state.
pub struct AppState {
    /// The connection hub.
    pub hub: Arc<Hub>,
    /// Token verification.
    pub auth: Arc<dyn Authenticator>,
    /// Per-user REST rate limiter.
    pub rest_limiter: RateLimiter,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(
        config: Config,
        store: Arc<dyn MessageStore>,
        auth: Arc<dyn Authenticator>,
    ) -> Self {
        let rest_limiter =
            RateLimiter::new(config.limits.rest_rate_limit, config.rest_rate_window());

        Self {
            hub: Arc::new(Hub::with_config(store, config.hub_config())),
            auth,
            rest_limiter,
            config,
        }
    }
}

/// Open the configured message store.
///
/// # Errors
///
/// Returns an error if the database cannot be opened.
pub fn open_store(config: &Config) -> Result<Arc<dyn MessageStore>> {
    let store = if config.storage.database == IN_MEMORY_DATABASE {
        SqliteStore::open_in_memory()
    } else {
        SqliteStore::open(&config.storage.database)
    }
    .with_context(|| format!("Failed to open database: {}", config.storage.database))?;

    Ok(Arc::new(store))
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .merge(rest::routes())
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let secret = config.jwt_secret()?;
    let auth = Arc::new(JwtAuthenticator::new(
        secret.as_bytes(),
        Duration::from_secs(config.auth.token_ttl_secs),
    ));
    let store = open_store(&config)?;
    let state = Arc::new(AppState::new(config.clone(), store, auth));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    // Bind and serve
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Relay server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    serve(listener, state).await
}

/// Serve on an already bound listener.
///
/// # Errors
///
/// Returns an error if serving fails.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    tokio::spawn(prune_rest_limits(Arc::clone(&state)));

    axum::serve(listener, router(state))
        .await
        .context("Server error")?;

    Ok(())
}

/// Periodically forget REST callers that went quiet.
async fn prune_rest_limits(state: Arc<AppState>) {
    let mut ticker = tokio::time::interval(state.rest_limiter.window());
    loop {
        ticker.tick().await;
        let pruned = state.rest_limiter.prune();
        if pruned > 0 {
            debug!(pruned, "Pruned REST rate limit keys");
        }
    }
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// WebSocket upgrade query.
#[derive(Debug, Deserialize)]
pub struct WsParams {
    token: Option<String>,
}

/// WebSocket upgrade handler.
///
/// The token is verified before the upgrade; a rejected handshake never
/// reaches the hub.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let verified = params
        .token
        .as_deref()
        .ok_or(AuthError::Missing)
        .and_then(|token| state.auth.verify(token));

    let user = match verified {
        Ok(user) => user,
        Err(e) => {
            debug!(error = %e, "Rejected WebSocket handshake");
            metrics::record_error("auth");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };

    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, user))
}

/// Handle an upgraded WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, user: UserId) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    let (source, sink) = websocket::split(socket);
    let session = Session::open(Arc::clone(&state.hub), user, state.config.session_config());
    metrics::set_users_online(state.hub.stats().user_count);

    debug!(user = %user, session = %session.id(), "WebSocket connected");

    let summary = session.run(source, sink).await;

    metrics::record_session(&summary);
    metrics::set_users_online(state.hub.stats().user_count);
}
