//! Axum router: the WebSocket handshake boundary plus the HTTP
//! endpoints (`/health`, `/stats`, `/metrics`).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use beacon_hub::session::run_session;
use beacon_hub::{Address, Hub};

use crate::config::ServerConfig;
use crate::health;
use crate::shutdown::ShutdownCoordinator;

/// Errors surfaced while bringing the server up.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The listen address could not be bound.
    #[error("failed to bind {addr}")]
    Bind {
        /// The host:port that failed.
        addr: String,
        /// Underlying bind error.
        #[source]
        source: std::io::Error,
    },
    /// Any other socket-level failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Delivery handle into the hub.
    pub hub: Hub,
    /// When the server started.
    pub start_time: Instant,
    /// Renders the `/metrics` endpoint.
    pub metrics: PrometheusHandle,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws/{address}", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Handle returned by [`start`]. Keeps the serve task alive.
pub struct ServerHandle {
    /// The bound address (useful with port `0`).
    pub local_addr: SocketAddr,
    /// The serve task; resolves once graceful shutdown completes.
    pub task: tokio::task::JoinHandle<()>,
}

/// Bind the listener and start serving. Returns once the socket is
/// bound; the serve loop runs until the coordinator signals shutdown.
pub async fn start(
    config: &ServerConfig,
    hub: Hub,
    metrics: PrometheusHandle,
    shutdown: Arc<ShutdownCoordinator>,
) -> Result<ServerHandle, ServerError> {
    let state = AppState {
        hub,
        start_time: Instant::now(),
        metrics,
    };
    let router = build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;
    let local_addr = listener.local_addr()?;
    info!(%local_addr, "server listening");

    let token = shutdown.token();
    let task = tokio::spawn(async move {
        let serve = axum::serve(listener, router)
            .with_graceful_shutdown(async move { token.cancelled().await });
        if let Err(e) = serve.await {
            warn!(error = %e, "serve loop exited with error");
        }
    });

    Ok(ServerHandle { local_addr, task })
}

/// GET /ws/{address}: validate, normalize, upgrade, hand off.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(address): Path<String>,
    State(state): State<AppState>,
) -> Response {
    if !is_wallet_address(&address) {
        warn!(address, "rejecting connection with invalid address");
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "invalid address" })),
        )
            .into_response();
    }

    // One canonical key per wallet regardless of the checksum casing
    // the client used in the URL.
    let address = Address::from(address.to_ascii_lowercase());
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| run_session(socket, address, hub))
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<health::HealthResponse> {
    let connections = state.hub.stats().await.connected_clients;
    Json(health::health_check(state.start_time, connections))
}

/// GET /stats: registry snapshot, for debugging and admin tooling.
async fn stats_handler(State(state): State<AppState>) -> Json<beacon_hub::HubStats> {
    Json(state.hub.stats().await)
}

/// GET /metrics: Prometheus text format.
async fn metrics_handler(State(state): State<AppState>) -> String {
    crate::metrics::render(&state.metrics)
}

/// `0x` followed by exactly 40 hex digits.
fn is_wallet_address(s: &str) -> bool {
    s.len() == 42 && s.starts_with("0x") && s[2..].bytes().all(|b| b.is_ascii_hexdigit())
}
