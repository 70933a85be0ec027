use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::broker::RelayBroker;
use crate::config::ServerConfig;
use crate::connection::{self, ConnectionContext, ConnectionHub};
use crate::registry::Role;

/// Shared state passed to axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<ConnectionHub>,
    pub broker: Arc<RelayBroker>,
    pub config: Arc<ServerConfig>,
    pub started_at: DateTime<Utc>,
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        let hub = Arc::new(ConnectionHub::new(config.max_send_queue));
        let broker = Arc::new(RelayBroker::new(Arc::clone(&hub)));
        Self {
            hub,
            broker,
            config: Arc::new(config),
            started_at: Utc::now(),
            shutdown: CancellationToken::new(),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/app", get(app_ws_handler))
        .route("/inspector", get(inspector_ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Bind and serve. Returns once the listener is bound.
pub async fn start(config: ServerConfig) -> Result<ServerHandle, std::io::Error> {
    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    let addr = listener.local_addr()?;
    let state = AppState::new(config);
    let shutdown = state.shutdown.clone();

    let cleanup = connection::start_cleanup_task(
        Arc::clone(&state.hub),
        Arc::clone(&state.broker),
        state.config.cleanup_interval(),
        state.config.client_timeout(),
        shutdown.clone(),
    );

    let router = build_router(state);
    let token = shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "relay server stopped with error");
        }
    });

    tracing::info!(addr = %addr, "relay started");

    Ok(ServerHandle {
        addr,
        port: addr.port(),
        shutdown,
        server,
        cleanup,
    })
}

/// Handle returned by [`start`]. Dropping it leaves the server running.
pub struct ServerHandle {
    pub addr: SocketAddr,
    pub port: u16,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
    cleanup: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn app_url(&self) -> String {
        format!("ws://{}/app", self.addr)
    }

    pub fn inspector_url(&self) -> String {
        format!("ws://{}/inspector", self.addr)
    }

    /// Close every connection and stop accepting new ones.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if tokio::time::timeout(Duration::from_secs(5), self.server).await.is_err() {
            tracing::warn!("relay shutdown timed out");
        }
        let _ = self.cleanup.await;
        tracing::info!("relay stopped");
    }

    /// Wait until the server exits.
    pub async fn wait(self) {
        let _ = self.server.await;
        self.cleanup.abort();
    }
}

async fn app_ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let max = state.config.max_message_size;
    ws.max_message_size(max)
        .on_upgrade(move |socket| handle_socket(socket, state, Role::App))
}

async fn inspector_ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let max = state.config.max_message_size;
    ws.max_message_size(max)
        .on_upgrade(move |socket| handle_socket(socket, state, Role::Inspector))
}

async fn handle_socket(socket: WebSocket, state: AppState, role: Role) {
    let (id, rx) = state.hub.register(role);
    tracing::info!(connection_id = %id, role = %role, "websocket client connected");

    let ctx = ConnectionContext {
        id,
        role,
        hub: state.hub,
        broker: state.broker,
        heartbeat_interval: state.config.heartbeat_interval(),
        shutdown: state.shutdown,
    };
    connection::handle_ws_connection(socket, rx, ctx).await;
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    app_connections: usize,
    inspector_connections: usize,
    sessions: Vec<String>,
    started_at: DateTime<Utc>,
    uptime_secs: i64,
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let now = Utc::now();
    Json(Health {
        status: "healthy",
        app_connections: state.hub.count_role(Role::App),
        inspector_connections: state.hub.count_role(Role::Inspector),
        sessions: state
            .broker
            .registry()
            .sessions()
            .into_iter()
            .map(|s| s.to_string())
            .collect(),
        started_at: state.started_at,
        uptime_secs: (now - state.started_at).num_seconds(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn server_starts_and_serves_health() {
        let config = ServerConfig {
            port: 0,
            ..Default::default()
        };
        let handle = start(config).await.unwrap();
        assert!(handle.port > 0);

        let url = format!("http://127.0.0.1:{}/health", handle.port);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);

        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["app_connections"], 0);
        assert_eq!(body["inspector_connections"], 0);
        assert!(body["sessions"].as_array().unwrap().is_empty());
        assert!(body["started_at"].is_string());

        handle.shutdown().await;
    }

    #[test]
    fn build_router_creates_routes() {
        let _router = build_router(AppState::new(ServerConfig::default()));
    }

    #[tokio::test]
    async fn urls_use_bound_address() {
        let handle = start(ServerConfig {
            port: 0,
            ..Default::default()
        })
        .await
        .unwrap();
        assert_eq!(handle.app_url(), format!("ws://127.0.0.1:{}/app", handle.port));
        assert_eq!(handle.inspector_url(), format!("ws://127.0.0.1:{}/inspector", handle.port));
        handle.shutdown().await;
    }
}
