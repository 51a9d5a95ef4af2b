use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::routing::{get, post};
use axum::Router;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use servdeck_connection::ConnectionRegistry;
use servdeck_core::notifications::NotificationStore;
use servdeck_settings::HttpSettings;
use servdeck_telemetry::SqliteLogSink;

use crate::client::ClientRegistry;
use crate::handlers;
use crate::relay;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    /// 0 picks a free port.
    pub port: u16,
    pub max_send_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from(&HttpSettings::default())
    }
}

impl From<&HttpSettings> for ServerConfig {
    fn from(s: &HttpSettings) -> Self {
        Self {
            host: s.host.clone(),
            port: s.port,
            max_send_queue: s.max_send_queue,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub notifications: Arc<dyn NotificationStore>,
    pub clients: Arc<ClientRegistry>,
    pub logs: Option<Arc<SqliteLogSink>>,
    pub start_time: Instant,
    /// Cancelled on shutdown; open relays close their sockets.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        config: &ServerConfig,
        registry: Arc<ConnectionRegistry>,
        notifications: Arc<dyn NotificationStore>,
        logs: Option<Arc<SqliteLogSink>>,
    ) -> Self {
        Self {
            registry,
            notifications,
            clients: Arc::new(ClientRegistry::new(config.max_send_queue)),
            logs,
            start_time: Instant::now(),
            shutdown: CancellationToken::new(),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/servers", get(handlers::list_servers))
        .route("/servers/{id}/state", get(handlers::server_state))
        .route("/servers/{id}/reconnect", post(handlers::reconnect))
        .route("/servers/{id}/ws", get(relay::ws_handler))
        .route(
            "/users/{user}/notifications",
            get(handlers::list_notifications),
        )
        .route(
            "/users/{user}/notifications/unread-count",
            get(handlers::unread_count),
        )
        .route("/notifications/{id}/read", post(handlers::mark_read))
        .route("/logs", get(handlers::logs))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and serve. Returns once the listener is bound.
pub async fn start(config: ServerConfig, state: AppState) -> Result<ServerHandle, std::io::Error> {
    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let addr = listener.local_addr()?;
    let shutdown = state.shutdown.clone();
    let router = build_router(state);

    tracing::info!(%addr, "servdeck server started");

    let signal = shutdown.clone();
    let server = tokio::spawn(async move {
        let served = axum::serve(listener, router)
            .with_graceful_shutdown(async move { signal.cancelled().await })
            .await;
        if let Err(e) = served {
            tracing::error!(error = %e, "server stopped with error");
        }
    });

    Ok(ServerHandle {
        addr,
        shutdown,
        server,
    })
}

/// Handle returned by `start()`. Dropping it leaves the server running.
pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown: CancellationToken,
    server: JoinHandle<()>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Stop accepting, close relays, and wait briefly for in-flight requests.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let abort = self.server.abort_handle();
        if tokio::time::timeout(SHUTDOWN_GRACE, self.server).await.is_err() {
            tracing::warn!("graceful shutdown timed out, aborting");
            abort.abort();
        }
    }
}
