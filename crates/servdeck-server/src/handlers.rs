//! HTTP handlers. Thin: every decision lives in the connection crate or the
//! notification store.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use servdeck_connection::{CachedState, ManagerStatus};
use servdeck_core::notifications::Notification;
use servdeck_core::{ConnectionError, NotificationId, ServerId, UserId};
use servdeck_telemetry::{LogQuery, LogRecord};

use crate::error::ApiError;
use crate::server::AppState;

const MAX_LOG_ROWS: u32 = 1_000;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_secs: u64,
    /// Configured servers.
    pub servers: usize,
    /// Servers with a live session in this process.
    pub connected: usize,
    pub clients: usize,
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let connected = state
        .registry
        .managers()
        .iter()
        .filter(|m| m.is_connected())
        .count();
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.start_time.elapsed().as_secs(),
        servers: state.registry.server_ids().len(),
        connected,
        clients: state.clients.count(),
    })
}

/// GET /servers
pub async fn list_servers(State(state): State<AppState>) -> Json<Vec<ManagerStatus>> {
    Json(state.registry.managers().iter().map(|m| m.status()).collect())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStateResponse {
    pub server_id: ServerId,
    pub connected: bool,
    /// Relay sockets open against this server in this process.
    pub clients: usize,
    #[serde(flatten)]
    pub state: CachedState,
}

/// GET /servers/{id}/state
///
/// Answers from the shared cache only, so it works for servers whose live
/// session is owned by another process.
pub async fn server_state(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ServerStateResponse>, ApiError> {
    let server_id = known_server(&state, id)?;
    let cached = state.registry.reader().snapshot(&server_id).await?;
    let connected = state
        .registry
        .get(&server_id)
        .is_some_and(|m| m.is_connected());
    Ok(Json(ServerStateResponse {
        clients: state.clients.count_for(&server_id),
        server_id,
        connected,
        state: cached,
    }))
}

/// POST /servers/{id}/reconnect
pub async fn reconnect(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ManagerStatus>, ApiError> {
    let server_id = known_server(&state, id)?;
    let manager = state.registry.get_or_create(&server_id).await?;
    manager.reconnect().await?;
    Ok(Json(manager.status()))
}

fn known_server(state: &AppState, id: String) -> Result<ServerId, ApiError> {
    let server_id = ServerId::from_raw(id);
    if state.registry.definition(&server_id).is_none() {
        return Err(ConnectionError::Configuration(format!("unknown server id '{server_id}'")).into());
    }
    Ok(server_id)
}

#[derive(Debug, Default, Deserialize)]
pub struct NotificationParams {
    #[serde(default)]
    pub unread: bool,
}

/// GET /users/{user}/notifications?unread=true
pub async fn list_notifications(
    State(state): State<AppState>,
    Path(user): Path<String>,
    Query(params): Query<NotificationParams>,
) -> Result<Json<Vec<Notification>>, ApiError> {
    let rows = state
        .notifications
        .list_for_user(&UserId::from_raw(user), params.unread)
        .await?;
    Ok(Json(rows))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnreadCount {
    pub user_id: UserId,
    pub unread: u64,
}

/// GET /users/{user}/notifications/unread-count
pub async fn unread_count(
    State(state): State<AppState>,
    Path(user): Path<String>,
) -> Result<Json<UnreadCount>, ApiError> {
    let user_id = UserId::from_raw(user);
    let unread = state.notifications.unread_count(&user_id).await?;
    Ok(Json(UnreadCount { user_id, unread }))
}

/// POST /notifications/{id}/read
pub async fn mark_read(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Notification>, ApiError> {
    let updated = state
        .notifications
        .mark_read(&NotificationId::from_raw(id))
        .await?;
    Ok(Json(updated))
}

#[derive(Debug, Default, Deserialize)]
pub struct LogParams {
    pub level: Option<String>,
    pub target: Option<String>,
    pub server: Option<String>,
    pub since: Option<String>,
    pub limit: Option<u32>,
}

/// GET /logs
///
/// Persisted warn+ records, newest first.
pub async fn logs(
    State(state): State<AppState>,
    Query(params): Query<LogParams>,
) -> Result<Json<Vec<LogRecord>>, ApiError> {
    let sink = state.logs.as_ref().ok_or(ApiError::LogsDisabled)?;
    let query = LogQuery {
        level: params.level,
        target: params.target,
        server_id: params.server,
        since: params.since,
        limit: Some(params.limit.unwrap_or(100).min(MAX_LOG_ROWS)),
    };
    let rows = sink.query(&query).map_err(|e| ApiError::Logs(e.to_string()))?;
    Ok(Json(rows))
}
