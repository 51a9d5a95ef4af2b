//! Per-server event relay over WebSocket.
//!
//! One socket watches one server. On open the client's handlers are
//! registered for the whole event vocabulary, then a snapshot of the current
//! state is queued so the client never depends on having seen earlier
//! incremental events. On close the client's listener group is removed.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use servdeck_connection::{handler, ConnectionManager, Handler, Principal};
use servdeck_core::{EventKind, ServerEvent, ServerId};

use crate::client::Outbox;
use crate::error::ApiError;
use crate::server::AppState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Default, Deserialize)]
pub struct RelayParams {
    pub user: Option<String>,
    #[serde(default)]
    pub admin: bool,
}

impl RelayParams {
    fn principal(&self) -> Option<Principal> {
        self.user
            .as_deref()
            .filter(|u| !u.is_empty())
            .map(|u| Principal::new(u, self.admin))
    }
}

/// GET /servers/{id}/ws
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(id): Path<String>,
    Query(params): Query<RelayParams>,
    State(state): State<AppState>,
) -> Result<Response, ApiError> {
    let manager = state
        .registry
        .get_or_create(&ServerId::from_raw(id))
        .await?;
    let principal = params.principal();
    Ok(ws.on_upgrade(move |socket| relay(socket, manager, principal, state)))
}

/// Events a fresh client needs before incremental updates make sense.
pub fn snapshot(manager: &ConnectionManager) -> Vec<ServerEvent> {
    let mut events = vec![ServerEvent::PlayerList(manager.active_players())];
    if let Some(map) = manager.active_map() {
        events.push(ServerEvent::StartMap { map_uid: map.uid });
    }
    if !manager.is_connected() {
        events.push(ServerEvent::Disconnect);
    }
    events
}

/// Holds back live events until the opening snapshot is queued.
///
/// The manager updates its state before dispatching, so anything dispatched
/// while the gate is closed is either already reflected in the snapshot
/// (and replays idempotently) or happened after it was taken.
pub struct SnapshotGate {
    outbox: Outbox,
    held: Mutex<Option<Vec<String>>>,
}

impl SnapshotGate {
    pub fn new(outbox: Outbox) -> Arc<Self> {
        Arc::new(Self {
            outbox,
            held: Mutex::new(Some(Vec::new())),
        })
    }

    fn forward(&self, json: String) {
        let mut held = self.held.lock();
        match held.as_mut() {
            Some(buffer) => buffer.push(json),
            None => {
                self.outbox.push(json);
            }
        }
    }

    /// Queue the snapshot, then everything held back, then go live.
    pub fn open(&self, snapshot: Vec<ServerEvent>) -> usize {
        let mut held = self.held.lock();
        for event in snapshot {
            if let Some(json) = event.to_json() {
                self.outbox.push(json);
            }
        }
        let replayed = held.take().unwrap_or_default();
        let count = replayed.len();
        for json in replayed {
            self.outbox.push(json);
        }
        count
    }
}

fn forward_to(gate: &Arc<SnapshotGate>) -> Handler {
    let gate = gate.clone();
    handler(move |event| {
        if let Some(json) = event.to_json() {
            gate.forward(json);
        }
    })
}

async fn relay(
    socket: WebSocket,
    manager: Arc<ConnectionManager>,
    principal: Option<Principal>,
    state: AppState,
) {
    let server_id = manager.server_id().clone();
    let (outbox, rx) = state.clients.register(server_id.clone(), principal.clone());
    let listener_id = outbox.listener_id().clone();

    let gate = SnapshotGate::new(outbox);
    let _group = manager.add_listeners(
        &listener_id,
        principal,
        EventKind::ALL.map(|kind| (kind, forward_to(&gate))),
    );
    let replayed = gate.open(snapshot(&manager));
    info!(server_id = %server_id, listener_id = %listener_id, replayed, "relay opened");

    pump_socket(socket, rx, &state.shutdown).await;

    let removed = manager.remove_listeners(&listener_id);
    state.clients.unregister(&listener_id);
    info!(server_id = %server_id, listener_id = %listener_id, removed, "relay closed");
}

/// Drain the outbox into the socket and watch the socket for close.
async fn pump_socket(
    socket: WebSocket,
    mut rx: mpsc::Receiver<String>,
    shutdown: &CancellationToken,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer = async {
        let mut ping = tokio::time::interval(HEARTBEAT_INTERVAL);
        ping.tick().await;
        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(text) => {
                        if ws_tx.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = ping.tick() => {
                    if ws_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
                () = shutdown.cancelled() => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    };

    let reader = async {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                Message::Close(_) => break,
                Message::Text(text) => trace!(len = text.as_str().len(), "ignoring client message"),
                _ => {}
            }
        }
        debug!("client socket closed");
    };

    tokio::select! {
        () = writer => {}
        () = reader => {}
    }
}
