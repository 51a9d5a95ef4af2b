//! The per-server connection manager.
//!
//! Owns the one live session to its server and drives it through
//! `Disconnected → Connecting → Authenticating → SubscribingCallbacks → Ready`.
//! Raw callbacks are consumed by a single pump task per session, in delivery
//! order. Each callback updates in-memory state, writes it through to the
//! shared cache, and only then dispatches the normalized event.
//!
//! Connection attempts are serialized by `attempt_lock`. The registry's first
//! attempt, the supervisor's retries and `reconnect()` all go through it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use servdeck_core::cache::KeyValueCache;
use servdeck_core::session::{RawCallback, RpcSession, SessionConnector, SessionHandle, SessionSignal};
use servdeck_core::{
    ConnectionError, ConnectionState, EventKind, ListenerId, MapInfo, PlayerInfo, ServerEvent,
    ServerId,
};
use servdeck_settings::ServerDefinition;

use crate::config::ManagerConfig;
use crate::listeners::{Handler, ListenerGroup, ListenerRegistry, Principal, Subscription};
use crate::mirror::StateMirror;
use crate::normalize::{self, RawEvent};
use crate::roster::Roster;
use crate::sink::{self, NotificationSink};
use crate::supervisor;

const PLAYER_LIST_LIMIT: i64 = 1000;

/// Serializable view of a manager for dashboards and health checks.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerStatus {
    pub server_id: ServerId,
    pub name: String,
    pub state: ConnectionState,
    pub connected: bool,
    /// A connect attempt is underway.
    pub connecting: bool,
    /// Map and players are last-known-good rather than live.
    pub stale: bool,
    pub last_error: Option<String>,
    pub player_count: usize,
    pub spectator_count: usize,
    pub active_map: Option<MapInfo>,
}

#[derive(Default)]
struct LiveState {
    session: Option<Arc<dyn RpcSession>>,
    active_map: Option<MapInfo>,
    roster: Roster,
    last_error: Option<ConnectionError>,
    stale: bool,
}

pub struct ConnectionManager {
    definition: ServerDefinition,
    config: ManagerConfig,
    connector: Arc<dyn SessionConnector>,
    mirror: StateMirror,
    listeners: ListenerRegistry,
    sink: Option<Arc<NotificationSink>>,
    state: watch::Sender<ConnectionState>,
    live: RwLock<LiveState>,
    attempt_lock: tokio::sync::Mutex<()>,
    /// Bumped whenever a session is installed or torn down. Pumps for older
    /// generations exit without touching state.
    generation: AtomicU64,
    supervisor_started: AtomicBool,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    this: Weak<ConnectionManager>,
}

impl ConnectionManager {
    pub fn new(
        definition: ServerDefinition,
        config: ManagerConfig,
        connector: Arc<dyn SessionConnector>,
        cache: Arc<dyn KeyValueCache>,
        sink: Option<Arc<NotificationSink>>,
    ) -> Arc<Self> {
        let mirror = StateMirror::new(
            cache,
            definition.id.clone(),
            config.key_prefix.clone(),
            config.cache_ttl,
        );
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Arc::new_cyclic(|this| Self {
            definition,
            config,
            connector,
            mirror,
            listeners: ListenerRegistry::new(),
            sink,
            state,
            live: RwLock::new(LiveState::default()),
            attempt_lock: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
            supervisor_started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            this: this.clone(),
        })
    }

    pub fn server_id(&self) -> &ServerId {
        &self.definition.id
    }

    pub fn definition(&self) -> &ServerDefinition {
        &self.definition
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Observe state changes. The receiver starts at the current state.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Last known map, possibly stale.
    pub fn active_map(&self) -> Option<MapInfo> {
        self.live.read().active_map.clone()
    }

    pub fn active_players(&self) -> Vec<PlayerInfo> {
        self.live.read().roster.to_vec()
    }

    pub fn is_stale(&self) -> bool {
        self.live.read().stale
    }

    pub fn last_error(&self) -> Option<ConnectionError> {
        self.live.read().last_error.clone()
    }

    pub fn status(&self) -> ManagerStatus {
        let state = self.state();
        let live = self.live.read();
        ManagerStatus {
            server_id: self.definition.id.clone(),
            name: self.definition.name.clone(),
            state,
            connected: state == ConnectionState::Ready,
            connecting: state.is_in_flight(),
            stale: live.stale,
            last_error: live.last_error.as_ref().map(ToString::to_string),
            player_count: live.roster.len(),
            spectator_count: live.roster.players().iter().filter(|p| p.is_spectator()).count(),
            active_map: live.active_map.clone(),
        }
    }

    // ── subscriptions ──────────────────────────────────────────────────

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    pub fn subscribe(&self, kind: EventKind, handler: Handler) -> Subscription {
        self.listeners.subscribe(kind, handler)
    }

    /// Subscribe to a lifecycle event (`connect`, `disconnect`, `startMap`, `endMap`).
    pub fn on(&self, kind: EventKind, handler: Handler) -> Result<Subscription, ConnectionError> {
        if !kind.is_lifecycle() {
            return Err(ConnectionError::Configuration(format!(
                "'{kind}' is not a lifecycle event"
            )));
        }
        Ok(self.listeners.subscribe(kind, handler))
    }

    pub fn off(&self, kind: EventKind, handler: &Handler) -> bool {
        self.listeners.unsubscribe(kind, handler) > 0
    }

    pub fn add_listeners(
        &self,
        listener_id: &ListenerId,
        principal: Option<Principal>,
        handlers: impl IntoIterator<Item = (EventKind, Handler)>,
    ) -> ListenerGroup {
        let group = self.listeners.add_listeners(listener_id, principal, handlers);
        debug!(server_id = %self.definition.id, listener_id = %listener_id, handlers = group.len(), "listeners added");
        group
    }

    pub fn remove_listeners(&self, listener_id: &ListenerId) -> usize {
        let removed = self.listeners.remove_listeners(listener_id);
        debug!(server_id = %self.definition.id, listener_id = %listener_id, removed, "listeners removed");
        removed
    }

    // ── calls ──────────────────────────────────────────────────────────

    /// Forward a call to the session. Only valid while `Ready`; never queued.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, ConnectionError> {
        let session = self.ready_session()?;
        self.bounded(method, session.call(method, params)).await
    }

    pub async fn call_script(&self, method: &str, arg: Value) -> Result<Value, ConnectionError> {
        let session = self.ready_session()?;
        self.bounded(method, session.call_script(method, arg)).await
    }

    fn ready_session(&self) -> Result<Arc<dyn RpcSession>, ConnectionError> {
        let state = self.state();
        match (&self.live.read().session, state) {
            (Some(session), ConnectionState::Ready) => Ok(session.clone()),
            _ => Err(ConnectionError::NotConnected { state }),
        }
    }

    /// A slow call is not a dead transport: time out without touching state.
    async fn bounded<T>(
        &self,
        what: &str,
        fut: impl std::future::Future<Output = Result<T, ConnectionError>>,
    ) -> Result<T, ConnectionError> {
        let limit = self.config.rpc_timeout;
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(server_id = %self.definition.id, method = what, timeout_ms = limit.as_millis() as u64, "call timed out");
                Err(ConnectionError::Timeout(limit))
            }
        }
    }

    // ── lifecycle ──────────────────────────────────────────────────────

    /// Hydrate from the cache, make the first attempt, then hand over to the
    /// supervisor. The attempt's outcome is returned but the manager stays
    /// usable either way.
    pub async fn start(&self) -> Result<(), ConnectionError> {
        self.hydrate().await;
        let result = self.attempt().await;
        if let Err(e) = &result {
            warn!(server_id = %self.definition.id, error = %e, kind = e.error_kind(), "initial connection failed");
        }
        self.ensure_supervisor();
        result
    }

    /// Manual trigger. The only way out of `PermanentlyFailed`.
    pub async fn reconnect(&self) -> Result<(), ConnectionError> {
        if self.state() == ConnectionState::PermanentlyFailed {
            let _guard = self.attempt_lock.lock().await;
            if self.state() == ConnectionState::PermanentlyFailed {
                info!(server_id = %self.definition.id, "manual reconnect after permanent failure");
                self.live.write().last_error = None;
                self.transition(ConnectionState::Disconnected);
            }
        }
        self.attempt().await
    }

    /// Stop background tasks and close the session. No `disconnect` is
    /// broadcast. The manager cannot be restarted afterwards.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.generation.fetch_add(1, Ordering::SeqCst);

        let session = self.live.write().session.take();
        if let Some(session) = session {
            session.close().await;
        }
        if self.state() == ConnectionState::Ready {
            self.transition(ConnectionState::Disconnected);
        }
        info!(server_id = %self.definition.id, "manager shut down");
    }

    /// Adopt whatever the shared cache holds as stale last-known-good state.
    async fn hydrate(&self) {
        match self.mirror.read_back().await {
            Ok(cached) if !cached.is_empty() => {
                let mut live = self.live.write();
                if let Some(map) = cached.active_map {
                    live.active_map = Some(map);
                }
                if let Some(players) = cached.active_players {
                    live.roster = Roster::from_players(players);
                }
                live.stale = true;
                debug!(server_id = %self.definition.id, players = live.roster.len(), "hydrated from cache");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(server_id = %self.definition.id, error = %e, "cache hydration failed");
            }
        }
    }

    fn ensure_supervisor(&self) {
        if self.cancel.is_cancelled() || self.supervisor_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let handle = tokio::spawn(supervisor::run(
            self.this.clone(),
            self.state.subscribe(),
            self.config.backoff.clone(),
            self.cancel.clone(),
        ));
        self.tasks.lock().push(handle);
    }

    /// One pass through the state machine. No-op when already `Ready`.
    pub(crate) async fn attempt(&self) -> Result<(), ConnectionError> {
        if self.cancel.is_cancelled() {
            return Err(ConnectionError::NotConnected { state: self.state() });
        }
        let _guard = self.attempt_lock.lock().await;
        match self.state() {
            ConnectionState::Ready => return Ok(()),
            ConnectionState::PermanentlyFailed => {
                return Err(self.last_error().unwrap_or_else(|| {
                    ConnectionError::Authentication("credentials rejected".into())
                }))
            }
            _ => {}
        }

        self.transition(ConnectionState::Connecting);
        let endpoint = self.definition.endpoint();
        let connected = tokio::time::timeout(
            self.config.connect_timeout,
            self.connector.connect(&endpoint),
        )
        .await
        .unwrap_or_else(|_| {
            Err(ConnectionError::Transport(format!("connect to {endpoint} timed out")))
        });
        let SessionHandle { session, signals } = match connected {
            Ok(handle) => handle,
            Err(e) => return Err(self.attempt_failed(e)),
        };

        self.transition(ConnectionState::Authenticating);
        let credentials = self.definition.credentials();
        if let Err(e) = self.bounded("Authenticate", session.authenticate(&credentials)).await {
            session.close().await;
            if matches!(e, ConnectionError::Authentication(_)) {
                error!(server_id = %self.definition.id, login = %credentials.login, error = %e, "authentication rejected, not retrying");
                self.live.write().last_error = Some(e.clone());
                self.transition(ConnectionState::PermanentlyFailed);
                return Err(e);
            }
            return Err(self.attempt_failed(e));
        }

        self.transition(ConnectionState::SubscribingCallbacks);
        let api_version = self.definition.api_version.clone();
        if let Err(e) = self
            .bounded("EnableCallbacks", session.subscribe_callbacks(&api_version))
            .await
        {
            session.close().await;
            return Err(self.attempt_failed(e));
        }

        if self.cancel.is_cancelled() {
            session.close().await;
            return Err(self.attempt_failed(ConnectionError::Transport("manager shut down".into())));
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut live = self.live.write();
            live.session = Some(session);
            live.last_error = None;
        }
        self.transition(ConnectionState::Ready);
        self.dispatch(ServerEvent::Connect);
        self.seed().await;
        self.spawn_pump(generation, signals);
        Ok(())
    }

    fn attempt_failed(&self, e: ConnectionError) -> ConnectionError {
        self.live.write().last_error = Some(e.clone());
        self.transition(ConnectionState::Disconnected);
        e
    }

    fn transition(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev == next {
            return;
        }
        if !prev.can_transition_to(next) {
            warn!(server_id = %self.definition.id, from = %prev, to = %next, "unexpected state transition");
        }
        info!(server_id = %self.definition.id, from = %prev, to = %next, "state changed");
    }

    /// Fetch the current map and player list after reaching `Ready`.
    /// Failures are logged; the connection stays up.
    async fn seed(&self) {
        let mut fresh = true;

        match self
            .call("GetCurrentMapInfo", Vec::new())
            .await
            .and_then(decode::<MapInfo>)
        {
            Ok(map) => {
                self.live.write().active_map = Some(map.clone());
                self.mirror.write_map(&map).await;
                self.dispatch(ServerEvent::StartMap { map_uid: map.uid });
            }
            Err(e) => {
                fresh = false;
                warn!(server_id = %self.definition.id, error = %e, "could not fetch current map");
            }
        }

        match self
            .call("GetPlayerList", vec![json!(PLAYER_LIST_LIMIT), json!(0)])
            .await
            .and_then(decode::<Vec<PlayerInfo>>)
        {
            Ok(players) => {
                let players = {
                    let mut live = self.live.write();
                    live.roster = Roster::from_players(players);
                    live.roster.to_vec()
                };
                self.mirror.write_players(&players).await;
                self.dispatch(ServerEvent::PlayerList(players));
            }
            Err(e) => {
                fresh = false;
                warn!(server_id = %self.definition.id, error = %e, "could not fetch player list");
            }
        }

        if fresh {
            self.live.write().stale = false;
        }
    }

    fn spawn_pump(&self, generation: u64, signals: mpsc::UnboundedReceiver<SessionSignal>) {
        let handle = tokio::spawn(pump(
            self.this.clone(),
            generation,
            signals,
            self.cancel.clone(),
        ));
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    /// `Ready → Disconnected`. Broadcasts `disconnect` once, before the state
    /// changes; map and players are kept and marked stale.
    async fn transport_lost(&self, generation: u64, reason: String) {
        if self.generation.load(Ordering::SeqCst) != generation
            || self.state() != ConnectionState::Ready
        {
            return;
        }
        warn!(server_id = %self.definition.id, reason = %reason, "transport lost");

        self.dispatch(ServerEvent::Disconnect);
        let session = {
            let mut live = self.live.write();
            live.stale = true;
            live.last_error = Some(ConnectionError::Transport(reason));
            live.session.take()
        };
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.transition(ConnectionState::Disconnected);

        if let Some(session) = session {
            session.close().await;
        }
    }

    // ── normalization ──────────────────────────────────────────────────

    async fn handle_callback(&self, cb: RawCallback) {
        match normalize::classify(&cb) {
            RawEvent::PlayerConnect { login } => {
                let info = self.fetch_player(&login).await;
                let (stored, players) = self.upsert_player(info);
                self.mirror.write_players(&players).await;
                self.dispatch(ServerEvent::PlayerConnect(stored));
            }
            RawEvent::PlayerInfoChanged(info) => {
                let merged = {
                    let mut live = self.live.write();
                    live.roster
                        .merge(&info)
                        .map(|stored| (stored, live.roster.to_vec()))
                };
                let Some((stored, players)) = merged else {
                    trace!(server_id = %self.definition.id, login = %info.login, "info for player not in roster");
                    return;
                };
                self.mirror.write_players(&players).await;
                self.dispatch(ServerEvent::PlayerInfo(stored));
            }
            RawEvent::PlayerDisconnect { login } => {
                let remaining = {
                    let mut live = self.live.write();
                    live.roster.remove(&login).then(|| live.roster.to_vec())
                };
                if let Some(players) = remaining {
                    self.mirror.write_players(&players).await;
                }
                self.dispatch(ServerEvent::PlayerDisconnect { login });
            }
            RawEvent::BeginMap(map) => {
                self.live.write().active_map = Some(map.clone());
                self.mirror.write_map(&map).await;
                self.dispatch(ServerEvent::StartMap { map_uid: map.uid });
            }
            RawEvent::EndMap { map_uid } => {
                self.dispatch(ServerEvent::EndMap { map_uid });
            }
            RawEvent::AdminAssistance(payload) => {
                let enriched = sink::enrich(payload, &self.definition);
                let recipients = self.listeners.admin_recipients(EventKind::AdminCommand);
                self.dispatch(ServerEvent::AdminCommand(enriched.clone()));
                if let Some(sink) = &self.sink {
                    sink.persist(&self.definition, recipients, &enriched);
                }
            }
            RawEvent::Consumed(name) => {
                trace!(server_id = %self.definition.id, callback = %name, "callback consumed");
            }
            RawEvent::Unknown(name) => {
                trace!(server_id = %self.definition.id, callback = %name, "ignoring callback");
            }
        }
    }

    /// Full info for a newly connected login. Falls back to a bare entry so
    /// the roster still reflects the connect.
    async fn fetch_player(&self, login: &str) -> PlayerInfo {
        match self
            .call("GetPlayerInfo", vec![json!(login), json!(1)])
            .await
            .and_then(decode::<PlayerInfo>)
        {
            Ok(mut info) => {
                if info.login != login {
                    debug!(server_id = %self.definition.id, expected = login, got = %info.login, "player info login mismatch");
                    info.login = login.to_string();
                }
                info
            }
            Err(e) => {
                warn!(server_id = %self.definition.id, login, error = %e, "player info unavailable");
                PlayerInfo::bare(login)
            }
        }
    }

    fn upsert_player(&self, info: PlayerInfo) -> (PlayerInfo, Vec<PlayerInfo>) {
        let mut live = self.live.write();
        let stored = live.roster.upsert(info);
        (stored, live.roster.to_vec())
    }

    fn dispatch(&self, event: ServerEvent) {
        let kind = event.kind();
        let delivered = self.listeners.dispatch(&event);
        metrics::counter!("servdeck_events_dispatched_total", "event" => kind.as_str()).increment(1);
        trace!(server_id = %self.definition.id, event = %kind, delivered, "dispatched");
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, ConnectionError> {
    serde_json::from_value(value)
        .map_err(|e| ConnectionError::rpc(0, format!("unexpected result shape: {e}")))
}

async fn pump(
    manager: Weak<ConnectionManager>,
    generation: u64,
    mut signals: mpsc::UnboundedReceiver<SessionSignal>,
    cancel: CancellationToken,
) {
    loop {
        let signal = tokio::select! {
            () = cancel.cancelled() => return,
            signal = signals.recv() => signal,
        };
        let Some(m) = manager.upgrade() else { return };
        if m.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        match signal {
            Some(SessionSignal::Callback(cb)) => m.handle_callback(cb).await,
            Some(SessionSignal::Closed) => {
                m.transport_lost(generation, "transport closed".into()).await;
                return;
            }
            Some(SessionSignal::Error(reason)) => {
                m.transport_lost(generation, reason).await;
                return;
            }
            None => {
                m.transport_lost(generation, "signal stream ended".into()).await;
                return;
            }
        }
    }
}
