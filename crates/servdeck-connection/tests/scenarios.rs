//! End-to-end manager scenarios through the registry, driven by the mock
//! session and the in-process cache.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::timeout;

use servdeck_connection::normalize::{
    BEGIN_MAP, PLAYER_CONNECT, PLAYER_DISCONNECT, PLAYER_INFO_CHANGED, SCRIPT_ADMIN_ASSISTANCE,
    SCRIPT_CALLBACK,
};
use servdeck_connection::{
    handler, BackoffPolicy, ConnectionManager, ConnectionRegistry, ManagerConfig,
    NotificationSink, Principal, StateMirror,
};
use servdeck_core::cache::{state_key, KeyValueCache, StateKind};
use servdeck_core::notifications::{NotificationStore, ADMIN_ASSISTANCE};
use servdeck_core::{
    ConnectionError, ConnectionState, EventKind, ListenerId, MapInfo, PlayerInfo, ServerEvent,
    ServerId, UserId,
};
use servdeck_session::{MockConnector, MockSession};
use servdeck_settings::ServerDefinition;
use servdeck_store::{Database, MemoryCache, NotificationRepo};

const TIMEOUT: Duration = Duration::from_secs(5);

struct Harness {
    registry: Arc<ConnectionRegistry>,
    connector: Arc<MockConnector>,
    cache: Arc<MemoryCache>,
    notifications: Arc<NotificationRepo>,
    sink: Arc<NotificationSink>,
}

/// Retries are pushed far out so a lost transport stays lost for the test.
fn config() -> ManagerConfig {
    ManagerConfig {
        rpc_timeout: Duration::from_secs(2),
        connect_timeout: Duration::from_secs(2),
        backoff: BackoffPolicy {
            base_delay: Duration::from_secs(3600),
            max_delay: Duration::from_secs(3600),
            jitter_factor: 0.0,
            max_attempts: None,
        },
        key_prefix: "servdeck".into(),
        cache_ttl: None,
    }
}

fn harness() -> Harness {
    let connector = Arc::new(MockConnector::new());
    connector.respond("GetCurrentMapInfo", json!({"UId": "map-1", "Name": "A01"}));
    connector.respond("GetPlayerList", json!([]));

    let cache = Arc::new(MemoryCache::new());
    let notifications = Arc::new(NotificationRepo::new(Database::in_memory().unwrap()));
    let sink = Arc::new(NotificationSink::new(notifications.clone()));
    let registry = ConnectionRegistry::new(
        [ServerDefinition::new("main", "Main Server", "127.0.0.1", 5000)],
        config(),
        connector.clone(),
        cache.clone(),
    )
    .with_notifications(sink.clone());

    Harness {
        registry: Arc::new(registry),
        connector,
        cache,
        notifications,
        sink,
    }
}

fn main_id() -> ServerId {
    ServerId::from("main")
}

async fn ready(h: &Harness) -> (Arc<ConnectionManager>, Arc<MockSession>) {
    let m = h.registry.get_or_create(&main_id()).await.unwrap();
    assert_eq!(m.state(), ConnectionState::Ready);
    let session = h.connector.last_session().unwrap();
    (m, session)
}

async fn wait_for_state(m: &ConnectionManager, target: ConnectionState) {
    let mut rx = m.watch_state();
    timeout(TIMEOUT, rx.wait_for(|s| *s == target))
        .await
        .expect("state change timed out")
        .unwrap();
}

/// Forward every event of `kind` into a channel.
fn tap(m: &ConnectionManager, kind: EventKind) -> mpsc::UnboundedReceiver<ServerEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    let _sub = m.subscribe(
        kind,
        handler(move |event| {
            let _ = tx.send(event.clone());
        }),
    );
    rx
}

async fn next(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> ServerEvent {
    timeout(TIMEOUT, rx.recv())
        .await
        .expect("event timed out")
        .expect("channel closed")
}

fn abc(nick: &str) -> Value {
    json!({"Login": "abc", "NickName": nick, "PlayerId": 7, "SpectatorStatus": 0, "TeamId": -1})
}

// ── registry ──

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_lookups_share_one_connect() {
    let h = harness();
    h.connector.set_connect_delay(Duration::from_millis(50));

    let mut set = tokio::task::JoinSet::new();
    for _ in 0..16 {
        let registry = h.registry.clone();
        set.spawn(async move { registry.get_or_create(&main_id()).await.unwrap() });
    }
    let mut managers = Vec::new();
    while let Some(joined) = set.join_next().await {
        managers.push(joined.unwrap());
    }

    assert_eq!(h.connector.connect_count(), 1);
    assert!(managers.iter().all(|m| Arc::ptr_eq(m, &managers[0])));
    assert!(managers[0].is_connected());
    h.registry.dispose_all().await;
}

#[tokio::test]
async fn unknown_server_fails_fast_without_connecting() {
    let h = harness();
    let err = h.registry.get_or_create(&ServerId::from("nope")).await.err();
    assert!(matches!(err, Some(ConnectionError::Configuration(_))));
    assert_eq!(h.connector.connect_count(), 0);
}

// ── roster ──

#[tokio::test]
async fn player_connect_fetches_info_and_mirrors_roster() {
    let h = harness();
    let (m, session) = ready(&h).await;
    session.respond("GetPlayerInfo", abc("Abc"));
    let mut connects = tap(&m, EventKind::PlayerConnect);

    session.push_callback(PLAYER_CONNECT, vec![json!("abc"), json!(false)]);
    let event = next(&mut connects).await;

    let expected = PlayerInfo {
        login: "abc".into(),
        nick_name: "Abc".into(),
        player_id: 7,
        spectator_status: 0,
        team_id: -1,
    };
    assert_eq!(event, ServerEvent::PlayerConnect(expected.clone()));
    assert_eq!(m.active_players(), vec![expected.clone()]);

    let key = state_key("servdeck", &main_id(), StateKind::ActivePlayers);
    let cached = h.cache.get(&key).await.unwrap().unwrap();
    assert_eq!(cached, serde_json::to_string(&vec![expected]).unwrap());
    h.registry.dispose_all().await;
}

#[tokio::test]
async fn repeated_connect_merges_into_one_entry() {
    let h = harness();
    let (m, session) = ready(&h).await;
    session.respond_seq("GetPlayerInfo", vec![abc("Abc"), abc("Abc Renamed")]);
    let mut connects = tap(&m, EventKind::PlayerConnect);

    session.push_callback(PLAYER_CONNECT, vec![json!("abc")]);
    session.push_callback(PLAYER_CONNECT, vec![json!("abc")]);
    next(&mut connects).await;
    next(&mut connects).await;

    let players = m.active_players();
    assert_eq!(players.len(), 1);
    assert_eq!(players[0].nick_name, "Abc Renamed");
    h.registry.dispose_all().await;
}

#[tokio::test]
async fn handlers_see_state_consistent_with_the_event() {
    let h = harness();
    let (m, session) = ready(&h).await;
    session.respond("GetPlayerInfo", abc("Abc"));

    let seen: Arc<Mutex<Vec<(EventKind, Vec<String>)>>> = Arc::default();
    let weak: Weak<ConnectionManager> = Arc::downgrade(&m);
    let (tx, mut done) = mpsc::unbounded_channel();
    let record = {
        let seen = seen.clone();
        handler(move |event| {
            if let Some(m) = weak.upgrade() {
                let logins = m.active_players().into_iter().map(|p| p.login).collect();
                seen.lock().push((event.kind(), logins));
            }
            let _ = tx.send(());
        })
    };
    let _group = m.add_listeners(
        &ListenerId::from("observer"),
        None,
        [
            (EventKind::PlayerConnect, record.clone()),
            (EventKind::PlayerDisconnect, record),
        ],
    );

    session.push_callback(PLAYER_CONNECT, vec![json!("abc")]);
    session.push_callback(PLAYER_DISCONNECT, vec![json!("abc"), json!("")]);
    for _ in 0..2 {
        timeout(TIMEOUT, done.recv()).await.unwrap();
    }

    assert_eq!(
        *seen.lock(),
        vec![
            (EventKind::PlayerConnect, vec!["abc".to_string()]),
            (EventKind::PlayerDisconnect, Vec::new()),
        ]
    );
    h.registry.dispose_all().await;
}

#[tokio::test]
async fn disconnect_of_absent_login_is_a_no_op() {
    let h = harness();
    let (m, session) = ready(&h).await;
    session.respond("GetPlayerInfo", abc("Abc"));
    let mut connects = tap(&m, EventKind::PlayerConnect);
    let mut disconnects = tap(&m, EventKind::PlayerDisconnect);

    session.push_callback(PLAYER_CONNECT, vec![json!("abc")]);
    next(&mut connects).await;

    for _ in 0..2 {
        session.push_callback(PLAYER_DISCONNECT, vec![json!("ghost")]);
        next(&mut disconnects).await;
    }
    assert_eq!(m.active_players().len(), 1);

    session.push_callback(PLAYER_DISCONNECT, vec![json!("abc")]);
    session.push_callback(PLAYER_DISCONNECT, vec![json!("abc")]);
    next(&mut disconnects).await;
    next(&mut disconnects).await;
    assert!(m.active_players().is_empty());
    h.registry.dispose_all().await;
}

#[tokio::test]
async fn info_after_disconnect_does_not_bring_the_player_back() {
    let h = harness();
    let (m, session) = ready(&h).await;
    session.respond("GetPlayerInfo", abc("Abc"));
    let mut connects = tap(&m, EventKind::PlayerConnect);
    let mut disconnects = tap(&m, EventKind::PlayerDisconnect);
    let mut infos = tap(&m, EventKind::PlayerInfo);
    let mut maps = tap(&m, EventKind::StartMap);

    session.push_callback(PLAYER_CONNECT, vec![json!("abc")]);
    next(&mut connects).await;
    session.push_callback(PLAYER_DISCONNECT, vec![json!("abc")]);
    next(&mut disconnects).await;
    session.push_callback(PLAYER_INFO_CHANGED, vec![abc("Late")]);
    // Callbacks are handled in order, so once this map event arrives the
    // late info has been processed.
    session.push_callback(BEGIN_MAP, vec![json!({"UId": "map-2", "Name": "A02"})]);
    next(&mut maps).await;

    assert!(m.active_players().is_empty());
    assert!(infos.try_recv().is_err());
    let key = state_key("servdeck", &main_id(), StateKind::ActivePlayers);
    assert_eq!(h.cache.get(&key).await.unwrap().as_deref(), Some("[]"));
    h.registry.dispose_all().await;
}

#[tokio::test]
async fn info_changed_and_begin_map_update_state() {
    let h = harness();
    let (m, session) = ready(&h).await;
    session.respond("GetPlayerInfo", abc("Abc"));
    let mut connects = tap(&m, EventKind::PlayerConnect);
    let mut infos = tap(&m, EventKind::PlayerInfo);
    let mut maps = tap(&m, EventKind::StartMap);

    session.push_callback(PLAYER_CONNECT, vec![json!("abc")]);
    next(&mut connects).await;
    session.push_callback(PLAYER_INFO_CHANGED, vec![abc("Abc2")]);
    session.push_callback(BEGIN_MAP, vec![json!({"UId": "map-2", "Name": "A02"})]);

    assert!(matches!(next(&mut infos).await, ServerEvent::PlayerInfo(p) if p.nick_name == "Abc2"));
    assert_eq!(
        next(&mut maps).await,
        ServerEvent::StartMap {
            map_uid: "map-2".into()
        }
    );
    assert_eq!(m.active_map().map(|map| map.uid), Some("map-2".into()));

    let cached = h.registry.reader().active_map(&main_id()).await.unwrap();
    assert_eq!(cached.map(|map| map.name), Some("A02".into()));
    h.registry.dispose_all().await;
}

// ── listeners ──

#[tokio::test]
async fn removed_listeners_receive_nothing() {
    let h = harness();
    let (m, session) = ready(&h).await;
    let client = ListenerId::from("client-1");
    let hits = Arc::new(AtomicUsize::new(0));

    let counting = {
        let hits = hits.clone();
        handler(move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    };
    let _group = m.add_listeners(
        &client,
        None,
        [
            (EventKind::PlayerDisconnect, counting.clone()),
            (EventKind::EndMap, counting),
        ],
    );
    assert_eq!(m.remove_listeners(&client), 2);
    assert_eq!(m.listeners().count_for(&client), 0);

    let mut disconnects = tap(&m, EventKind::PlayerDisconnect);
    session.push_callback(PLAYER_DISCONNECT, vec![json!("abc")]);
    next(&mut disconnects).await;

    assert_eq!(hits.load(Ordering::SeqCst), 0);
    h.registry.dispose_all().await;
}

// ── transport loss ──

#[tokio::test]
async fn transport_close_broadcasts_one_disconnect_and_keeps_state() {
    let h = harness();
    let (m, session) = ready(&h).await;
    let disconnects = Arc::new(AtomicUsize::new(0));
    let _sub = {
        let d = disconnects.clone();
        m.on(
            EventKind::Disconnect,
            handler(move |_| {
                d.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap()
    };

    session.close_transport();
    session.close_transport();
    wait_for_state(&m, ConnectionState::Disconnected).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    assert!(!m.is_connected());
    assert!(m.is_stale());
    assert_eq!(m.active_map().map(|map| map.uid), Some("map-1".into()));
    assert!(session.is_closed());
    assert!(matches!(
        m.call("GetVersion", vec![]).await,
        Err(ConnectionError::NotConnected {
            state: ConnectionState::Disconnected
        })
    ));
    assert!(matches!(m.last_error(), Some(ConnectionError::Transport(_))));
    h.registry.dispose_all().await;
}

#[tokio::test]
async fn transport_error_also_disconnects() {
    let h = harness();
    let (m, session) = ready(&h).await;
    let mut disconnects = tap(&m, EventKind::Disconnect);

    session.fail_transport("connection reset by peer");
    assert_eq!(next(&mut disconnects).await, ServerEvent::Disconnect);
    wait_for_state(&m, ConnectionState::Disconnected).await;
    h.registry.dispose_all().await;
}

// ── notifications ──

#[tokio::test]
async fn admin_command_reaches_every_listener_and_persists_per_admin() {
    let h = harness();
    let (m, session) = ready(&h).await;

    let mut receivers = Vec::new();
    for (client, principal) in [
        ("tab-1", Some(Principal::new("admin-1", true))),
        ("tab-2", Some(Principal::new("admin-2", true))),
        ("tab-3", Some(Principal::new("viewer", false))),
    ] {
        let (tx, rx) = mpsc::unbounded_channel();
        let _group = m.add_listeners(
            &ListenerId::from(client),
            principal,
            [(
                EventKind::AdminCommand,
                handler(move |event: &ServerEvent| {
                    let _ = tx.send(event.clone());
                }),
            )],
        );
        receivers.push(rx);
    }

    session.push_callback(
        SCRIPT_CALLBACK,
        vec![
            json!(SCRIPT_ADMIN_ASSISTANCE),
            json!([r#"{"login":"abc","message":"stuck in wall"}"#]),
        ],
    );

    for rx in &mut receivers {
        match next(rx).await {
            ServerEvent::AdminCommand(payload) => {
                assert_eq!(payload["serverName"], "Main Server");
                assert_eq!(payload["serverId"], "main");
                assert_eq!(payload["login"], "abc");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    h.sink.flush().await;
    for admin in ["admin-1", "admin-2"] {
        let rows = h
            .notifications
            .list_for_user(&UserId::from(admin), false)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].kind, ADMIN_ASSISTANCE);
        assert_eq!(rows[0].message, "Admin assistance requested on Main Server");
        assert!(!rows[0].read);
    }
    let viewer = h
        .notifications
        .list_for_user(&UserId::from("viewer"), false)
        .await
        .unwrap();
    assert!(viewer.is_empty());
    h.registry.dispose_all().await;
}

// ── hydration ──

#[tokio::test]
async fn offline_server_serves_cached_snapshot() {
    let h = harness();
    let mirror = StateMirror::new(h.cache.clone(), main_id(), "servdeck", None);
    mirror.write_map(&MapInfo::new("cached-map", "Old")).await;
    let mut watcher = PlayerInfo::bare("spec");
    watcher.spectator_status = 1;
    mirror.write_players(&[PlayerInfo::bare("abc"), watcher]).await;
    h.connector
        .fail_next_connect(ConnectionError::Transport("connection refused".into()));

    let m = h.registry.get_or_create(&main_id()).await.unwrap();
    assert_eq!(m.state(), ConnectionState::Disconnected);
    assert!(m.is_stale());
    assert_eq!(m.active_map().map(|map| map.uid), Some("cached-map".into()));
    assert_eq!(m.active_players().len(), 2);

    let status = m.status();
    assert!(!status.connected);
    assert!(!status.connecting);
    assert!(status.stale);
    assert_eq!(status.player_count, 2);
    assert_eq!(status.spectator_count, 1);
    assert!(status.last_error.is_some());
    h.registry.dispose_all().await;
}

#[tokio::test]
async fn seeding_replaces_hydrated_state() {
    let h = harness();
    let mirror = StateMirror::new(h.cache.clone(), main_id(), "servdeck", None);
    mirror.write_players(&[PlayerInfo::bare("gone")]).await;

    let (m, _) = ready(&h).await;
    assert!(!m.is_stale());
    assert!(m.active_players().is_empty());
    assert_eq!(m.active_map().map(|map| map.uid), Some("map-1".into()));
    h.registry.dispose_all().await;
}
