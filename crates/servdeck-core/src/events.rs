use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::player::PlayerInfo;

/// Closed vocabulary of normalized events a manager dispatches.
#[derive(Clone, Debug, PartialEq)]
pub enum ServerEvent {
    Connect,
    Disconnect,
    StartMap { map_uid: String },
    EndMap { map_uid: String },
    PlayerConnect(PlayerInfo),
    PlayerDisconnect { login: String },
    PlayerInfo(PlayerInfo),
    PlayerList(Vec<PlayerInfo>),
    AdminCommand(Value),
}

/// Event names, used as subscription keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    Connect,
    Disconnect,
    StartMap,
    EndMap,
    PlayerConnect,
    PlayerDisconnect,
    PlayerInfo,
    PlayerList,
    AdminCommand,
}

impl EventKind {
    pub const ALL: [EventKind; 9] = [
        EventKind::Connect,
        EventKind::Disconnect,
        EventKind::StartMap,
        EventKind::EndMap,
        EventKind::PlayerConnect,
        EventKind::PlayerDisconnect,
        EventKind::PlayerInfo,
        EventKind::PlayerList,
        EventKind::AdminCommand,
    ];

    /// The coarse lifecycle events exposed through `on`/`off`.
    pub const LIFECYCLE: [EventKind; 4] = [
        EventKind::Connect,
        EventKind::Disconnect,
        EventKind::StartMap,
        EventKind::EndMap,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::StartMap => "startMap",
            Self::EndMap => "endMap",
            Self::PlayerConnect => "playerConnect",
            Self::PlayerDisconnect => "playerDisconnect",
            Self::PlayerInfo => "playerInfo",
            Self::PlayerList => "playerList",
            Self::AdminCommand => "adminCommand",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == name)
    }

    pub fn is_lifecycle(&self) -> bool {
        Self::LIFECYCLE.contains(self)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire form delivered to clients: `{"type": <eventName>, "data": <payload>}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
}

impl ServerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Connect => EventKind::Connect,
            Self::Disconnect => EventKind::Disconnect,
            Self::StartMap { .. } => EventKind::StartMap,
            Self::EndMap { .. } => EventKind::EndMap,
            Self::PlayerConnect(_) => EventKind::PlayerConnect,
            Self::PlayerDisconnect { .. } => EventKind::PlayerDisconnect,
            Self::PlayerInfo(_) => EventKind::PlayerInfo,
            Self::PlayerList(_) => EventKind::PlayerList,
            Self::AdminCommand(_) => EventKind::AdminCommand,
        }
    }

    pub fn to_wire(&self) -> WireEvent {
        let data = match self {
            Self::Connect | Self::Disconnect => Value::Null,
            Self::StartMap { map_uid } | Self::EndMap { map_uid } => Value::String(map_uid.clone()),
            Self::PlayerConnect(p) | Self::PlayerInfo(p) => {
                serde_json::to_value(p).unwrap_or(Value::Null)
            }
            Self::PlayerDisconnect { login } => Value::String(login.clone()),
            Self::PlayerList(players) => serde_json::to_value(players).unwrap_or(Value::Null),
            Self::AdminCommand(payload) => payload.clone(),
        };
        WireEvent {
            event_type: self.kind().as_str().to_string(),
            data,
        }
    }

    /// Serialize to the JSON text sent over a client socket.
    pub fn to_json(&self) -> Option<String> {
        serde_json::to_string(&self.to_wire()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_roundtrip() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EventKind::parse("waypoint"), None);
    }

    #[test]
    fn lifecycle_subset() {
        assert!(EventKind::Connect.is_lifecycle());
        assert!(EventKind::EndMap.is_lifecycle());
        assert!(!EventKind::PlayerList.is_lifecycle());
    }

    #[test]
    fn connect_serializes_with_null_data() {
        let json = ServerEvent::Connect.to_json().unwrap();
        assert_eq!(json, r#"{"type":"connect","data":null}"#);
    }

    #[test]
    fn start_map_carries_uid() {
        let wire = ServerEvent::StartMap {
            map_uid: "uid-1".into(),
        }
        .to_wire();
        assert_eq!(wire.event_type, "startMap");
        assert_eq!(wire.data, serde_json::json!("uid-1"));
    }

    #[test]
    fn player_list_serializes_players() {
        let wire = ServerEvent::PlayerList(vec![PlayerInfo::bare("abc")]).to_wire();
        assert_eq!(wire.event_type, "playerList");
        assert_eq!(wire.data[0]["login"], "abc");
    }

    #[test]
    fn wire_event_parses_back() {
        let json = ServerEvent::PlayerDisconnect {
            login: "abc".into(),
        }
        .to_json()
        .unwrap();
        let wire: WireEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(wire.event_type, "playerDisconnect");
        assert_eq!(wire.data, "abc");
    }
}
