//! Classify raw session callbacks.
//!
//! Pure translation from the `ManiaPlanet.*` callback catalog into what the
//! manager has to do. State changes and dispatch live in the manager.

use serde_json::Value;

use servdeck_core::session::RawCallback;
use servdeck_core::{MapInfo, PlayerInfo};

pub const PLAYER_CONNECT: &str = "ManiaPlanet.PlayerConnect";
pub const PLAYER_DISCONNECT: &str = "ManiaPlanet.PlayerDisconnect";
pub const PLAYER_INFO_CHANGED: &str = "ManiaPlanet.PlayerInfoChanged";
pub const BEGIN_MAP: &str = "ManiaPlanet.BeginMap";
pub const END_MAP: &str = "ManiaPlanet.EndMap";
pub const SCRIPT_CALLBACK: &str = "ManiaPlanet.ModeScriptCallbackArray";

pub const SCRIPT_WAYPOINT: &str = "Trackmania.Event.WayPoint";
pub const SCRIPT_ADMIN_ASSISTANCE: &str = "Servdeck.AdminAssistance";

/// What a raw callback means to the manager.
#[derive(Clone, Debug, PartialEq)]
pub enum RawEvent {
    /// Only the login arrives; full info must be fetched.
    PlayerConnect { login: String },
    PlayerDisconnect { login: String },
    PlayerInfoChanged(PlayerInfo),
    BeginMap(MapInfo),
    EndMap { map_uid: String },
    AdminAssistance(Value),
    /// Recognized, consumed, no vocabulary event.
    Consumed(String),
    Unknown(String),
}

pub fn classify(cb: &RawCallback) -> RawEvent {
    let first = cb.params.first();
    match cb.method.as_str() {
        PLAYER_CONNECT => match first.and_then(Value::as_str) {
            Some(login) => RawEvent::PlayerConnect {
                login: login.to_string(),
            },
            None => RawEvent::Unknown(cb.method.clone()),
        },
        PLAYER_DISCONNECT => match first.and_then(Value::as_str) {
            Some(login) => RawEvent::PlayerDisconnect {
                login: login.to_string(),
            },
            None => RawEvent::Unknown(cb.method.clone()),
        },
        PLAYER_INFO_CHANGED => first
            .and_then(|v| serde_json::from_value::<PlayerInfo>(v.clone()).ok())
            .map_or_else(|| RawEvent::Unknown(cb.method.clone()), RawEvent::PlayerInfoChanged),
        BEGIN_MAP => first
            .and_then(|v| serde_json::from_value::<MapInfo>(v.clone()).ok())
            .map_or_else(|| RawEvent::Unknown(cb.method.clone()), RawEvent::BeginMap),
        END_MAP => match first.and_then(map_uid) {
            Some(uid) => RawEvent::EndMap { map_uid: uid },
            None => RawEvent::Unknown(cb.method.clone()),
        },
        SCRIPT_CALLBACK => classify_script(&cb.params),
        other => RawEvent::Unknown(other.to_string()),
    }
}

/// `ModeScriptCallbackArray(method, [args...])`. Args are JSON text.
fn classify_script(params: &[Value]) -> RawEvent {
    let Some(method) = params.first().and_then(Value::as_str) else {
        return RawEvent::Unknown(SCRIPT_CALLBACK.to_string());
    };
    let arg = params
        .get(1)
        .and_then(Value::as_array)
        .and_then(|args| args.first())
        .map(decode_script_arg)
        .unwrap_or(Value::Null);

    match method {
        SCRIPT_ADMIN_ASSISTANCE => RawEvent::AdminAssistance(arg),
        SCRIPT_WAYPOINT => RawEvent::Consumed(method.to_string()),
        other => RawEvent::Unknown(other.to_string()),
    }
}

fn decode_script_arg(raw: &Value) -> Value {
    match raw {
        Value::String(text) => serde_json::from_str(text).unwrap_or_else(|_| raw.clone()),
        other => other.clone(),
    }
}

fn map_uid(map: &Value) -> Option<String> {
    map.get("UId")
        .or_else(|| map.get("uid"))
        .and_then(Value::as_str)
        .map(String::from)
}
