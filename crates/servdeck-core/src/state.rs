use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection lifecycle of a managed server.
///
/// `Disconnected → Connecting → Authenticating → SubscribingCallbacks → Ready`,
/// `Ready → Disconnected` on transport loss, and `PermanentlyFailed` only from
/// `Authenticating` when credentials are rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    SubscribingCallbacks,
    Ready,
    PermanentlyFailed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::SubscribingCallbacks => "subscribing_callbacks",
            Self::Ready => "ready",
            Self::PermanentlyFailed => "permanently_failed",
        }
    }

    /// Whether a connection attempt is currently underway.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Authenticating | Self::SubscribingCallbacks
        )
    }

    /// Whether `self → next` is an edge of the state machine.
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Authenticating)
                | (Connecting, Disconnected)
                | (Authenticating, SubscribingCallbacks)
                | (Authenticating, PermanentlyFailed)
                | (Authenticating, Disconnected)
                | (SubscribingCallbacks, Ready)
                | (SubscribingCallbacks, Disconnected)
                | (Ready, Disconnected)
                | (PermanentlyFailed, Disconnected)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
