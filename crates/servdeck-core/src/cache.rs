use std::time::Duration;

use async_trait::async_trait;

use crate::errors::CacheError;
use crate::ids::ServerId;

/// Shared key-value store mirroring live state for non-owning readers.
#[async_trait]
pub trait KeyValueCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// `ttl: None` keeps the entry until overwritten.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError>;
}

/// Which piece of server state a cache entry holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateKind {
    ActiveMap,
    ActivePlayers,
}

impl StateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ActiveMap => "active_map",
            Self::ActivePlayers => "active_players",
        }
    }
}

/// `<prefix>:<server id>:<kind>`
pub fn state_key(prefix: &str, server_id: &ServerId, kind: StateKind) -> String {
    format!("{prefix}:{server_id}:{}", kind.as_str())
}
