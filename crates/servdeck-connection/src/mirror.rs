use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use servdeck_core::cache::{state_key, KeyValueCache, StateKind};
use servdeck_core::{CacheError, MapInfo, PlayerInfo, ServerId};

/// Write-through mirror of one server's live state into the shared cache.
///
/// Only the manager owning the live session writes through this. Write
/// failures are logged and counted, never returned.
pub struct StateMirror {
    cache: Arc<dyn KeyValueCache>,
    server_id: ServerId,
    prefix: String,
    ttl: Option<Duration>,
}

impl StateMirror {
    pub fn new(
        cache: Arc<dyn KeyValueCache>,
        server_id: ServerId,
        prefix: impl Into<String>,
        ttl: Option<Duration>,
    ) -> Self {
        Self {
            cache,
            server_id,
            prefix: prefix.into(),
            ttl,
        }
    }

    pub async fn write_map(&self, map: &MapInfo) {
        self.write(StateKind::ActiveMap, serde_json::to_string(map)).await;
    }

    pub async fn write_players(&self, players: &[PlayerInfo]) {
        self.write(StateKind::ActivePlayers, serde_json::to_string(players))
            .await;
    }

    async fn write(&self, kind: StateKind, encoded: serde_json::Result<String>) {
        let key = state_key(&self.prefix, &self.server_id, kind);
        let result = match encoded {
            Ok(value) => self.cache.set(&key, &value, self.ttl).await,
            Err(e) => Err(CacheError::from(e)),
        };
        if let Err(e) = result {
            metrics::counter!("servdeck_cache_write_failures_total", "kind" => kind.as_str())
                .increment(1);
            warn!(server_id = %self.server_id, key = %key, error = %e, "cache write failed");
        }
    }

    /// Last snapshot written by any process, used to seed a fresh manager.
    pub async fn read_back(&self) -> Result<CachedState, CacheError> {
        CachedStateReader::new(self.cache.clone(), self.prefix.clone())
            .snapshot(&self.server_id)
            .await
    }
}

/// Cached state for one server, as a non-owning process sees it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedState {
    pub active_map: Option<MapInfo>,
    pub active_players: Option<Vec<PlayerInfo>>,
}

impl CachedState {
    pub fn is_empty(&self) -> bool {
        self.active_map.is_none() && self.active_players.is_none()
    }
}

/// Read-only view over the shared cache. Needs no session.
#[derive(Clone)]
pub struct CachedStateReader {
    cache: Arc<dyn KeyValueCache>,
    prefix: String,
}

impl CachedStateReader {
    pub fn new(cache: Arc<dyn KeyValueCache>, prefix: impl Into<String>) -> Self {
        Self {
            cache,
            prefix: prefix.into(),
        }
    }

    pub async fn active_map(&self, server_id: &ServerId) -> Result<Option<MapInfo>, CacheError> {
        self.read(server_id, StateKind::ActiveMap).await
    }

    pub async fn active_players(
        &self,
        server_id: &ServerId,
    ) -> Result<Option<Vec<PlayerInfo>>, CacheError> {
        self.read(server_id, StateKind::ActivePlayers).await
    }

    pub async fn snapshot(&self, server_id: &ServerId) -> Result<CachedState, CacheError> {
        Ok(CachedState {
            active_map: self.active_map(server_id).await?,
            active_players: self.active_players(server_id).await?,
        })
    }

    async fn read<T: serde::de::DeserializeOwned>(
        &self,
        server_id: &ServerId,
        kind: StateKind,
    ) -> Result<Option<T>, CacheError> {
        let key = state_key(&self.prefix, server_id, kind);
        match self.cache.get(&key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use servdeck_store::MemoryCache;

    struct BrokenCache;

    #[async_trait]
    impl KeyValueCache for BrokenCache {
        async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
            Err(CacheError::Backend("down".into()))
        }
        async fn set(&self, _key: &str, _value: &str, _ttl: Option<Duration>) -> Result<(), CacheError> {
            Err(CacheError::Backend("down".into()))
        }
    }

    #[tokio::test]
    async fn players_written_under_namespaced_key() {
        let cache = Arc::new(MemoryCache::new());
        let mirror = StateMirror::new(cache.clone(), ServerId::from("main"), "servdeck", None);
        let players = vec![PlayerInfo::bare("abc")];
        mirror.write_players(&players).await;

        let raw = cache.get("servdeck:main:active_players").await.unwrap().unwrap();
        assert_eq!(raw, serde_json::to_string(&players).unwrap());
    }

    #[tokio::test]
    async fn reader_sees_what_mirror_wrote() {
        let cache: Arc<dyn KeyValueCache> = Arc::new(MemoryCache::new());
        let id = ServerId::from("main");
        let mirror = StateMirror::new(cache.clone(), id.clone(), "servdeck", None);
        mirror.write_map(&MapInfo::new("uid-1", "A01")).await;

        let reader = CachedStateReader::new(cache, "servdeck");
        let state = reader.snapshot(&id).await.unwrap();
        assert_eq!(state.active_map.map(|m| m.uid), Some("uid-1".to_string()));
        assert_eq!(state.active_players, None);

        let other = reader.snapshot(&ServerId::from("other")).await.unwrap();
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn write_failures_are_swallowed() {
        let mirror = StateMirror::new(Arc::new(BrokenCache), ServerId::from("main"), "servdeck", None);
        mirror.write_players(&[]).await;
        assert!(mirror.read_back().await.is_err());
    }

    #[tokio::test]
    async fn corrupt_entry_is_a_serialization_error() {
        let cache = Arc::new(MemoryCache::new());
        cache.set("servdeck:main:active_map", "{oops", None).await.unwrap();
        let reader = CachedStateReader::new(cache, "servdeck");
        assert!(matches!(
            reader.active_map(&ServerId::from("main")).await,
            Err(CacheError::Serialization(_))
        ));
    }
}
