//! Process-wide map of server id to connection manager.
//!
//! At most one manager exists per server id. Concurrent first lookups for the
//! same id share one creation: the first caller builds and starts the manager,
//! the rest await the same cell.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use servdeck_core::cache::KeyValueCache;
use servdeck_core::session::SessionConnector;
use servdeck_core::{ConnectionError, ServerId};
use servdeck_settings::{ServdeckSettings, ServerDefinition};

use crate::config::ManagerConfig;
use crate::manager::ConnectionManager;
use crate::mirror::CachedStateReader;
use crate::sink::NotificationSink;

type Slot = Arc<OnceCell<Arc<ConnectionManager>>>;

pub struct ConnectionRegistry {
    catalog: HashMap<ServerId, ServerDefinition>,
    config: ManagerConfig,
    connector: Arc<dyn SessionConnector>,
    cache: Arc<dyn KeyValueCache>,
    sink: Option<Arc<NotificationSink>>,
    managers: DashMap<ServerId, Slot>,
}

impl ConnectionRegistry {
    pub fn new(
        servers: impl IntoIterator<Item = ServerDefinition>,
        config: ManagerConfig,
        connector: Arc<dyn SessionConnector>,
        cache: Arc<dyn KeyValueCache>,
    ) -> Self {
        let catalog = servers
            .into_iter()
            .map(|def| (def.id.clone(), def))
            .collect();
        Self {
            catalog,
            config,
            connector,
            cache,
            sink: None,
            managers: DashMap::new(),
        }
    }

    pub fn from_settings(
        settings: &ServdeckSettings,
        connector: Arc<dyn SessionConnector>,
        cache: Arc<dyn KeyValueCache>,
    ) -> Self {
        Self::new(
            settings.servers.iter().cloned(),
            ManagerConfig::from_settings(settings),
            connector,
            cache,
        )
    }

    /// Persist admin-assistance notifications through `sink`.
    pub fn with_notifications(mut self, sink: Arc<NotificationSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn notifications(&self) -> Option<&Arc<NotificationSink>> {
        self.sink.as_ref()
    }

    pub fn definition(&self, id: &ServerId) -> Option<&ServerDefinition> {
        self.catalog.get(id)
    }

    /// Configured servers, sorted by id.
    pub fn server_ids(&self) -> Vec<ServerId> {
        let mut ids: Vec<ServerId> = self.catalog.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn definitions(&self) -> Vec<ServerDefinition> {
        self.server_ids()
            .iter()
            .filter_map(|id| self.catalog.get(id).cloned())
            .collect()
    }

    /// The manager for `id`, creating and starting it on first use.
    ///
    /// A failed first connection attempt does not fail the lookup: the
    /// manager is returned anyway and its supervisor keeps retrying.
    pub async fn get_or_create(
        &self,
        id: &ServerId,
    ) -> Result<Arc<ConnectionManager>, ConnectionError> {
        let Some(definition) = self.catalog.get(id) else {
            return Err(ConnectionError::Configuration(format!(
                "unknown server id '{id}'"
            )));
        };

        let slot: Slot = self.managers.entry(id.clone()).or_default().clone();
        let manager = slot
            .get_or_init(|| async {
                info!(server_id = %id, "creating connection manager");
                let manager = ConnectionManager::new(
                    definition.clone(),
                    self.config.clone(),
                    self.connector.clone(),
                    self.cache.clone(),
                    self.sink.clone(),
                );
                // Outcome already logged by the manager.
                let _ = manager.start().await;
                manager
            })
            .await;
        Ok(manager.clone())
    }

    /// Existing manager for `id`, if one has been created and finished starting.
    pub fn get(&self, id: &ServerId) -> Option<Arc<ConnectionManager>> {
        self.managers.get(id).and_then(|slot| slot.get().cloned())
    }

    pub fn managers(&self) -> Vec<Arc<ConnectionManager>> {
        let mut out: Vec<Arc<ConnectionManager>> = self
            .managers
            .iter()
            .filter_map(|entry| entry.value().get().cloned())
            .collect();
        out.sort_by(|a, b| a.server_id().cmp(b.server_id()));
        out
    }

    /// Shut down and forget the manager for `id`. A later `get_or_create`
    /// builds a fresh one.
    pub async fn dispose(&self, id: &ServerId) -> bool {
        let Some((_, slot)) = self.managers.remove(id) else {
            return false;
        };
        match slot.get() {
            Some(manager) => {
                manager.shutdown().await;
                debug!(server_id = %id, "manager disposed");
                true
            }
            None => false,
        }
    }

    pub async fn dispose_all(&self) {
        let ids: Vec<ServerId> = self.managers.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.dispose(&id).await;
        }
    }

    /// Read cached state without a session. Works for servers owned by
    /// another process.
    pub fn reader(&self) -> CachedStateReader {
        CachedStateReader::new(self.cache.clone(), self.config.key_prefix.clone())
    }
}
