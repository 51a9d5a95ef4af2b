use std::time::Duration;

use servdeck_settings::ServdeckSettings;

use crate::supervisor::BackoffPolicy;

/// Tuning shared by every manager a registry creates.
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// Upper bound on each RPC call, including handshake steps.
    pub rpc_timeout: Duration,
    pub connect_timeout: Duration,
    pub backoff: BackoffPolicy,
    pub key_prefix: String,
    pub cache_ttl: Option<Duration>,
}

impl ManagerConfig {
    pub fn from_settings(settings: &ServdeckSettings) -> Self {
        Self {
            rpc_timeout: settings.connection.rpc_timeout(),
            connect_timeout: settings.connection.connect_timeout(),
            backoff: BackoffPolicy::from(&settings.connection.reconnect),
            key_prefix: settings.cache.key_prefix.clone(),
            cache_ttl: settings.cache.ttl(),
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::from_settings(&ServdeckSettings::default())
    }
}
