//! Settings type definitions.
//!
//! All types use camelCase JSON and `#[serde(default)]`, so partial files are
//! valid: missing fields take their compiled default.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use servdeck_core::ids::ServerId;
use servdeck_core::session::{Credentials, ServerEndpoint};

use crate::errors::{Result, SettingsError};

/// Root settings type.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServdeckSettings {
    pub server: HttpSettings,
    pub connection: ConnectionSettings,
    pub cache: CacheSettings,
    pub store: StoreSettings,
    pub logging: LoggingSettings,
    pub servers: Vec<ServerDefinition>,
}

impl Default for ServdeckSettings {
    fn default() -> Self {
        Self {
            server: HttpSettings::default(),
            connection: ConnectionSettings::default(),
            cache: CacheSettings::default(),
            store: StoreSettings::default(),
            logging: LoggingSettings::default(),
            servers: Vec::new(),
        }
    }
}

impl ServdeckSettings {
    /// Clamp out-of-range tuning values and reject a malformed server catalog.
    ///
    /// Called automatically during loading.
    pub fn validate(&mut self) -> Result<()> {
        let r = &mut self.connection.reconnect;
        if !(0.0..=1.0).contains(&r.jitter_factor) {
            let clamped = r.jitter_factor.clamp(0.0, 1.0);
            tracing::warn!("jitterFactor out of range ({}), clamped to {clamped}", r.jitter_factor);
            r.jitter_factor = clamped;
        }
        if r.max_delay_ms < r.base_delay_ms {
            tracing::warn!(
                base = r.base_delay_ms,
                max = r.max_delay_ms,
                "maxDelayMs below baseDelayMs, raised to match"
            );
            r.max_delay_ms = r.base_delay_ms;
        }

        let mut seen = HashSet::new();
        for def in &self.servers {
            if def.id.as_str().trim().is_empty() {
                return Err(SettingsError::InvalidServer("empty server id".into()));
            }
            if !seen.insert(def.id.clone()) {
                return Err(SettingsError::InvalidServer(format!(
                    "duplicate server id '{}'",
                    def.id
                )));
            }
        }
        Ok(())
    }

    pub fn server(&self, id: &ServerId) -> Option<&ServerDefinition> {
        self.servers.iter().find(|s| &s.id == id)
    }
}

/// HTTP/WebSocket listener.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpSettings {
    pub host: String,
    pub port: u16,
    /// Per-client outbound queue; events beyond it are dropped for that client.
    pub max_send_queue: usize,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 9300,
            max_send_queue: 256,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionSettings {
    /// Upper bound on every RPC call.
    pub rpc_timeout_ms: u64,
    /// Upper bound on the transport handshake.
    pub connect_timeout_ms: u64,
    pub reconnect: ReconnectSettings,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            rpc_timeout_ms: 10_000,
            connect_timeout_ms: 5_000,
            reconnect: ReconnectSettings::default(),
        }
    }
}

impl ConnectionSettings {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectSettings {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
    /// `None` retries until the transport comes back.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            jitter_factor: 0.2,
            max_attempts: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    /// In-process only. Other processes see nothing.
    Memory,
    /// SQLite file shared by every process on the host.
    Sqlite,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheSettings {
    pub backend: CacheBackend,
    pub path: PathBuf,
    pub key_prefix: String,
    pub ttl_secs: Option<u64>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            backend: CacheBackend::Sqlite,
            path: servdeck_dir().join("cache.db"),
            key_prefix: "servdeck".into(),
            ttl_secs: None,
        }
    }
}

impl CacheSettings {
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_secs.map(Duration::from_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    pub path: PathBuf,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: servdeck_dir().join("servdeck.db"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
    /// Persist warn+ records to `logDbPath`.
    pub persist_warnings: bool,
    pub log_db_path: PathBuf,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: true,
            persist_warnings: true,
            log_db_path: servdeck_dir().join("logs.db"),
        }
    }
}

/// One managed remote server.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerDefinition {
    pub id: ServerId,
    /// Human-readable name used in notifications and the dashboard.
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default = "default_login")]
    pub login: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
}

fn default_login() -> String {
    "SuperAdmin".into()
}

fn default_api_version() -> String {
    "2023-04-24".into()
}

impl ServerDefinition {
    pub fn new(id: &str, name: &str, host: &str, port: u16) -> Self {
        Self {
            id: ServerId::from_raw(id),
            name: name.into(),
            host: host.into(),
            port,
            login: default_login(),
            password: String::new(),
            api_version: default_api_version(),
        }
    }

    pub fn endpoint(&self) -> ServerEndpoint {
        ServerEndpoint {
            host: self.host.clone(),
            port: self.port,
        }
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            login: self.login.clone(),
            password: self.password.clone(),
        }
    }
}

impl std::fmt::Debug for ServerDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerDefinition")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("login", &self.login)
            .field("api_version", &self.api_version)
            .finish_non_exhaustive()
    }
}

/// `~/.servdeck`, falling back to `/tmp/.servdeck` without a home dir.
pub fn servdeck_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".servdeck")
}
