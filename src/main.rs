use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use servdeck_connection::{ConnectionRegistry, NotificationSink};
use servdeck_core::cache::KeyValueCache;
use servdeck_server::{AppState, ServerConfig};
use servdeck_session::JsonRpcConnector;
use servdeck_settings::{load_settings, load_settings_from_path, CacheBackend, ServdeckSettings};
use servdeck_store::{Database, MemoryCache, NotificationRepo, SqliteCache};
use servdeck_telemetry::{init_telemetry, TelemetryConfig};

/// Dashboard backend for remote game servers.
#[derive(Debug, Parser)]
#[command(name = "servdeck", version)]
struct Cli {
    /// Settings file. Defaults to ~/.servdeck/settings.json.
    #[arg(long)]
    settings: Option<PathBuf>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    log_level: Option<String>,
    /// Human-readable logs instead of JSON lines.
    #[arg(long)]
    pretty: bool,
    /// Connect to every configured server at startup instead of on first use.
    #[arg(long)]
    eager: bool,
}

impl Cli {
    fn load(&self) -> anyhow::Result<ServdeckSettings> {
        let mut settings = match &self.settings {
            Some(path) => load_settings_from_path(path)
                .with_context(|| format!("loading settings from {}", path.display()))?,
            None => load_settings().context("loading settings")?,
        };
        if let Some(host) = &self.host {
            settings.server.host = host.clone();
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level = level.clone();
        }
        if self.pretty {
            settings.logging.json = false;
        }
        Ok(settings)
    }
}

fn open_cache(settings: &ServdeckSettings) -> anyhow::Result<Arc<dyn KeyValueCache>> {
    Ok(match settings.cache.backend {
        CacheBackend::Memory => Arc::new(MemoryCache::new()),
        CacheBackend::Sqlite => {
            let db = Database::open(&settings.cache.path)
                .with_context(|| format!("opening cache at {}", settings.cache.path.display()))?;
            Arc::new(SqliteCache::new(db))
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = cli.load()?;

    let telemetry = init_telemetry(
        TelemetryConfig {
            json: settings.logging.json,
            log_to_sqlite: settings.logging.persist_warnings,
            log_db_path: settings.logging.log_db_path.clone(),
            ..TelemetryConfig::default()
        }
        .with_level_str(&settings.logging.level),
    );

    let db = Database::open(&settings.store.path)
        .with_context(|| format!("opening store at {}", settings.store.path.display()))?;
    tracing::info!(path = %settings.store.path.display(), "store opened");
    let notifications = Arc::new(NotificationRepo::new(db));
    let sink = Arc::new(NotificationSink::new(notifications.clone()));

    let registry = Arc::new(
        ConnectionRegistry::from_settings(
            &settings,
            Arc::new(JsonRpcConnector::new()),
            open_cache(&settings)?,
        )
        .with_notifications(sink.clone()),
    );

    if cli.eager {
        for id in registry.server_ids() {
            let registry = registry.clone();
            tokio::spawn(async move {
                if let Err(e) = registry.get_or_create(&id).await {
                    tracing::warn!(server_id = %id, error = %e, "eager connect failed");
                }
            });
        }
    }

    let config = ServerConfig::from(&settings.server);
    let state = AppState::new(&config, registry.clone(), notifications, telemetry.log_sink());
    let handle = servdeck_server::start(config, state)
        .await
        .context("starting http server")?;
    tracing::info!(
        port = handle.port(),
        servers = registry.server_ids().len(),
        "servdeck ready"
    );

    tokio::signal::ctrl_c()
        .await
        .context("listening for ctrl+c")?;

    tracing::info!("shutting down");
    handle.shutdown().await;
    registry.dispose_all().await;
    sink.flush().await;
    Ok(())
}
