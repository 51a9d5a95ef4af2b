//! Tracing setup for servdeck: one stdout layer (JSON lines or pretty) plus
//! an optional SQLite layer that keeps warn+ records for later inspection.

mod logging;

pub use logging::{LogQuery, LogRecord, SqliteLogLayer, SqliteLogSink};

use std::path::PathBuf;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::Registry;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default level. `RUST_LOG` wins when set.
    pub log_level: Level,
    /// Per-module overrides, e.g. `("servdeck_session", DEBUG)`.
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines on stdout; otherwise human-readable.
    pub json: bool,
    pub log_to_sqlite: bool,
    pub log_db_path: PathBuf,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: true,
            log_to_sqlite: false,
            log_db_path: PathBuf::from("logs.db"),
        }
    }
}

impl TelemetryConfig {
    /// Parse a textual level ("warn", "DEBUG"); unknown strings fall back to INFO.
    pub fn with_level_str(mut self, level: &str) -> Self {
        self.log_level = level.parse().unwrap_or(Level::INFO);
        self
    }

    fn filter_directive(&self) -> String {
        std::iter::once(self.log_level.as_str().to_lowercase())
            .chain(
                self.module_levels
                    .iter()
                    .map(|(module, level)| format!("{module}={}", level.as_str().to_lowercase())),
            )
            .collect::<Vec<_>>()
            .join(",")
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.filter_directive()))
    }
}

/// Keeps the persisted log sink reachable for queries.
pub struct TelemetryGuard {
    log_sink: Option<Arc<SqliteLogSink>>,
}

impl TelemetryGuard {
    /// Shared handle to the sink, for serving persisted logs over HTTP.
    pub fn log_sink(&self) -> Option<Arc<SqliteLogSink>> {
        self.log_sink.clone()
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn stdout_layer(config: &TelemetryConfig) -> BoxedLayer {
    let layer = tracing_subscriber::fmt::layer().with_target(true);
    if config.json {
        layer
            .json()
            .with_span_list(true)
            .with_filter(config.env_filter())
            .boxed()
    } else {
        layer.with_filter(config.env_filter()).boxed()
    }
}

/// A failure to open the log database only costs persistence; stdout
/// logging still comes up.
fn open_sink(config: &TelemetryConfig) -> Option<Arc<SqliteLogSink>> {
    if !config.log_to_sqlite {
        return None;
    }
    match SqliteLogSink::new(&config.log_db_path) {
        Ok(sink) => Some(Arc::new(sink)),
        Err(e) => {
            eprintln!(
                "servdeck-telemetry: cannot open {}: {e}",
                config.log_db_path.display()
            );
            None
        }
    }
}

/// Install the global subscriber. Call once at startup; later calls keep the
/// first subscriber and only report the conflict.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let log_sink = open_sink(&config);
    let mut layers = vec![stdout_layer(&config)];
    if let Some(sink) = &log_sink {
        layers.push(SqliteLogLayer::new(sink.clone()).boxed());
    }

    if let Err(e) = tracing_subscriber::registry().with(layers).try_init() {
        eprintln!("servdeck-telemetry: subscriber already installed: {e}");
    }

    TelemetryGuard { log_sink }
}
