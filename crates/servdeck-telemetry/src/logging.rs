//! Warn+ records persisted to SQLite so operators can see why a server went
//! offline after the fact. Records carry the `server_id` of the event, or of
//! the nearest enclosing span that declared one.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{span, Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

const LOG_SCHEMA: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    CREATE TABLE IF NOT EXISTS logs (
        id        INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        level     TEXT NOT NULL,
        target    TEXT NOT NULL,
        message   TEXT NOT NULL,
        fields    TEXT,
        server_id TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_logs_server_ts ON logs(server_id, timestamp);
    CREATE INDEX IF NOT EXISTS idx_logs_level ON logs(level);
";

const DEFAULT_LIMIT: u32 = 100;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    /// Remaining event fields as a JSON object.
    pub fields: Option<String>,
    pub server_id: Option<String>,
}

/// Filters for [`SqliteLogSink::query`]. Unset filters match everything.
#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    /// Exact level, upper case (`WARN`, `ERROR`).
    pub level: Option<String>,
    /// Substring of the event target.
    pub target: Option<String>,
    pub server_id: Option<String>,
    /// RFC 3339 lower bound, inclusive.
    pub since: Option<String>,
    pub limit: Option<u32>,
}

impl LogQuery {
    fn to_sql(&self) -> (String, Vec<String>) {
        let mut clauses = Vec::new();
        let mut args = Vec::new();
        let mut push = |clause: &str, arg: String| {
            args.push(arg);
            clauses.push(format!("{clause} ?{}", args.len()));
        };
        if let Some(level) = &self.level {
            push("level =", level.to_uppercase());
        }
        if let Some(target) = &self.target {
            push("target LIKE", format!("%{target}%"));
        }
        if let Some(server_id) = &self.server_id {
            push("server_id =", server_id.clone());
        }
        if let Some(since) = &self.since {
            push("timestamp >=", since.clone());
        }

        let filter = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT id, timestamp, level, target, message, fields, server_id FROM logs{filter} \
             ORDER BY id DESC LIMIT {}",
            self.limit.unwrap_or(DEFAULT_LIMIT)
        );
        (sql, args)
    }
}

/// Append-only log table behind a mutex-guarded connection.
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(LOG_SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Write failures are dropped: logging about a broken log table would
    /// feed straight back into this sink.
    fn append(&self, entry: &Captured, level: Level, target: &str, timestamp: &str) {
        let fields = (!entry.fields.is_empty())
            .then(|| Value::Object(entry.fields.clone()).to_string());
        let _ = self.conn.lock().execute(
            "INSERT INTO logs (timestamp, level, target, message, fields, server_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                timestamp,
                level.as_str(),
                target,
                entry.message.as_deref().unwrap_or_default(),
                fields,
                entry.server_id,
            ],
        );
    }

    /// Newest first.
    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let (sql, args) = q.to_sql();
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), |row| {
            Ok(LogRecord {
                id: row.get("id")?,
                timestamp: row.get("timestamp")?,
                level: row.get("level")?,
                target: row.get("target")?,
                message: row.get("message")?,
                fields: row.get("fields")?,
                server_id: row.get("server_id")?,
            })
        })?;
        rows.collect()
    }

    pub fn count(&self) -> Result<i64, rusqlite::Error> {
        self.conn
            .lock()
            .query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))
    }
}

/// Event or span fields, with `message` and `server_id` pulled out.
#[derive(Default)]
struct Captured {
    message: Option<String>,
    server_id: Option<String>,
    fields: Map<String, Value>,
}

impl Captured {
    fn put(&mut self, field: &Field, value: Value) {
        match (field.name(), value) {
            ("message", Value::String(s)) => self.message = Some(s),
            ("server_id", Value::String(s)) => self.server_id = Some(s),
            (name, value) => {
                self.fields.insert(name.to_owned(), value);
            }
        }
    }
}

impl Visit for Captured {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let text = format!("{value:?}");
        let text = match field.name() {
            "server_id" => text.trim_matches('"').to_owned(),
            _ => text,
        };
        self.put(field, Value::String(text));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, Value::String(value.to_owned()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.put(field, value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, value.into());
    }
}

/// Span extension: the server a span was opened for.
struct ServerScope(String);

/// Feeds warn+ events into a [`SqliteLogSink`].
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut captured = Captured::default();
        attrs.record(&mut captured);
        let (Some(server_id), Some(span)) = (captured.server_id, ctx.span(id)) else {
            return;
        };
        span.extensions_mut().insert(ServerScope(server_id));
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let meta = event.metadata();
        if *meta.level() > Level::WARN {
            return;
        }

        let mut captured = Captured::default();
        event.record(&mut captured);
        if captured.server_id.is_none() {
            captured.server_id = ctx.event_scope(event).and_then(|scope| {
                scope
                    .into_iter()
                    .find_map(|span| span.extensions().get::<ServerScope>().map(|s| s.0.clone()))
            });
        }

        let timestamp = Utc::now().to_rfc3339();
        self.sink
            .append(&captured, *meta.level(), meta.target(), &timestamp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    fn record(sink: &SqliteLogSink, ts: &str, level: Level, msg: &str, server: Option<&str>) {
        let captured = Captured {
            message: Some(msg.into()),
            server_id: server.map(Into::into),
            fields: Map::new(),
        };
        sink.append(&captured, level, "servdeck_connection::manager", ts);
    }

    #[test]
    fn query_by_level_and_server() {
        let dir = tempfile::tempdir().unwrap();
        let sink = SqliteLogSink::new(&dir.path().join("logs.db")).unwrap();

        record(&sink, "2026-10-01T12:00:00Z", Level::WARN, "cache write failed", Some("main"));
        record(&sink, "2026-10-01T12:00:01Z", Level::ERROR, "auth rejected", Some("alt"));
        assert_eq!(sink.count().unwrap(), 2);

        let errors = sink
            .query(&LogQuery {
                level: Some("error".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "auth rejected");

        let main = sink
            .query(&LogQuery {
                server_id: Some("main".into()),
                target: Some("connection".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(main.len(), 1);
        assert_eq!(main[0].message, "cache write failed");
    }

    #[test]
    fn query_since_and_limit() {
        let dir = tempfile::tempdir().unwrap();
        let sink = SqliteLogSink::new(&dir.path().join("logs.db")).unwrap();
        for i in 0..10 {
            record(&sink, &format!("2026-10-01T12:00:{i:02}Z"), Level::WARN, &format!("msg {i}"), None);
        }

        let recent = sink
            .query(&LogQuery {
                since: Some("2026-10-01T12:00:05Z".into()),
                limit: Some(3),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].message, "msg 9");
    }

    #[test]
    fn layer_persists_only_warn_and_above_with_span_server() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(SqliteLogSink::new(&dir.path().join("logs.db")).unwrap());
        let subscriber = tracing_subscriber::registry().with(SqliteLogLayer::new(sink.clone()));

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("manager", server_id = "main");
            let _enter = span.enter();
            tracing::info!("not persisted");
            tracing::warn!(attempt = 3u64, "transport lost");
        });

        let rows = sink.query(&LogQuery::default()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].level, "WARN");
        assert_eq!(rows[0].message, "transport lost");
        assert_eq!(rows[0].server_id.as_deref(), Some("main"));
        assert_eq!(rows[0].fields.as_deref(), Some(r#"{"attempt":3}"#));
    }
}
