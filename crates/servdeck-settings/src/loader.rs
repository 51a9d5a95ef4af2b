use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::errors::{Result, SettingsError};
use crate::types::{servdeck_dir, ServdeckSettings};

/// `SERVDECK_SETTINGS` if set, otherwise `~/.servdeck/settings.json`.
pub fn settings_path() -> PathBuf {
    std::env::var("SERVDECK_SETTINGS")
        .map(PathBuf::from)
        .unwrap_or_else(|_| servdeck_dir().join("settings.json"))
}

/// Load from the default path. A missing file means defaults + env.
pub fn load_settings() -> Result<ServdeckSettings> {
    load_settings_from_path(&settings_path())
}

pub fn load_settings_from_path(path: &Path) -> Result<ServdeckSettings> {
    let defaults = serde_json::to_value(ServdeckSettings::default())?;

    let merged = match std::fs::read_to_string(path) {
        Ok(text) => {
            let user: Value = serde_json::from_str(&text)?;
            deep_merge(defaults, user)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no settings file, using defaults");
            defaults
        }
        Err(source) => {
            return Err(SettingsError::Io {
                path: path.to_owned(),
                source,
            })
        }
    };

    let mut settings: ServdeckSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    settings.validate()?;
    Ok(settings)
}

/// Recursively merge `overlay` into `base`. Objects merge key by key; any
/// other overlay value (arrays included) replaces the base value.
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                let merged = match base.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                base.insert(key, merged);
            }
            Value::Object(base)
        }
        (_, overlay) => overlay,
    }
}

pub(crate) fn apply_env_overrides(
    settings: &mut ServdeckSettings,
    lookup: impl Fn(&str) -> Option<String>,
) {
    if let Some(host) = lookup("SERVDECK_HOST") {
        settings.server.host = host;
    }
    if let Some(port) = lookup("SERVDECK_PORT").and_then(|v| parse_or_warn("SERVDECK_PORT", &v)) {
        settings.server.port = port;
    }
    if let Some(level) = lookup("SERVDECK_LOG_LEVEL") {
        settings.logging.level = level;
    }
    if let Some(ms) =
        lookup("SERVDECK_RPC_TIMEOUT_MS").and_then(|v| parse_or_warn("SERVDECK_RPC_TIMEOUT_MS", &v))
    {
        settings.connection.rpc_timeout_ms = ms;
    }
    if let Some(path) = lookup("SERVDECK_CACHE_PATH") {
        settings.cache.path = PathBuf::from(path);
    }
    if let Some(path) = lookup("SERVDECK_DB_PATH") {
        settings.store.path = PathBuf::from(path);
    }
}

fn parse_or_warn<T: std::str::FromStr>(key: &str, raw: &str) -> Option<T> {
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = raw, "ignoring unparseable env override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn deep_merge_objects() {
        let a = serde_json::json!({"x": 1, "nested": {"a": 1, "b": 2}});
        let b = serde_json::json!({"y": 2, "nested": {"b": 3}});
        let merged = deep_merge(a, b);
        assert_eq!(merged["x"], 1);
        assert_eq!(merged["y"], 2);
        assert_eq!(merged["nested"]["a"], 1);
        assert_eq!(merged["nested"]["b"], 3);
    }

    #[test]
    fn deep_merge_replaces_arrays() {
        let a = serde_json::json!({"list": [1, 2, 3]});
        let b = serde_json::json!({"list": [9]});
        assert_eq!(deep_merge(a, b)["list"], serde_json::json!([9]));
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let s = load_settings_from_path(&dir.path().join("nope.json")).unwrap();
        assert!(s.servers.is_empty());
    }

    #[test]
    fn file_is_merged_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{
                "connection": { "reconnect": { "baseDelayMs": 250 } },
                "servers": [{ "id": "main", "name": "Main", "host": "10.0.0.5", "port": 5000, "password": "pw" }]
            }"#,
        )
        .unwrap();

        let s = load_settings_from_path(&path).unwrap();
        assert_eq!(s.connection.reconnect.base_delay_ms, 250);
        assert_eq!(s.connection.reconnect.max_delay_ms, 60_000);
        assert_eq!(s.servers.len(), 1);
        assert_eq!(s.servers[0].password, "pw");
    }

    #[test]
    fn invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            load_settings_from_path(&path),
            Err(SettingsError::Json(_))
        ));
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("SERVDECK_PORT", "8088"),
            ("SERVDECK_LOG_LEVEL", "debug"),
            ("SERVDECK_RPC_TIMEOUT_MS", "250"),
            ("SERVDECK_DB_PATH", "/var/lib/servdeck/db.sqlite"),
        ]);
        let mut s = ServdeckSettings::default();
        apply_env_overrides(&mut s, |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(s.server.port, 8088);
        assert_eq!(s.logging.level, "debug");
        assert_eq!(s.connection.rpc_timeout_ms, 250);
        assert_eq!(s.store.path, PathBuf::from("/var/lib/servdeck/db.sqlite"));
    }

    #[test]
    fn unparseable_env_override_is_ignored() {
        let mut s = ServdeckSettings::default();
        apply_env_overrides(&mut s, |k| (k == "SERVDECK_PORT").then(|| "not-a-port".to_string()));
        assert_eq!(s.server.port, 9300);
    }
}
