use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::time::Instant;

use servdeck_core::cache::KeyValueCache;
use servdeck_core::CacheError;

use crate::database::Database;
use crate::error::StoreError;

/// Cache entries in a SQLite file, visible to every process that opens it.
#[derive(Clone)]
pub struct SqliteCache {
    db: Database,
}

impl SqliteCache {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Utc::now().timestamp_millis();
        self.db.with_conn(|conn| {
            let row: Option<(String, Option<i64>)> = match conn.query_row(
                "SELECT value, expires_at FROM kv_cache WHERE key = ?1",
                [key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            ) {
                Ok(row) => Some(row),
                Err(rusqlite::Error::QueryReturnedNoRows) => None,
                Err(e) => return Err(e.into()),
            };

            match row {
                Some((_, Some(expires_at))) if expires_at <= now => {
                    conn.execute("DELETE FROM kv_cache WHERE key = ?1", [key])?;
                    Ok(None)
                }
                Some((value, _)) => Ok(Some(value)),
                None => Ok(None),
            }
        })
    }

    fn write(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let expires_at =
            ttl.map(|t| Utc::now().timestamp_millis() + i64::try_from(t.as_millis()).unwrap_or(i64::MAX / 2));
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO kv_cache (key, value, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
                rusqlite::params![key, value, expires_at],
            )?;
            Ok(())
        })
    }
}

#[async_trait]
impl KeyValueCache for SqliteCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self.read(key)?)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        Ok(self.write(key, value, ttl)?)
    }
}

/// Process-local cache. Readers in other processes see nothing.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, (String, Option<Instant>)>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KeyValueCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        if let Some(entry) = self.entries.get(key) {
            match entry.1 {
                Some(deadline) if deadline <= Instant::now() => {}
                _ => return Ok(Some(entry.0.clone())),
            }
        } else {
            return Ok(None);
        }
        self.entries.remove(key);
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let deadline = ttl.map(|t| Instant::now() + t);
        self.entries
            .insert(key.to_string(), (value.to_string(), deadline));
        Ok(())
    }
}
