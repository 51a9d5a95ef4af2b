use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::schema;

/// Shared SQLite connection. Clones share the same handle, so the
/// notification repo and the cache can sit on one file.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl Database {
    /// Open or create a database file, creating parent directories as needed.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Io(format!("create dir: {e}")))?;
        }

        let db = Self::prepare(Connection::open(path)?, path.to_owned())?;
        info!(path = %path.display(), "database opened");
        Ok(db)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::prepare(Connection::open_in_memory()?, PathBuf::from(":memory:"))
    }

    fn prepare(conn: Connection, path: PathBuf) -> Result<Self, StoreError> {
        conn.execute_batch(schema::PRAGMAS)
            .map_err(|e| StoreError::Database(format!("pragmas: {e}")))?;

        let found: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
        if found > schema::SCHEMA_VERSION {
            return Err(StoreError::Database(format!(
                "{} has schema version {found}, newer than {}",
                path.display(),
                schema::SCHEMA_VERSION
            )));
        }
        conn.execute_batch(schema::CREATE_TABLES)
            .map_err(|e| StoreError::Database(format!("schema: {e}")))?;
        if found < schema::SCHEMA_VERSION {
            conn.pragma_update(None, "user_version", schema::SCHEMA_VERSION)?;
            debug!(from = found, to = schema::SCHEMA_VERSION, "schema version set");
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    /// Run `f` with the connection held.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
