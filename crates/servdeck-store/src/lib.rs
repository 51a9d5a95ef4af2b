//! SQLite-backed persistence: notification rows and the shared state cache.

pub mod cache;
pub mod database;
pub mod error;
pub mod notifications;
pub mod schema;

pub use cache::{MemoryCache, SqliteCache};
pub use database::Database;
pub use error::StoreError;
pub use notifications::NotificationRepo;
