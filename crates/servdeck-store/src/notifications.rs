use async_trait::async_trait;
use chrono::Utc;

use servdeck_core::ids::{NotificationId, UserId};
use servdeck_core::notifications::{Notification, NotificationDraft, NotificationStore};
use servdeck_core::PersistenceError;

use crate::database::Database;
use crate::error::StoreError;

const COLUMNS: &str = "id, user_id, type, message, description, read, created_at";

/// Notification rows in SQLite.
#[derive(Clone)]
pub struct NotificationRepo {
    db: Database,
}

impl NotificationRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn insert(&self, draft: NotificationDraft) -> Result<Notification, StoreError> {
        let notification = Notification {
            id: NotificationId::new(),
            user_id: draft.user_id,
            kind: draft.kind,
            message: draft.message,
            description: draft.description,
            read: false,
            created_at: Utc::now().to_rfc3339(),
        };

        self.db.with_conn(|conn| {
            conn.execute(
                &format!("INSERT INTO notifications ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
                rusqlite::params![
                    notification.id.as_str(),
                    notification.user_id.as_str(),
                    notification.kind,
                    notification.message,
                    notification.description,
                    notification.read,
                    notification.created_at,
                ],
            )?;
            Ok(())
        })?;

        Ok(notification)
    }

    pub fn get(&self, id: &NotificationId) -> Result<Notification, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {COLUMNS} FROM notifications WHERE id = ?1"),
                [id.as_str()],
                row_to_notification,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    StoreError::NotFound(format!("notification {id}"))
                }
                other => other.into(),
            })
        })
    }

    /// Newest first.
    pub fn list(&self, user_id: &UserId, unread_only: bool) -> Result<Vec<Notification>, StoreError> {
        let sql = if unread_only {
            format!(
                "SELECT {COLUMNS} FROM notifications WHERE user_id = ?1 AND read = 0
                 ORDER BY created_at DESC, id DESC"
            )
        } else {
            format!(
                "SELECT {COLUMNS} FROM notifications WHERE user_id = ?1
                 ORDER BY created_at DESC, id DESC"
            )
        };

        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([user_id.as_str()], row_to_notification)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn set_read(&self, id: &NotificationId) -> Result<Notification, StoreError> {
        let changed = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE notifications SET read = 1 WHERE id = ?1",
                [id.as_str()],
            )?)
        })?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("notification {id}")));
        }
        self.get(id)
    }

    pub fn count_unread(&self, user_id: &UserId) -> Result<u64, StoreError> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM notifications WHERE user_id = ?1 AND read = 0",
                [user_id.as_str()],
                |row| row.get(0),
            )?;
            Ok(n.max(0) as u64)
        })
    }
}

fn row_to_notification(row: &rusqlite::Row<'_>) -> rusqlite::Result<Notification> {
    Ok(Notification {
        id: NotificationId::from_raw(row.get::<_, String>(0)?),
        user_id: UserId::from_raw(row.get::<_, String>(1)?),
        kind: row.get(2)?,
        message: row.get(3)?,
        description: row.get(4)?,
        read: row.get(5)?,
        created_at: row.get(6)?,
    })
}

#[async_trait]
impl NotificationStore for NotificationRepo {
    async fn create(&self, draft: NotificationDraft) -> Result<Notification, PersistenceError> {
        Ok(self.insert(draft)?)
    }

    async fn list_for_user(
        &self,
        user_id: &UserId,
        unread_only: bool,
    ) -> Result<Vec<Notification>, PersistenceError> {
        Ok(self.list(user_id, unread_only)?)
    }

    async fn mark_read(&self, id: &NotificationId) -> Result<Notification, PersistenceError> {
        Ok(self.set_read(id)?)
    }

    async fn unread_count(&self, user_id: &UserId) -> Result<u64, PersistenceError> {
        Ok(self.count_unread(user_id)?)
    }
}
