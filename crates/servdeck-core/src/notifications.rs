use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::PersistenceError;
use crate::ids::{NotificationId, UserId};

/// Notification type written for in-game admin assistance requests.
pub const ADMIN_ASSISTANCE: &str = "admin_assistance";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: NotificationId,
    pub user_id: UserId,
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    pub description: String,
    pub read: bool,
    pub created_at: String,
}

/// Fields supplied by the writer; id, read flag and timestamp are assigned on create.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NotificationDraft {
    pub user_id: UserId,
    pub kind: String,
    pub message: String,
    pub description: String,
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn create(&self, draft: NotificationDraft) -> Result<Notification, PersistenceError>;

    async fn list_for_user(
        &self,
        user_id: &UserId,
        unread_only: bool,
    ) -> Result<Vec<Notification>, PersistenceError>;

    /// The only mutation a notification ever sees. Returns the updated row.
    async fn mark_read(&self, id: &NotificationId) -> Result<Notification, PersistenceError>;

    async fn unread_count(&self, user_id: &UserId) -> Result<u64, PersistenceError>;
}
