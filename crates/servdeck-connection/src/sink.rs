//! Admin-assistance notifications.
//!
//! The manager dispatches the enriched payload to its live listeners first;
//! persistence runs afterwards on a tracked background task, so a slow or
//! failing store never holds up delivery.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use servdeck_core::notifications::{NotificationDraft, NotificationStore, ADMIN_ASSISTANCE};
use servdeck_core::UserId;
use servdeck_settings::ServerDefinition;

/// Add `serverName` and `serverId` to an admin-assistance payload.
///
/// Non-object payloads are wrapped under `payload`.
pub fn enrich(payload: Value, server: &ServerDefinition) -> Value {
    let mut object = match payload {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("payload".into(), other);
            map
        }
    };
    object.insert("serverName".into(), json!(server.name));
    object.insert("serverId".into(), json!(server.id));
    Value::Object(object)
}

pub struct NotificationSink {
    store: Arc<dyn NotificationStore>,
    tracker: TaskTracker,
}

impl NotificationSink {
    pub fn new(store: Arc<dyn NotificationStore>) -> Self {
        Self {
            store,
            tracker: TaskTracker::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn NotificationStore> {
        &self.store
    }

    /// Write one notification per recipient in the background.
    pub fn persist(&self, server: &ServerDefinition, recipients: Vec<UserId>, payload: &Value) {
        if recipients.is_empty() {
            debug!(server_id = %server.id, "admin assistance with no admin listeners");
            return;
        }

        let message = format!("Admin assistance requested on {}", server.name);
        let description = describe(payload);
        let drafts: Vec<NotificationDraft> = recipients
            .into_iter()
            .map(|user_id| NotificationDraft {
                user_id,
                kind: ADMIN_ASSISTANCE.into(),
                message: message.clone(),
                description: description.clone(),
            })
            .collect();

        let store = self.store.clone();
        let server_id = server.id.clone();
        self.tracker.spawn(async move {
            for draft in drafts {
                let user_id = draft.user_id.clone();
                if let Err(e) = store.create(draft).await {
                    metrics::counter!("servdeck_notification_failures_total").increment(1);
                    warn!(server_id = %server_id, user_id = %user_id, error = %e, "notification persist failed");
                }
            }
        });
    }

    /// Wait for every persistence task spawned so far.
    pub async fn flush(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

fn describe(payload: &Value) -> String {
    let field = |name: &str| payload.get(name).and_then(Value::as_str).filter(|s| !s.is_empty());
    let who = match (field("nickName"), field("login")) {
        (Some(nick), Some(login)) => Some(format!("{nick} ({login})")),
        (None, Some(login)) => Some(login.to_string()),
        (Some(nick), None) => Some(nick.to_string()),
        (None, None) => None,
    };
    match (who, field("message")) {
        (Some(who), Some(msg)) => format!("{who}: {msg}"),
        (Some(who), None) => format!("{who} requested assistance"),
        (None, Some(msg)) => msg.to_string(),
        (None, None) => "A player requested assistance".to_string(),
    }
}
