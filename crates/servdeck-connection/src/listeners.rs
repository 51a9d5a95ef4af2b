//! Per-manager subscription table.
//!
//! Every registration is a [`Subscription`] whose `dispose()` removes it.
//! `add_listeners` registers several handlers under one caller-supplied
//! [`ListenerId`] and returns them as a [`ListenerGroup`]; removing by id and
//! disposing the group are equivalent.
//!
//! Dispatch clones the matching handlers out of the table and releases the
//! lock before invoking them, so a handler may subscribe or unsubscribe from
//! inside its own callback.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use servdeck_core::{EventKind, ListenerId, ServerEvent, UserId};

/// Event callback. Invoked synchronously on the manager's event task.
pub type Handler = Arc<dyn Fn(&ServerEvent) + Send + Sync>;

/// Wrap a closure as a [`Handler`].
pub fn handler<F>(f: F) -> Handler
where
    F: Fn(&ServerEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Who registered a listener group. Used to address notifications.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Principal {
    pub user_id: UserId,
    pub is_admin: bool,
}

impl Principal {
    pub fn new(user_id: impl Into<String>, is_admin: bool) -> Self {
        Self {
            user_id: UserId::from_raw(user_id),
            is_admin,
        }
    }
}

type SubscriptionId = u64;

struct Entry {
    kind: EventKind,
    handler: Handler,
    group: Option<ListenerId>,
    principal: Option<Principal>,
}

#[derive(Default)]
struct Table {
    entries: RwLock<BTreeMap<SubscriptionId, Entry>>,
    next_id: AtomicU64,
}

impl Table {
    fn insert(&self, entry: Entry) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.write().insert(id, entry);
        id
    }

    fn remove(&self, id: SubscriptionId) -> bool {
        self.entries.write().remove(&id).is_some()
    }
}

/// Handle for one registered handler.
#[must_use = "dropping a Subscription does not unsubscribe; call dispose()"]
pub struct Subscription {
    id: SubscriptionId,
    kind: EventKind,
    table: Weak<Table>,
}

impl Subscription {
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Remove the handler. Returns false if it was already gone.
    pub fn dispose(self) -> bool {
        self.table.upgrade().is_some_and(|t| t.remove(self.id))
    }
}

/// All subscriptions made under one [`ListenerId`].
#[must_use = "dropping a ListenerGroup does not unsubscribe; call dispose()"]
pub struct ListenerGroup {
    listener_id: ListenerId,
    subscriptions: Vec<Subscription>,
}

impl ListenerGroup {
    pub fn listener_id(&self) -> &ListenerId {
        &self.listener_id
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Returns how many handlers were still registered.
    pub fn dispose(self) -> usize {
        self.subscriptions
            .into_iter()
            .filter(|s| s.table.upgrade().is_some_and(|t| t.remove(s.id)))
            .count()
    }
}

#[derive(Clone, Default)]
pub struct ListenerRegistry {
    table: Arc<Table>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, kind: EventKind, handler: Handler) -> Subscription {
        let id = self.table.insert(Entry {
            kind,
            handler,
            group: None,
            principal: None,
        });
        Subscription {
            id,
            kind,
            table: Arc::downgrade(&self.table),
        }
    }

    /// Remove every ungrouped registration of `handler` for `kind`.
    /// Matches by identity of the `Arc`, not by behavior.
    pub fn unsubscribe(&self, kind: EventKind, handler: &Handler) -> usize {
        let mut entries = self.table.entries.write();
        let before = entries.len();
        entries.retain(|_, e| {
            !(e.kind == kind && e.group.is_none() && Arc::ptr_eq(&e.handler, handler))
        });
        before - entries.len()
    }

    pub fn add_listeners(
        &self,
        listener_id: &ListenerId,
        principal: Option<Principal>,
        handlers: impl IntoIterator<Item = (EventKind, Handler)>,
    ) -> ListenerGroup {
        let subscriptions = handlers
            .into_iter()
            .map(|(kind, handler)| {
                let id = self.table.insert(Entry {
                    kind,
                    handler,
                    group: Some(listener_id.clone()),
                    principal: principal.clone(),
                });
                Subscription {
                    id,
                    kind,
                    table: Arc::downgrade(&self.table),
                }
            })
            .collect();
        ListenerGroup {
            listener_id: listener_id.clone(),
            subscriptions,
        }
    }

    /// Leaves zero handlers registered under `listener_id`.
    pub fn remove_listeners(&self, listener_id: &ListenerId) -> usize {
        let mut entries = self.table.entries.write();
        let before = entries.len();
        entries.retain(|_, e| e.group.as_ref() != Some(listener_id));
        before - entries.len()
    }

    /// Invoke every handler subscribed to the event's kind, in registration
    /// order. Returns the number of handlers called.
    pub fn dispatch(&self, event: &ServerEvent) -> usize {
        let kind = event.kind();
        let handlers: Vec<Handler> = self
            .table
            .entries
            .read()
            .values()
            .filter(|e| e.kind == kind)
            .map(|e| e.handler.clone())
            .collect();

        for h in &handlers {
            h(event);
        }
        handlers.len()
    }

    /// Distinct admin users with a live handler for `kind`, sorted.
    pub fn admin_recipients(&self, kind: EventKind) -> Vec<UserId> {
        self.table
            .entries
            .read()
            .values()
            .filter(|e| e.kind == kind)
            .filter_map(|e| e.principal.as_ref())
            .filter(|p| p.is_admin)
            .map(|p| p.user_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.table
            .entries
            .read()
            .values()
            .filter(|e| e.kind == kind)
            .count()
    }

    pub fn count_for(&self, listener_id: &ListenerId) -> usize {
        self.table
            .entries
            .read()
            .values()
            .filter(|e| e.group.as_ref() == Some(listener_id))
            .count()
    }

    pub fn len(&self) -> usize {
        self.table.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.entries.read().is_empty()
    }
}
