use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use servdeck_connection::Principal;
use servdeck_core::{ListenerId, ServerId};

/// Sending half of one client's bounded outbound queue.
///
/// Pushes never wait: when the queue is full the message is dropped for this
/// client only, so a slow socket cannot hold up the manager's dispatch.
#[derive(Clone)]
pub struct Outbox {
    listener_id: ListenerId,
    tx: mpsc::Sender<String>,
}

impl Outbox {
    pub fn listener_id(&self) -> &ListenerId {
        &self.listener_id
    }

    pub fn push(&self, message: String) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                metrics::counter!("servdeck_ws_messages_dropped_total").increment(1);
                tracing::warn!(
                    listener_id = %self.listener_id,
                    msg_len = msg.len(),
                    "send queue full, dropping message"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// A connected WebSocket client watching one server.
pub struct Client {
    pub server_id: ServerId,
    pub principal: Option<Principal>,
    outbox: Outbox,
}

/// Registry of all connected WebSocket clients.
pub struct ClientRegistry {
    clients: DashMap<ListenerId, Arc<Client>>,
    max_send_queue: usize,
}

impl ClientRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            clients: DashMap::new(),
            max_send_queue: max_send_queue.max(1),
        }
    }

    /// Register a client and return its outbox plus the receiving half the
    /// socket writer drains. The outbox's listener id doubles as the
    /// client's listener group on the manager.
    pub fn register(
        &self,
        server_id: ServerId,
        principal: Option<Principal>,
    ) -> (Outbox, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        let outbox = Outbox {
            listener_id: ListenerId::new(),
            tx,
        };
        self.clients.insert(
            outbox.listener_id.clone(),
            Arc::new(Client {
                server_id,
                principal,
                outbox: outbox.clone(),
            }),
        );
        (outbox, rx)
    }

    pub fn unregister(&self, id: &ListenerId) -> bool {
        self.clients.remove(id).is_some()
    }

    pub fn count(&self) -> usize {
        self.clients.len()
    }

    pub fn count_for(&self, server_id: &ServerId) -> usize {
        self.clients
            .iter()
            .filter(|entry| &entry.value().server_id == server_id)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_unregister() {
        let registry = ClientRegistry::new(8);
        let (a, _rx_a) = registry.register(ServerId::from("main"), None);
        let (_b, _rx_b) = registry.register(ServerId::from("other"), None);
        assert_eq!(registry.count(), 2);
        assert_eq!(registry.count_for(&ServerId::from("main")), 1);

        assert!(registry.unregister(a.listener_id()));
        assert!(!registry.unregister(a.listener_id()));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn full_queue_drops() {
        let registry = ClientRegistry::new(2);
        let (outbox, _rx) = registry.register(ServerId::from("main"), None);

        assert!(outbox.push("1".into()));
        assert!(outbox.push("2".into()));
        assert!(!outbox.push("3".into()));
    }

    #[test]
    fn closed_queue_drops_quietly() {
        let registry = ClientRegistry::new(2);
        let (outbox, rx) = registry.register(ServerId::from("main"), None);
        drop(rx);
        assert!(!outbox.push("late".into()));
    }
}
