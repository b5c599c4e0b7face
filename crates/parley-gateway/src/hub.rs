use std::collections::HashMap;

use axum::extract::ws::Utf8Bytes;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use parley_types::events::OutboundMessage;
use parley_types::models::Message;

pub type ConnectionId = Uuid;

/// The hub's side of one live connection.
///
/// Owns the only sender of the connection's delivery queue, so dropping the
/// handle is what closes the queue. Not `Clone`.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub user_id: Uuid,
    pub conversation_id: Uuid,
    queue: mpsc::Sender<Utf8Bytes>,
}

impl ConnectionHandle {
    /// Create a handle plus the receiving end of its delivery queue.
    pub fn new(user_id: Uuid, conversation_id: Uuid, capacity: usize) -> (Self, mpsc::Receiver<Utf8Bytes>) {
        let (queue, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id: Uuid::new_v4(),
            user_id,
            conversation_id,
            queue,
        };
        (handle, rx)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    pub conversations: usize,
    pub connections: usize,
}

/// Outcome of one fan-out.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub evicted: Vec<ConnectionId>,
}

/// conversation -> live connections. Only ever touched by the hub task.
#[derive(Debug, Default)]
pub struct Registry {
    conversations: HashMap<Uuid, HashMap<ConnectionId, ConnectionHandle>>,
}

impl Registry {
    pub fn register(&mut self, handle: ConnectionHandle) {
        let conversation_id = handle.conversation_id;
        let user_id = handle.user_id;
        let connections = self.conversations.entry(conversation_id).or_default();
        connections.insert(handle.id, handle);

        info!(
            "User {} joined conversation {} ({} connections)",
            user_id,
            conversation_id,
            connections.len()
        );
    }

    /// Remove a connection and close its queue. Returns false if it was
    /// already gone.
    pub fn unregister(&mut self, conversation_id: Uuid, connection_id: ConnectionId) -> bool {
        let Some(connections) = self.conversations.get_mut(&conversation_id) else {
            return false;
        };

        let Some(handle) = connections.remove(&connection_id) else {
            return false;
        };

        let remaining = connections.len();
        if remaining == 0 {
            self.conversations.remove(&conversation_id);
        }

        info!(
            "User {} left conversation {} ({} connections remaining)",
            handle.user_id, conversation_id, remaining
        );
        true
    }

    /// Render `message` once and offer it to every connection in its
    /// conversation without waiting. Connections whose queue is full or
    /// closed are evicted on the spot.
    pub fn broadcast(&mut self, message: &Message) -> Delivery {
        let conversation_id = message.conversation_id;
        let Some(connections) = self.conversations.get_mut(&conversation_id) else {
            debug!(
                "No live connections in conversation {} for message {}",
                conversation_id, message.id
            );
            return Delivery::default();
        };

        let frame: Utf8Bytes = match serde_json::to_string(&OutboundMessage::from(message)) {
            Ok(json) => json.into(),
            Err(e) => {
                error!("Failed to render message {} for broadcast: {}", message.id, e);
                return Delivery::default();
            }
        };

        let mut delivery = Delivery::default();
        connections.retain(|id, handle| match handle.queue.try_send(frame.clone()) {
            Ok(()) => {
                delivery.delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(
                    "User {} send queue full in conversation {}, evicting",
                    handle.user_id, conversation_id
                );
                delivery.evicted.push(*id);
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("User {} send queue already closed, evicting", handle.user_id);
                delivery.evicted.push(*id);
                false
            }
        });

        if connections.is_empty() {
            self.conversations.remove(&conversation_id);
        }

        delivery
    }

    pub fn connections_in(&self, conversation_id: Uuid) -> Vec<ConnectionId> {
        self.conversations
            .get(&conversation_id)
            .map(|connections| connections.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            conversations: self.conversations.len(),
            connections: self.conversations.values().map(HashMap::len).sum(),
        }
    }

    /// Drop every connection, closing all delivery queues.
    pub fn clear(&mut self) -> usize {
        let closed = self.stats().connections;
        self.conversations.clear();
        closed
    }
}

enum HubRequest {
    Register(ConnectionHandle),
    Unregister {
        conversation_id: Uuid,
        connection_id: ConnectionId,
    },
    Broadcast(Message),
    Connections {
        conversation_id: Uuid,
        reply: oneshot::Sender<Vec<ConnectionId>>,
    },
    Stats(oneshot::Sender<HubStats>),
    Shutdown(oneshot::Sender<usize>),
}

/// Handle to the hub task. Every registry change and every fan-out goes
/// through one request queue, so the registry needs no lock.
///
/// Calls never fail: once the hub has stopped they are silently dropped.
#[derive(Clone)]
pub struct Hub {
    requests: mpsc::Sender<HubRequest>,
}

impl Hub {
    /// Start the hub task.
    pub fn spawn(capacity: usize) -> (Self, JoinHandle<()>) {
        let (requests, rx) = mpsc::channel(capacity.max(1));
        let task = tokio::spawn(run(rx));
        (Self { requests }, task)
    }

    pub async fn register(&self, handle: ConnectionHandle) {
        self.submit(HubRequest::Register(handle)).await;
    }

    pub async fn unregister(&self, conversation_id: Uuid, connection_id: ConnectionId) {
        self.submit(HubRequest::Unregister {
            conversation_id,
            connection_id,
        })
        .await;
    }

    pub async fn broadcast(&self, message: Message) {
        self.submit(HubRequest::Broadcast(message)).await;
    }

    pub async fn connections_in(&self, conversation_id: Uuid) -> Vec<ConnectionId> {
        let (reply, rx) = oneshot::channel();
        self.submit(HubRequest::Connections {
            conversation_id,
            reply,
        })
        .await;
        rx.await.unwrap_or_default()
    }

    pub async fn stats(&self) -> HubStats {
        let (reply, rx) = oneshot::channel();
        self.submit(HubRequest::Stats(reply)).await;
        rx.await.unwrap_or_default()
    }

    /// Close every connection's queue and stop the hub. Returns the number
    /// of connections that were still registered.
    pub async fn shutdown(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        self.submit(HubRequest::Shutdown(reply)).await;
        rx.await.unwrap_or_default()
    }

    async fn submit(&self, request: HubRequest) {
        if self.requests.send(request).await.is_err() {
            debug!("Hub has stopped, dropping request");
        }
    }
}

async fn run(mut requests: mpsc::Receiver<HubRequest>) {
    let mut registry = Registry::default();

    while let Some(request) = requests.recv().await {
        match request {
            HubRequest::Register(handle) => registry.register(handle),
            HubRequest::Unregister {
                conversation_id,
                connection_id,
            } => {
                registry.unregister(conversation_id, connection_id);
            }
            HubRequest::Broadcast(message) => {
                let delivery = registry.broadcast(&message);
                debug!(
                    "Message {} delivered to {} connections ({} evicted)",
                    message.id,
                    delivery.delivered,
                    delivery.evicted.len()
                );
            }
            HubRequest::Connections {
                conversation_id,
                reply,
            } => {
                let _ = reply.send(registry.connections_in(conversation_id));
            }
            HubRequest::Stats(reply) => {
                let _ = reply.send(registry.stats());
            }
            HubRequest::Shutdown(reply) => {
                let closed = registry.clear();
                info!("Hub shutting down, closed {} connections", closed);
                let _ = reply.send(closed);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashSet;

    fn message_for(conversation_id: Uuid, content: &str) -> Message {
        let now = Utc::now();
        Message {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id: Uuid::new_v4(),
            content: content.into(),
            kind: "text".into(),
            media_url: None,
            metadata: None,
            reply_to_message_id: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    #[test]
    fn registry_tracks_exactly_live_registrations() {
        let mut registry = Registry::default();
        let conversation = Uuid::new_v4();
        let other = Uuid::new_v4();

        let mut receivers = Vec::new();
        let mut ids = Vec::new();
        for i in 0..6 {
            let target = if i % 3 == 0 { other } else { conversation };
            let (handle, rx) = ConnectionHandle::new(Uuid::new_v4(), target, 4);
            ids.push((target, handle.id));
            receivers.push(rx);
            registry.register(handle);
        }

        // Unregister two from `conversation` and one from `other`
        for &(target, id) in [ids[1], ids[4], ids[0]].iter() {
            assert!(registry.unregister(target, id));
        }
        // Repeats and unknown ids are no-ops
        assert!(!registry.unregister(ids[1].0, ids[1].1));
        assert!(!registry.unregister(Uuid::new_v4(), Uuid::new_v4()));

        let live: HashSet<_> = registry.connections_in(conversation).into_iter().collect();
        let expected: HashSet<_> = [ids[2].1, ids[5].1].into_iter().collect();
        assert_eq!(live, expected);

        let live_other: HashSet<_> = registry.connections_in(other).into_iter().collect();
        assert_eq!(live_other, [ids[3].1].into_iter().collect());

        assert_eq!(
            registry.stats(),
            HubStats {
                conversations: 2,
                connections: 3
            }
        );
    }

    #[test]
    fn last_unregister_removes_conversation_and_closes_queue() {
        let mut registry = Registry::default();
        let conversation = Uuid::new_v4();
        let (handle, mut rx) = ConnectionHandle::new(Uuid::new_v4(), conversation, 4);
        let id = handle.id;
        registry.register(handle);

        assert!(registry.unregister(conversation, id));
        assert_eq!(registry.stats(), HubStats::default());
        assert!(matches!(rx.try_recv(), Err(mpsc::error::TryRecvError::Disconnected)));
    }

    #[test]
    fn broadcast_without_recipients_is_noop() {
        let mut registry = Registry::default();
        let delivery = registry.broadcast(&message_for(Uuid::new_v4(), "nobody home"));
        assert_eq!(delivery, Delivery::default());
        assert_eq!(registry.stats(), HubStats::default());
    }

    #[test]
    fn broadcast_reaches_every_connection_in_conversation_only() {
        let mut registry = Registry::default();
        let conversation = Uuid::new_v4();

        let (a, mut rx_a) = ConnectionHandle::new(Uuid::new_v4(), conversation, 4);
        let (b, mut rx_b) = ConnectionHandle::new(Uuid::new_v4(), conversation, 4);
        let (c, mut rx_c) = ConnectionHandle::new(Uuid::new_v4(), Uuid::new_v4(), 4);
        registry.register(a);
        registry.register(b);
        registry.register(c);

        let message = message_for(conversation, "hi");
        let delivery = registry.broadcast(&message);
        assert_eq!(delivery.delivered, 2);
        assert!(delivery.evicted.is_empty());

        for rx in [&mut rx_a, &mut rx_b] {
            let frame = rx.try_recv().unwrap();
            let wire: OutboundMessage = serde_json::from_str(frame.as_str()).unwrap();
            assert_eq!(wire.id, message.id);
            assert_eq!(wire.content, "hi");
        }
        assert!(rx_c.try_recv().is_err());
    }

    #[test]
    fn full_queue_evicts_and_closes_once() {
        let mut registry = Registry::default();
        let conversation = Uuid::new_v4();

        let (slow, mut slow_rx) = ConnectionHandle::new(Uuid::new_v4(), conversation, 1);
        let slow_id = slow.id;
        let (healthy, mut healthy_rx) = ConnectionHandle::new(Uuid::new_v4(), conversation, 8);
        registry.register(slow);
        registry.register(healthy);

        let first = registry.broadcast(&message_for(conversation, "one"));
        assert_eq!(first.delivered, 2);

        // Slow consumer never drained its single slot
        let second = registry.broadcast(&message_for(conversation, "two"));
        assert_eq!(second.delivered, 1);
        assert_eq!(second.evicted, vec![slow_id]);
        assert_eq!(registry.connections_in(conversation).len(), 1);

        // Later fan-outs no longer see it; eviction is not repeated
        let third = registry.broadcast(&message_for(conversation, "three"));
        assert_eq!(third.delivered, 1);
        assert!(third.evicted.is_empty());

        // Evicted queue yields what was buffered, then reports closed
        assert!(slow_rx.try_recv().is_ok());
        assert!(matches!(slow_rx.try_recv(), Err(mpsc::error::TryRecvError::Disconnected)));

        // Unregistering the evicted connection later is harmless
        assert!(!registry.unregister(conversation, slow_id));

        let mut received = 0;
        while healthy_rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 3);
    }

    #[test]
    fn dropped_receiver_is_evicted() {
        let mut registry = Registry::default();
        let conversation = Uuid::new_v4();
        let (handle, rx) = ConnectionHandle::new(Uuid::new_v4(), conversation, 4);
        let id = handle.id;
        registry.register(handle);
        drop(rx);

        let delivery = registry.broadcast(&message_for(conversation, "gone"));
        assert_eq!(delivery.evicted, vec![id]);
        assert_eq!(registry.stats(), HubStats::default());
    }

    #[tokio::test]
    async fn hub_serializes_requests() {
        let (hub, task) = Hub::spawn(16);
        let conversation = Uuid::new_v4();

        let (a, mut rx_a) = ConnectionHandle::new(Uuid::new_v4(), conversation, 4);
        let (b, mut rx_b) = ConnectionHandle::new(Uuid::new_v4(), conversation, 4);
        let b_id = b.id;
        hub.register(a).await;
        hub.register(b).await;
        assert_eq!(hub.connections_in(conversation).await.len(), 2);

        hub.broadcast(message_for(conversation, "first")).await;
        hub.unregister(conversation, b_id).await;
        hub.unregister(conversation, b_id).await;
        hub.broadcast(message_for(conversation, "second")).await;

        let stats = hub.stats().await;
        assert_eq!(stats, HubStats { conversations: 1, connections: 1 });

        assert!(rx_a.recv().await.is_some());
        assert!(rx_a.recv().await.is_some());
        assert!(rx_b.recv().await.is_some());
        assert!(rx_b.recv().await.is_none());

        assert_eq!(hub.shutdown().await, 1);
        assert!(rx_a.recv().await.is_none());
        task.await.unwrap();

        // Calls after shutdown are dropped quietly
        hub.broadcast(message_for(conversation, "late")).await;
        assert_eq!(hub.stats().await, HubStats::default());
    }
}
