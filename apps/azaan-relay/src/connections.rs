use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::Message;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::{counter, decrement_gauge, increment_gauge};
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::hub::{Envelope, Target};
use crate::protocol::ServerMessage;

/// Opaque, relay-assigned id of one live WebSocket.
pub type ConnectionId = String;

/// Generate a unique connection ID
pub fn generate_connection_id() -> ConnectionId {
    Uuid::new_v4().to_string()
}

#[derive(Clone)]
struct PeerHandle {
    tx: mpsc::Sender<Message>,
    connected_at: DateTime<Utc>,
    remote_addr: Option<SocketAddr>,
}

/// Live connections and their outbound queues.
#[derive(Clone)]
pub struct ConnectionRegistry {
    peers: Arc<DashMap<ConnectionId, PeerHandle>>,
    buffer: usize,
}

pub struct Registration {
    pub connection_id: ConnectionId,
    pub receiver: mpsc::Receiver<Message>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub dropped: usize,
}

impl DeliveryReport {
    fn record(&mut self, queued: bool) {
        if queued {
            self.delivered += 1;
        } else {
            self.dropped += 1;
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub connection_id: ConnectionId,
    pub connected_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_addr: Option<String>,
}

impl ConnectionRegistry {
    pub fn new(buffer: usize) -> Self {
        Self {
            peers: Arc::new(DashMap::new()),
            buffer: buffer.max(1),
        }
    }

    /// Register a new connection. `connected{connectionId}` is queued before the peer becomes
    /// visible to [`deliver`](Self::deliver), so it is always the first frame the client sees.
    pub fn register(&self, remote_addr: Option<SocketAddr>) -> Registration {
        let (tx, receiver) = mpsc::channel(self.buffer);
        let connection_id = generate_connection_id();
        let greeting = ServerMessage::Connected {
            connection_id: connection_id.clone(),
        };
        match serde_json::to_string(&greeting) {
            Ok(text) => {
                queue(&connection_id, &tx, &text);
            }
            Err(err) => warn!(error = %err, "failed to serialize connection greeting"),
        }
        self.peers.insert(
            connection_id.clone(),
            PeerHandle {
                tx,
                connected_at: Utc::now(),
                remote_addr,
            },
        );
        counter!("azaan_relay_connections_total", 1);
        increment_gauge!("azaan_relay_connections_active", 1.0);

        Registration {
            connection_id,
            receiver,
        }
    }

    /// Forget a connection. Dropping its sender lets the writer task drain and exit.
    pub fn unregister(&self, connection_id: &str) -> bool {
        let removed = self.peers.remove(connection_id).is_some();
        if removed {
            decrement_gauge!("azaan_relay_connections_active", 1.0);
        }
        removed
    }

    #[cfg(test)]
    pub(crate) fn is_registered(&self, connection_id: &str) -> bool {
        self.peers.contains_key(connection_id)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn snapshot(&self) -> Vec<ConnectionSnapshot> {
        let mut connections: Vec<ConnectionSnapshot> = self
            .peers
            .iter()
            .map(|entry| ConnectionSnapshot {
                connection_id: entry.key().clone(),
                connected_at: entry.connected_at,
                remote_addr: entry.remote_addr.map(|addr| addr.to_string()),
            })
            .collect();
        connections.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
        connections
    }

    /// Queue every envelope on its recipients' outbound channels.
    ///
    /// Each message is serialized once. Delivery is at-most-once: an unknown recipient, a closed
    /// connection or a full queue drops the message for that recipient only.
    pub fn deliver(&self, envelopes: Vec<Envelope>) -> DeliveryReport {
        let mut report = DeliveryReport::default();

        for envelope in envelopes {
            let text = match serde_json::to_string(&envelope.message) {
                Ok(text) => text,
                Err(err) => {
                    warn!(error = %err, "failed to serialize outbound message");
                    continue;
                }
            };

            match envelope.target {
                Target::Connection(connection_id) => {
                    report.record(self.send_text(&connection_id, &text));
                }
                Target::Connections(connection_ids) => {
                    for connection_id in &connection_ids {
                        report.record(self.send_text(connection_id, &text));
                    }
                }
                Target::Everyone => {
                    // Collect senders first to avoid holding DashMap guards while queueing
                    let peers: Vec<(ConnectionId, mpsc::Sender<Message>)> = self
                        .peers
                        .iter()
                        .map(|entry| (entry.key().clone(), entry.tx.clone()))
                        .collect();
                    for (connection_id, tx) in peers {
                        report.record(queue(&connection_id, &tx, &text));
                    }
                }
            }
        }

        if report.dropped > 0 {
            counter!("azaan_relay_messages_dropped_total", report.dropped as u64);
        }
        report
    }

    fn send_text(&self, connection_id: &str, text: &str) -> bool {
        let Some(tx) = self.peers.get(connection_id).map(|peer| peer.tx.clone()) else {
            debug!(connection_id, "destination not connected; dropping message");
            return false;
        };
        queue(connection_id, &tx, text)
    }
}

fn queue(connection_id: &str, tx: &mpsc::Sender<Message>, text: &str) -> bool {
    match tx.try_send(Message::Text(text.to_owned())) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!(connection_id, "outbound queue full; dropping message");
            false
        }
        Err(TrySendError::Closed(_)) => {
            debug!(connection_id, "outbound queue closed; dropping message");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn next(receiver: &mut mpsc::Receiver<Message>) -> Option<ServerMessage> {
        match receiver.try_recv().ok()? {
            Message::Text(text) => Some(serde_json::from_str(&text).unwrap()),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    /// Register and consume the `connected` greeting.
    fn register(registry: &ConnectionRegistry) -> Registration {
        let mut registration = registry.register(None);
        assert_eq!(
            next(&mut registration.receiver),
            Some(ServerMessage::Connected {
                connection_id: registration.connection_id.clone()
            })
        );
        registration
    }

    #[test_timeout::timeout]
    fn test_greeting_precedes_any_broadcast() {
        let registry = ConnectionRegistry::new(8);
        let mut fresh = registry.register(None);
        registry.deliver(vec![Envelope::everyone(ServerMessage::BroadcastStarted {
            channel_id: "m1".into(),
        })]);

        assert_eq!(
            next(&mut fresh.receiver),
            Some(ServerMessage::Connected {
                connection_id: fresh.connection_id.clone()
            })
        );
        assert_eq!(
            next(&mut fresh.receiver),
            Some(ServerMessage::BroadcastStarted {
                channel_id: "m1".into()
            })
        );
    }

    #[test_timeout::timeout]
    fn test_register_assigns_unique_ids() {
        let registry = ConnectionRegistry::new(8);
        let a = registry.register(None);
        let b = registry.register(None);
        assert_ne!(a.connection_id, b.connection_id);
        assert_eq!(a.connection_id.len(), 36);
        assert_eq!(registry.len(), 2);

        assert!(registry.unregister(&a.connection_id));
        assert!(!registry.unregister(&a.connection_id));
        assert!(!registry.is_registered(&a.connection_id));
        assert!(registry.is_registered(&b.connection_id));
    }

    #[test_timeout::timeout]
    fn test_deliver_scopes() {
        let registry = ConnectionRegistry::new(8);
        let mut a = register(&registry);
        let mut b = register(&registry);
        let mut c = register(&registry);

        let report = registry.deliver(vec![
            Envelope::everyone(ServerMessage::BroadcastStarted {
                channel_id: "m1".into(),
            }),
            Envelope::to(a.connection_id.clone(), ServerMessage::Pong),
            Envelope::to_many(
                vec![b.connection_id.clone(), c.connection_id.clone()],
                ServerMessage::ListenerCount { count: 2 },
            ),
        ]);
        assert_eq!(
            report,
            DeliveryReport {
                delivered: 6,
                dropped: 0
            }
        );

        let started = ServerMessage::BroadcastStarted {
            channel_id: "m1".into(),
        };
        assert_eq!(next(&mut a.receiver), Some(started.clone()));
        assert_eq!(next(&mut a.receiver), Some(ServerMessage::Pong));
        assert_eq!(next(&mut a.receiver), None);
        for registration in [&mut b, &mut c] {
            assert_eq!(next(&mut registration.receiver), Some(started.clone()));
            assert_eq!(
                next(&mut registration.receiver),
                Some(ServerMessage::ListenerCount { count: 2 })
            );
        }
    }

    #[test_timeout::timeout]
    fn test_unknown_destination_is_dropped() {
        let registry = ConnectionRegistry::new(8);
        let report = registry.deliver(vec![Envelope::to("ghost", ServerMessage::Pong)]);
        assert_eq!(
            report,
            DeliveryReport {
                delivered: 0,
                dropped: 1
            }
        );
    }

    #[test_timeout::timeout]
    fn test_full_queue_drops_for_that_connection_only() {
        // The greeting takes one slot, the first pong the other
        let registry = ConnectionRegistry::new(2);
        let slow = registry.register(None);
        let mut fast = register(&registry);

        registry.deliver(vec![Envelope::to(slow.connection_id.clone(), ServerMessage::Pong)]);
        let report = registry.deliver(vec![Envelope::to_many(
            vec![slow.connection_id.clone(), fast.connection_id.clone()],
            ServerMessage::Pong,
        )]);
        assert_eq!(
            report,
            DeliveryReport {
                delivered: 1,
                dropped: 1
            }
        );
        assert_eq!(next(&mut fast.receiver), Some(ServerMessage::Pong));
    }

    #[test_timeout::timeout]
    fn test_closed_receiver_is_dropped() {
        let registry = ConnectionRegistry::new(4);
        let gone = registry.register(None);
        let id = gone.connection_id.clone();
        drop(gone.receiver);

        let report = registry.deliver(vec![Envelope::to(id, ServerMessage::Pong)]);
        assert_eq!(report.dropped, 1);
    }
}
