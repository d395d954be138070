//! Live fan-out of signaling payloads
//!
//! Each connected device socket registers a connection with a bounded
//! outbound queue and joins one or more couple channels. Publishing always
//! deposits in the mailbox first, then pushes to every other subscriber of
//! the couple without waiting on any of them.

use crate::mailbox::{SignalEnvelope, SignalMailbox, SignalRequest};
use dashmap::DashMap;
use duet_auth::device::validate_id;
use duet_core::{Error, Result, SignalEvent};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

/// Identifier of one live connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Events pushed to a live connection
#[derive(Debug, Clone)]
pub enum HubEvent {
    Signal(SignalEvent),
}

/// Outcome of a publish
#[derive(Debug, Clone)]
pub struct PublishReceipt {
    /// The envelope stored in the mailbox
    pub envelope: SignalEnvelope,
    /// Number of live connections the event was handed to
    pub delivered: usize,
}

struct Connection {
    tx: mpsc::Sender<HubEvent>,
    couples: HashSet<String>,
    /// Device identity declared on join, used to skip self-echoes
    device_id: Option<String>,
}

/// Publish/subscribe hub keyed by couple id
pub struct RelayHub {
    mailbox: Arc<SignalMailbox>,
    connections: DashMap<ConnectionId, Connection>,
    channels: DashMap<String, HashSet<ConnectionId>>,
    next_id: AtomicU64,
    queue_depth: usize,
}

impl RelayHub {
    /// Create a hub that persists every signal in `mailbox`
    pub fn new(mailbox: Arc<SignalMailbox>, queue_depth: usize) -> Self {
        Self {
            mailbox,
            connections: DashMap::new(),
            channels: DashMap::new(),
            next_id: AtomicU64::new(1),
            queue_depth: queue_depth.max(1),
        }
    }

    /// The mailbox backing this hub
    pub fn mailbox(&self) -> &Arc<SignalMailbox> {
        &self.mailbox
    }

    /// Register a live connection and return its event stream
    pub fn connect(&self) -> (ConnectionId, mpsc::Receiver<HubEvent>) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.queue_depth);
        self.connections.insert(
            id,
            Connection {
                tx,
                couples: HashSet::new(),
                device_id: None,
            },
        );
        debug!("Registered live connection {}", id);
        (id, rx)
    }

    /// Add a connection to a couple's channel
    pub fn subscribe(
        &self,
        conn: ConnectionId,
        couple_id: &str,
        device_id: Option<&str>,
    ) -> Result<()> {
        let couple_id = validate_id("coupleId", couple_id)?;
        let device_id = device_id
            .map(|d| validate_id("deviceId", d))
            .transpose()?;

        {
            let mut connection = self
                .connections
                .get_mut(&conn)
                .ok_or_else(|| Error::not_found(format!("Connection {} is not registered", conn)))?;
            connection.couples.insert(couple_id.clone());
            if device_id.is_some() {
                connection.device_id = device_id;
            }
        }
        self.channels
            .entry(couple_id.clone())
            .or_default()
            .insert(conn);

        info!("Connection {} joined couple {}", conn, couple_id);
        Ok(())
    }

    /// Remove a connection from a couple's channel
    pub fn unsubscribe(&self, conn: ConnectionId, couple_id: &str) -> bool {
        let couple_id = couple_id.trim();
        let was_member = self
            .connections
            .get_mut(&conn)
            .map(|mut c| c.couples.remove(couple_id))
            .unwrap_or(false);
        self.leave_channel(conn, couple_id);

        if was_member {
            info!("Connection {} left couple {}", conn, couple_id);
        }
        was_member
    }

    /// Forget a connection and all of its subscriptions
    pub fn disconnect(&self, conn: ConnectionId) {
        if let Some((_, connection)) = self.connections.remove(&conn) {
            for couple_id in &connection.couples {
                self.leave_channel(conn, couple_id);
            }
            debug!("Removed live connection {}", conn);
        }
    }

    fn leave_channel(&self, conn: ConnectionId, couple_id: &str) {
        if let Some(mut members) = self.channels.get_mut(couple_id) {
            members.remove(&conn);
        }
        self.channels.remove_if(couple_id, |_, members| members.is_empty());
    }

    /// Whether a connection has joined a couple's channel
    pub fn is_subscribed(&self, conn: ConnectionId, couple_id: &str) -> bool {
        self.connections
            .get(&conn)
            .map(|c| c.couples.contains(couple_id.trim()))
            .unwrap_or(false)
    }

    /// Persist a signal, then push it to the couple's other live subscribers
    ///
    /// `origin` is the connection the signal arrived on, if any; it never
    /// receives its own signal, nor does any connection that declared the
    /// sender's device id.
    pub fn publish(
        &self,
        request: &SignalRequest,
        origin: Option<ConnectionId>,
    ) -> Result<PublishReceipt> {
        let envelope = self.mailbox.deposit(request)?;
        let event = envelope.to_event();

        let members: Vec<ConnectionId> = self
            .channels
            .get(&request.couple_id)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default();

        let mut delivered = 0;
        let mut dead = Vec::new();
        for member in members {
            if Some(member) == origin {
                continue;
            }
            let Some(connection) = self.connections.get(&member) else {
                continue;
            };
            if connection.device_id.as_deref() == Some(request.from_device_id.as_str()) {
                continue;
            }
            match connection.tx.try_send(HubEvent::Signal(event.clone())) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        "Connection {} is not keeping up, dropped live signal {}",
                        member, envelope.id
                    );
                }
                Err(TrySendError::Closed(_)) => dead.push(member),
            }
        }

        for member in dead {
            debug!("Connection {} is gone, removing it", member);
            self.disconnect(member);
        }

        debug!(
            "Published signal {} in couple {} to {} live subscriber(s)",
            envelope.id, request.couple_id, delivered
        );
        Ok(PublishReceipt {
            envelope,
            delivered,
        })
    }

    /// Number of live subscribers of a couple
    pub fn subscriber_count(&self, couple_id: &str) -> usize {
        self.channels
            .get(couple_id.trim())
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// Number of registered live connections
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hub() -> RelayHub {
        RelayHub::new(Arc::new(SignalMailbox::default()), 4)
    }

    fn signal(from: &str, to: &str) -> SignalRequest {
        SignalRequest::new("c1", from, to, json!({"type": "offer", "sdp": "v=0"})).unwrap()
    }

    #[test]
    fn test_publish_reaches_other_subscribers_only() {
        let hub = hub();
        let (a, mut rx_a) = hub.connect();
        let (b, mut rx_b) = hub.connect();
        hub.subscribe(a, "c1", Some("d1")).unwrap();
        hub.subscribe(b, "c1", Some("d2")).unwrap();

        let receipt = hub.publish(&signal("d1", "d2"), Some(a)).unwrap();
        assert_eq!(receipt.delivered, 1);

        let HubEvent::Signal(event) = rx_b.try_recv().unwrap();
        assert_eq!(event.from_device_id, "d1");
        assert_eq!(event.envelope_id, receipt.envelope.id.to_string());
        assert!(rx_a.try_recv().is_err());

        // Always persisted, even when delivered live
        assert_eq!(hub.mailbox().pending("c1", "d2"), 1);
    }

    #[test]
    fn test_sender_device_filter_without_origin() {
        let hub = hub();
        let (a, mut rx_a) = hub.connect();
        hub.subscribe(a, "c1", Some("d1")).unwrap();

        // Published over HTTP: no origin connection, but the device is known
        let receipt = hub.publish(&signal("d1", "d2"), None).unwrap();
        assert_eq!(receipt.delivered, 0);
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn test_other_couples_do_not_receive() {
        let hub = hub();
        let (a, mut rx_a) = hub.connect();
        hub.subscribe(a, "c2", None).unwrap();

        hub.publish(&signal("d1", "d2"), None).unwrap();
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn test_unsubscribe_and_disconnect() {
        let hub = hub();
        let (a, _rx_a) = hub.connect();
        let (b, _rx_b) = hub.connect();
        hub.subscribe(a, "c1", None).unwrap();
        hub.subscribe(b, "c1", None).unwrap();
        assert_eq!(hub.subscriber_count("c1"), 2);

        assert!(hub.unsubscribe(a, "c1"));
        assert!(!hub.unsubscribe(a, "c1"));
        assert!(!hub.is_subscribed(a, "c1"));
        assert_eq!(hub.subscriber_count("c1"), 1);

        hub.disconnect(b);
        assert_eq!(hub.subscriber_count("c1"), 0);
        assert_eq!(hub.connection_count(), 1);
    }

    #[test]
    fn test_subscribe_unknown_connection() {
        let hub = hub();
        let (a, _rx) = hub.connect();
        hub.disconnect(a);
        assert!(matches!(
            hub.subscribe(a, "c1", None),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_slow_subscriber_does_not_block() {
        let hub = RelayHub::new(Arc::new(SignalMailbox::default()), 1);
        let (slow, _rx_slow) = hub.connect();
        let (fast, mut rx_fast) = hub.connect();
        hub.subscribe(slow, "c1", None).unwrap();
        hub.subscribe(fast, "c1", None).unwrap();

        hub.publish(&signal("d1", "d2"), None).unwrap();
        rx_fast.try_recv().unwrap();
        let receipt = hub.publish(&signal("d1", "d2"), None).unwrap();

        // The slow queue is full and drops the push; the fast one still gets it
        assert_eq!(receipt.delivered, 1);
        assert!(rx_fast.try_recv().is_ok());
        assert_eq!(hub.connection_count(), 2);
        assert_eq!(hub.mailbox().pending("c1", "d2"), 2);
    }

    #[test]
    fn test_dead_subscriber_is_removed() {
        let hub = hub();
        let (a, rx_a) = hub.connect();
        hub.subscribe(a, "c1", None).unwrap();
        drop(rx_a);

        let receipt = hub.publish(&signal("d1", "d2"), None).unwrap();
        assert_eq!(receipt.delivered, 0);
        assert_eq!(hub.connection_count(), 0);
        assert_eq!(hub.subscriber_count("c1"), 0);
    }
}
