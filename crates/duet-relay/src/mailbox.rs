//! Store-and-forward queue for signaling payloads
//!
//! Envelopes are queued per (couple, recipient device) and drained
//! destructively: the whole queue is removed in the same operation that reads
//! it, so the mailbox path delivers each envelope at most once.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use duet_auth::device::validate_id;
use duet_auth::DeviceId;
use duet_core::{Error, RelayConfig, Result, SignalEvent};
use serde_json::Value;
use std::collections::VecDeque;
use tracing::{debug, warn};
use uuid::Uuid;

/// A validated request to relay one signaling payload
#[derive(Debug, Clone)]
pub struct SignalRequest {
    pub couple_id: String,
    pub from_device_id: DeviceId,
    pub to_device_id: DeviceId,
    pub payload: Value,
}

impl SignalRequest {
    /// Validate the routing fields of a signal
    pub fn new(couple_id: &str, from: &str, to: &str, payload: Value) -> Result<Self> {
        if payload.is_null() {
            return Err(Error::validation("Missing required field: signalPayload"));
        }
        Ok(Self {
            couple_id: validate_id("coupleId", couple_id)?,
            from_device_id: DeviceId::parse(from)?,
            to_device_id: DeviceId::parse(to)?,
            payload,
        })
    }
}

/// One queued signaling payload
#[derive(Debug, Clone)]
pub struct SignalEnvelope {
    pub id: Uuid,
    pub couple_id: String,
    pub from_device_id: DeviceId,
    pub to_device_id: DeviceId,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SignalEnvelope {
    fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Wire representation delivered to devices
    pub fn to_event(&self) -> SignalEvent {
        SignalEvent {
            envelope_id: self.id.to_string(),
            couple_id: self.couple_id.clone(),
            from_device_id: self.from_device_id.to_string(),
            to_device_id: self.to_device_id.to_string(),
            signal_payload: self.payload.clone(),
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MailboxKey {
    couple_id: String,
    recipient: String,
}

impl MailboxKey {
    fn new(couple_id: &str, recipient: &str) -> Self {
        Self {
            couple_id: couple_id.trim().to_string(),
            recipient: recipient.trim().to_string(),
        }
    }
}

/// Per-recipient, per-couple signal queues
pub struct SignalMailbox {
    queues: DashMap<MailboxKey, VecDeque<SignalEnvelope>>,
    ttl: Duration,
    max_payload_bytes: usize,
    max_queue: usize,
}

impl Default for SignalMailbox {
    fn default() -> Self {
        Self::new(&RelayConfig::default())
    }
}

impl SignalMailbox {
    /// Create a mailbox using the relay's limits
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            queues: DashMap::new(),
            ttl: Duration::seconds(config.signal_ttl_secs as i64),
            max_payload_bytes: config.max_signal_bytes,
            max_queue: config.max_queue_per_recipient,
        }
    }

    /// Queue a signal for its recipient
    pub fn deposit(&self, request: &SignalRequest) -> Result<SignalEnvelope> {
        self.deposit_at(Utc::now(), request)
    }

    /// Queue a signal as of `now`
    pub fn deposit_at(
        &self,
        now: DateTime<Utc>,
        request: &SignalRequest,
    ) -> Result<SignalEnvelope> {
        let size = serde_json::to_vec(&request.payload)?.len();
        if size > self.max_payload_bytes {
            return Err(Error::PayloadTooLarge {
                size,
                limit: self.max_payload_bytes,
            });
        }

        let envelope = SignalEnvelope {
            id: Uuid::new_v4(),
            couple_id: request.couple_id.clone(),
            from_device_id: request.from_device_id.clone(),
            to_device_id: request.to_device_id.clone(),
            payload: request.payload.clone(),
            created_at: now,
            expires_at: now + self.ttl,
        };

        let key = MailboxKey::new(&request.couple_id, request.to_device_id.as_str());
        let mut queue = self.queues.entry(key).or_default();
        queue.retain(|e| !e.is_expired_at(now));
        while queue.len() >= self.max_queue {
            if let Some(evicted) = queue.pop_front() {
                warn!(
                    "Mailbox for {} in couple {} is full, evicted envelope {}",
                    evicted.to_device_id, evicted.couple_id, evicted.id
                );
            }
        }
        queue.push_back(envelope.clone());

        debug!(
            "Queued signal {} from {} to {} in couple {}",
            envelope.id, envelope.from_device_id, envelope.to_device_id, envelope.couple_id
        );
        Ok(envelope)
    }

    /// Take every live envelope addressed to `recipient`, oldest first
    pub fn drain(&self, couple_id: &str, recipient: &str) -> Vec<SignalEnvelope> {
        self.drain_at(Utc::now(), couple_id, recipient)
    }

    /// Drain as of `now`
    pub fn drain_at(
        &self,
        now: DateTime<Utc>,
        couple_id: &str,
        recipient: &str,
    ) -> Vec<SignalEnvelope> {
        let key = MailboxKey::new(couple_id, recipient);
        let Some((_, queue)) = self.queues.remove(&key) else {
            return Vec::new();
        };

        let envelopes: Vec<SignalEnvelope> = queue
            .into_iter()
            .filter(|e| !e.is_expired_at(now))
            .collect();
        if !envelopes.is_empty() {
            debug!(
                "Drained {} signal(s) for {} in couple {}",
                envelopes.len(),
                key.recipient,
                key.couple_id
            );
        }
        envelopes
    }

    /// Number of live envelopes waiting for `recipient`
    pub fn pending(&self, couple_id: &str, recipient: &str) -> usize {
        let now = Utc::now();
        self.queues
            .get(&MailboxKey::new(couple_id, recipient))
            .map(|q| q.iter().filter(|e| !e.is_expired_at(now)).count())
            .unwrap_or(0)
    }

    /// Drop expired envelopes and empty queues, returning how many envelopes were removed
    pub fn sweep(&self) -> usize {
        self.sweep_at(Utc::now())
    }

    /// Sweep as of `now`
    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let mut removed = 0;
        self.queues.retain(|_, queue| {
            let before = queue.len();
            queue.retain(|e| !e.is_expired_at(now));
            removed += before - queue.len();
            !queue.is_empty()
        });
        removed
    }

    /// Total queued envelopes, including expired ones not yet swept
    pub fn len(&self) -> usize {
        self.queues.iter().map(|q| q.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn request(payload: Value) -> SignalRequest {
        SignalRequest::new("c1", "d1", "d2", payload).unwrap()
    }

    #[test]
    fn test_offline_delivery() {
        let mailbox = SignalMailbox::default();
        let t = Utc::now();
        let offer = json!({"type": "offer", "sdp": "v=0..."});

        mailbox.deposit_at(t, &request(offer.clone())).unwrap();

        let drained = mailbox.drain_at(t + Duration::minutes(2), "c1", "d2");
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].payload, offer);
        assert_eq!(drained[0].from_device_id.as_str(), "d1");

        assert!(mailbox.drain_at(t + Duration::minutes(2), "c1", "d2").is_empty());
    }

    #[test]
    fn test_drain_preserves_creation_order() {
        let mailbox = SignalMailbox::default();
        let t = Utc::now();
        let p1 = json!({"type": "offer", "sdp": "1"});
        let p2 = json!({"candidate": "2"});

        mailbox.deposit_at(t, &request(p1.clone())).unwrap();
        mailbox
            .deposit_at(t + Duration::seconds(1), &request(p2.clone()))
            .unwrap();

        let payloads: Vec<Value> = mailbox
            .drain_at(t + Duration::seconds(2), "c1", "d2")
            .into_iter()
            .map(|e| e.payload)
            .collect();
        assert_eq!(payloads, vec![p1, p2]);
    }

    #[test]
    fn test_expiry_boundary() {
        let mailbox = SignalMailbox::default();
        let t = Utc::now();

        mailbox.deposit_at(t, &request(json!({"n": 1}))).unwrap();
        let almost = t + Duration::minutes(4) + Duration::seconds(59);
        assert_eq!(mailbox.drain_at(almost, "c1", "d2").len(), 1);

        mailbox.deposit_at(t, &request(json!({"n": 2}))).unwrap();
        let late = t + Duration::minutes(5) + Duration::seconds(1);
        assert!(mailbox.drain_at(late, "c1", "d2").is_empty());
    }

    #[test]
    fn test_queues_are_isolated() {
        let mailbox = SignalMailbox::default();
        mailbox.deposit(&request(json!({"n": 1}))).unwrap();
        mailbox
            .deposit(&SignalRequest::new("c2", "d1", "d2", json!({"n": 2})).unwrap())
            .unwrap();
        mailbox
            .deposit(&SignalRequest::new("c1", "d2", "d1", json!({"n": 3})).unwrap())
            .unwrap();

        assert_eq!(mailbox.pending("c1", "d2"), 1);
        assert_eq!(mailbox.pending("c2", "d2"), 1);
        assert_eq!(mailbox.pending("c1", "d1"), 1);
        assert_eq!(mailbox.drain("c1", "d2")[0].payload, json!({"n": 1}));
        assert_eq!(mailbox.len(), 2);
    }

    #[test]
    fn test_payload_limits() {
        let config = RelayConfig {
            max_signal_bytes: 16,
            max_queue_per_recipient: 2,
            ..RelayConfig::default()
        };
        let mailbox = SignalMailbox::new(&config);

        let big = json!({"sdp": "x".repeat(64)});
        assert!(matches!(
            mailbox.deposit(&request(big)),
            Err(Error::PayloadTooLarge { limit: 16, .. })
        ));

        for n in 0..3 {
            mailbox.deposit(&request(json!({ "n": n }))).unwrap();
        }
        let drained = mailbox.drain("c1", "d2");
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].payload, json!({"n": 1}));
    }

    #[test]
    fn test_request_validation() {
        assert!(matches!(
            SignalRequest::new("c1", "d1", "d2", Value::Null),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            SignalRequest::new("", "d1", "d2", json!({})),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            SignalRequest::new("c1", "d1", " ", json!({})),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_sweep() {
        let mailbox = SignalMailbox::default();
        let t = Utc::now();
        mailbox.deposit_at(t, &request(json!({"n": 1}))).unwrap();
        mailbox
            .deposit_at(t + Duration::minutes(3), &request(json!({"n": 2})))
            .unwrap();

        assert_eq!(mailbox.sweep_at(t + Duration::minutes(6)), 1);
        assert_eq!(mailbox.len(), 1);
        assert_eq!(mailbox.sweep_at(t + Duration::minutes(9)), 1);
        assert!(mailbox.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_deposits() {
        let mailbox = Arc::new(SignalMailbox::default());
        let mut handles = Vec::new();
        for n in 0..32 {
            let mailbox = mailbox.clone();
            handles.push(tokio::spawn(async move {
                mailbox.deposit(&request(json!({ "n": n }))).unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(mailbox.drain("c1", "d2").len(), 32);
    }
}
