//! WebSocket live-channel message types
//!
//! Field names are camelCase so existing web clients can speak the protocol
//! without translation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A signaling payload as delivered to a device, live or drained
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEvent {
    /// Envelope identifier, identical on the live and mailbox paths
    pub envelope_id: String,
    pub couple_id: String,
    pub from_device_id: String,
    pub to_device_id: String,
    /// Opaque SDP offer/answer or ICE candidate
    pub signal_payload: Value,
    pub created_at: DateTime<Utc>,
}

/// Messages sent from a device to the relay
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Subscribe to a couple's live channel
    #[serde(rename_all = "camelCase")]
    Join {
        couple_id: String,
        /// Device identity used to suppress echoes of this device's own signals
        #[serde(default)]
        device_id: Option<String>,
    },
    /// Unsubscribe from a couple's live channel
    #[serde(rename_all = "camelCase")]
    Leave { couple_id: String },
    /// Publish a signaling payload to the couple
    #[serde(rename_all = "camelCase", alias = "webrtc-signal")]
    Signal {
        couple_id: String,
        from_device_id: String,
        to_device_id: String,
        signal_payload: Value,
    },
    /// Drain queued envelopes addressed to this device
    #[serde(rename_all = "camelCase")]
    Drain { couple_id: String, device_id: String },
    /// Pong response to ping
    Pong { timestamp: u64 },
}

/// Messages sent from the relay to a device
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Subscription acknowledged
    #[serde(rename_all = "camelCase")]
    Joined { couple_id: String },
    /// Unsubscription acknowledged
    #[serde(rename_all = "camelCase")]
    Left { couple_id: String },
    /// Live signaling payload from another device of the couple
    WebrtcSignal(SignalEvent),
    /// Result of a drain request
    #[serde(rename_all = "camelCase")]
    Signals {
        couple_id: String,
        signals: Vec<SignalEvent>,
    },
    /// Error message
    Error { message: String },
    /// Ping for connection keepalive
    Ping { timestamp: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_message_parsing() {
        let join: ClientMessage =
            serde_json::from_str(r#"{"type":"join","coupleId":"c1","deviceId":"d1"}"#).unwrap();
        assert!(matches!(
            join,
            ClientMessage::Join {
                ref couple_id,
                device_id: Some(ref d),
            } if couple_id == "c1" && d == "d1"
        ));

        let signal: ClientMessage = serde_json::from_value(json!({
            "type": "webrtc-signal",
            "coupleId": "c1",
            "fromDeviceId": "d1",
            "toDeviceId": "d2",
            "signalPayload": {"type": "offer", "sdp": "v=0"}
        }))
        .unwrap();
        match signal {
            ClientMessage::Signal { signal_payload, .. } => {
                assert_eq!(signal_payload["type"], "offer");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_server_message_shape() {
        let event = SignalEvent {
            envelope_id: "e1".to_string(),
            couple_id: "c1".to_string(),
            from_device_id: "d1".to_string(),
            to_device_id: "d2".to_string(),
            signal_payload: json!({"candidate": "a=1"}),
            created_at: Utc::now(),
        };
        let value = serde_json::to_value(ServerMessage::WebrtcSignal(event)).unwrap();
        assert_eq!(value["type"], "webrtc-signal");
        assert_eq!(value["fromDeviceId"], "d1");
        assert_eq!(value["toDeviceId"], "d2");
        assert_eq!(value["signalPayload"]["candidate"], "a=1");
    }
}
