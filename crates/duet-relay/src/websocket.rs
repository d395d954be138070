//! WebSocket live channel
//!
//! A device joins its couple's channel and receives other devices' signals
//! as they are published. Signals sent over the socket are also queued in
//! the mailbox, so a partner that is offline can drain them later.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use chrono::Utc;
use duet_core::protocol::{ClientMessage, ServerMessage};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::time::{self, Duration, Instant};
use tracing::{debug, info, warn};

use crate::hub::{ConnectionId, HubEvent};
use crate::mailbox::SignalRequest;
use crate::state::AppState;

const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Upgrade handler for `/ws`
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Drive one live connection until either side closes it
pub async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let (conn, mut events) = state.hub.connect();
    info!("Live client connected ({})", conn);

    let mut ping = time::interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let reply = match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(message) => handle_client_message(&state, conn, message),
                            Err(e) => {
                                warn!("Invalid live message from {}: {}", conn, e);
                                Some(ServerMessage::Error {
                                    message: format!("Invalid message: {}", e),
                                })
                            }
                        };
                        if let Some(reply) = reply {
                            if !send_message(&mut sender, &reply).await {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!("WebSocket receive error: {}", e);
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
            event = events.recv() => {
                let Some(HubEvent::Signal(signal)) = event else {
                    break;
                };
                if !send_message(&mut sender, &ServerMessage::WebrtcSignal(signal)).await {
                    break;
                }
            }
            _ = ping.tick() => {
                let ping_msg = ServerMessage::Ping {
                    timestamp: Utc::now().timestamp_millis().max(0) as u64,
                };
                if !send_message(&mut sender, &ping_msg).await {
                    break;
                }
            }
        }
    }

    state.hub.disconnect(conn);
    info!("Live client disconnected ({})", conn);
}

async fn send_message(sender: &mut SplitSink<WebSocket, Message>, message: &ServerMessage) -> bool {
    match serde_json::to_string(message) {
        Ok(json) => sender.send(Message::Text(json)).await.is_ok(),
        Err(e) => {
            warn!("Failed to serialize live message: {}", e);
            true
        }
    }
}

/// Apply one client message, returning the direct reply if there is one
pub fn handle_client_message(
    state: &AppState,
    conn: ConnectionId,
    message: ClientMessage,
) -> Option<ServerMessage> {
    let error = |e: duet_core::Error| ServerMessage::Error {
        message: e.to_string(),
    };

    match message {
        ClientMessage::Join {
            couple_id,
            device_id,
        } => Some(
            match state.hub.subscribe(conn, &couple_id, device_id.as_deref()) {
                Ok(()) => ServerMessage::Joined { couple_id },
                Err(e) => error(e),
            },
        ),
        ClientMessage::Leave { couple_id } => {
            state.hub.unsubscribe(conn, &couple_id);
            Some(ServerMessage::Left { couple_id })
        }
        ClientMessage::Signal {
            couple_id,
            from_device_id,
            to_device_id,
            signal_payload,
        } => {
            if !state.hub.is_subscribed(conn, &couple_id) {
                warn!("Connection {} signaled couple {} without joining", conn, couple_id);
                return Some(ServerMessage::Error {
                    message: "Join the couple before sending signals".to_string(),
                });
            }
            let published =
                SignalRequest::new(&couple_id, &from_device_id, &to_device_id, signal_payload)
                    .and_then(|request| state.hub.publish(&request, Some(conn)));
            match published {
                Ok(receipt) => {
                    debug!(
                        "Live signal {} from {} delivered to {}",
                        receipt.envelope.id, conn, receipt.delivered
                    );
                    None
                }
                Err(e) => Some(error(e)),
            }
        }
        ClientMessage::Drain {
            couple_id,
            device_id,
        } => {
            if !state.hub.is_subscribed(conn, &couple_id) {
                warn!("Connection {} drained couple {} without joining", conn, couple_id);
                return Some(ServerMessage::Error {
                    message: "Join the couple before draining signals".to_string(),
                });
            }
            let signals = state
                .mailbox
                .drain(&couple_id, &device_id)
                .iter()
                .map(|e| e.to_event())
                .collect();
            Some(ServerMessage::Signals { couple_id, signals })
        }
        ClientMessage::Pong { .. } => None,
    }
}
