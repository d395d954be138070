//! Duet Relay - pairing, signaling and backup server
//!
//! The relay never sees journal content: it matches pairing digests, forwards
//! opaque WebRTC signaling payloads between a couple's devices, and stores
//! client-encrypted backups.

pub mod error;
pub mod http;
pub mod hub;
pub mod mailbox;
pub mod state;
pub mod sweeper;
pub mod tls;
pub mod vault;
pub mod websocket;

pub use error::{ApiError, ApiResult};
pub use http::create_router;
pub use hub::{ConnectionId, HubEvent, PublishReceipt, RelayHub};
pub use mailbox::{SignalEnvelope, SignalMailbox, SignalRequest};
pub use state::AppState;
pub use sweeper::spawn_sweeper;
pub use tls::{cert_fingerprint, generate_self_signed_cert, CertificateManager, ServerCertificate};
pub use vault::{BackupRecord, BackupVault};
