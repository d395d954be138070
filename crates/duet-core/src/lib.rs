//! Duet Core - Shared types and protocol definitions
//!
//! This crate provides the error taxonomy, relay configuration and the
//! live-channel wire protocol used across all Duet components.

pub mod config;
pub mod error;
pub mod protocol;

pub use config::RelayConfig;
pub use error::{Error, ErrorKind, Result};
pub use protocol::{ClientMessage, ServerMessage, SignalEvent};
