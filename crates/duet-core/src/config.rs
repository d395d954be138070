//! Configuration types for Duet

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Pairing requests stay confirmable for 24 hours
pub const DEFAULT_PAIRING_TTL_SECS: u64 = 24 * 60 * 60;

/// Signals are latency-sensitive; stale ones are useless after 5 minutes
pub const DEFAULT_SIGNAL_TTL_SECS: u64 = 5 * 60;

/// Upper bound for lifetimes and intervals (ten years)
pub const MAX_DURATION_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Backup blob ceiling (100 MiB)
pub const DEFAULT_MAX_BACKUP_BYTES: usize = 100 * 1024 * 1024;

/// Where backups are written when a data directory is available
///
/// `~/.local/share/duet/backups` on Linux.
pub fn default_backup_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|d| d.join("duet").join("backups"))
}

/// Main configuration for the Duet relay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Address the HTTP/WebSocket server listens on
    pub bind_addr: SocketAddr,
    /// Allowed CORS origins (empty means any origin)
    pub allowed_origins: Vec<String>,
    /// Lifetime of a pairing request in seconds
    pub pairing_ttl_secs: u64,
    /// Lifetime of a queued signal envelope in seconds
    pub signal_ttl_secs: u64,
    /// Largest accepted signaling payload (serialized JSON bytes)
    pub max_signal_bytes: usize,
    /// Queued envelopes kept per recipient before the oldest is evicted
    pub max_queue_per_recipient: usize,
    /// Outbound queue depth of each live connection
    pub subscriber_queue: usize,
    /// Largest accepted backup blob in bytes
    pub max_backup_bytes: usize,
    /// Backups kept per couple; older ones are pruned on store
    pub backup_retention: usize,
    /// Directory for backup blobs; `None` keeps them in memory
    pub backup_dir: Option<PathBuf>,
    /// Interval of the expiry sweeper in seconds
    pub sweep_interval_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            allowed_origins: Vec::new(),
            pairing_ttl_secs: DEFAULT_PAIRING_TTL_SECS,
            signal_ttl_secs: DEFAULT_SIGNAL_TTL_SECS,
            max_signal_bytes: 64 * 1024,
            max_queue_per_recipient: 256,
            subscriber_queue: 64,
            max_backup_bytes: DEFAULT_MAX_BACKUP_BYTES,
            backup_retention: 5,
            backup_dir: None,
            sweep_interval_secs: 60,
        }
    }
}

impl RelayConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder pattern: set bind address
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Builder pattern: set port, keeping the bind IP
    pub fn with_port(mut self, port: u16) -> Self {
        self.bind_addr.set_port(port);
        self
    }

    /// Builder pattern: set allowed origins
    pub fn with_allowed_origins(mut self, origins: Vec<String>) -> Self {
        self.allowed_origins = origins;
        self
    }

    /// Builder pattern: set pairing TTL
    pub fn with_pairing_ttl_secs(mut self, secs: u64) -> Self {
        self.pairing_ttl_secs = secs;
        self
    }

    /// Builder pattern: set signal TTL
    pub fn with_signal_ttl_secs(mut self, secs: u64) -> Self {
        self.signal_ttl_secs = secs;
        self
    }

    /// Builder pattern: set backup size ceiling
    pub fn with_max_backup_bytes(mut self, bytes: usize) -> Self {
        self.max_backup_bytes = bytes;
        self
    }

    /// Builder pattern: set backup retention
    pub fn with_backup_retention(mut self, keep: usize) -> Self {
        self.backup_retention = keep;
        self
    }

    /// Builder pattern: set backup directory
    pub fn with_backup_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.backup_dir = dir;
        self
    }

    /// Builder pattern: set sweep interval
    pub fn with_sweep_interval_secs(mut self, secs: u64) -> Self {
        self.sweep_interval_secs = secs;
        self
    }

    /// Parse a comma separated origin list (as found in `ALLOWED_ORIGINS`)
    pub fn parse_origins(raw: &str) -> Vec<String> {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty() && *s != "*")
            .map(str::to_string)
            .collect()
    }

    /// Reject settings the relay cannot run with
    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("pairing_ttl_secs", self.pairing_ttl_secs),
            ("signal_ttl_secs", self.signal_ttl_secs),
            ("sweep_interval_secs", self.sweep_interval_secs),
        ];
        for (name, secs) in durations {
            if secs == 0 {
                return Err(Error::Validation(format!("{} must be greater than zero", name)));
            }
            if secs > MAX_DURATION_SECS {
                return Err(Error::Validation(format!(
                    "{} must be at most {} seconds",
                    name, MAX_DURATION_SECS
                )));
            }
        }

        let sizes = [
            ("max_signal_bytes", self.max_signal_bytes),
            ("max_queue_per_recipient", self.max_queue_per_recipient),
            ("subscriber_queue", self.subscriber_queue),
            ("max_backup_bytes", self.max_backup_bytes),
            ("backup_retention", self.backup_retention),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(Error::Validation(format!("{} must be greater than zero", name)));
            }
        }
        Ok(())
    }
}
