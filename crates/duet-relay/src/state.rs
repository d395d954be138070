//! Shared application state

use crate::hub::RelayHub;
use crate::mailbox::SignalMailbox;
use crate::vault::BackupVault;
use duet_auth::PairingRegistry;
use duet_core::{RelayConfig, Result};
use std::sync::Arc;
use tracing::info;

/// State injected into every handler
pub struct AppState {
    /// Configuration
    pub config: RelayConfig,
    /// Outstanding pairing requests
    pub registry: Arc<PairingRegistry>,
    /// Store-and-forward signal queues
    pub mailbox: Arc<SignalMailbox>,
    /// Live channel hub, backed by `mailbox`
    pub hub: Arc<RelayHub>,
    /// Encrypted backup storage
    pub vault: Arc<BackupVault>,
    /// Certificate fingerprint when serving over TLS
    pub cert_fingerprint: Option<String>,
}

impl AppState {
    /// Assemble the relay components from configuration
    pub async fn from_config(config: RelayConfig) -> Result<Self> {
        config.validate()?;

        let vault = BackupVault::from_config(&config).await?;
        let registry = PairingRegistry::with_ttl_secs(config.pairing_ttl_secs);
        let mailbox = Arc::new(SignalMailbox::new(&config));
        let hub = RelayHub::new(mailbox.clone(), config.subscriber_queue);

        match &config.backup_dir {
            Some(dir) => info!("Backups stored in {:?}", dir),
            None => info!("Backups kept in memory"),
        }

        Ok(Self {
            registry: Arc::new(registry),
            mailbox,
            hub: Arc::new(hub),
            vault: Arc::new(vault),
            cert_fingerprint: None,
            config,
        })
    }

    /// Record the fingerprint of the certificate being served
    pub fn with_cert_fingerprint(mut self, fingerprint: Option<String>) -> Self {
        self.cert_fingerprint = fingerprint;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_components_share_mailbox() {
        let state = AppState::from_config(RelayConfig::default()).await.unwrap();
        assert!(Arc::ptr_eq(state.hub.mailbox(), &state.mailbox));
        assert!(state.registry.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = RelayConfig::default().with_signal_ttl_secs(0);
        assert!(AppState::from_config(config).await.is_err());
    }

    #[tokio::test]
    async fn test_disk_vault() {
        let dir = tempdir().unwrap();
        let config = RelayConfig::default().with_backup_dir(Some(dir.path().join("backups")));
        let state = AppState::from_config(config).await.unwrap();
        assert!(state.vault.latest_record("c1").await.is_none());
        assert!(dir.path().join("backups").exists());
    }
}
