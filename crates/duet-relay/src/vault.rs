//! Encrypted backup storage
//!
//! Blobs are opaque ciphertext; the vault never decrypts or inspects them.
//! Each store adds a new record keyed by couple and creation time, and
//! retrieval returns the newest. With a backup directory configured, blobs
//! live under `<dir>/<couple hash>/<created ms>-<id>.bin` and the record index
//! is persisted in `<dir>/index.json`.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use duet_auth::device::validate_id;
use duet_core::{Error, RelayConfig, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

const INDEX_FILE: &str = "index.json";

/// One stored backup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    pub id: Uuid,
    pub couple_id: String,
    /// Location of the blob relative to the vault root
    pub object_key: String,
    pub size: usize,
    /// Hex SHA-256 of the ciphertext, for client-side integrity checks
    pub sha256: String,
    pub created_at: DateTime<Utc>,
    /// Opaque client metadata
    #[serde(default)]
    pub meta: Value,
}

impl BackupRecord {
    /// URL-style handle returned to clients
    pub fn object_url(&self) -> String {
        format!("backups/{}", self.object_key)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredIndex {
    /// Records per couple, oldest first
    backups: HashMap<String, Vec<BackupRecord>>,
}

enum Backend {
    Memory(DashMap<String, Bytes>),
    Disk(PathBuf),
}

/// Latest-wins backup store
pub struct BackupVault {
    backend: Backend,
    index: RwLock<StoredIndex>,
    max_bytes: usize,
    retention: usize,
}

impl BackupVault {
    /// Create a vault that keeps blobs in memory
    pub fn in_memory(max_bytes: usize, retention: usize) -> Self {
        Self {
            backend: Backend::Memory(DashMap::new()),
            index: RwLock::new(StoredIndex::default()),
            max_bytes,
            retention: retention.max(1),
        }
    }

    /// Open (or create) a vault rooted at `dir`
    ///
    /// Loads the existing index if present.
    pub async fn open(dir: PathBuf, max_bytes: usize, retention: usize) -> Result<Self> {
        tokio::fs::create_dir_all(&dir).await?;

        let index_path = dir.join(INDEX_FILE);
        let index = match tokio::fs::read_to_string(&index_path).await {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(index) => {
                    info!("Loaded backup index from {:?}", index_path);
                    index
                }
                Err(e) => {
                    warn!("Failed to parse backup index, starting fresh: {}", e);
                    StoredIndex::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No existing backup index, creating new");
                StoredIndex::default()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            backend: Backend::Disk(dir),
            index: RwLock::new(index),
            max_bytes,
            retention: retention.max(1),
        })
    }

    /// Build the vault described by the relay configuration
    pub async fn from_config(config: &RelayConfig) -> Result<Self> {
        match &config.backup_dir {
            Some(dir) => {
                Self::open(dir.clone(), config.max_backup_bytes, config.backup_retention).await
            }
            None => Ok(Self::in_memory(
                config.max_backup_bytes,
                config.backup_retention,
            )),
        }
    }

    /// Largest accepted blob
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Store a new backup for a couple
    pub async fn store(&self, couple_id: &str, blob: Bytes, meta: Value) -> Result<BackupRecord> {
        self.store_at(Utc::now(), couple_id, blob, meta).await
    }

    /// Store as of `now`
    pub async fn store_at(
        &self,
        now: DateTime<Utc>,
        couple_id: &str,
        blob: Bytes,
        meta: Value,
    ) -> Result<BackupRecord> {
        let couple_id = validate_id("coupleId", couple_id)?;
        if blob.is_empty() {
            return Err(Error::validation("Backup blob is empty"));
        }
        if blob.len() > self.max_bytes {
            return Err(Error::PayloadTooLarge {
                size: blob.len(),
                limit: self.max_bytes,
            });
        }

        let id = Uuid::new_v4();
        let record = BackupRecord {
            id,
            object_key: format!(
                "{}/{}-{}.bin",
                couple_dir(&couple_id),
                now.timestamp_millis(),
                id
            ),
            couple_id: couple_id.clone(),
            size: blob.len(),
            sha256: hex::encode(Sha256::digest(&blob)),
            created_at: now,
            meta,
        };

        self.write_blob(&record.object_key, blob).await?;

        // Held until the index is on disk; a failed save is rolled back
        let pruned = {
            let mut index = self.index.write().await;
            let previous = index.backups.get(&couple_id).cloned();
            let records = index.backups.entry(couple_id.clone()).or_default();
            records.push(record.clone());
            records.sort_by_key(|r| r.created_at);
            let excess = records.len().saturating_sub(self.retention);
            let pruned = records.drain(..excess).collect::<Vec<_>>();

            let saved = self.save(&index).await;
            if let Err(e) = saved {
                match previous {
                    Some(records) => index.backups.insert(couple_id.clone(), records),
                    None => index.backups.remove(&couple_id),
                };
                drop(index);
                if let Err(cleanup) = self.delete_blob(&record.object_key).await {
                    warn!("Failed to remove unsaved backup {}: {}", record.id, cleanup);
                }
                return Err(e);
            }
            pruned
        };

        for old in &pruned {
            if let Err(e) = self.delete_blob(&old.object_key).await {
                warn!("Failed to delete pruned backup {}: {}", old.id, e);
            }
        }

        info!(
            "Stored backup {} for couple {} ({} bytes, {} pruned)",
            record.id,
            couple_id,
            record.size,
            pruned.len()
        );
        Ok(record)
    }

    /// Newest backup of a couple with its blob
    pub async fn retrieve_latest(&self, couple_id: &str) -> Result<(BackupRecord, Bytes)> {
        let record = self
            .latest_record(couple_id)
            .await
            .ok_or_else(|| Error::not_found("No backup found"))?;
        let blob = self.read_blob(&record.object_key).await?;
        debug!("Retrieved backup {} for couple {}", record.id, record.couple_id);
        Ok((record, blob))
    }

    /// Newest backup record of a couple, without loading the blob
    pub async fn latest_record(&self, couple_id: &str) -> Option<BackupRecord> {
        let index = self.index.read().await;
        index
            .backups
            .get(couple_id.trim())
            .and_then(|records| records.iter().max_by_key(|r| r.created_at))
            .cloned()
    }

    /// Number of records kept for a couple
    pub async fn record_count(&self, couple_id: &str) -> usize {
        let index = self.index.read().await;
        index
            .backups
            .get(couple_id.trim())
            .map(Vec::len)
            .unwrap_or(0)
    }

    async fn write_blob(&self, key: &str, blob: Bytes) -> Result<()> {
        match &self.backend {
            Backend::Memory(blobs) => {
                blobs.insert(key.to_string(), blob);
            }
            Backend::Disk(root) => {
                let path = root.join(key);
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&path, &blob).await?;
            }
        }
        Ok(())
    }

    async fn read_blob(&self, key: &str) -> Result<Bytes> {
        match &self.backend {
            Backend::Memory(blobs) => blobs
                .get(key)
                .map(|b| b.value().clone())
                .ok_or_else(|| Error::internal(format!("Backup blob {} is missing", key))),
            Backend::Disk(root) => Ok(Bytes::from(tokio::fs::read(root.join(key)).await?)),
        }
    }

    async fn delete_blob(&self, key: &str) -> Result<()> {
        match &self.backend {
            Backend::Memory(blobs) => {
                blobs.remove(key);
            }
            Backend::Disk(root) => tokio::fs::remove_file(root.join(key)).await?,
        }
        Ok(())
    }

    /// Save the index to disk (no-op in memory)
    ///
    /// Callers hold the index write lock.
    async fn save(&self, index: &StoredIndex) -> Result<()> {
        let Backend::Disk(root) = &self.backend else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(index)?;
        write_atomic(&root.join(INDEX_FILE), json.as_bytes()).await?;
        debug!("Saved backup index to {:?}", root);
        Ok(())
    }
}

/// Directory name for a couple; client ids never reach the filesystem
fn couple_dir(couple_id: &str) -> String {
    let digest = hex::encode(Sha256::digest(couple_id.as_bytes()));
    digest[..32].to_string()
}

async fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
    let result = match tokio::fs::write(&tmp, contents).await {
        Ok(()) => tokio::fs::rename(&tmp, path).await,
        Err(e) => Err(e),
    };
    if result.is_err() {
        tokio::fs::remove_file(&tmp).await.ok();
    }
    result
}
