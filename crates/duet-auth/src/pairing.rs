//! Pairing registry with one-time, time-bounded requests
//!
//! Implements the relay side of the pairing flow:
//! 1. The initiating device registers the digest of its secret for a couple
//! 2. The request stays confirmable for 24 hours
//! 3. The joining device presents the secret (or its digest)
//! 4. A matching confirm consumes the request; every later attempt is `NotFound`
//!
//! Requests are keyed by couple id in a sharded map, so initiate-if-absent and
//! confirm-then-delete are atomic per couple and unrelated couples never
//! contend on the same lock.

use crate::device::{validate_id, DeviceInfo};
use crate::token::{digests_match, hash_token, TokenDigest};
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use duet_core::config::DEFAULT_PAIRING_TTL_SECS;
use duet_core::{Error, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

/// An outstanding pairing attempt
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingRequest {
    pub couple_id: String,
    /// Digest of the pairing secret; the secret itself never reaches the relay
    #[serde(skip_serializing)]
    pub token_digest: TokenDigest,
    /// Device that initiated the pairing, if it described itself
    pub initiator: Option<DeviceInfo>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PairingRequest {
    fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    fn matches(&self, proof: &TokenProof) -> bool {
        match proof {
            TokenProof::Digest(digest) => digests_match(&self.token_digest, digest),
            TokenProof::Secret(secret) => digests_match(&self.token_digest, &hash_token(secret)),
        }
    }
}

/// What the joining device presents when confirming
#[derive(Clone)]
pub enum TokenProof {
    /// SHA-256 digest of the secret, as sent by existing web clients
    Digest(TokenDigest),
    /// The secret itself
    Secret(String),
}

impl std::fmt::Debug for TokenProof {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenProof::Digest(d) => f.debug_tuple("Digest").field(d).finish(),
            TokenProof::Secret(_) => f.write_str("Secret(<redacted>)"),
        }
    }
}

/// Public view of a live pairing request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingStatus {
    pub couple_id: String,
    pub expires_at: DateTime<Utc>,
    /// Seconds until the request expires
    pub expires_in: i64,
}

/// Tracks outstanding pairing requests by couple id
pub struct PairingRegistry {
    requests: DashMap<String, PairingRequest>,
    ttl: Duration,
}

impl Default for PairingRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PairingRegistry {
    /// Create a registry with the default 24 hour request lifetime
    pub fn new() -> Self {
        Self::with_ttl_secs(DEFAULT_PAIRING_TTL_SECS)
    }

    /// Create a registry with a custom request lifetime
    pub fn with_ttl_secs(ttl_secs: u64) -> Self {
        Self {
            requests: DashMap::new(),
            ttl: Duration::seconds(ttl_secs as i64),
        }
    }

    /// Register a pairing request for a couple
    pub fn initiate(
        &self,
        couple_id: &str,
        digest: TokenDigest,
        initiator: Option<DeviceInfo>,
    ) -> Result<PairingRequest> {
        self.initiate_at(Utc::now(), couple_id, digest, initiator)
    }

    /// Register a pairing request as of `now`
    ///
    /// First write wins: while a live request exists for the couple, further
    /// attempts fail with `Conflict`. An expired request is replaced.
    pub fn initiate_at(
        &self,
        now: DateTime<Utc>,
        couple_id: &str,
        digest: TokenDigest,
        initiator: Option<DeviceInfo>,
    ) -> Result<PairingRequest> {
        let couple_id = validate_id("coupleId", couple_id)?;
        let request = PairingRequest {
            couple_id: couple_id.clone(),
            token_digest: digest,
            initiator,
            created_at: now,
            expires_at: now + self.ttl,
        };

        match self.requests.entry(couple_id) {
            Entry::Occupied(mut existing) => {
                if !existing.get().is_expired_at(now) {
                    warn!(
                        "Rejected pairing initiate for couple {}: request already pending",
                        existing.key()
                    );
                    return Err(Error::conflict(
                        "A pairing request is already pending for this couple",
                    ));
                }
                debug!("Replacing expired pairing request for couple {}", existing.key());
                existing.insert(request.clone());
            }
            Entry::Vacant(slot) => {
                slot.insert(request.clone());
            }
        }

        info!(
            "Pairing initiated for couple {} (expires {})",
            request.couple_id, request.expires_at
        );
        Ok(request)
    }

    /// Confirm and consume the pairing request for a couple
    pub fn confirm(&self, couple_id: &str, proof: &TokenProof) -> Result<PairingRequest> {
        self.confirm_at(Utc::now(), couple_id, proof)
    }

    /// Confirm as of `now`
    ///
    /// Absent, expired and non-matching requests are all reported as
    /// `NotFound` so a caller cannot tell which case applies.
    pub fn confirm_at(
        &self,
        now: DateTime<Utc>,
        couple_id: &str,
        proof: &TokenProof,
    ) -> Result<PairingRequest> {
        let couple_id = validate_id("coupleId", couple_id)?;

        if let Some((_, request)) = self
            .requests
            .remove_if(&couple_id, |_, r| !r.is_expired_at(now) && r.matches(proof))
        {
            info!("Pairing confirmed for couple {}", couple_id);
            return Ok(request);
        }

        // Expired entries are dead weight; drop them while we are here
        if self
            .requests
            .remove_if(&couple_id, |_, r| r.is_expired_at(now))
            .is_some()
        {
            debug!("Removed expired pairing request for couple {}", couple_id);
        }

        warn!("Pairing confirm failed for couple {}", couple_id);
        Err(Error::not_found("Invalid or expired pairing token"))
    }

    /// Status of the live request for a couple, if any
    pub fn status(&self, couple_id: &str) -> Option<PairingStatus> {
        self.status_at(Utc::now(), couple_id)
    }

    /// Status as of `now`
    pub fn status_at(&self, now: DateTime<Utc>, couple_id: &str) -> Option<PairingStatus> {
        let request = self.requests.get(couple_id.trim())?;
        if request.is_expired_at(now) {
            return None;
        }
        Some(PairingStatus {
            couple_id: request.couple_id.clone(),
            expires_at: request.expires_at,
            expires_in: (request.expires_at - now).num_seconds().max(0),
        })
    }

    /// Remove expired requests, returning how many were dropped
    pub fn sweep(&self) -> usize {
        self.sweep_at(Utc::now())
    }

    /// Sweep as of `now`
    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let before = self.requests.len();
        self.requests.retain(|_, r| !r.is_expired_at(now));
        before.saturating_sub(self.requests.len())
    }

    /// Number of stored requests, including expired ones not yet swept
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::mint_token;
    use std::sync::Arc;

    fn secret_and_digest() -> (String, TokenDigest) {
        let secret = mint_token().unwrap().expose().to_string();
        let digest = hash_token(&secret);
        (secret, digest)
    }

    #[test]
    fn test_pairing_flow() {
        let registry = PairingRegistry::new();
        let (secret, h1) = secret_and_digest();

        let request = registry.initiate("c1", h1, None).unwrap();
        assert_eq!(request.couple_id, "c1");
        assert_eq!(request.expires_at - request.created_at, Duration::hours(24));

        let proof = TokenProof::Secret(secret);
        assert!(registry.confirm("c1", &proof).is_ok());
        assert!(matches!(
            registry.confirm("c1", &proof),
            Err(Error::NotFound(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_confirm_with_digest() {
        let registry = PairingRegistry::new();
        let (_, digest) = secret_and_digest();
        registry.initiate("c1", digest.clone(), None).unwrap();

        let proof = TokenProof::Digest(digest);
        assert!(registry.confirm("c1", &proof).is_ok());
        assert!(matches!(
            registry.confirm("c1", &proof),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_wrong_token_keeps_request() {
        let registry = PairingRegistry::new();
        let (secret, digest) = secret_and_digest();
        registry.initiate("c1", digest, None).unwrap();

        let wrong = TokenProof::Secret("not-the-secret".to_string());
        assert!(matches!(
            registry.confirm("c1", &wrong),
            Err(Error::NotFound(_))
        ));
        assert!(registry.confirm("c1", &TokenProof::Secret(secret)).is_ok());
    }

    #[test]
    fn test_second_initiate_conflicts() {
        let registry = PairingRegistry::new();
        let (_, first) = secret_and_digest();
        let (_, second) = secret_and_digest();

        registry.initiate("c1", first, None).unwrap();
        assert!(matches!(
            registry.initiate("c1", second, None),
            Err(Error::Conflict(_))
        ));
        // Unrelated couples are unaffected
        let (_, other) = secret_and_digest();
        assert!(registry.initiate("c2", other, None).is_ok());
    }

    #[test]
    fn test_expiry_boundary() {
        let registry = PairingRegistry::new();
        let t = Utc::now();
        let (secret, digest) = secret_and_digest();
        let proof = TokenProof::Secret(secret);

        registry.initiate_at(t, "c1", digest.clone(), None).unwrap();
        let almost = t + Duration::hours(23) + Duration::minutes(59);
        assert!(registry.status_at(almost, "c1").is_some());
        assert!(registry.confirm_at(almost, "c1", &proof).is_ok());

        registry.initiate_at(t, "c1", digest, None).unwrap();
        let late = t + Duration::hours(24) + Duration::minutes(1);
        assert!(registry.status_at(late, "c1").is_none());
        assert!(matches!(
            registry.confirm_at(late, "c1", &proof),
            Err(Error::NotFound(_))
        ));
        // Lazily removed by the failed confirm
        assert!(registry.is_empty());
    }

    #[test]
    fn test_expired_request_is_replaced() {
        let registry = PairingRegistry::new();
        let t = Utc::now();
        let (_, old) = secret_and_digest();
        let (secret, new) = secret_and_digest();

        registry.initiate_at(t, "c1", old, None).unwrap();
        let later = t + Duration::hours(25);
        registry.initiate_at(later, "c1", new, None).unwrap();
        assert!(registry
            .confirm_at(later, "c1", &TokenProof::Secret(secret))
            .is_ok());
    }

    #[test]
    fn test_sweep() {
        let registry = PairingRegistry::with_ttl_secs(60);
        let t = Utc::now();
        registry
            .initiate_at(t, "c1", secret_and_digest().1, None)
            .unwrap();
        registry
            .initiate_at(t + Duration::seconds(30), "c2", secret_and_digest().1, None)
            .unwrap();

        assert_eq!(registry.sweep_at(t + Duration::seconds(61)), 1);
        assert_eq!(registry.len(), 1);
        assert!(registry.status_at(t + Duration::seconds(61), "c2").is_some());
    }

    #[test]
    fn test_missing_couple_id() {
        let registry = PairingRegistry::new();
        assert!(matches!(
            registry.initiate("  ", secret_and_digest().1, None),
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_confirms_have_one_winner() {
        let registry = Arc::new(PairingRegistry::new());
        let (secret, digest) = secret_and_digest();
        registry.initiate("c1", digest, None).unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            let proof = TokenProof::Secret(secret.clone());
            handles.push(tokio::spawn(async move {
                registry.confirm("c1", &proof).is_ok()
            }));
        }

        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap() {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_initiates_have_one_winner() {
        let registry = Arc::new(PairingRegistry::new());

        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            let digest = secret_and_digest().1;
            handles.push(tokio::spawn(async move {
                registry.initiate("c1", digest, None)
            }));
        }

        let mut successes = 0;
        let mut conflicts = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => successes += 1,
                Err(Error::Conflict(_)) => conflicts += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(successes, 1);
        assert_eq!(conflicts, 15);
    }
}
