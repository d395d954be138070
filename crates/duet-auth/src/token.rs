//! One-time pairing secrets and their digests
//!
//! Secrets are 256 bits from the operating system CSPRNG, hex encoded so the
//! web client's WebCrypto SHA-256 digest of the same string matches ours.

use duet_core::{Error, Result};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Secret size in bytes (256 bits)
pub const SECRET_BYTES: usize = 32;

/// Hex length of a SHA-256 digest
const DIGEST_HEX_LEN: usize = 64;

/// A freshly minted pairing secret
///
/// Lives on the initiating device and inside the pairing code only; the
/// relay sees nothing but its digest.
#[derive(Clone, PartialEq, Eq)]
pub struct PairingSecret(String);

impl PairingSecret {
    /// Access the hex encoded secret
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for PairingSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PairingSecret(<redacted>)")
    }
}

/// Lowercase hex SHA-256 digest of a pairing secret
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenDigest(String);

impl TokenDigest {
    /// Parse a digest supplied by a client
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.len() != DIGEST_HEX_LEN || !raw.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::validation(
                "Token digest must be a 64 character hex SHA-256 digest",
            ));
        }
        Ok(Self(raw.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TokenDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Generate a secure random pairing secret
pub fn mint_token() -> Result<PairingSecret> {
    let mut bytes = [0u8; SECRET_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| Error::Entropy(e.to_string()))?;
    Ok(PairingSecret(hex::encode(bytes)))
}

/// Hash a secret for storage
pub fn hash_token(secret: &str) -> TokenDigest {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    TokenDigest(hex::encode(hasher.finalize()))
}

/// Check a presented secret against a stored digest
pub fn verify_token(secret: &str, digest: &TokenDigest) -> bool {
    digests_match(&hash_token(secret), digest)
}

/// Compare two digests without leaking the position of the first mismatch
pub fn digests_match(a: &TokenDigest, b: &TokenDigest) -> bool {
    let (a, b) = (a.0.as_bytes(), b.0.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Make sure the entropy source works before accepting traffic
pub fn entropy_self_test() -> Result<()> {
    let first = mint_token()?;
    let second = mint_token()?;
    if first == second {
        return Err(Error::Entropy("entropy source returned repeated output".into()));
    }
    Ok(())
}
