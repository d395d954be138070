//! Duet Auth - Device pairing for couples
//!
//! Provides one-time pairing secrets, the server-side pairing registry and
//! the transportable pairing code carried by QR code or manual entry.
//!
//! # Pairing Flow
//!
//! 1. Device A calls [`mint_token`] and keeps the secret locally
//! 2. Device A embeds the secret in a code via [`codec::encode`] and shows it
//! 3. Device A registers [`hash_token`] of the secret with `POST /api/pair/initiate`
//! 4. Device B decodes the code and calls `POST /api/pair/confirm`
//! 5. On match the registry consumes the request; any replay is `NotFound`
//!
//! # Example
//!
//! ```no_run
//! use duet_auth::{hash_token, mint_token, PairingRegistry, TokenProof};
//!
//! fn example() -> duet_core::Result<()> {
//!     let registry = PairingRegistry::new();
//!     let secret = mint_token()?;
//!
//!     registry.initiate("c1", hash_token(secret.expose()), None)?;
//!     registry.confirm("c1", &TokenProof::Secret(secret.expose().to_string()))?;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod device;
pub mod pairing;
pub mod token;

pub use codec::{PairingPayload, DEFAULT_COVER_TITLE};
pub use device::{DeviceId, DeviceInfo, DeviceType};
pub use pairing::{PairingRegistry, PairingRequest, PairingStatus, TokenProof};
pub use token::{
    digests_match, entropy_self_test, hash_token, mint_token, verify_token, PairingSecret,
    TokenDigest,
};
