//! # Identity and Keypair Primitives
//!
//! This module defines the identity types used throughout Lattica:
//!
//! - [`Keypair`]: Ed25519 signing keypair (secret + public key)
//! - [`Identity`]: 32-byte public key serving as a node's unique identifier
//!
//! ## Identity Model
//!
//! Lattica uses a simple identity model: **Identity = Ed25519 Public Key**.
//! Possession of the matching private key proves identity; no external CA
//! is involved. An [`Identity`] alone can verify signatures, a [`Keypair`]
//! can additionally produce them. The all-zero value is reserved as the
//! "no identity" marker ([`Identity::ZERO`]).
//!
//! ## Security Invariants
//!
//! - `Identity::from_bytes(bytes).as_bytes() == bytes` (round-trip preservation)
//! - Signature verification fails for identities that are not valid Ed25519 points
//! - Identities are never mutated after creation

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use std::time::{SystemTime, UNIX_EPOCH};

/// Byte length of an identity (Ed25519 public key).
pub const IDENTITY_LEN: usize = 32;

/// Byte length of an Ed25519 signature.
pub const SIGNATURE_LEN: usize = 64;

/// Returns current time as milliseconds since Unix epoch.
#[inline]
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Returns current time as seconds since Unix epoch.
/// Used for certificate expiry checks (seconds-resolution timestamps).
#[inline]
pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn identity(&self) -> Identity {
        Identity::from_bytes(self.public_key_bytes())
    }

    /// Sign a message, returning the raw 64-byte signature.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing_key.sign(message).to_bytes()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("identity", &self.identity().short())
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Identity([u8; IDENTITY_LEN]);

impl Identity {
    /// The "no identity" marker. Never a usable public key.
    pub const ZERO: Identity = Identity([0u8; IDENTITY_LEN]);

    #[inline]
    pub fn from_bytes(bytes: [u8; IDENTITY_LEN]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; IDENTITY_LEN] {
        &self.0
    }

    /// True if this is the "no identity" marker.
    #[inline]
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != IDENTITY_LEN {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; IDENTITY_LEN];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Truncated hex form (first 8 bytes), used in log output.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }

    /// Verify an Ed25519 signature over `message` against this public key.
    ///
    /// Returns `false` for invalid signatures and for identities that are
    /// not valid curve points (including [`Identity::ZERO`]).
    pub fn verify(&self, message: &[u8], signature: &[u8; SIGNATURE_LEN]) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.0) else {
            return false;
        };
        let signature = Signature::from_bytes(signature);
        key.verify(message, &signature).is_ok()
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity({}..)", self.short())
    }
}

impl From<[u8; IDENTITY_LEN]> for Identity {
    fn from(bytes: [u8; IDENTITY_LEN]) -> Self {
        Self::from_bytes(bytes)
    }
}
