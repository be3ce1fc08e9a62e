//! Ed25519 signing and verifying keys
//!
//! The same key types serve both as long-term identity keys (looked up via
//! the public key directory) and as the ephemeral per-session keys the
//! authenticated key exchange publishes.

use super::errors::{CryptoError, CryptoResult};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use std::fmt;
use zeroize::ZeroizeOnDrop;

/// Length of an Ed25519 signature in bytes
pub const SIGNATURE_LEN: usize = 64;

/// Ed25519 signing key (secret key)
///
/// Implements `ZeroizeOnDrop` so the secret is erased when dropped.
#[derive(Clone, ZeroizeOnDrop)]
pub struct GreetSigningKey {
    inner: SigningKey,
}

impl GreetSigningKey {
    /// Generate a new random signing key
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let mut seed = [0u8; 32];
        rng.fill_bytes(&mut seed);

        Self { inner: SigningKey::from_bytes(&seed) }
    }

    /// Create from raw 32-byte seed
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self { inner: SigningKey::from_bytes(bytes) }
    }

    /// Create from a byte slice, which must be exactly 32 bytes
    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        let seed: [u8; 32] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!("expected 32 secret key bytes, got {}", bytes.len()))
        })?;
        Ok(Self::from_bytes(&seed))
    }

    /// Get the corresponding verifying (public) key
    pub fn verifying_key(&self) -> GreetVerifyingKey {
        GreetVerifyingKey { inner: self.inner.verifying_key() }
    }

    /// Sign data and return signature bytes
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        self.inner.sign(data).to_bytes().to_vec()
    }

    /// Export as bytes (WARNING: exposes secret key!)
    pub fn to_bytes(&self) -> [u8; 32] {
        self.inner.to_bytes()
    }
}

impl fmt::Debug for GreetSigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GreetSigningKey")
            .field("public", &self.verifying_key())
            .finish_non_exhaustive()
    }
}

/// Ed25519 verifying key (public key)
#[derive(Clone, PartialEq, Eq)]
pub struct GreetVerifyingKey {
    inner: VerifyingKey,
}

impl GreetVerifyingKey {
    /// Create from raw 32-byte public key
    pub fn from_bytes(bytes: &[u8; 32]) -> CryptoResult<Self> {
        let inner = VerifyingKey::from_bytes(bytes)
            .map_err(|e| CryptoError::InvalidKey(format!("Invalid Ed25519 public key: {}", e)))?;

        Ok(Self { inner })
    }

    /// Create from a byte slice, which must be exactly 32 bytes
    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        let raw: [u8; 32] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!("expected 32 public key bytes, got {}", bytes.len()))
        })?;
        Self::from_bytes(&raw)
    }

    /// Verify a signature on data
    ///
    /// Returns `Ok(false)` for a well-formed signature that does not match.
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> CryptoResult<bool> {
        let sig_array: [u8; SIGNATURE_LEN] = signature.try_into().map_err(|_| {
            CryptoError::InvalidSignature(format!(
                "expected {} signature bytes, got {}",
                SIGNATURE_LEN,
                signature.len()
            ))
        })?;

        let signature = Signature::from_bytes(&sig_array);
        Ok(self.inner.verify(data, &signature).is_ok())
    }

    /// Export as bytes
    pub fn to_bytes(&self) -> [u8; 32] {
        self.inner.to_bytes()
    }
}

impl fmt::Debug for GreetVerifyingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GreetVerifyingKey({})", hex::encode(self.to_bytes()))
    }
}
