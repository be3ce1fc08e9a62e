//! X25519 scalar multiplication for the group Diffie-Hellman chain

use super::errors::{CryptoError, CryptoResult};
use rand::RngCore;
use std::fmt;
use x25519_dalek::{x25519, X25519_BASEPOINT_BYTES};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A curve point in Montgomery u-coordinate form
pub type DhPoint = [u8; 32];

/// A private X25519 scalar contributed by one member
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DhScalar([u8; 32]);

impl DhScalar {
    /// Generate a fresh random scalar
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        let raw: [u8; 32] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!("expected 32 scalar bytes, got {}", bytes.len()))
        })?;
        Ok(Self(raw))
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0
    }
}

impl fmt::Debug for DhScalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DhScalar(..)")
    }
}

/// Multiply `point` by `scalar`; `None` stands for the curve base point.
pub fn scalar_mult(scalar: &DhScalar, point: Option<&DhPoint>) -> DhPoint {
    x25519(scalar.0, point.copied().unwrap_or(X25519_BASEPOINT_BYTES))
}
