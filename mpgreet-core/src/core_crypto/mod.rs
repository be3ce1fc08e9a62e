//! Cryptographic primitives for the greeting protocol
//!
//! Provides the building blocks the key agreement and the authenticated key
//! exchange are assembled from:
//! - Ed25519 signatures for long-term identity keys and per-session keys
//! - X25519 scalar multiplication for the group Diffie-Hellman chain
//! - SHA-256 digests for packet ids, session ids and chain hashes
//! - HKDF-SHA256 to turn the raw group secret into usable key material

mod dh;
mod errors;
mod hash;
mod signing;

pub use dh::{scalar_mult, DhPoint, DhScalar};
pub use errors::{CryptoError, CryptoResult};
pub use hash::{derive_group_key, sha256, sha256_parts, Digest, DIGEST_LEN};
pub use signing::{GreetSigningKey, GreetVerifyingKey, SIGNATURE_LEN};
