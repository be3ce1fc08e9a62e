//! SHA-256 digests and group key derivation

use super::errors::{CryptoError, CryptoResult};
use hkdf::Hkdf;
use sha2::{Digest as _, Sha256};

/// Length of a SHA-256 digest in bytes
pub const DIGEST_LEN: usize = 32;

/// A SHA-256 digest, used for packet ids and chain hashes
pub type Digest = [u8; DIGEST_LEN];

const GROUP_KEY_INFO: &[u8] = b"mpgreet group key v1";

/// Hash a single byte string
pub fn sha256(data: &[u8]) -> Digest {
    Sha256::digest(data).into()
}

/// Hash a sequence of byte strings, each prefixed by its big-endian u32 length
///
/// The length prefix keeps `["ab", "c"]` and `["a", "bc"]` apart.
pub fn sha256_parts<'a, I>(parts: I) -> Digest
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u32).to_be_bytes());
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Derive symmetric group key material from the raw Diffie-Hellman output
pub fn derive_group_key(raw_secret: &[u8]) -> CryptoResult<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(None, raw_secret);
    let mut okm = [0u8; 32];
    hk.expand(GROUP_KEY_INFO, &mut okm)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(okm)
}
