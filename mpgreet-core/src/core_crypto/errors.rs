//! Error types for cryptographic operations

use thiserror::Error;

/// Result type for cryptographic operations
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Errors that can occur in cryptographic operations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CryptoError {
    /// Key bytes could not be parsed
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Signature bytes are malformed
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    /// Key derivation failed
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),
}
