//! Error types for greeting operations

use crate::core_codec::CodecError;
use crate::core_crypto::CryptoError;
use thiserror::Error;

/// Result type for greeting operations
pub type GreetResult<T> = Result<T, GreetError>;

/// Errors that can occur while running a greeting
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GreetError {
    /// Packet could not be decoded
    #[error("decode failed: {0}")]
    Decode(String),

    /// Packet envelope carries a protocol version we do not speak
    #[error("decode failed: expected PROTOCOL_VERSION {expected:#04x}, got {actual:#04x}")]
    ProtocolVersion { expected: u8, actual: u8 },

    /// Packet signature did not verify against the sender's directory key
    #[error("Signature verification failed for sender {0}")]
    SignatureInvalid(String),

    /// A member's session signature did not verify
    #[error("Session authentication by member {0} failed.")]
    SessionAuthFailed(String),

    /// No public key is known for this member
    #[error("No public key known for member {0}")]
    UnknownMember(String),

    /// Operation called with bad arguments
    #[error("{0}")]
    Precondition(String),

    /// Operation called in a state that does not allow it
    #[error("Invalid state for {operation}: {state}")]
    InvalidState { operation: &'static str, state: String },

    /// Bit transition produced a greet type that does not exist
    #[error("Illegal message type: {0:#05x}")]
    IllegalGreetType(u16),

    /// Unknown greet type number
    #[error("Unknown greet type: {0:#05x}")]
    UnknownGreetType(u16),

    /// Membership change mixes joins and departures
    #[error("Cannot both exclude and join members.")]
    MixedMembershipChange,

    /// The operation was aborted
    #[error("OperationFailed: {0}")]
    OperationFailed(String),

    /// This member was excluded from the session
    #[error("Excluded from session by {0}")]
    Excluded(String),

    /// The operation has not completed yet
    #[error("Operation not finished")]
    NotFinished,

    /// Sub-protocol outputs disagree; indicates a bug, never user input
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}
