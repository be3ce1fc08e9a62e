//! Codec error types

use thiserror::Error;

pub type CodecResult<T> = Result<T, CodecError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Truncated record: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("Unexpected record type: expected {expected:#06x}, got {actual:#06x}")]
    UnexpectedType { expected: u16, actual: u16 },

    #[error("Missing record of type {0:#06x}")]
    Missing(u16),

    #[error("Value too large: {0} bytes")]
    ValueTooLarge(usize),

    #[error("Invalid value for record type {tlv_type:#06x}: {reason}")]
    InvalidValue { tlv_type: u16, reason: String },
}
