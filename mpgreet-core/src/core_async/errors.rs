//! Error types for the async primitives

use thiserror::Error;

pub type AsyncResult<T> = Result<T, AsyncError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AsyncError {
    /// Operation not allowed in the current state; a caller bug
    #[error("Cannot {operation} a monitor that is {state}")]
    InvalidState { operation: &'static str, state: &'static str },

    /// [`TokioTimer`](super::TokioTimer) built outside a tokio runtime
    #[error("No tokio runtime to schedule on: {0}")]
    NoRuntime(String),
}
