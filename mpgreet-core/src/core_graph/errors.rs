//! Error types for graph traversal and merging

use thiserror::Error;

pub type GraphResult<T> = Result<T, GraphError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    /// A directed cycle is reachable from the starting nodes
    #[error("Cycle detected: {pending} nodes could not be ordered")]
    Cycle { pending: usize },
}
