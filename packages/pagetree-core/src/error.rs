use std::time::Duration;

use thiserror::Error;

use crate::ids::NodeId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("node {0} not found")]
    NotFound(NodeId),
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error("unbalanced publication scope: exit without a matching enter")]
    UnbalancedScope,
    #[error("could not acquire the tree lock within {0:?}")]
    ConcurrencyTimeout(Duration),
    #[error("cannot move node {node} beneath {target}, which is inside its own branch")]
    CycleDetected { node: NodeId, target: NodeId },
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    /// Whether the caller may retry the whole operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ConcurrencyTimeout(_))
    }
}
