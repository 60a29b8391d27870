use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Catch-all for custom assignor implementations.
    #[error("{0}")]
    Custom(String),
    #[error("invalid consumer protocol version: {0}")]
    InvalidVersion(i16),
    #[error("partition assignor already registered: {0}")]
    DuplicateAssignor(String),
    #[error("partition assignor not available: {0}")]
    AssignorNotAvailable(String),
    #[error("partition assignment failed: {0}")]
    AssignmentFailed(String),
    /// Non-fatal: a member whose metadata cannot be decoded degrades to an
    /// empty subscription, the rebalance itself carries on.
    #[error("unreadable member metadata: {0}")]
    UnreadableMetadata(String),
}
