use stello_shared::{IdentityError, Role};
use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Bad identity pair or otherwise malformed argument.  Rejected before
    /// any backend call.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Message text trimmed to the empty string.
    #[error("message text is empty")]
    EmptyMessage,

    /// The operation requires a doctor or patient viewer.
    #[error("invalid role for this operation: {0}")]
    InvalidRole(Role),

    /// A query expected exactly one document but found none.
    #[error("record not found")]
    NotFound,

    /// Registration with an email that is already taken.
    #[error("a user with email {0:?} already exists")]
    DuplicateEmail(String),

    /// Transient backend failure.  Callers may retry; the store never does.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The live change feed for a subscription was dropped.  The caller must
    /// resubscribe explicitly.
    #[error("subscription terminated")]
    SubscriptionTerminated,

    /// Document (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<IdentityError> for StoreError {
    fn from(err: IdentityError) -> Self {
        StoreError::InvalidArgument(err.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
