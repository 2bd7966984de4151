use thiserror::Error;

/// Errors produced when validating participant identities.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// A conversation needs two distinct participants.
    #[error("participant ids must differ")]
    SameParticipant,

    /// The id is empty or contains the key separator.
    #[error("invalid user id: {0:?}")]
    InvalidUserId(String),

    /// The string is not a well-formed conversation key.
    #[error("invalid conversation key: {0:?}")]
    InvalidKey(String),
}
