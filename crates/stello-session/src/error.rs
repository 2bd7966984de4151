use stello_shared::UserId;
use stello_store::StoreError;
use thiserror::Error;

/// Errors produced by the session layer.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The operation requires an online session.
    #[error("not signed in")]
    NotSignedIn,

    /// A session is already online; sign out first.
    #[error("already signed in")]
    AlreadySignedIn,

    /// The operation needs an open conversation.
    #[error("no active conversation")]
    NoActiveConversation,

    /// The session went offline; offline is terminal for a session.
    #[error("session is over")]
    SessionClosed,

    /// The auth service vouched for an id the registry does not know.
    #[error("unknown user: {0}")]
    UnknownUser(UserId),

    /// Store-layer failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}
