//! The identity-service contract.
//!
//! Authentication itself is owned by an external service; the core only
//! consumes two things from it: the currently signed-in id, and a stream of
//! login/logout transitions.  [`crate::drive`] maps that stream onto the
//! session state machine.

use tokio::sync::mpsc;

use stello_shared::UserId;

/// One login/logout transition, fired once per transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    SignedIn(UserId),
    SignedOut,
}

/// Narrow contract over the external auth collaborator.
pub trait IdentityService: Send + Sync + 'static {
    /// Id of the currently signed-in user, if any.
    fn current_user_id(&self) -> Option<UserId>;

    /// Stream of session transitions.  The service pushes one event per
    /// transition; dropping the sender ends the stream (and the drive
    /// loop).
    fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionEvent>;
}
