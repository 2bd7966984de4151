//! # stello-session
//!
//! Session lifecycle for the Stelloscope messaging core: the narrow
//! identity-service contract, the per-session state machine, and ownership
//! of the single active conversation subscription.
//!
//! The session context replaces what a presentation layer would otherwise
//! keep as global mutable state (current user, current partner, active
//! listener): all of it lives in one [`SessionContext`] that cancels the
//! previous subscription before establishing the next.

pub mod identity;
pub mod session;

mod error;

pub use error::SessionError;
pub use identity::{IdentityService, SessionEvent};
pub use session::{drive, SessionContext, SessionState};
