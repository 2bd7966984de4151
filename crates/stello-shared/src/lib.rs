//! # stello-shared
//!
//! Identifier and role types shared by every Stelloscope crate.
//!
//! The central type is [`ConversationKey`]: a stable identifier derived from
//! an unordered pair of participant ids, so that the same two people always
//! land in the same conversation regardless of who opens it first.

pub mod constants;
pub mod types;

mod error;

pub use error::IdentityError;
pub use types::{ConversationKey, MessageId, Presence, Role, UserId};
