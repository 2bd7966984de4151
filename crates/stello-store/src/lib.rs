//! # stello-store
//!
//! The Stelloscope messaging core: conversation and message records, live
//! message subscriptions, per-message read state, contact resolution, and
//! presence, all defined against a narrow document-backend port.
//!
//! The port ([`Backend`]) exposes exactly four primitives: filtered document
//! queries, atomic multi-document batches, a live change feed, and a
//! server-assigned monotonic timestamp.  Two implementations ship with the
//! crate: [`MemoryBackend`] for tests and ephemeral deployments, and
//! [`SqliteBackend`] for durable single-node ones.  Everything above the port
//! works identically against either.

pub mod backend;
pub mod contacts;
pub mod memory;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod presence;
pub mod read_state;
pub mod sqlite;
pub mod stats;
pub mod users;

mod error;

pub use backend::{Backend, ChangeEvent, Filter, WriteBatch};
pub use contacts::ContactResolver;
pub use error::{Result, StoreError};
pub use memory::MemoryBackend;
pub use messages::{MessageStore, Subscription, SubscriptionEvent};
pub use models::{Conversation, Message, UserProfile};
pub use presence::PresenceTracker;
pub use read_state::ReadStateTracker;
pub use sqlite::SqliteBackend;
pub use stats::{DashboardSnapshot, DashboardStats};
pub use users::UserRegistry;
