//! Domain model structs stored as backend documents.
//!
//! Every struct round-trips through `serde_json::Value` — the backend only
//! ever sees JSON objects.  Timestamps are serialized as epoch milliseconds
//! so that range filters can compare them numerically.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stello_shared::{ConversationKey, MessageId, Presence, Role, UserId};

/// Backend collection holding [`UserProfile`] documents.
pub const USERS: &str = "users";
/// Backend collection holding [`Conversation`] documents.
pub const CONVERSATIONS: &str = "conversations";
/// Backend collection holding [`Message`] documents.
pub const MESSAGES: &str = "messages";

// ---------------------------------------------------------------------------
// UserProfile
// ---------------------------------------------------------------------------

/// A registered user.  Document id = user id.
///
/// `presence` and `last_seen_at` are owned by the presence tracker; every
/// other field is owned by the user registry and immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserProfile {
    pub id: UserId,
    pub username: String,
    pub email: String,
    pub role: Role,
    pub presence: Presence,
    #[serde(with = "chrono::serde::ts_milliseconds_option", default)]
    pub last_seen_at: Option<DateTime<Utc>>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// A doctor/patient pairing.  Document id = conversation key.
///
/// The orientation fields are `None` for conversations created lazily by a
/// first message; [`crate::MessageStore::ensure_conversation`] fills them in
/// when the pairing is established.  Conversations are never deleted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    pub key: ConversationKey,
    pub doctor_id: Option<UserId>,
    pub patient_id: Option<UserId>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_activity_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A single chat message.  Document id = message id.
///
/// `sent_at` is assigned from the backend's monotonic clock at append time;
/// client-supplied timestamps are never trusted.  Within a conversation,
/// messages are totally ordered by `(sent_at, id)`.  Immutable once written
/// except for the `read` flag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub conversation_key: ConversationKey,
    pub sender_id: UserId,
    pub text: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub sent_at: DateTime<Utc>,
    pub read: bool,
}

impl Message {
    /// Sort key implementing the per-conversation total order.
    pub fn order_key(&self) -> (DateTime<Utc>, MessageId) {
        (self.sent_at, self.id)
    }
}
