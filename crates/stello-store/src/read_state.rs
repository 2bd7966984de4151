//! Per-message read state.
//!
//! The read flag is the only mutable field of a message.  Bulk marking is a
//! single atomic batch of per-message merges keyed by message id, so two
//! readers marking the same conversation concurrently cannot lose each
//! other's updates — there is no read-modify-write of any shared counter.

use std::sync::Arc;

use serde_json::json;

use stello_shared::{ConversationKey, Role, UserId};

use crate::backend::{Backend, Filter, WriteBatch};
use crate::error::Result;
use crate::messages::MessageStore;
use crate::models::MESSAGES;

/// Tracks and updates the `read` flag on messages.
pub struct ReadStateTracker<B> {
    backend: Arc<B>,
}

impl<B> Clone for ReadStateTracker<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
        }
    }
}

impl<B: Backend> ReadStateTracker<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }

    fn unread_filter(key: &ConversationKey, reader: &UserId) -> Filter {
        Filter::and([
            Filter::Eq("conversation_key", json!(key)),
            Filter::Ne("sender_id", json!(reader)),
            Filter::Eq("read", json!(false)),
        ])
    }

    /// Mark every unread message in the conversation that `reader` did not
    /// send.  One atomic batch: either all named messages flip or none do.
    /// Idempotent; returns the number of messages marked.
    pub async fn mark_read(&self, key: &ConversationKey, reader: &UserId) -> Result<usize> {
        let unread = self
            .backend
            .query(MESSAGES, &Self::unread_filter(key, reader))
            .await?;
        if unread.is_empty() {
            return Ok(0);
        }

        let mut batch = WriteBatch::new();
        let mut count = 0;
        for doc in &unread {
            if let Some(id) = doc.get("id").and_then(|v| v.as_str()) {
                batch = batch.merge(MESSAGES, id, json!({ "read": true }));
                count += 1;
            }
        }
        self.backend.commit(batch).await?;

        tracing::debug!(key = %key, reader = %reader, count, "messages marked read");
        Ok(count)
    }

    /// Number of unread messages for `reader` in one conversation.  Pure
    /// read, no mutation.
    pub async fn unread_count(&self, key: &ConversationKey, reader: &UserId) -> Result<usize> {
        let unread = self
            .backend
            .query(MESSAGES, &Self::unread_filter(key, reader))
            .await?;
        Ok(unread.len())
    }

    /// Unread messages for `reader` summed across all of their
    /// conversations — the dashboard badge number.
    pub async fn unread_total(&self, reader: &UserId, role: Role) -> Result<usize> {
        let messages = MessageStore::new(Arc::clone(&self.backend));
        let mut total = 0;
        for conversation in messages.conversations_for(reader, role).await? {
            total += self.unread_count(&conversation.key, reader).await?;
        }
        Ok(total)
    }
}
