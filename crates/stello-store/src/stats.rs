//! Dashboard aggregates.
//!
//! The numbers each role's dashboard shows: how many partners, how many
//! unread messages across all conversations, and the most recently active
//! conversations.  Pure reads over the other stores; nothing here mutates.

use std::sync::Arc;

use stello_shared::{Role, UserId};

use crate::backend::Backend;
use crate::error::Result;
use crate::messages::MessageStore;
use crate::models::Conversation;
use crate::read_state::ReadStateTracker;

/// How many recent conversations a snapshot carries.
const RECENT_LIMIT: usize = 10;

/// One dashboard refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DashboardSnapshot {
    /// Partners the viewer shares a conversation with.
    pub partner_count: usize,
    /// Unread messages for the viewer, summed across conversations.
    pub unread_messages: usize,
    /// Most recently active conversations, newest first.
    pub recent: Vec<Conversation>,
}

/// Computes [`DashboardSnapshot`]s.
pub struct DashboardStats<B> {
    backend: Arc<B>,
}

impl<B> Clone for DashboardStats<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
        }
    }
}

impl<B: Backend> DashboardStats<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }

    /// Aggregate the viewer's dashboard numbers.  Fails with
    /// [`crate::StoreError::InvalidRole`] for admins, whose dashboard is
    /// role counts from the registry instead.
    pub async fn snapshot(&self, viewer: &UserId, role: Role) -> Result<DashboardSnapshot> {
        let messages = MessageStore::new(Arc::clone(&self.backend));
        let read_state = ReadStateTracker::new(Arc::clone(&self.backend));

        let conversations = messages.conversations_for(viewer, role).await?;

        let mut unread_messages = 0;
        for conversation in &conversations {
            unread_messages += read_state.unread_count(&conversation.key, viewer).await?;
        }

        let partner_count = conversations.len();
        let mut recent = conversations;
        recent.truncate(RECENT_LIMIT);

        Ok(DashboardSnapshot {
            partner_count,
            unread_messages,
            recent,
        })
    }
}
