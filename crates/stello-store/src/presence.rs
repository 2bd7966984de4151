//! Best-effort presence.
//!
//! Presence writes are unconditional merges of the two presence fields —
//! last-writer-wins, no conflict detection, and nothing else on the profile
//! is touched.  Durability on the sign-out path is best-effort by design:
//! the session layer spawns the offline write with a timeout, and a stale
//! "online" status after a crash is an accepted failure mode.

use std::sync::Arc;

use serde_json::json;

use stello_shared::{Presence, UserId};

use crate::backend::{Backend, WriteBatch};
use crate::error::{Result, StoreError};
use crate::models::{UserProfile, USERS};

/// Owns the `presence` / `last_seen_at` fields of user profiles.
pub struct PresenceTracker<B> {
    backend: Arc<B>,
}

impl<B> Clone for PresenceTracker<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
        }
    }
}

impl<B: Backend> PresenceTracker<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }

    async fn set(&self, user: &UserId, presence: Presence) -> Result<()> {
        let now = self.backend.server_timestamp().await?;
        self.backend
            .commit(WriteBatch::new().merge(
                USERS,
                user.as_str(),
                json!({
                    "presence": presence,
                    "last_seen_at": now.timestamp_millis(),
                }),
            ))
            .await?;
        tracing::debug!(user = %user, presence = %presence, "presence updated");
        Ok(())
    }

    pub async fn set_online(&self, user: &UserId) -> Result<()> {
        self.set(user, Presence::Online).await
    }

    pub async fn set_offline(&self, user: &UserId) -> Result<()> {
        self.set(user, Presence::Offline).await
    }

    /// Current presence fields of a user.
    pub async fn presence_of(&self, user: &UserId) -> Result<UserProfile> {
        let doc = self
            .backend
            .fetch(USERS, user.as_str())
            .await?
            .ok_or(StoreError::NotFound)?;
        serde_json::from_value(doc).map_err(StoreError::from)
    }
}
