//! User registry.
//!
//! Profiles are created at registration (the auth service assigns the id
//! beforehand) and their identity fields never change afterwards.  Presence
//! fields belong to [`crate::PresenceTracker`]; the registry only sets their
//! initial value.

use std::sync::Arc;

use serde_json::json;

use stello_shared::constants::{DEFAULT_ADMIN_EMAIL, DEFAULT_ADMIN_USERNAME};
use stello_shared::{Presence, Role, UserId};

use crate::backend::{Backend, Filter, WriteBatch};
use crate::error::{Result, StoreError};
use crate::models::{UserProfile, USERS};

/// CRUD over [`UserProfile`] documents.
pub struct UserRegistry<B> {
    backend: Arc<B>,
}

impl<B> Clone for UserRegistry<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
        }
    }
}

impl<B: Backend> UserRegistry<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }

    /// Create a profile for a freshly authenticated id.
    ///
    /// Fails with [`StoreError::DuplicateEmail`] when the email is already
    /// registered.  New users start offline.
    pub async fn register(
        &self,
        id: UserId,
        username: &str,
        email: &str,
        role: Role,
    ) -> Result<UserProfile> {
        id.validate().map_err(StoreError::from)?;
        if self.find_by_email(email).await?.is_some() {
            return Err(StoreError::DuplicateEmail(email.to_string()));
        }

        // Backend clock, not the local one: millisecond-quantized, so the
        // returned profile matches later fetches byte for byte.
        let profile = UserProfile {
            id,
            username: username.to_string(),
            email: email.to_string(),
            role,
            presence: Presence::Offline,
            last_seen_at: None,
            created_at: self.backend.server_timestamp().await?,
        };
        self.backend
            .commit(WriteBatch::new().put(
                USERS,
                profile.id.as_str(),
                serde_json::to_value(&profile)?,
            ))
            .await?;

        tracing::info!(user = %profile.id, role = %role, "user registered");
        Ok(profile)
    }

    /// Fetch a profile by id.
    pub async fn get(&self, id: &UserId) -> Result<Option<UserProfile>> {
        self.backend
            .fetch(USERS, id.as_str())
            .await?
            .map(|doc| serde_json::from_value(doc).map_err(StoreError::from))
            .transpose()
    }

    /// Fetch a profile by email.
    pub async fn find_by_email(&self, email: &str) -> Result<Option<UserProfile>> {
        let docs = self
            .backend
            .query(USERS, &Filter::Eq("email", json!(email)))
            .await?;
        docs.into_iter()
            .next()
            .map(|doc| serde_json::from_value(doc).map_err(StoreError::from))
            .transpose()
    }

    /// Directory listing: every user with the given role, ordered by
    /// username.  This is deliberately distinct from
    /// [`crate::ContactResolver::partners`], which only lists users who
    /// share a conversation with the viewer.
    pub async fn list_by_role(&self, role: Role) -> Result<Vec<UserProfile>> {
        let docs = self
            .backend
            .query(USERS, &Filter::Eq("role", json!(role)))
            .await?;

        let mut users = Vec::with_capacity(docs.len());
        for doc in docs {
            users.push(serde_json::from_value::<UserProfile>(doc)?);
        }
        users.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(users)
    }

    /// Number of users with the given role (admin dashboard counter).
    pub async fn count_by_role(&self, role: Role) -> Result<usize> {
        Ok(self
            .backend
            .query(USERS, &Filter::Eq("role", json!(role)))
            .await?
            .len())
    }

    /// Remove a profile.  Returns `true` if it existed.
    pub async fn remove(&self, id: &UserId) -> Result<bool> {
        let existed = self.get(id).await?.is_some();
        if existed {
            self.backend
                .commit(WriteBatch::new().delete(USERS, id.as_str()))
                .await?;
            tracing::info!(user = %id, "user removed");
        }
        Ok(existed)
    }

    /// Idempotent bootstrap of the default administrator profile.  The auth
    /// service owns the credentials; this only guarantees the profile
    /// document exists.
    pub async fn ensure_default_admin(&self, id: UserId) -> Result<UserProfile> {
        if let Some(existing) = self.find_by_email(DEFAULT_ADMIN_EMAIL).await? {
            return Ok(existing);
        }
        self.register(id, DEFAULT_ADMIN_USERNAME, DEFAULT_ADMIN_EMAIL, Role::Admin)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;

    fn registry() -> UserRegistry<MemoryBackend> {
        UserRegistry::new(Arc::new(MemoryBackend::new()))
    }

    #[tokio::test]
    async fn register_and_lookup() {
        let registry = registry();
        let profile = registry
            .register(UserId::from("doc-1"), "gregory", "g@example.com", Role::Doctor)
            .await
            .unwrap();
        assert_eq!(profile.presence, Presence::Offline);

        let by_id = registry.get(&profile.id).await.unwrap().unwrap();
        assert_eq!(by_id, profile);
        let by_email = registry.find_by_email("g@example.com").await.unwrap().unwrap();
        assert_eq!(by_email.id, profile.id);
        assert!(registry.get(&UserId::from("missing")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_email_is_rejected() {
        let registry = registry();
        registry
            .register(UserId::from("u1"), "one", "same@example.com", Role::Patient)
            .await
            .unwrap();
        assert!(matches!(
            registry
                .register(UserId::from("u2"), "two", "same@example.com", Role::Patient)
                .await,
            Err(StoreError::DuplicateEmail(_))
        ));
    }

    #[tokio::test]
    async fn invalid_id_rejected_before_backend() {
        let registry = registry();
        assert!(matches!(
            registry
                .register(UserId::from("bad:id"), "x", "x@example.com", Role::Patient)
                .await,
            Err(StoreError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn directory_and_counts() {
        let registry = registry();
        for (id, name) in [("pat-2", "zoe"), ("pat-1", "abe")] {
            registry
                .register(UserId::from(id), name, &format!("{id}@example.com"), Role::Patient)
                .await
                .unwrap();
        }
        registry
            .register(UserId::from("doc-1"), "greg", "d@example.com", Role::Doctor)
            .await
            .unwrap();

        let patients = registry.list_by_role(Role::Patient).await.unwrap();
        assert_eq!(patients.len(), 2);
        assert_eq!(patients[0].username, "abe");
        assert_eq!(registry.count_by_role(Role::Doctor).await.unwrap(), 1);
        assert_eq!(registry.count_by_role(Role::Admin).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn remove_reports_existence() {
        let registry = registry();
        let id = UserId::from("pat-1");
        registry
            .register(id.clone(), "abe", "a@example.com", Role::Patient)
            .await
            .unwrap();

        assert!(registry.remove(&id).await.unwrap());
        assert!(!registry.remove(&id).await.unwrap());
        assert!(registry.get(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn default_admin_bootstrap_is_idempotent() {
        let registry = registry();
        let first = registry
            .ensure_default_admin(UserId::from("admin-uid"))
            .await
            .unwrap();
        let second = registry
            .ensure_default_admin(UserId::from("other-uid"))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.role, Role::Admin);
        assert_eq!(registry.count_by_role(Role::Admin).await.unwrap(), 1);
    }
}
