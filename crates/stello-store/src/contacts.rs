//! Role-aware contact resolution.
//!
//! A viewer's chat partners are the users on the other side of their
//! existing conversations (the directory-of-everyone listing lives on
//! [`crate::UserRegistry::list_by_role`] instead, so the two policies stay
//! distinct).  Partners come back ordered by most recent conversation
//! activity, matching the contact list in the UI.

use std::sync::Arc;

use stello_shared::{Role, UserId};

use crate::backend::Backend;
use crate::error::{Result, StoreError};
use crate::messages::MessageStore;
use crate::models::UserProfile;
use crate::users::UserRegistry;

/// Lists eligible chat partners for a viewer.
pub struct ContactResolver<B> {
    backend: Arc<B>,
}

impl<B> Clone for ContactResolver<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
        }
    }
}

impl<B: Backend> ContactResolver<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }

    /// All users who share a conversation with `viewer`, most recent
    /// activity first.  Doctors get their patients and patients their
    /// doctors; any other role fails with [`StoreError::InvalidRole`].
    pub async fn partners(&self, viewer: &UserId, role: Role) -> Result<Vec<UserProfile>> {
        if role.counterpart().is_none() {
            return Err(StoreError::InvalidRole(role));
        }

        let messages = MessageStore::new(Arc::clone(&self.backend));
        let registry = UserRegistry::new(Arc::clone(&self.backend));

        let mut partners = Vec::new();
        for conversation in messages.conversations_for(viewer, role).await? {
            let partner_id = match role {
                Role::Doctor => conversation.patient_id,
                _ => conversation.doctor_id,
            };
            let Some(partner_id) = partner_id else {
                continue; // unoriented lazy record
            };
            match registry.get(&partner_id).await? {
                Some(profile) => partners.push(profile),
                None => {
                    tracing::warn!(partner = %partner_id, "conversation references unknown user")
                }
            }
        }
        Ok(partners)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use crate::messages::MessageStore;
    use stello_shared::ConversationKey;

    async fn setup() -> (
        Arc<MemoryBackend>,
        MessageStore<MemoryBackend>,
        ContactResolver<MemoryBackend>,
        UserRegistry<MemoryBackend>,
    ) {
        let backend = Arc::new(MemoryBackend::new());
        (
            Arc::clone(&backend),
            MessageStore::new(Arc::clone(&backend)),
            ContactResolver::new(Arc::clone(&backend)),
            UserRegistry::new(backend),
        )
    }

    #[tokio::test]
    async fn doctor_sees_only_paired_patients() {
        let (_backend, messages, resolver, registry) = setup().await;

        let doctor = registry
            .register(UserId::from("doc-1"), "gregory", "g@example.com", Role::Doctor)
            .await
            .unwrap();
        let paired = registry
            .register(UserId::from("pat-1"), "lisa", "l@example.com", Role::Patient)
            .await
            .unwrap();
        // A patient with no conversation must not appear.
        registry
            .register(UserId::from("pat-2"), "james", "j@example.com", Role::Patient)
            .await
            .unwrap();

        messages.ensure_conversation(&doctor, &paired).await.unwrap();

        let partners = resolver.partners(&doctor.id, Role::Doctor).await.unwrap();
        assert_eq!(partners.len(), 1);
        assert_eq!(partners[0].id, paired.id);
        assert!(partners.iter().all(|p| p.role == Role::Patient));

        // Symmetric view.
        let doctors = resolver.partners(&paired.id, Role::Patient).await.unwrap();
        assert_eq!(doctors.len(), 1);
        assert_eq!(doctors[0].id, doctor.id);
    }

    #[tokio::test]
    async fn admin_role_is_rejected() {
        let (_backend, _messages, resolver, _registry) = setup().await;
        assert!(matches!(
            resolver.partners(&UserId::from("adm-1"), Role::Admin).await,
            Err(StoreError::InvalidRole(Role::Admin))
        ));
    }

    #[tokio::test]
    async fn partners_ordered_by_recent_activity() {
        let (_backend, messages, resolver, registry) = setup().await;

        let doctor = registry
            .register(UserId::from("doc-1"), "gregory", "g@example.com", Role::Doctor)
            .await
            .unwrap();
        let mut keys = Vec::new();
        for pat in ["pat-1", "pat-2", "pat-3"] {
            let patient = registry
                .register(UserId::from(pat), pat, &format!("{pat}@example.com"), Role::Patient)
                .await
                .unwrap();
            messages.ensure_conversation(&doctor, &patient).await.unwrap();
            keys.push(ConversationKey::derive(&doctor.id, &patient.id).unwrap());
        }
        messages.append(&keys[1], &doctor.id, "bump").await.unwrap();

        let partners = resolver.partners(&doctor.id, Role::Doctor).await.unwrap();
        assert_eq!(partners.len(), 3);
        assert_eq!(partners[0].id, UserId::from("pat-2"));
    }
}
