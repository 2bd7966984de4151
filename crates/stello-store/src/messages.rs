//! Conversation and message records, plus live message subscriptions.
//!
//! [`MessageStore`] owns the `conversations` and `messages` collections.
//! Appends are validated before any backend call, stamped from the backend's
//! monotonic clock (client timestamps are never trusted), and committed
//! together with a conversation `last_activity_at` touch in one atomic
//! batch.
//!
//! Subscriptions are cancellable workers on the backend change feed.  Within
//! one live subscription every newly appended message is delivered exactly
//! once: the worker tracks delivered ids, so a message whose commit lands on
//! the feed after a later-stamped one still goes out (late) instead of being
//! dropped.  Bursts are drained and sorted by `(sent_at, id)` before
//! delivery.  A subscriber that lags the feed re-queries the conversation
//! and delivers whatever it has not seen yet; across a resubscribe the
//! contract is at-least-once, and consumers de-duplicate by message id.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use stello_shared::{ConversationKey, MessageId, Role, UserId};

use crate::backend::{Backend, ChangeEvent, Filter, WriteBatch};
use crate::error::{Result, StoreError};
use crate::models::{Conversation, Message, UserProfile, CONVERSATIONS, MESSAGES};

/// Events delivered to a subscription callback.
#[derive(Debug)]
pub enum SubscriptionEvent {
    /// A newly appended message.
    Message(Message),
    /// The live feed was dropped.  Delivered at most once; the subscription
    /// is over and the caller must resubscribe explicitly.
    Terminated(StoreError),
}

/// Cancellation handle for a live subscription.
///
/// Cancelling is idempotent; dropping the handle cancels as well.  After
/// cancellation the callback never fires again.
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn cancel(&self) {
        self.task.abort();
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Ordered per-conversation message log.
pub struct MessageStore<B> {
    backend: Arc<B>,
}

impl<B> Clone for MessageStore<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
        }
    }
}

impl<B: Backend> MessageStore<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }

    /// Append a message to a conversation.
    ///
    /// Fails with [`StoreError::EmptyMessage`] when `text` trims to empty
    /// (checked before any backend call).  `sent_at` comes from the
    /// backend's monotonic clock.  The message insert and the conversation
    /// `last_activity_at` touch commit as one atomic batch; the conversation
    /// record is created lazily if absent.
    pub async fn append(
        &self,
        key: &ConversationKey,
        sender: &UserId,
        text: &str,
    ) -> Result<Message> {
        let text = text.trim();
        if text.is_empty() {
            return Err(StoreError::EmptyMessage);
        }

        let sent_at = self.backend.server_timestamp().await?;
        let message = Message {
            id: MessageId::new(),
            conversation_key: key.clone(),
            sender_id: sender.clone(),
            text: text.to_string(),
            sent_at,
            read: false,
        };

        let batch = WriteBatch::new()
            .put(
                MESSAGES,
                message.id.to_string(),
                serde_json::to_value(&message)?,
            )
            .merge(
                CONVERSATIONS,
                key.as_str(),
                json!({
                    "key": key,
                    "last_activity_at": sent_at.timestamp_millis(),
                }),
            );
        self.backend.commit(batch).await?;

        tracing::debug!(key = %key, sender = %sender, id = %message.id, "message appended");
        Ok(message)
    }

    /// Snapshot of all messages in a conversation, ascending `(sent_at, id)`.
    pub async fn read_ordered(&self, key: &ConversationKey) -> Result<Vec<Message>> {
        let docs = self
            .backend
            .query(MESSAGES, &Filter::Eq("conversation_key", json!(key)))
            .await?;

        let mut messages = Vec::with_capacity(docs.len());
        for doc in docs {
            messages.push(serde_json::from_value::<Message>(doc)?);
        }
        messages.sort_by_key(Message::order_key);
        Ok(messages)
    }

    /// Establish (or complete) the doctor/patient pairing for a
    /// conversation.  Idempotent; validates both roles.
    pub async fn ensure_conversation(
        &self,
        doctor: &UserProfile,
        patient: &UserProfile,
    ) -> Result<Conversation> {
        if doctor.role != Role::Doctor {
            return Err(StoreError::InvalidRole(doctor.role));
        }
        if patient.role != Role::Patient {
            return Err(StoreError::InvalidRole(patient.role));
        }

        let key = ConversationKey::derive(&doctor.id, &patient.id)?;
        if let Some(doc) = self.backend.fetch(CONVERSATIONS, key.as_str()).await? {
            let existing: Conversation = serde_json::from_value(doc)?;
            if existing.doctor_id.is_some() {
                return Ok(existing);
            }
            // Lazily created record; fill in the orientation.
            self.backend
                .commit(WriteBatch::new().merge(
                    CONVERSATIONS,
                    key.as_str(),
                    json!({ "doctor_id": doctor.id, "patient_id": patient.id }),
                ))
                .await?;
            return Ok(Conversation {
                doctor_id: Some(doctor.id.clone()),
                patient_id: Some(patient.id.clone()),
                ..existing
            });
        }

        let conversation = Conversation {
            key: key.clone(),
            doctor_id: Some(doctor.id.clone()),
            patient_id: Some(patient.id.clone()),
            last_activity_at: self.backend.server_timestamp().await?,
        };
        self.backend
            .commit(WriteBatch::new().put(
                CONVERSATIONS,
                key.as_str(),
                serde_json::to_value(&conversation)?,
            ))
            .await?;

        tracing::info!(key = %key, "conversation established");
        Ok(conversation)
    }

    /// Fetch a conversation record by key.
    pub async fn conversation(&self, key: &ConversationKey) -> Result<Option<Conversation>> {
        self.backend
            .fetch(CONVERSATIONS, key.as_str())
            .await?
            .map(|doc| serde_json::from_value(doc).map_err(StoreError::from))
            .transpose()
    }

    /// All conversations where `user` participates with the given role,
    /// most recent activity first.
    pub async fn conversations_for(&self, user: &UserId, role: Role) -> Result<Vec<Conversation>> {
        let field = match role {
            Role::Doctor => "doctor_id",
            Role::Patient => "patient_id",
            Role::Admin => return Err(StoreError::InvalidRole(role)),
        };

        let docs = self
            .backend
            .query(CONVERSATIONS, &Filter::Eq(field, json!(user)))
            .await?;

        let mut conversations = Vec::with_capacity(docs.len());
        for doc in docs {
            conversations.push(serde_json::from_value::<Conversation>(doc)?);
        }
        conversations.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
        Ok(conversations)
    }

    /// Subscribe to new messages in a conversation.
    ///
    /// Messages appended after the subscription is established are delivered
    /// to `on_event` exactly once each, sorted within a drained burst; a
    /// message whose commit reaches the feed after a later-stamped one is
    /// still delivered rather than dropped.  Read-flag updates are not
    /// delivered.  On feed loss the callback receives one
    /// [`SubscriptionEvent::Terminated`] and the worker exits; there is no
    /// automatic resubscribe.
    pub fn subscribe<F>(&self, key: &ConversationKey, mut on_event: F) -> Subscription
    where
        F: FnMut(SubscriptionEvent) + Send + 'static,
    {
        // Take the feed before the snapshot so no append can fall between.
        let rx = self.backend.watch();
        let store = self.clone();
        let key = key.clone();

        let task = tokio::spawn(async move {
            let mut rx = rx;
            // Ids already delivered (or present before subscribing).  Two
            // writers can take timestamps in one order and commit in the
            // other, so delivery is tracked by id, never by a timestamp
            // cursor; a cursor silently drops the earlier-stamped message.
            let mut seen: HashSet<MessageId> = HashSet::new();
            match store.read_ordered(&key).await {
                Ok(snapshot) => seen.extend(snapshot.iter().map(|m| m.id)),
                Err(err) => {
                    on_event(SubscriptionEvent::Terminated(err));
                    return;
                }
            }

            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let mut batch = Vec::new();
                        let mut lagged = false;
                        push_if_relevant(&key, event, &mut batch);

                        // Drain whatever else is queued so a burst delivered
                        // out of order still goes out sorted.
                        loop {
                            match rx.try_recv() {
                                Ok(event) => push_if_relevant(&key, event, &mut batch),
                                Err(broadcast::error::TryRecvError::Empty) => break,
                                Err(broadcast::error::TryRecvError::Lagged(_)) => {
                                    lagged = true;
                                    break;
                                }
                                Err(broadcast::error::TryRecvError::Closed) => break,
                            }
                        }

                        if lagged {
                            match store.resync(&key).await {
                                Ok(missed) => batch.extend(missed),
                                Err(err) => {
                                    on_event(SubscriptionEvent::Terminated(err));
                                    return;
                                }
                            }
                        }

                        flush(batch, &mut seen, &mut on_event);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(key = %key, skipped, "change feed lagged; re-querying");
                        match store.resync(&key).await {
                            Ok(missed) => flush(missed, &mut seen, &mut on_event),
                            Err(err) => {
                                on_event(SubscriptionEvent::Terminated(err));
                                return;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        on_event(SubscriptionEvent::Terminated(StoreError::SubscriptionTerminated));
                        return;
                    }
                }
            }
        });

        Subscription { task }
    }

    /// Fetch the conversation's messages for gap recovery after a lagged
    /// feed.  No timestamp bound: a timestamp can be taken before a gap and
    /// committed inside it, so the seen set is the only safe filter.
    async fn resync(&self, key: &ConversationKey) -> Result<Vec<Message>> {
        let docs = self
            .backend
            .query(MESSAGES, &Filter::Eq("conversation_key", json!(key)))
            .await?;
        let mut messages = Vec::with_capacity(docs.len());
        for doc in docs {
            messages.push(serde_json::from_value::<Message>(doc)?);
        }
        Ok(messages)
    }
}

/// Keep change events that are messages of this conversation.
fn push_if_relevant(key: &ConversationKey, event: ChangeEvent, batch: &mut Vec<Message>) {
    if event.collection != MESSAGES || event.data.is_null() {
        return;
    }
    match serde_json::from_value::<Message>(event.data) {
        Ok(message) if message.conversation_key == *key => batch.push(message),
        Ok(_) => {}
        Err(err) => {
            tracing::warn!(id = %event.id, error = %err, "undecodable message document on feed")
        }
    }
}

/// Sort a batch and deliver everything not yet seen.
///
/// Read-flag merges re-surface the message under its original id, so the
/// seen set filters those out as well.
fn flush<F>(mut batch: Vec<Message>, seen: &mut HashSet<MessageId>, on_event: &mut F)
where
    F: FnMut(SubscriptionEvent),
{
    batch.sort_by_key(Message::order_key);
    for message in batch {
        if seen.insert(message.id) {
            on_event(SubscriptionEvent::Message(message));
        }
    }
}
