//! In-memory backend.
//!
//! Used by tests and ephemeral deployments.  State lives in a mutexed map;
//! the change feed is a bounded `tokio::sync::broadcast` channel.
//! [`MemoryBackend::close`] simulates a backend outage: subsequent calls
//! fail `Unavailable` and the change feed is dropped, so live subscribers
//! observe termination.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use tokio::sync::broadcast;

use stello_shared::constants::CHANGE_FEED_CAPACITY;

use crate::backend::{merge_into, Backend, ChangeEvent, Filter, WriteBatch, WriteOp};
use crate::error::{Result, StoreError};

#[derive(Default)]
struct State {
    collections: HashMap<&'static str, BTreeMap<String, Value>>,
    last_timestamp_ms: i64,
    commit_seq: u64,
}

/// A document backend held entirely in process memory.
pub struct MemoryBackend {
    state: Mutex<State>,
    // `None` once closed; receivers then see the channel as closed.
    feed: Mutex<Option<broadcast::Sender<ChangeEvent>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_feed_capacity(CHANGE_FEED_CAPACITY)
    }

    /// A backend with a custom change-feed capacity.  Tests use a tiny
    /// capacity to force lagged subscribers.
    pub fn with_feed_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self {
            state: Mutex::new(State::default()),
            feed: Mutex::new(Some(tx)),
        }
    }

    /// Simulate an outage: every later call fails `Unavailable` and the
    /// change feed is closed.
    pub fn close(&self) {
        self.feed.lock().expect("feed lock poisoned").take();
        tracing::debug!("memory backend closed");
    }

    fn is_closed(&self) -> bool {
        self.feed.lock().expect("feed lock poisoned").is_none()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(StoreError::Unavailable("backend closed".to_string()));
        }
        Ok(())
    }

    fn publish(&self, events: Vec<ChangeEvent>) {
        let feed = self.feed.lock().expect("feed lock poisoned");
        if let Some(tx) = feed.as_ref() {
            for event in events {
                // No receivers is fine.
                let _ = tx.send(event);
            }
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn fetch(&self, collection: &'static str, id: &str) -> Result<Option<Value>> {
        self.ensure_open()?;
        let state = self.state.lock().expect("state lock poisoned");
        Ok(state
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    async fn query(&self, collection: &'static str, filter: &Filter) -> Result<Vec<Value>> {
        self.ensure_open()?;
        let state = self.state.lock().expect("state lock poisoned");
        Ok(state
            .collections
            .get(collection)
            .map(|docs| {
                docs.values()
                    .filter(|doc| filter.matches(doc))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        self.ensure_open()?;

        let events = {
            let mut state = self.state.lock().expect("state lock poisoned");
            let mut events = Vec::with_capacity(batch.len());

            for op in batch.into_ops() {
                state.commit_seq += 1;
                let commit_seq = state.commit_seq;
                match op {
                    WriteOp::Put {
                        collection,
                        id,
                        data,
                    } => {
                        state
                            .collections
                            .entry(collection)
                            .or_default()
                            .insert(id.clone(), data.clone());
                        events.push(ChangeEvent {
                            commit_seq,
                            collection,
                            id,
                            data,
                        });
                    }
                    WriteOp::Merge {
                        collection,
                        id,
                        patch,
                    } => {
                        let docs = state.collections.entry(collection).or_default();
                        let doc = docs
                            .entry(id.clone())
                            .or_insert_with(|| Value::Object(Default::default()));
                        merge_into(doc, &patch);
                        let data = doc.clone();
                        events.push(ChangeEvent {
                            commit_seq,
                            collection,
                            id,
                            data,
                        });
                    }
                    WriteOp::Delete { collection, id } => {
                        if let Some(docs) = state.collections.get_mut(collection) {
                            docs.remove(&id);
                        }
                        events.push(ChangeEvent {
                            commit_seq,
                            collection,
                            id,
                            data: Value::Null,
                        });
                    }
                }
            }
            events
        };

        self.publish(events);
        Ok(())
    }

    async fn server_timestamp(&self) -> Result<DateTime<Utc>> {
        self.ensure_open()?;
        let mut state = self.state.lock().expect("state lock poisoned");
        let now = Utc::now().timestamp_millis();
        let next = now.max(state.last_timestamp_ms + 1);
        state.last_timestamp_ms = next;
        Ok(Utc
            .timestamp_millis_opt(next)
            .single()
            .unwrap_or_else(Utc::now))
    }

    fn watch(&self) -> broadcast::Receiver<ChangeEvent> {
        let feed = self.feed.lock().expect("feed lock poisoned");
        match feed.as_ref() {
            Some(tx) => tx.subscribe(),
            None => {
                // Closed backend: hand out a receiver that reports Closed
                // immediately.
                let (tx, rx) = broadcast::channel(1);
                drop(tx);
                rx
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::USERS;
    use serde_json::json;

    #[tokio::test]
    async fn put_fetch_query_round_trip() {
        let backend = MemoryBackend::new();
        backend
            .commit(
                WriteBatch::new()
                    .put(USERS, "u1", json!({ "role": "doctor" }))
                    .put(USERS, "u2", json!({ "role": "patient" })),
            )
            .await
            .unwrap();

        let doc = backend.fetch(USERS, "u1").await.unwrap().unwrap();
        assert_eq!(doc["role"], "doctor");

        let patients = backend
            .query(USERS, &Filter::Eq("role", json!("patient")))
            .await
            .unwrap();
        assert_eq!(patients.len(), 1);
    }

    #[tokio::test]
    async fn merge_preserves_unnamed_fields() {
        let backend = MemoryBackend::new();
        backend
            .commit(WriteBatch::new().put(USERS, "u1", json!({ "a": 1, "b": 2 })))
            .await
            .unwrap();
        backend
            .commit(WriteBatch::new().merge(USERS, "u1", json!({ "b": 3 })))
            .await
            .unwrap();

        let doc = backend.fetch(USERS, "u1").await.unwrap().unwrap();
        assert_eq!(doc, json!({ "a": 1, "b": 3 }));
    }

    #[tokio::test]
    async fn commit_publishes_one_event_per_op() {
        let backend = MemoryBackend::new();
        let mut rx = backend.watch();

        backend
            .commit(
                WriteBatch::new()
                    .put(USERS, "u1", json!({}))
                    .delete(USERS, "u1"),
            )
            .await
            .unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(second.commit_seq > first.commit_seq);
        assert!(second.data.is_null());
    }

    #[tokio::test]
    async fn timestamps_strictly_increase() {
        let backend = MemoryBackend::new();
        let mut last = backend.server_timestamp().await.unwrap();
        for _ in 0..50 {
            let next = backend.server_timestamp().await.unwrap();
            assert!(next > last);
            last = next;
        }
    }

    #[tokio::test]
    async fn close_fails_calls_and_ends_feed() {
        let backend = MemoryBackend::new();
        let mut rx = backend.watch();

        backend.close();
        assert!(matches!(
            backend.fetch(USERS, "u1").await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
        // A watch taken after close is closed as well.
        let mut rx2 = backend.watch();
        assert!(matches!(
            rx2.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }
}
