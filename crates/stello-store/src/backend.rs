//! The document-backend port.
//!
//! Everything the core needs from a backend is exactly four primitives:
//! filtered document reads, an atomic multi-document batch write, a live
//! change feed, and a server-assigned monotonic timestamp.  Any backend
//! offering these can sit behind the port; [`crate::MemoryBackend`] and
//! [`crate::SqliteBackend`] are the two in-tree implementations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::Result;

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

/// Predicate over top-level document fields.
///
/// Evaluation happens wherever it is cheapest for the backend; both in-tree
/// backends evaluate with [`Filter::matches`].
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Match every document in the collection.
    All,
    /// Field equals value.
    Eq(&'static str, Value),
    /// Field differs from value (missing fields match).
    Ne(&'static str, Value),
    /// Numeric field strictly greater than value.
    Gt(&'static str, Value),
    /// Every inner filter matches.
    And(Vec<Filter>),
}

impl Filter {
    pub fn and(filters: impl IntoIterator<Item = Filter>) -> Self {
        Filter::And(filters.into_iter().collect())
    }

    /// Evaluate against a document body.
    pub fn matches(&self, doc: &Value) -> bool {
        match self {
            Filter::All => true,
            Filter::Eq(field, value) => doc.get(field) == Some(value),
            Filter::Ne(field, value) => doc.get(field) != Some(value),
            Filter::Gt(field, value) => match (doc.get(field), value) {
                (Some(Value::Number(a)), Value::Number(b)) => {
                    match (a.as_i64(), b.as_i64()) {
                        (Some(a), Some(b)) => a > b,
                        _ => a.as_f64().zip(b.as_f64()).is_some_and(|(a, b)| a > b),
                    }
                }
                _ => false,
            },
            Filter::And(filters) => filters.iter().all(|f| f.matches(doc)),
        }
    }
}

// ---------------------------------------------------------------------------
// WriteBatch
// ---------------------------------------------------------------------------

/// A single write inside a batch.
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// Create or replace a whole document.
    Put {
        collection: &'static str,
        id: String,
        data: Value,
    },
    /// Shallow-merge `patch` into an existing document, creating it when
    /// absent.  Fields not named in the patch are left untouched, which is
    /// what makes concurrent disjoint updates safe.
    Merge {
        collection: &'static str,
        id: String,
        patch: Value,
    },
    /// Remove a document.  Removing an absent document is a no-op.
    Delete { collection: &'static str, id: String },
}

/// An ordered set of writes applied atomically: either every op lands or
/// none do.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(mut self, collection: &'static str, id: impl Into<String>, data: Value) -> Self {
        self.ops.push(WriteOp::Put {
            collection,
            id: id.into(),
            data,
        });
        self
    }

    pub fn merge(mut self, collection: &'static str, id: impl Into<String>, patch: Value) -> Self {
        self.ops.push(WriteOp::Merge {
            collection,
            id: id.into(),
            patch,
        });
        self
    }

    pub fn delete(mut self, collection: &'static str, id: impl Into<String>) -> Self {
        self.ops.push(WriteOp::Delete {
            collection,
            id: id.into(),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

/// Shallow object merge: fields of `patch` overwrite fields of `base`.
pub(crate) fn merge_into(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            for (k, v) in patch {
                base.insert(k.clone(), v.clone());
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}

// ---------------------------------------------------------------------------
// Change feed
// ---------------------------------------------------------------------------

/// One committed write, as observed on the change feed.
///
/// `commit_seq` increases with commit order across the whole backend.  The
/// feed is a firehose: subscribers filter by collection and document fields
/// themselves.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub commit_seq: u64,
    pub collection: &'static str,
    pub id: String,
    pub data: Value,
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

/// The four-primitive document backend contract.
///
/// Transient failures surface as [`crate::StoreError::Unavailable`].  The
/// change feed channel is bounded; a subscriber that falls behind observes
/// [`broadcast::error::RecvError::Lagged`] and is expected to re-query from
/// its cursor — this is where the at-least-once delivery contract of message
/// subscriptions comes from.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Fetch one document by id.
    async fn fetch(&self, collection: &'static str, id: &str) -> Result<Option<Value>>;

    /// Fetch all documents in `collection` matching `filter`.  Order is
    /// unspecified; callers sort.
    async fn query(&self, collection: &'static str, filter: &Filter) -> Result<Vec<Value>>;

    /// Apply a batch atomically and publish one change event per op.
    async fn commit(&self, batch: WriteBatch) -> Result<()>;

    /// A timestamp strictly greater than any previously issued by this
    /// backend.
    async fn server_timestamp(&self) -> Result<DateTime<Utc>>;

    /// Subscribe to the change feed.
    fn watch(&self) -> broadcast::Receiver<ChangeEvent>;
}
