//! Replicated keyed store abstraction the whole engine multiplexes through.
//!
//! Paths are `/`-separated keys into one JSON tree (`rooms/{code}/...`).
//! Writing JSON `null` deletes the subtree, matching the semantics of the
//! push-subscription databases this engine is deployed against.

pub mod memory;

use std::error::Error;

use futures::future::BoxFuture;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::mpsc;

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Error raised by store backends regardless of the underlying transport.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached or rejected the operation.
    #[error("store unavailable: {message}")]
    Unavailable {
        /// Human readable description of the failed operation.
        message: String,
        /// Underlying backend failure.
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
    /// A stored value did not match the expected shape.
    #[error("corrupted value at `{path}`")]
    Corrupted {
        /// Path of the offending value.
        path: String,
        /// Decoding failure.
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    /// Construct an unavailable error from any backend failure.
    pub fn unavailable(message: String, source: impl Error + Send + Sync + 'static) -> Self {
        StoreError::Unavailable {
            message,
            source: Box::new(source),
        }
    }

    /// Construct a corrupted-value error for the given path.
    pub fn corrupted(path: impl Into<String>, source: serde_json::Error) -> Self {
        StoreError::Corrupted {
            path: path.into(),
            source,
        }
    }
}

/// Decision returned by a [`KeyValueStore::transactional_update`] closure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionVerdict {
    /// Replace the value at the path with the payload.
    Commit(Value),
    /// Leave the path untouched.
    Abort,
}

/// Result of a transactional update, as observed by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOutcome {
    /// The closure committed and the write is visible to every subscriber.
    Committed,
    /// The closure aborted; the stored value was not modified.
    Aborted,
}

/// Closure shape accepted by [`KeyValueStore::transactional_update`].
pub type TransactionFn = Box<dyn FnOnce(Option<Value>) -> TransactionVerdict + Send>;

/// Live subscription to a subtree of the store.
///
/// The current snapshot is delivered immediately, then a fresh snapshot after
/// every write overlapping the subscribed path. `None` means the subtree was
/// deleted. Dropping the subscription unsubscribes.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Option<Value>>,
    _guard: Box<dyn Send>,
}

impl Subscription {
    /// Assemble a subscription from its snapshot channel and an unsubscribe guard.
    pub fn new(rx: mpsc::UnboundedReceiver<Option<Value>>, guard: impl Send + 'static) -> Self {
        Self {
            rx,
            _guard: Box::new(guard),
        }
    }

    /// Wait for the next snapshot. Returns `None` when the store itself went away.
    pub async fn next_snapshot(&mut self) -> Option<Option<Value>> {
        self.rx.recv().await
    }
}

/// Abstraction over the replicated keyed store used for game state and signaling.
///
/// Modelled after push-subscription document stores: per-path last-write-wins,
/// no cross-path atomicity. [`KeyValueStore::transactional_update`] is the one
/// primitive that makes a read-then-write atomic and is what the buzz lock
/// relies on.
pub trait KeyValueStore: Send + Sync {
    /// Whether a non-null value exists at the path.
    fn exists(&self, path: &str) -> BoxFuture<'static, StoreResult<bool>>;
    /// Read the value at the path once, without subscribing.
    fn read_once(&self, path: &str) -> BoxFuture<'static, StoreResult<Option<Value>>>;
    /// Overwrite the value at the path. Writing `Value::Null` deletes it.
    fn write(&self, path: &str, value: Value) -> BoxFuture<'static, StoreResult<()>>;
    /// Shallow-merge fields into the object at the path, creating it if absent.
    /// A `Value::Null` field deletes that key.
    fn merge(&self, path: &str, fields: Map<String, Value>) -> BoxFuture<'static, StoreResult<()>>;
    /// Atomically read, transform, and write the value at a single path.
    fn transactional_update(
        &self,
        path: &str,
        op: TransactionFn,
    ) -> BoxFuture<'static, StoreResult<TransactionOutcome>>;
    /// Subscribe to snapshots of the subtree at the path.
    fn subscribe(&self, path: &str) -> BoxFuture<'static, StoreResult<Subscription>>;
}
