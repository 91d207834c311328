//! In-process reference backend for [`KeyValueStore`].
//!
//! Keeps the whole tree as one JSON value behind a mutex and fans snapshots
//! out to subscribers on every overlapping write. Used by the test suite and
//! by embedders that want a single-process session without a remote store.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, mpsc};
use uuid::Uuid;

use super::{
    KeyValueStore, StoreResult, Subscription, TransactionFn, TransactionOutcome, TransactionVerdict,
};

/// In-memory implementation of [`KeyValueStore`].
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    root: Mutex<Value>,
    subscribers: DashMap<Uuid, SubscriberEntry>,
}

struct SubscriberEntry {
    segments: Vec<String>,
    tx: mpsc::UnboundedSender<Option<Value>>,
}

/// Removes the subscriber registration when the subscription is dropped.
pub struct SubscriptionGuard {
    id: Uuid,
    inner: Weak<StoreInner>,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.subscribers.remove(&self.id);
        }
    }
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StoreInner {
                root: Mutex::new(Value::Object(Map::new())),
                subscribers: DashMap::new(),
            }),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreInner {
    /// Push the subtree snapshot to every subscriber overlapping `changed`.
    ///
    /// Must be called while `root` is locked so subscribers observe writes in
    /// commit order.
    fn notify(&self, root: &Value, changed: &[String]) {
        let mut stale = Vec::new();
        for entry in self.subscribers.iter() {
            if !paths_overlap(&entry.segments, changed) {
                continue;
            }
            let snapshot = node_at(root, &entry.segments).cloned();
            if entry.tx.send(snapshot).is_err() {
                stale.push(*entry.key());
            }
        }
        for id in stale {
            self.subscribers.remove(&id);
        }
    }
}

impl KeyValueStore for MemoryStore {
    fn exists(&self, path: &str) -> BoxFuture<'static, StoreResult<bool>> {
        let inner = self.inner.clone();
        let segments = split_path(path);
        Box::pin(async move {
            let root = inner.root.lock().await;
            Ok(node_at(&root, &segments).is_some())
        })
    }

    fn read_once(&self, path: &str) -> BoxFuture<'static, StoreResult<Option<Value>>> {
        let inner = self.inner.clone();
        let segments = split_path(path);
        Box::pin(async move {
            let root = inner.root.lock().await;
            Ok(node_at(&root, &segments).cloned())
        })
    }

    fn write(&self, path: &str, value: Value) -> BoxFuture<'static, StoreResult<()>> {
        let inner = self.inner.clone();
        let segments = split_path(path);
        Box::pin(async move {
            let mut root = inner.root.lock().await;
            write_at(&mut root, &segments, value);
            inner.notify(&root, &segments);
            Ok(())
        })
    }

    fn merge(&self, path: &str, fields: Map<String, Value>) -> BoxFuture<'static, StoreResult<()>> {
        let inner = self.inner.clone();
        let segments = split_path(path);
        Box::pin(async move {
            let mut root = inner.root.lock().await;
            for (key, value) in fields {
                let mut field_path = segments.clone();
                field_path.push(key);
                write_at(&mut root, &field_path, value);
            }
            inner.notify(&root, &segments);
            Ok(())
        })
    }

    fn transactional_update(
        &self,
        path: &str,
        op: TransactionFn,
    ) -> BoxFuture<'static, StoreResult<TransactionOutcome>> {
        let inner = self.inner.clone();
        let segments = split_path(path);
        Box::pin(async move {
            // The tree lock is held across the closure, so the read and the
            // conditional write are atomic with respect to every other writer.
            let mut root = inner.root.lock().await;
            let current = node_at(&root, &segments).cloned();
            match op(current) {
                TransactionVerdict::Commit(value) => {
                    write_at(&mut root, &segments, value);
                    inner.notify(&root, &segments);
                    Ok(TransactionOutcome::Committed)
                }
                TransactionVerdict::Abort => Ok(TransactionOutcome::Aborted),
            }
        })
    }

    fn subscribe(&self, path: &str) -> BoxFuture<'static, StoreResult<Subscription>> {
        let inner = self.inner.clone();
        let segments = split_path(path);
        Box::pin(async move {
            let (tx, rx) = mpsc::unbounded_channel();
            let root = inner.root.lock().await;
            let initial = node_at(&root, &segments).cloned();
            let _ = tx.send(initial);
            let id = Uuid::new_v4();
            inner.subscribers.insert(id, SubscriberEntry { segments, tx });
            drop(root);
            let guard = SubscriptionGuard {
                id,
                inner: Arc::downgrade(&inner),
            };
            Ok(Subscription::new(rx, guard))
        })
    }
}

/// Split a `/`-separated path into non-empty segments.
fn split_path(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Whether a write at `changed` affects the subtree at `watched`.
fn paths_overlap(watched: &[String], changed: &[String]) -> bool {
    watched
        .iter()
        .zip(changed.iter())
        .all(|(left, right)| left == right)
}

fn node_at<'a>(root: &'a Value, segments: &[String]) -> Option<&'a Value> {
    let mut current = root;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Set the value at a path, creating intermediate objects.
///
/// Writing `null` deletes the key; intermediate objects emptied by a delete
/// are pruned so `exists` reflects logical deletion.
fn write_at(root: &mut Value, segments: &[String], value: Value) {
    let Some((head, rest)) = segments.split_first() else {
        *root = if value.is_null() {
            Value::Object(Map::new())
        } else {
            value
        };
        return;
    };

    if !root.is_object() {
        *root = Value::Object(Map::new());
    }
    let Value::Object(map) = root else {
        return;
    };

    if rest.is_empty() {
        if value.is_null() {
            map.remove(head);
        } else {
            map.insert(head.clone(), value);
        }
        return;
    }

    let child = map
        .entry(head.clone())
        .or_insert_with(|| Value::Object(Map::new()));
    write_at(child, rest, value);
    if child.as_object().is_some_and(Map::is_empty) {
        map.remove(head);
    }
}
