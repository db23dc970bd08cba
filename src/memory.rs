//! In-process document store.
//!
//! [`MemoryStore`] implements [`DocumentStore`] over a map guarded by a
//! mutex. Like a hosted change feed, a new subscription first receives
//! every existing document as `added`, then live changes as they happen.
//! Every mutation is also appended to a journal so callers can inspect
//! exactly what was written, and in which order.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::document::{Change, ChangeBatch, ChangeKind, FieldUpdate, Fields};
use crate::error::{StoreError, StoreResult};
use crate::job::JobId;
use crate::store::{ChangeFeed, DocumentStore};

/// A mutation recorded by [`MemoryStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct Write {
    pub id: JobId,
    pub update: FieldUpdate,
}

#[derive(Default)]
struct Inner {
    documents: BTreeMap<JobId, Fields>,
    subscribers: Vec<mpsc::UnboundedSender<StoreResult<ChangeBatch>>>,
    journal: Vec<Write>,
    failing_writes: u32,
}

impl Inner {
    fn publish(&mut self, batch: ChangeBatch) {
        self.subscribers
            .retain(|tx| tx.send(Ok(batch.clone())).is_ok());
    }
}

/// In-memory [`DocumentStore`] for a single collection.
pub struct MemoryStore {
    collection: String,
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Empty store serving `collection`.
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a document and notify subscribers with an `added` change.
    pub fn insert(&self, id: impl Into<JobId>, fields: Fields) {
        let id = id.into();
        let mut inner = self.lock();
        inner.documents.insert(id.clone(), fields.clone());
        inner.publish(vec![Change::added(id, fields)]);
    }

    /// Deliver the `added` change of an existing document again.
    ///
    /// Returns `false` if the document does not exist.
    pub fn redeliver(&self, id: &JobId) -> bool {
        let mut inner = self.lock();
        let Some(fields) = inner.documents.get(id).cloned() else {
            return false;
        };
        inner.publish(vec![Change::added(id.clone(), fields)]);
        true
    }

    /// Push a raw batch to every subscriber, as a feed redelivering
    /// changes would.
    pub fn deliver(&self, batch: ChangeBatch) {
        self.lock().publish(batch);
    }

    /// Current fields of a document.
    pub fn document(&self, id: &JobId) -> Option<Fields> {
        self.lock().documents.get(id).cloned()
    }

    /// Every successful mutation, in the order it was applied.
    pub fn writes(&self) -> Vec<Write> {
        self.lock().journal.clone()
    }

    /// Successful mutations addressed to one document.
    pub fn writes_for(&self, id: &JobId) -> Vec<FieldUpdate> {
        self.lock()
            .journal
            .iter()
            .filter(|w| &w.id == id)
            .map(|w| w.update.clone())
            .collect()
    }

    /// Make the next `count` calls to `update_fields` fail with
    /// [`StoreError::Unavailable`].
    pub fn fail_next_writes(&self, count: u32) {
        self.lock().failing_writes = count;
    }

    /// Number of open change feeds.
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("MemoryStore")
            .field("collection", &self.collection)
            .field("documents", &inner.documents.len())
            .field("subscribers", &inner.subscribers.len())
            .finish()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn subscribe(&self, collection: &str) -> StoreResult<ChangeFeed> {
        if collection != self.collection {
            return Err(StoreError::Subscription(format!(
                "unknown collection `{collection}`"
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        let snapshot: ChangeBatch = inner
            .documents
            .iter()
            .map(|(id, fields)| Change::added(id.clone(), fields.clone()))
            .collect();
        if !snapshot.is_empty() {
            // receiver is alive, the send cannot fail
            let _ = tx.send(Ok(snapshot));
        }
        inner.subscribers.push(tx);

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn unsubscribe(&self, collection: &str) -> StoreResult<()> {
        if collection != self.collection {
            return Err(StoreError::Subscription(format!(
                "unknown collection `{collection}`"
            )));
        }
        self.lock().subscribers.clear();
        Ok(())
    }

    async fn fetch(&self, id: &JobId) -> StoreResult<Fields> {
        self.document(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn update_fields(&self, id: &JobId, update: FieldUpdate) -> StoreResult<()> {
        let mut inner = self.lock();
        if inner.failing_writes > 0 {
            inner.failing_writes -= 1;
            return Err(StoreError::Unavailable("injected write failure".into()));
        }

        let fields = inner
            .documents
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        update.apply_to(fields);
        let fields = fields.clone();

        inner.journal.push(Write {
            id: id.clone(),
            update,
        });
        inner.publish(vec![Change {
            kind: ChangeKind::Modified,
            document_id: id.clone(),
            fields,
        }]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::document::{logs_of, status_of};
    use crate::job::JobStatus;

    fn pending() -> Fields {
        let mut fields = Fields::new();
        fields.insert("status".into(), json!("pending"));
        fields
    }

    #[tokio::test]
    async fn test_subscribe_delivers_snapshot_then_live_changes() {
        let store = MemoryStore::new("users/u1/scans");
        store.insert("a", pending());

        let mut feed = store.subscribe("users/u1/scans").await.unwrap();
        let snapshot = feed.next().await.unwrap().unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].document_id, JobId::new("a"));
        assert_eq!(snapshot[0].kind, ChangeKind::Added);

        store.insert("b", pending());
        let live = feed.next().await.unwrap().unwrap();
        assert_eq!(live[0].document_id, JobId::new("b"));

        store.unsubscribe("users/u1/scans").await.unwrap();
        assert!(feed.next().await.is_none());
    }

    #[tokio::test]
    async fn test_subscribe_unknown_collection() {
        let store = MemoryStore::new("users/u1/scans");
        let err = store.subscribe("users/u2/scans").await.err().unwrap();
        assert!(matches!(err, StoreError::Subscription(_)));
    }

    #[tokio::test]
    async fn test_update_fields_journal_and_union() {
        let store = MemoryStore::new("scans");
        let id = JobId::new("a");
        store.insert(id.clone(), pending());

        let update = FieldUpdate::new().with_status(JobStatus::Running).with_log("x");
        store.update_fields(&id, update.clone()).await.unwrap();
        store
            .update_fields(&id, FieldUpdate::new().with_log("x"))
            .await
            .unwrap();

        let doc = store.document(&id).unwrap();
        assert_eq!(status_of(&doc), Some(JobStatus::Running));
        assert_eq!(logs_of(&doc), vec!["x"]);
        assert_eq!(store.writes_for(&id).len(), 2);
        assert_eq!(store.writes()[0].update, update);
    }

    #[tokio::test]
    async fn test_injected_write_failures() {
        let store = MemoryStore::new("scans");
        let id = JobId::new("a");
        store.insert(id.clone(), pending());
        store.fail_next_writes(1);

        let err = store
            .update_fields(&id, FieldUpdate::new().with_progress(10))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        store
            .update_fields(&id, FieldUpdate::new().with_progress(10))
            .await
            .unwrap();
        assert_eq!(store.writes().len(), 1);
    }

    #[tokio::test]
    async fn test_update_missing_document() {
        let store = MemoryStore::new("scans");
        let err = store
            .update_fields(&JobId::new("nope"), FieldUpdate::new().with_progress(1))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::NotFound(JobId::new("nope")));
    }
}
