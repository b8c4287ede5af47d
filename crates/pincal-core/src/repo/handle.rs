//! Document handles and typed replicas
//!
//! A [`DocHandle`] owns one Automerge document inside a repo. Every change,
//! whether made locally or received from a peer, bumps a revision counter
//! that subscribers observe, is broadcast to the repo's peer tasks, and is
//! written to storage when the repo has one.
//!
//! A [`Replica`] is the typed view over a handle: reads hydrate the document
//! into `T`, writes hand out a mutable draft and reconcile the edits back.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use automerge::sync::{self, SyncDoc};
use automerge::transaction::CommitOptions;
use automerge::AutoCommit;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use super::json;
use super::storage::DocumentStorage;
use crate::error::{PincalError, PincalResult};
use crate::types::DocumentId;

/// Handle to one document held by a repo
#[derive(Clone)]
pub struct DocHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    id: DocumentId,
    doc: Mutex<AutoCommit>,
    ready: watch::Sender<bool>,
    revision: watch::Sender<u64>,
    changes: broadcast::Sender<DocumentId>,
    storage: Option<DocumentStorage>,
}

impl DocHandle {
    pub(crate) fn new(
        id: DocumentId,
        doc: AutoCommit,
        ready: bool,
        changes: broadcast::Sender<DocumentId>,
        storage: Option<DocumentStorage>,
    ) -> Self {
        let (ready, _) = watch::channel(ready);
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(HandleInner {
                id,
                doc: Mutex::new(doc),
                ready,
                revision,
                changes,
                storage,
            }),
        }
    }

    pub fn document_id(&self) -> DocumentId {
        self.inner.id
    }

    /// Whether the document has content (created locally, loaded, or synced)
    pub fn is_ready(&self) -> bool {
        *self.inner.ready.borrow()
    }

    /// Wait until the document has content
    pub async fn wait_ready(&self) {
        let mut ready = self.inner.ready.subscribe();
        // The sender lives in `self`, so this cannot observe a closed channel
        let _ = ready.wait_for(|ready| *ready).await;
    }

    /// Subscribe to the revision counter; it changes on every document change
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    /// Current revision counter
    pub fn revision(&self) -> u64 {
        *self.inner.revision.borrow()
    }

    /// Hydrate the whole document as JSON
    pub fn value(&self) -> PincalResult<serde_json::Value> {
        let doc = self.inner.doc.lock();
        json::hydrate(&doc)
    }

    /// Serialize the document to Automerge's binary format
    pub fn save(&self) -> Vec<u8> {
        self.inner.doc.lock().save()
    }

    /// Apply a local change.
    ///
    /// The closure's edits are committed as one change. If it fails, the
    /// edits are rolled back and nothing is published.
    pub fn change<R>(
        &self,
        f: impl FnOnce(&mut AutoCommit) -> PincalResult<R>,
    ) -> PincalResult<R> {
        let (changed, result) = {
            let mut doc = self.inner.doc.lock();
            let before = doc.get_heads();
            let result = match f(&mut doc) {
                Ok(result) => result,
                Err(e) => {
                    doc.rollback();
                    return Err(e);
                }
            };
            doc.commit_with(CommitOptions::default().with_time(chrono::Utc::now().timestamp()));
            let changed = doc.get_heads() != before;
            if changed {
                self.persist(&mut doc);
            }
            (changed, result)
        };

        if changed {
            self.mark_ready();
            self.publish();
        }
        Ok(result)
    }

    pub(crate) fn generate_sync_message(&self, state: &mut sync::State) -> Option<sync::Message> {
        self.inner.doc.lock().sync().generate_sync_message(state)
    }

    /// Apply a sync message from a peer; returns whether the document changed
    pub(crate) fn receive_sync_message(
        &self,
        state: &mut sync::State,
        message: sync::Message,
    ) -> PincalResult<bool> {
        let (changed, has_content) = {
            let mut doc = self.inner.doc.lock();
            let before = doc.get_heads();
            doc.sync().receive_sync_message(state, message)?;
            let after = doc.get_heads();
            let changed = after != before;
            if changed {
                self.persist(&mut doc);
            }
            (changed, !after.is_empty())
        };

        if has_content {
            self.mark_ready();
        }
        if changed {
            debug!(document = %self.inner.id, "Applied remote changes");
            self.publish();
        }
        Ok(changed)
    }

    fn mark_ready(&self) {
        self.inner.ready.send_if_modified(|ready| !std::mem::replace(ready, true));
    }

    fn publish(&self) {
        self.inner.revision.send_modify(|revision| *revision += 1);
        // No receivers just means no peers are attached
        let _ = self.inner.changes.send(self.inner.id);
    }

    fn persist(&self, doc: &mut AutoCommit) {
        if let Some(storage) = &self.inner.storage {
            if let Err(e) = storage.save_document(&self.inner.id, &doc.save()) {
                warn!(document = %self.inner.id, error = %e, "Failed to persist document");
            }
        }
    }
}

impl fmt::Debug for DocHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocHandle")
            .field("id", &self.inner.id)
            .field("ready", &self.is_ready())
            .finish()
    }
}

/// Typed, reactive view over a document
pub struct Replica<T> {
    handle: DocHandle,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Replica<T> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Replica<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Replica").field(&self.handle.document_id()).finish()
    }
}

impl<T: Serialize + DeserializeOwned> Replica<T> {
    pub fn new(handle: DocHandle) -> Self {
        Self {
            handle,
            _marker: PhantomData,
        }
    }

    pub fn handle(&self) -> &DocHandle {
        &self.handle
    }

    pub fn document_id(&self) -> DocumentId {
        self.handle.document_id()
    }

    /// Read the current value
    pub fn read(&self) -> PincalResult<T> {
        let value = self.handle.value()?;
        serde_json::from_value(value).map_err(PincalError::from)
    }

    /// Edit a draft of the current value; the edits become one tracked change
    pub fn mutate<R>(&self, f: impl FnOnce(&mut T) -> R) -> PincalResult<R> {
        self.handle.change(|doc| {
            let old = json::hydrate(doc)?;
            let mut draft: T = serde_json::from_value(old.clone())?;
            let result = f(&mut draft);
            let new = serde_json::to_value(&draft)?;
            json::reconcile(doc, &old, &new)?;
            Ok(result)
        })
    }

    /// Observe changes; the receiver is marked changed on every update
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.handle.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::collections::BTreeMap;

    #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
    struct Counter {
        #[serde(default)]
        values: BTreeMap<String, i64>,
    }

    fn handle() -> (DocHandle, broadcast::Receiver<DocumentId>) {
        let (changes, rx) = broadcast::channel(16);
        (
            DocHandle::new(DocumentId::new(), AutoCommit::new(), true, changes, None),
            rx,
        )
    }

    #[test]
    fn test_replica_mutate_then_read() {
        let (handle, _rx) = handle();
        let replica: Replica<Counter> = Replica::new(handle);

        replica
            .mutate(|c| {
                c.values.insert("a".to_string(), 1);
            })
            .unwrap();

        assert_eq!(replica.read().unwrap().values.get("a"), Some(&1));
    }

    #[test]
    fn test_change_publishes_revision_and_id() {
        let (handle, mut rx) = handle();
        let replica: Replica<Counter> = Replica::new(handle.clone());
        let revisions = replica.subscribe();

        replica
            .mutate(|c| {
                c.values.insert("x".to_string(), 7);
            })
            .unwrap();

        assert_eq!(*revisions.borrow(), 1);
        assert_eq!(rx.try_recv().unwrap(), handle.document_id());
    }

    #[test]
    fn test_noop_mutation_publishes_nothing() {
        let (handle, mut rx) = handle();
        let replica: Replica<Counter> = Replica::new(handle.clone());
        replica.mutate(|_| ()).unwrap();

        assert_eq!(handle.revision(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_failed_change_rolls_back() {
        let (handle, _rx) = handle();
        let err = handle
            .change(|doc| {
                use automerge::transaction::Transactable;
                doc.put(automerge::ROOT, "partial", 1)?;
                Err::<(), _>(PincalError::Timeout("abort".to_string()))
            })
            .unwrap_err();

        assert!(matches!(err, PincalError::Timeout(_)));
        assert_eq!(handle.value().unwrap(), serde_json::json!({}));
    }

    #[test]
    fn test_sync_between_handles() {
        let (left, _l) = handle();
        let (changes, _r) = broadcast::channel(16);
        let right = DocHandle::new(left.document_id(), AutoCommit::new(), false, changes, None);

        Replica::<Counter>::new(left.clone())
            .mutate(|c| {
                c.values.insert("k".to_string(), 42);
            })
            .unwrap();

        let mut left_state = sync::State::new();
        let mut right_state = sync::State::new();
        for _ in 0..4 {
            if let Some(msg) = left.generate_sync_message(&mut left_state) {
                right.receive_sync_message(&mut right_state, msg).unwrap();
            }
            if let Some(msg) = right.generate_sync_message(&mut right_state) {
                left.receive_sync_message(&mut left_state, msg).unwrap();
            }
        }

        assert!(right.is_ready());
        let counter: Counter = Replica::new(right).read().unwrap();
        assert_eq!(counter.values.get("k"), Some(&42));
    }
}
