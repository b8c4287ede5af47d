//! Document store
//!
//! A [`Repo`] holds Automerge documents by [`DocumentId`], optionally backed
//! by redb storage, and syncs them with peers through its network subsystem.
//!
//! ```text
//! ┌──────────────────────────── Repo ────────────────────────────┐
//! │  handles: DocumentId → DocHandle      storage: redb (opt.)   │
//! │  changes: broadcast<DocumentId>                               │
//! │  network: adapters ─▶ peer tasks (Automerge sync protocol)    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Lookup order for [`Repo::find`] is memory, then storage, then connected
//! peers. With no adapter attached the network step is skipped and the
//! lookup fails immediately.

mod handle;
pub(crate) mod json;
mod message_channel;
mod network;
mod storage;

pub use handle::{DocHandle, Replica};
pub use message_channel::MessageChannelAdapter;
pub use network::{
    AdapterContext, AdapterHandle, AdapterId, AdapterInfo, AdapterKind, ConnectedPeer, FrameLink,
    Network, NetworkAdapter, PeerConnection,
};
pub use storage::DocumentStorage;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use automerge::AutoCommit;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::RepoConfig;
use crate::error::{PincalError, PincalResult};
use crate::types::{DocumentId, PeerId, PeerMetadata};
use network::NetworkState;

const CHANGE_FEED_CAPACITY: usize = 256;

/// A document store with an attachable network
#[derive(Clone)]
pub struct Repo {
    inner: Arc<RepoInner>,
}

struct RepoInner {
    peer_id: PeerId,
    metadata: PeerMetadata,
    config: RepoConfig,
    storage: Option<DocumentStorage>,
    handles: RwLock<HashMap<DocumentId, DocHandle>>,
    changes: broadcast::Sender<DocumentId>,
    network: NetworkState,
}

#[derive(Clone)]
pub(crate) struct WeakRepo(Weak<RepoInner>);

impl WeakRepo {
    pub(crate) fn upgrade(&self) -> Option<Repo> {
        self.0.upgrade().map(|inner| Repo { inner })
    }
}

impl fmt::Debug for Repo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repo")
            .field("peer_id", &self.inner.peer_id)
            .field("persistent", &self.inner.storage.is_some())
            .finish()
    }
}

impl Repo {
    /// Create a repo whose peer ID is `<prefix>:<ulid>`
    ///
    /// Repos without storage announce themselves as ephemeral.
    pub fn new(peer_prefix: &str, config: RepoConfig, storage: Option<DocumentStorage>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        let metadata = PeerMetadata {
            is_ephemeral: storage.is_none(),
        };
        Self {
            inner: Arc::new(RepoInner {
                peer_id: PeerId::with_prefix(peer_prefix),
                metadata,
                config,
                storage,
                handles: RwLock::new(HashMap::new()),
                changes,
                network: NetworkState::default(),
            }),
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.inner.peer_id
    }

    pub fn metadata(&self) -> &PeerMetadata {
        &self.inner.metadata
    }

    pub fn is_persistent(&self) -> bool {
        self.inner.storage.is_some()
    }

    pub fn network(&self) -> Network<'_> {
        Network { repo: self }
    }

    /// Create a new document seeded with `initial`
    pub fn create<T: Serialize>(&self, initial: &T) -> PincalResult<DocHandle> {
        let id = DocumentId::new();
        let handle = DocHandle::new(
            id,
            AutoCommit::new(),
            true,
            self.inner.changes.clone(),
            self.inner.storage.clone(),
        );
        let value = serde_json::to_value(initial)?;
        handle.change(|doc| json::reconcile(doc, &serde_json::Value::Null, &value))?;

        self.inner.handles.write().insert(id, handle.clone());
        info!(repo = %self.inner.peer_id, document = %id, "Created document");
        Ok(handle)
    }

    /// Create a document and wrap it in a typed replica
    pub fn create_replica<T: Serialize + DeserializeOwned>(
        &self,
        initial: &T,
    ) -> PincalResult<Replica<T>> {
        Ok(Replica::new(self.create(initial)?))
    }

    /// Look a document up in memory, then in storage
    pub fn find_local(&self, id: &DocumentId) -> PincalResult<DocHandle> {
        if let Some(handle) = self.handle(id) {
            if handle.is_ready() {
                return Ok(handle);
            }
            return Err(PincalError::DocumentNotFound(id.to_string()));
        }

        let Some(storage) = &self.inner.storage else {
            return Err(PincalError::DocumentNotFound(id.to_string()));
        };
        let Some(bytes) = storage.load_document(id)? else {
            return Err(PincalError::DocumentNotFound(id.to_string()));
        };
        let doc = AutoCommit::load(&bytes)?;

        let mut handles = self.inner.handles.write();
        // Another caller may have loaded it while storage was being read
        let handle = handles
            .entry(*id)
            .or_insert_with(|| {
                DocHandle::new(
                    *id,
                    doc,
                    true,
                    self.inner.changes.clone(),
                    self.inner.storage.clone(),
                )
            })
            .clone();
        debug!(repo = %self.inner.peer_id, document = %id, "Loaded document from storage");
        Ok(handle)
    }

    /// Look a document up locally, then ask connected peers for it
    pub async fn find(&self, id: &DocumentId) -> PincalResult<DocHandle> {
        match self.find_local(id) {
            Ok(handle) => return Ok(handle),
            Err(PincalError::DocumentNotFound(_)) => {}
            Err(e) => return Err(e),
        }

        if !self.network().has_adapters() {
            return Err(PincalError::DocumentNotFound(id.to_string()));
        }

        let (handle, created) = {
            let mut handles = self.inner.handles.write();
            match handles.get(id) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let handle = DocHandle::new(
                        *id,
                        AutoCommit::new(),
                        false,
                        self.inner.changes.clone(),
                        self.inner.storage.clone(),
                    );
                    handles.insert(*id, handle.clone());
                    (handle, true)
                }
            }
        };
        if created {
            debug!(repo = %self.inner.peer_id, document = %id, "Requesting document from peers");
            let _ = self.inner.changes.send(*id);
        }

        match tokio::time::timeout(self.inner.config.find_timeout, handle.wait_ready()).await {
            Ok(()) => Ok(handle),
            Err(_) => {
                warn!(repo = %self.inner.peer_id, document = %id, "Document unavailable from peers");
                let mut handles = self.inner.handles.write();
                if handles.get(id).is_some_and(|h| !h.is_ready()) {
                    handles.remove(id);
                }
                Err(PincalError::DocumentUnavailable(id.to_string()))
            }
        }
    }

    /// Find a document and wrap it in a typed replica
    pub async fn find_replica<T: Serialize + DeserializeOwned>(
        &self,
        id: &DocumentId,
    ) -> PincalResult<Replica<T>> {
        Ok(Replica::new(self.find(id).await?))
    }

    /// IDs of every document currently held in memory
    pub fn document_ids(&self) -> Vec<DocumentId> {
        self.inner.handles.read().keys().copied().collect()
    }

    /// IDs of every persisted document
    pub fn stored_document_ids(&self) -> PincalResult<Vec<DocumentId>> {
        match &self.inner.storage {
            Some(storage) => storage.list_documents(),
            None => Ok(Vec::new()),
        }
    }

    pub(crate) fn handle(&self, id: &DocumentId) -> Option<DocHandle> {
        self.inner.handles.read().get(id).cloned()
    }

    /// Handle for an incoming sync message, created empty if unknown
    pub(crate) fn handle_for_sync(&self, id: DocumentId) -> DocHandle {
        if let Ok(handle) = self.find_local(&id) {
            return handle;
        }
        self.inner
            .handles
            .write()
            .entry(id)
            .or_insert_with(|| {
                DocHandle::new(
                    id,
                    AutoCommit::new(),
                    false,
                    self.inner.changes.clone(),
                    self.inner.storage.clone(),
                )
            })
            .clone()
    }

    pub(crate) fn subscribe_changes(&self) -> broadcast::Receiver<DocumentId> {
        self.inner.changes.subscribe()
    }

    pub(crate) fn downgrade(&self) -> WeakRepo {
        WeakRepo(Arc::downgrade(&self.inner))
    }
}
