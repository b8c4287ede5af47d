//! Network subsystem of a repo
//!
//! Adapters turn some transport into a stream of peer connections. The
//! subsystem runs one task per connected peer that speaks the Automerge
//! sync protocol for every document the repo holds:
//!
//! ```text
//!   adapter ──PeerConnection──▶ accept loop ──spawn──▶ peer task
//!                                                        │  ▲
//!                             repo change broadcast ─────┘  │
//!                                  FrameLink (postcard RepoMessage)
//! ```
//!
//! Detaching an adapter cancels its token, which ends its accept loop and
//! every peer task it spawned.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use automerge::sync;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Repo;
use crate::error::{PincalError, PincalResult};
use crate::types::{DocumentId, PeerId, PeerMetadata};

/// Transport family of an adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdapterKind {
    /// In-process channel between a tab and its coordinator
    MessageChannel,
    /// Peer-to-peer link between devices
    WebRtc,
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterKind::MessageChannel => f.write_str("message-channel"),
            AdapterKind::WebRtc => f.write_str("webrtc"),
        }
    }
}

/// Identifies one attached adapter within a repo
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AdapterId(u64);

impl fmt::Display for AdapterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "adapter-{}", self.0)
    }
}

/// Bidirectional frame pipe to one remote peer
#[derive(Debug)]
pub struct FrameLink {
    pub tx: mpsc::UnboundedSender<Bytes>,
    pub rx: mpsc::UnboundedReceiver<Bytes>,
}

impl FrameLink {
    /// Create two connected link ends
    pub fn pair() -> (FrameLink, FrameLink) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            FrameLink { tx: a_tx, rx: b_rx },
            FrameLink { tx: b_tx, rx: a_rx },
        )
    }
}

/// A peer an adapter has finished handshaking with
#[derive(Debug)]
pub struct PeerConnection {
    pub peer_id: PeerId,
    pub metadata: PeerMetadata,
    pub link: FrameLink,
}

/// Everything an adapter receives when it is attached
pub struct AdapterContext {
    pub local_peer_id: PeerId,
    pub local_metadata: PeerMetadata,
    /// Hand finished connections to the repo here
    pub connections: mpsc::UnboundedSender<PeerConnection>,
    /// Cancelled when the adapter is detached
    pub shutdown: CancellationToken,
}

/// A transport that produces peer connections for a repo
pub trait NetworkAdapter: Send + 'static {
    fn kind(&self) -> AdapterKind;

    /// Start the adapter. The returned watch turns `true` once the adapter
    /// is ready; if it closes while still `false`, the adapter gave up.
    fn connect(self: Box<Self>, context: AdapterContext) -> watch::Receiver<bool>;
}

/// Returned by [`Network::add_adapter`]
#[derive(Debug, Clone)]
pub struct AdapterHandle {
    pub id: AdapterId,
    pub kind: AdapterKind,
    ready: watch::Receiver<bool>,
}

impl AdapterHandle {
    /// Wait until the adapter reports readiness
    pub async fn wait_ready(&mut self) -> PincalResult<()> {
        self.ready
            .wait_for(|ready| *ready)
            .await
            .map(|_| ())
            .map_err(|_| PincalError::ChannelClosed(format!("{} stopped before ready", self.id)))
    }
}

/// Summary of an attached adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterInfo {
    pub id: AdapterId,
    pub kind: AdapterKind,
}

/// Summary of a connected peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedPeer {
    pub peer_id: PeerId,
    pub metadata: PeerMetadata,
    pub adapter: AdapterId,
}

struct AttachedAdapter {
    info: AdapterInfo,
    shutdown: CancellationToken,
}

struct PeerEntry {
    metadata: PeerMetadata,
    adapter: AdapterId,
    links: usize,
}

#[derive(Default)]
pub(crate) struct NetworkState {
    next_adapter: AtomicU64,
    adapters: Mutex<Vec<AttachedAdapter>>,
    peers: Mutex<HashMap<PeerId, PeerEntry>>,
}

impl NetworkState {
    fn shutdown_all(&self) {
        for adapter in self.adapters.lock().drain(..) {
            adapter.shutdown.cancel();
        }
    }
}

impl Drop for NetworkState {
    fn drop(&mut self) {
        self.shutdown_all();
    }
}

/// Borrowed view of a repo's network subsystem
pub struct Network<'a> {
    pub(super) repo: &'a Repo,
}

impl Network<'_> {
    fn state(&self) -> &NetworkState {
        &self.repo.inner.network
    }

    /// Attach an adapter and start accepting its peers
    pub fn add_adapter(&self, adapter: impl NetworkAdapter) -> AdapterHandle {
        let state = self.state();
        let id = AdapterId(state.next_adapter.fetch_add(1, Ordering::Relaxed));
        let kind = adapter.kind();
        let shutdown = CancellationToken::new();
        let (connections, mut incoming) = mpsc::unbounded_channel();

        let ready = Box::new(adapter).connect(AdapterContext {
            local_peer_id: self.repo.peer_id().clone(),
            local_metadata: self.repo.metadata().clone(),
            connections,
            shutdown: shutdown.clone(),
        });

        // The accept loop holds a weak reference so a dropped repo stops it
        let repo = self.repo.downgrade();
        let token = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    connection = incoming.recv() => {
                        let Some(connection) = connection else { break };
                        let Some(repo) = repo.upgrade() else { break };
                        tokio::spawn(run_peer(repo, id, connection, token.child_token()));
                    }
                }
            }
            debug!(adapter = %id, "Adapter accept loop stopped");
        });

        state.adapters.lock().push(AttachedAdapter {
            info: AdapterInfo { id, kind },
            shutdown,
        });
        info!(repo = %self.repo.peer_id(), adapter = %id, %kind, "Network adapter attached");

        AdapterHandle { id, kind, ready }
    }

    /// Detach one adapter, closing every peer link it opened
    pub fn remove_adapter(&self, id: AdapterId) -> bool {
        let removed = {
            let mut adapters = self.state().adapters.lock();
            let index = adapters.iter().position(|a| a.info.id == id);
            index.map(|index| adapters.remove(index))
        };
        match removed {
            Some(adapter) => {
                adapter.shutdown.cancel();
                info!(repo = %self.repo.peer_id(), adapter = %id, "Network adapter detached");
                true
            }
            None => false,
        }
    }

    /// Detach every adapter of the given kind; returns how many were removed
    pub fn remove_adapters_of_kind(&self, kind: AdapterKind) -> usize {
        let ids: Vec<AdapterId> = self
            .adapters()
            .into_iter()
            .filter(|a| a.kind == kind)
            .map(|a| a.id)
            .collect();
        ids.into_iter().filter(|id| self.remove_adapter(*id)).count()
    }

    pub fn adapters(&self) -> Vec<AdapterInfo> {
        self.state().adapters.lock().iter().map(|a| a.info).collect()
    }

    pub fn has_adapters(&self) -> bool {
        !self.state().adapters.lock().is_empty()
    }

    pub fn connected_peers(&self) -> Vec<ConnectedPeer> {
        let mut peers: Vec<ConnectedPeer> = self
            .state()
            .peers
            .lock()
            .iter()
            .map(|(peer_id, entry)| ConnectedPeer {
                peer_id: peer_id.clone(),
                metadata: entry.metadata.clone(),
                adapter: entry.adapter,
            })
            .collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        peers
    }
}

/// Frames exchanged between peer tasks
#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum RepoMessage {
    /// Automerge sync message for a document the sender holds
    Sync { document_id: DocumentId, data: Vec<u8> },
    /// Sync message for a document the sender is still looking for
    Request { document_id: DocumentId, data: Vec<u8> },
    /// The receiver of a request does not have the document either
    Unavailable { document_id: DocumentId },
}

impl RepoMessage {
    pub(crate) fn encode(&self) -> PincalResult<Bytes> {
        Ok(Bytes::from(postcard::to_allocvec(self)?))
    }

    pub(crate) fn decode(frame: &[u8]) -> PincalResult<Self> {
        Ok(postcard::from_bytes(frame)?)
    }
}

struct PeerSession {
    repo: Repo,
    peer_id: PeerId,
    tx: mpsc::UnboundedSender<Bytes>,
    states: HashMap<DocumentId, sync::State>,
}

impl PeerSession {
    fn send(&self, message: RepoMessage) {
        match message.encode() {
            // A closed link ends the peer loop on its next receive
            Ok(frame) => {
                let _ = self.tx.send(frame);
            }
            Err(e) => warn!(peer = %self.peer_id, error = %e, "Failed to encode repo message"),
        }
    }

    fn sync_document(&mut self, document_id: DocumentId) {
        let Some(handle) = self.repo.handle(&document_id) else {
            return;
        };
        let state = self.states.entry(document_id).or_insert_with(sync::State::new);
        if let Some(message) = handle.generate_sync_message(state) {
            let data = message.encode();
            self.send(if handle.is_ready() {
                RepoMessage::Sync { document_id, data }
            } else {
                RepoMessage::Request { document_id, data }
            });
        }
    }

    fn sync_all(&mut self) {
        for document_id in self.repo.document_ids() {
            self.sync_document(document_id);
        }
    }

    fn handle_frame(&mut self, frame: &[u8]) -> PincalResult<()> {
        match RepoMessage::decode(frame)? {
            RepoMessage::Sync { document_id, data } => {
                let handle = self.repo.handle_for_sync(document_id);
                self.receive(&handle, document_id, &data)?;
            }
            RepoMessage::Request { document_id, data } => match self.repo.find_local(&document_id) {
                Ok(handle) => self.receive(&handle, document_id, &data)?,
                Err(_) => {
                    debug!(peer = %self.peer_id, document = %document_id, "Requested document unavailable here");
                    self.send(RepoMessage::Unavailable { document_id });
                }
            },
            RepoMessage::Unavailable { document_id } => {
                debug!(peer = %self.peer_id, document = %document_id, "Peer does not have document");
                self.states.remove(&document_id);
            }
        }
        Ok(())
    }

    fn receive(
        &mut self,
        handle: &super::DocHandle,
        document_id: DocumentId,
        data: &[u8],
    ) -> PincalResult<()> {
        let message = sync::Message::decode(data)
            .map_err(|e| PincalError::Serialization(e.to_string()))?;
        let state = self.states.entry(document_id).or_insert_with(sync::State::new);
        handle.receive_sync_message(state, message)?;
        self.sync_document(document_id);
        Ok(())
    }
}

async fn run_peer(
    repo: Repo,
    adapter: AdapterId,
    connection: PeerConnection,
    shutdown: CancellationToken,
) {
    let PeerConnection {
        peer_id,
        metadata,
        link: FrameLink { tx, mut rx },
    } = connection;

    repo.inner
        .network
        .peers
        .lock()
        .entry(peer_id.clone())
        .and_modify(|entry| entry.links += 1)
        .or_insert(PeerEntry {
            metadata,
            adapter,
            links: 1,
        });
    info!(repo = %repo.peer_id(), peer = %peer_id, %adapter, "Peer connected");

    let mut changes = repo.subscribe_changes();
    let mut session = PeerSession {
        repo: repo.clone(),
        peer_id: peer_id.clone(),
        tx,
        states: HashMap::new(),
    };
    session.sync_all();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = session.handle_frame(&frame) {
                    warn!(peer = %peer_id, error = %e, "Dropping malformed frame");
                }
            }
            change = changes.recv() => match change {
                Ok(document_id) => session.sync_document(document_id),
                Err(RecvError::Lagged(skipped)) => {
                    debug!(peer = %peer_id, skipped, "Change feed lagged, resyncing everything");
                    session.sync_all();
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    {
        let mut peers = repo.inner.network.peers.lock();
        if let Some(entry) = peers.get_mut(&peer_id) {
            entry.links -= 1;
            if entry.links == 0 {
                peers.remove(&peer_id);
            }
        }
    }
    info!(repo = %repo.peer_id(), peer = %peer_id, "Peer disconnected");
}
