//! WebRTC network adapter for the shared document repo
//!
//! Only the tab elected by the coordinator runs this adapter. It registers
//! the device's peer connection ID with a [`PeerTransport`], dials every
//! remote peer listed in the local document, and accepts incoming links.
//!
//! Handshake on each data connection:
//!
//! ```text
//!  dialer                                   listener
//!    │── connect(metadata = ConnectMetadata) ──▶│
//!    │◀──────── ConnectResponse{metadata} ──────│
//!    │◀═════════ repo sync frames ═════════════▶│
//! ```
//!
//! Every opened connection registers the remote device in the local
//! document and in the ephemeral document's `connectedPeers`.

mod transport;

pub use transport::{DataConnection, MemoryTransport, PeerTransport};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::documents::{ConnectMetadata, EphemeralDocument, LocalReplica};
use crate::repo::{AdapterContext, AdapterKind, FrameLink, NetworkAdapter, PeerConnection, Replica};
use crate::types::PeerConnectionId;

#[derive(Debug, Serialize, Deserialize)]
struct ConnectResponse {
    metadata: ConnectMetadata,
}

/// Everything the adapter needs from the tab that runs it
#[derive(Clone)]
pub struct WebRtcAdapterOptions {
    pub transport: Arc<dyn PeerTransport>,
    pub local: LocalReplica,
    pub ephemeral: Replica<EphemeralDocument>,
    /// `None`: ready right away. `Some(grace)`: ready at the first peer
    /// connection, or once `grace` elapses.
    pub wait_for_peer: Option<Duration>,
}

pub struct WebRtcAdapter {
    options: WebRtcAdapterOptions,
}

impl WebRtcAdapter {
    pub fn new(options: WebRtcAdapterOptions) -> Self {
        Self { options }
    }
}

impl NetworkAdapter for WebRtcAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::WebRtc
    }

    fn connect(self: Box<Self>, context: AdapterContext) -> watch::Receiver<bool> {
        let (ready_tx, ready_rx) = watch::channel(false);
        tokio::spawn(run(self.options, context, ready_tx));
        ready_rx
    }
}

struct Session {
    options: WebRtcAdapterOptions,
    context: AdapterContext,
    ready: watch::Sender<bool>,
    announce: ConnectMetadata,
    /// Open links per remote device
    connected: HashMap<PeerConnectionId, usize>,
    closed_tx: mpsc::UnboundedSender<PeerConnectionId>,
}

impl Session {
    fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    fn set_ready(&self) {
        if !self.is_ready() {
            info!("WebRTC network adapter set to ready");
            let _ = self.ready.send(true);
        }
    }

    fn accept_inbound(&mut self, connection: DataConnection) {
        let DataConnection {
            remote,
            metadata,
            link,
        } = connection;
        let remote_metadata: ConnectMetadata = match postcard::from_bytes(&metadata) {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(peer = %remote, error = %e, "Rejecting connection with malformed metadata");
                return;
            }
        };

        let response = ConnectResponse {
            metadata: self.announce.clone(),
        };
        match postcard::to_allocvec(&response) {
            Ok(frame) => {
                if link.tx.send(Bytes::from(frame)).is_err() {
                    debug!(peer = %remote, "Inbound connection closed before response");
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to encode connect response");
                return;
            }
        }
        self.on_connection_opened(remote, remote_metadata, link);
    }

    fn on_connection_opened(&mut self, remote: PeerConnectionId, metadata: ConnectMetadata, link: FrameLink) {
        info!(peer = %remote, repo_peer = %metadata.peer_id, "Connection established");

        if let Err(e) = self.options.local.add_peer(remote.clone(), "") {
            warn!(peer = %remote, error = %e, "Failed to record peer in local document");
        }
        *self.connected.entry(remote.clone()).or_default() += 1;
        let presence = metadata.clone();
        let key = remote.clone();
        if let Err(e) = self.options.ephemeral.mutate(move |doc| {
            doc.connected_peers.insert(key, presence);
        }) {
            warn!(peer = %remote, error = %e, "Failed to record connected peer");
        }

        let (repo_side, relay_side) = FrameLink::pair();
        tokio::spawn(relay(
            link,
            relay_side,
            remote,
            self.closed_tx.clone(),
            self.context.shutdown.clone(),
        ));

        let connection = PeerConnection {
            peer_id: metadata.peer_id,
            metadata: metadata.peer_metadata,
            link: repo_side,
        };
        if self.context.connections.send(connection).is_ok() {
            self.set_ready();
        }
    }

    fn on_peer_disconnected(&mut self, remote: PeerConnectionId) {
        let Some(count) = self.connected.get_mut(&remote) else {
            return;
        };
        *count -= 1;
        if *count > 0 {
            return;
        }
        self.connected.remove(&remote);
        info!(peer = %remote, "Peer disconnected");
        self.forget_presence(&remote);
    }

    fn forget_presence(&self, remote: &PeerConnectionId) {
        if let Err(e) = self.options.ephemeral.mutate(|doc| {
            doc.connected_peers.remove(remote);
        }) {
            warn!(peer = %remote, error = %e, "Failed to clear connected peer");
        }
    }
}

async fn run(options: WebRtcAdapterOptions, context: AdapterContext, ready: watch::Sender<bool>) {
    let local = match options.local.read() {
        Ok(local) => local,
        Err(e) => {
            error!(error = %e, "WebRTC adapter cannot read the local document");
            return;
        }
    };
    let local_id = local.local_peer.peer_connection_id.clone();

    let mut incoming = match options.transport.listen(&local_id) {
        Ok(incoming) => incoming,
        Err(e) => {
            error!(peer = %local_id, error = %e, "Failed to open peer transport");
            return;
        }
    };
    info!(peer = %local_id, "Connected to signalling layer");

    let announce = ConnectMetadata {
        peer_id: context.local_peer_id.clone(),
        peer_metadata: context.local_metadata.clone(),
    };
    let encoded = match postcard::to_allocvec(&announce) {
        Ok(encoded) => Bytes::from(encoded),
        Err(e) => {
            error!(error = %e, "Failed to encode connect metadata");
            return;
        }
    };

    let (opened_tx, mut opened_rx) = mpsc::unbounded_channel();
    for remote in local.remote_peers.keys() {
        match options.transport.connect(&local_id, remote, encoded.clone()) {
            Ok(connection) => {
                tokio::spawn(await_response(
                    connection,
                    opened_tx.clone(),
                    context.shutdown.clone(),
                ));
            }
            Err(e) => info!(peer = %remote, error = %e, "Remote peer unavailable"),
        }
    }
    drop(opened_tx);

    let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
    let shutdown = context.shutdown.clone();
    let transport = options.transport.clone();
    let mut session = Session {
        options,
        context,
        ready,
        announce,
        connected: HashMap::new(),
        closed_tx,
    };

    let grace_period = match session.options.wait_for_peer {
        Some(grace) if !local.remote_peers.is_empty() => Some(grace),
        _ => {
            session.set_ready();
            None
        }
    };
    let grace = tokio::time::sleep(grace_period.unwrap_or_default());
    tokio::pin!(grace);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            connection = incoming.recv() => match connection {
                Some(connection) => session.accept_inbound(connection),
                None => break,
            },
            Some((remote, metadata, link)) = opened_rx.recv() => {
                session.on_connection_opened(remote, metadata, link);
            }
            Some(remote) = closed_rx.recv() => session.on_peer_disconnected(remote),
            _ = &mut grace, if grace_period.is_some() && !session.is_ready() => {
                info!("No peer connected within the grace period");
                session.set_ready();
            }
        }
    }

    drop(incoming);
    transport.close(&local_id);
    for remote in session.connected.keys() {
        session.forget_presence(remote);
    }
    info!(peer = %local_id, "WebRTC network adapter stopped");
}

/// Wait for the listener's response on an outbound connection
async fn await_response(
    connection: DataConnection,
    opened: mpsc::UnboundedSender<(PeerConnectionId, ConnectMetadata, FrameLink)>,
    shutdown: CancellationToken,
) {
    let DataConnection {
        remote, mut link, ..
    } = connection;
    let frame = tokio::select! {
        _ = shutdown.cancelled() => return,
        frame = link.rx.recv() => frame,
    };
    let Some(frame) = frame else {
        debug!(peer = %remote, "Outbound connection closed before response");
        return;
    };
    match postcard::from_bytes::<ConnectResponse>(&frame) {
        Ok(response) => {
            debug!(peer = %remote, "Received connect response");
            let _ = opened.send((remote, response.metadata, link));
        }
        Err(e) => warn!(peer = %remote, error = %e, "Malformed connect response"),
    }
}

/// Forward frames between the transport link and the repo's link, and
/// report when either side closes
async fn relay(
    mut external: FrameLink,
    mut internal: FrameLink,
    remote: PeerConnectionId,
    closed: mpsc::UnboundedSender<PeerConnectionId>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = external.rx.recv() => {
                let Some(frame) = frame else { break };
                if internal.tx.send(frame).is_err() {
                    break;
                }
            }
            frame = internal.rx.recv() => {
                let Some(frame) = frame else { break };
                if external.tx.send(frame).is_err() {
                    break;
                }
            }
        }
    }
    let _ = closed.send(remote);
}
