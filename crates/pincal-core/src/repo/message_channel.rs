//! Network adapter over an in-process port pair
//!
//! Both ends send a hello frame carrying their peer ID and metadata as the
//! first message. Once the remote hello arrives the port becomes a regular
//! peer link and the adapter reports ready.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::network::{AdapterContext, AdapterKind, FrameLink, NetworkAdapter, PeerConnection};
use crate::port::DocumentPort;
use crate::types::{PeerId, PeerMetadata};

#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    peer_id: PeerId,
    metadata: PeerMetadata,
}

/// Connects a repo to exactly one peer through a [`DocumentPort`]
pub struct MessageChannelAdapter {
    port: DocumentPort,
}

impl MessageChannelAdapter {
    pub fn new(port: DocumentPort) -> Self {
        Self { port }
    }
}

impl NetworkAdapter for MessageChannelAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::MessageChannel
    }

    fn connect(self: Box<Self>, context: AdapterContext) -> watch::Receiver<bool> {
        let (ready_tx, ready_rx) = watch::channel(false);
        let DocumentPort { tx, mut rx } = self.port;

        tokio::spawn(async move {
            let hello = Hello {
                peer_id: context.local_peer_id.clone(),
                metadata: context.local_metadata.clone(),
            };
            let frame = match postcard::to_allocvec(&hello) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "Failed to encode hello");
                    return;
                }
            };
            if tx.send(frame.into()).is_err() {
                debug!(peer = %context.local_peer_id, "Port closed before hello");
                return;
            }

            let first = tokio::select! {
                _ = context.shutdown.cancelled() => return,
                first = rx.recv() => first,
            };
            let Some(first) = first else {
                debug!(peer = %context.local_peer_id, "Port closed before remote hello");
                return;
            };
            let remote: Hello = match postcard::from_bytes(&first) {
                Ok(remote) => remote,
                Err(e) => {
                    warn!(error = %e, "Malformed hello on message channel");
                    return;
                }
            };

            debug!(local = %context.local_peer_id, remote = %remote.peer_id, "Message channel handshake complete");
            let connection = PeerConnection {
                peer_id: remote.peer_id,
                metadata: remote.metadata,
                link: FrameLink { tx, rx },
            };
            if context.connections.send(connection).is_ok() {
                let _ = ready_tx.send(true);
            }
        });

        ready_rx
    }
}
