//! Peer-to-peer transport seam
//!
//! The WebRTC adapter only needs a signalling layer that can register a
//! local connection ID, accept incoming data connections, and dial a remote
//! connection ID. [`MemoryTransport`] implements that in process for demos
//! and tests; a real deployment plugs in its WebRTC stack here.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{PincalError, PincalResult};
use crate::repo::FrameLink;
use crate::types::PeerConnectionId;

/// An open data connection to a remote device
#[derive(Debug)]
pub struct DataConnection {
    /// Connection ID of the device on the other end
    pub remote: PeerConnectionId,
    /// Opaque metadata the dialing side attached; empty for outbound links
    pub metadata: Bytes,
    pub link: FrameLink,
}

/// Signalling and data-channel layer used by the WebRTC adapter
pub trait PeerTransport: Send + Sync + 'static {
    /// Register `local` and receive every connection dialed to it
    fn listen(&self, local: &PeerConnectionId)
        -> PincalResult<mpsc::UnboundedReceiver<DataConnection>>;

    /// Open a data connection from `local` to `remote`
    ///
    /// Fails with [`PincalError::Transport`] if `remote` is not listening.
    fn connect(
        &self,
        local: &PeerConnectionId,
        remote: &PeerConnectionId,
        metadata: Bytes,
    ) -> PincalResult<DataConnection>;

    /// Unregister `local` once its listener is dropped. A newer listener
    /// for the same ID stays registered; open data connections stay open.
    fn close(&self, local: &PeerConnectionId);
}

/// In-process signalling hub shared by every device in a test or demo
#[derive(Clone, Default)]
pub struct MemoryTransport {
    listeners: Arc<Mutex<HashMap<PeerConnectionId, mpsc::UnboundedSender<DataConnection>>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `id` is currently registered
    pub fn is_listening(&self, id: &PeerConnectionId) -> bool {
        self.listeners
            .lock()
            .get(id)
            .is_some_and(|tx| !tx.is_closed())
    }
}

impl PeerTransport for MemoryTransport {
    fn listen(
        &self,
        local: &PeerConnectionId,
    ) -> PincalResult<mpsc::UnboundedReceiver<DataConnection>> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.listeners.lock().insert(local.clone(), tx).is_some() {
            debug!(peer = %local, "Replacing previous listener");
        }
        Ok(rx)
    }

    fn connect(
        &self,
        local: &PeerConnectionId,
        remote: &PeerConnectionId,
        metadata: Bytes,
    ) -> PincalResult<DataConnection> {
        let listener = self
            .listeners
            .lock()
            .get(remote)
            .cloned()
            .ok_or_else(|| PincalError::Transport(format!("peer-unavailable: {}", remote)))?;

        let (ours, theirs) = FrameLink::pair();
        listener
            .send(DataConnection {
                remote: local.clone(),
                metadata,
                link: theirs,
            })
            .map_err(|_| PincalError::Transport(format!("peer-unavailable: {}", remote)))?;

        Ok(DataConnection {
            remote: remote.clone(),
            metadata: Bytes::new(),
            link: ours,
        })
    }

    fn close(&self, local: &PeerConnectionId) {
        let mut listeners = self.listeners.lock();
        if listeners.get(local).is_some_and(|tx| tx.is_closed()) {
            listeners.remove(local);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dial_reaches_listener() {
        let transport = MemoryTransport::new();
        let a = PeerConnectionId::from("a");
        let b = PeerConnectionId::from("b");
        let mut incoming = transport.listen(&b).unwrap();

        let mut outbound = transport
            .connect(&a, &b, Bytes::from_static(b"meta"))
            .unwrap();
        let mut inbound = incoming.recv().await.unwrap();

        assert_eq!(inbound.remote, a);
        assert_eq!(inbound.metadata, Bytes::from_static(b"meta"));
        outbound.link.tx.send(Bytes::from_static(b"hi")).unwrap();
        assert_eq!(inbound.link.rx.recv().await.unwrap(), Bytes::from_static(b"hi"));
        inbound.link.tx.send(Bytes::from_static(b"yo")).unwrap();
        assert_eq!(outbound.link.rx.recv().await.unwrap(), Bytes::from_static(b"yo"));
    }

    #[test]
    fn test_dial_unknown_peer_fails() {
        let transport = MemoryTransport::new();
        let err = transport
            .connect(&"a".into(), &"nobody".into(), Bytes::new())
            .unwrap_err();
        assert!(matches!(err, PincalError::Transport(_)));
    }

    #[test]
    fn test_close_unregisters_dropped_listener() {
        let transport = MemoryTransport::new();
        let id = PeerConnectionId::from("a");
        let rx = transport.listen(&id).unwrap();
        assert!(transport.is_listening(&id));
        drop(rx);
        transport.close(&id);
        assert!(!transport.is_listening(&id));
        assert!(transport.connect(&"b".into(), &id, Bytes::new()).is_err());
    }

    #[test]
    fn test_close_keeps_newer_listener() {
        let transport = MemoryTransport::new();
        let id = PeerConnectionId::from("a");
        let old = transport.listen(&id).unwrap();
        let _new = transport.listen(&id).unwrap();
        drop(old);
        transport.close(&id);
        assert!(transport.is_listening(&id));
    }
}
