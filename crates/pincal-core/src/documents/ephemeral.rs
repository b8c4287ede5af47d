//! Ephemeral document: presence state that is never persisted

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{PeerConnectionId, PeerId, PeerMetadata};

/// What a device announces when it opens a peer link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectMetadata {
    pub peer_id: PeerId,
    pub peer_metadata: PeerMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EphemeralDocument {
    /// Devices with an open peer link, keyed by their connection ID
    #[serde(default)]
    pub connected_peers: BTreeMap<PeerConnectionId, ConnectMetadata>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape() {
        let mut doc = EphemeralDocument::default();
        doc.connected_peers.insert(
            PeerConnectionId::from("p1"),
            ConnectMetadata {
                peer_id: PeerId("repo-shared:x".to_string()),
                peer_metadata: PeerMetadata { is_ephemeral: false },
            },
        );
        assert_eq!(
            serde_json::to_value(&doc).unwrap(),
            json!({
                "connectedPeers": {
                    "p1": { "peerId": "repo-shared:x", "peerMetadata": { "isEphemeral": false } }
                }
            })
        );
    }
}
