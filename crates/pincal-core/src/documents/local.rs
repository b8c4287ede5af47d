//! Local document: this device's identity and the peers it knows about

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::PincalResult;
use crate::invitation::Invitation;
use crate::repo::DocHandle;
use crate::types::{DocumentId, PeerConnectionId};
use crate::versioned::VersionedReplica;

pub const LOCAL_DOCUMENT_SCHEMA_VERSION_CURRENT: u32 = 1;

/// Device name given to a freshly created local document
pub const DEFAULT_DEVICE_NAME: &str = "New device";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemotePeer {
    pub device_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalPeer {
    pub device_name: String,
    pub peer_connection_id: PeerConnectionId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id_shared: Option<DocumentId>,
    pub local_peer: LocalPeer,
    #[serde(default)]
    pub remote_peers: BTreeMap<PeerConnectionId, RemotePeer>,
}

/// How an invitation was reconciled with the stored shared document ID
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvitationOutcome {
    /// No shared ID was stored; the invitation's ID was adopted
    Adopted,
    /// The stored ID equals the invitation's
    Matched,
    /// A different ID is stored; it was kept and the invitation ignored
    Conflict {
        stored: DocumentId,
        suggested: DocumentId,
    },
}

impl LocalDocument {
    /// Fresh local document with a newly generated peer connection ID
    pub fn new_default() -> Self {
        Self {
            document_id_shared: None,
            local_peer: LocalPeer {
                device_name: DEFAULT_DEVICE_NAME.to_string(),
                peer_connection_id: PeerConnectionId::generate(),
            },
            remote_peers: BTreeMap::new(),
        }
    }

    /// Whether `id` is this device or an already registered remote peer
    pub fn knows_peer(&self, id: &PeerConnectionId) -> bool {
        self.local_peer.peer_connection_id == *id || self.remote_peers.contains_key(id)
    }

    /// Register a remote peer; returns `false` if it was already known
    pub fn add_peer(&mut self, id: PeerConnectionId, device_name: impl Into<String>) -> bool {
        if self.knows_peer(&id) {
            info!(peer = %id, "Not adding peer, because this peer is already known");
            return false;
        }
        info!(peer = %id, "Added new peer");
        self.remote_peers.insert(
            id,
            RemotePeer {
                device_name: device_name.into(),
            },
        );
        true
    }

    /// Reconcile an invitation; the first stored shared ID always wins
    ///
    /// The inviting peer is registered unless the IDs conflict. A conflict
    /// is returned, not logged; callers report it with their own context.
    pub fn apply_invitation(&mut self, invitation: &Invitation) -> InvitationOutcome {
        let outcome = match self.document_id_shared {
            None => {
                info!(document = %invitation.document_id, "Using suggested shared document ID");
                self.document_id_shared = Some(invitation.document_id);
                InvitationOutcome::Adopted
            }
            Some(stored) if stored == invitation.document_id => {
                info!(document = %stored, "Suggested shared document ID matches the stored one");
                InvitationOutcome::Matched
            }
            Some(stored) => {
                return InvitationOutcome::Conflict {
                    stored,
                    suggested: invitation.document_id,
                };
            }
        };
        // Device names are not part of invitations
        self.add_peer(invitation.peer_connection_id.clone(), "");
        outcome
    }
}

/// Local document as stored: inside a versioned envelope
pub type LocalReplica = VersionedReplica<LocalDocument>;

/// Wrap a handle to a versioned local document
pub fn local_replica(handle: DocHandle) -> LocalReplica {
    VersionedReplica::new(
        handle,
        "local",
        LOCAL_DOCUMENT_SCHEMA_VERSION_CURRENT,
        Some(LocalDocument::new_default),
    )
}

impl VersionedReplica<LocalDocument> {
    /// Register a remote peer as a tracked change
    pub fn add_peer(&self, id: PeerConnectionId, device_name: &str) -> PincalResult<bool> {
        if self.read()?.knows_peer(&id) {
            return Ok(false);
        }
        self.mutate(|local| local.add_peer(id, device_name))
    }

    /// Reconcile an invitation as a tracked change
    pub fn apply_invitation(&self, invitation: &Invitation) -> PincalResult<InvitationOutcome> {
        self.mutate(|local| local.apply_invitation(invitation))
    }

    /// The shared document ID, if one has been recorded
    pub fn document_id_shared(&self) -> PincalResult<Option<DocumentId>> {
        Ok(self.read()?.document_id_shared)
    }
}
