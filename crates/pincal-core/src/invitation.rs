//! Invitation links
//!
//! An invitation travels in a URL fragment:
//!
//! ```text
//! #action=addPeer&documentId=<base58>&peerConnectionId=<id>
//! ```
//!
//! Keys and values are percent-encoded. Unknown keys are ignored so newer
//! links stay readable by older builds.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{PincalError, PincalResult};
use crate::types::{DocumentId, PeerConnectionId};

/// What an invitation asks the receiving device to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InvitationAction {
    /// Join the shared document and register the inviting device
    AddPeer,
}

impl InvitationAction {
    fn as_str(&self) -> &'static str {
        match self {
            InvitationAction::AddPeer => "addPeer",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invitation {
    pub action: InvitationAction,
    pub document_id: DocumentId,
    pub peer_connection_id: PeerConnectionId,
}

impl Invitation {
    pub fn add_peer(document_id: DocumentId, peer_connection_id: PeerConnectionId) -> Self {
        Self {
            action: InvitationAction::AddPeer,
            document_id,
            peer_connection_id,
        }
    }

    /// Render as a URL fragment, including the leading `#`
    pub fn encode(&self) -> String {
        format!(
            "#action={}&documentId={}&peerConnectionId={}",
            self.action.as_str(),
            urlencoding::encode(&self.document_id.to_base58()),
            urlencoding::encode(self.peer_connection_id.as_str()),
        )
    }

    /// Parse a URL fragment; the leading `#` is optional
    pub fn decode(hash: &str) -> PincalResult<Self> {
        let mut action = None;
        let mut document_id = None;
        let mut peer_connection_id = None;

        for pair in hash.trim_start_matches('#').split('&') {
            if pair.is_empty() {
                continue;
            }
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let key = decode_component(key)?;
            let value = decode_component(value)?;
            match key.as_str() {
                "action" => action = Some(value),
                "documentId" => document_id = Some(value),
                "peerConnectionId" => peer_connection_id = Some(value),
                _ => {}
            }
        }

        match action.as_deref() {
            Some("addPeer") => {}
            Some(other) => {
                return Err(PincalError::InvalidInvitation(format!(
                    "unknown action: {}",
                    other
                )))
            }
            None => return Err(PincalError::InvalidInvitation("missing action".to_string())),
        }

        let document_id = document_id
            .ok_or_else(|| PincalError::InvalidInvitation("missing documentId".to_string()))?;
        let document_id = DocumentId::from_base58(&document_id)
            .map_err(|e| PincalError::InvalidInvitation(e.to_string()))?;

        let peer_connection_id = peer_connection_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| PincalError::InvalidInvitation("missing peerConnectionId".to_string()))?;

        Ok(Self::add_peer(document_id, PeerConnectionId(peer_connection_id)))
    }
}

impl fmt::Display for Invitation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

fn decode_component(raw: &str) -> PincalResult<String> {
    urlencoding::decode(raw)
        .map(|cow| cow.into_owned())
        .map_err(|e| PincalError::InvalidInvitation(e.to_string()))
}
