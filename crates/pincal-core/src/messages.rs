//! Coordination protocol between tabs and the session coordinator
//!
//! ```text
//!  Tab                                   Coordinator
//!   │── init {ids, invitation, ports} ──▶│
//!   │◀──────────── ready-local {ids} ────│
//!   │◀──────────── webrtc-start ─────────│  (elected tab only)
//!   │── webrtc-start-success ───────────▶│
//!   │◀──────────── ready-shared ─────────│  (every tab)
//!   │◀──────────── webrtc-pollalive ─────│
//!   │── webrtc-pollalive-acq ───────────▶│
//!   │◀──────────── webrtc-stop ──────────│
//!   │── webrtc-stop-success ────────────▶│
//!   │◀──────────── disconnected ─────────│  (tab pruned, port closed)
//! ```

use std::fmt;

use crate::invitation::Invitation;
use crate::port::{DocumentPort, PortChannel, RawPort, Transfer};
use crate::types::{CalendarId, DocumentId};

/// One raw port per document store, moved from the tab to the coordinator
#[derive(Debug)]
pub struct DocumentPorts {
    pub ephemeral: DocumentPort,
    pub local: DocumentPort,
    pub shared: DocumentPort,
}

#[derive(Debug, Clone)]
pub struct InitMessage {
    pub calendar_id: CalendarId,
    pub document_id_ephemeral: Option<DocumentId>,
    pub document_id_local: Option<DocumentId>,
    pub invitation: Option<Invitation>,
    pub ports: Transfer<DocumentPorts>,
}

/// Tab to coordinator
#[derive(Debug, Clone)]
pub enum ToSharedRepo {
    Init(InitMessage),
    WebRtcStartSuccess,
    WebRtcStopSuccess,
    WebRtcPollAliveAcq,
}

impl ToSharedRepo {
    pub fn kind(&self) -> &'static str {
        match self {
            ToSharedRepo::Init(_) => "init",
            ToSharedRepo::WebRtcStartSuccess => "webrtc-start-success",
            ToSharedRepo::WebRtcStopSuccess => "webrtc-stop-success",
            ToSharedRepo::WebRtcPollAliveAcq => "webrtc-pollalive-acq",
        }
    }
}

/// Coordinator to tab
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FromSharedRepo {
    ReadyLocal {
        document_id_ephemeral: DocumentId,
        document_id_local: DocumentId,
    },
    ReadyShared,
    WebRtcStart {
        document_shared_available_locally_during_initialization: bool,
    },
    WebRtcStop,
    WebRtcPollAlive,
    /// Session initialization failed; the tab cannot proceed
    InitFailed { reason: String },
    /// The tab missed too many heartbeats and was dropped from the session.
    /// Last message on the connection.
    Disconnected,
}

impl FromSharedRepo {
    pub fn kind(&self) -> &'static str {
        match self {
            FromSharedRepo::ReadyLocal { .. } => "ready-local",
            FromSharedRepo::ReadyShared => "ready-shared",
            FromSharedRepo::WebRtcStart { .. } => "webrtc-start",
            FromSharedRepo::WebRtcStop => "webrtc-stop",
            FromSharedRepo::WebRtcPollAlive => "webrtc-pollalive",
            FromSharedRepo::InitFailed { .. } => "init-failed",
            FromSharedRepo::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for ToSharedRepo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

impl fmt::Display for FromSharedRepo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

/// The coordinator's end of a tab connection
pub type TabPort = PortChannel<FromSharedRepo, ToSharedRepo>;

/// The tab's end of its coordinator connection
pub type CoordinatorPort = PortChannel<ToSharedRepo, FromSharedRepo>;

/// Raw port a tab receives when it connects to a coordinator host
pub type CoordinatorConnection = RawPort<ToSharedRepo, FromSharedRepo>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names() {
        assert_eq!(ToSharedRepo::WebRtcPollAliveAcq.kind(), "webrtc-pollalive-acq");
        assert_eq!(
            FromSharedRepo::WebRtcStart {
                document_shared_available_locally_during_initialization: true
            }
            .to_string(),
            "webrtc-start"
        );
        assert_eq!(FromSharedRepo::Disconnected.kind(), "disconnected");
    }
}
