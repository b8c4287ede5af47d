//! The three document kinds of a calendar session
//!
//! | kind      | persisted | versioned | contents                          |
//! |-----------|-----------|-----------|-----------------------------------|
//! | ephemeral | no        | no        | peers currently connected         |
//! | local     | yes       | yes       | this device's identity and peers  |
//! | shared    | yes       | yes       | pin catalog and pin calendar      |

mod ephemeral;
mod local;
mod shared;

pub use ephemeral::{ConnectMetadata, EphemeralDocument};
pub use local::{
    local_replica, InvitationOutcome, LocalDocument, LocalPeer, LocalReplica, RemotePeer,
    DEFAULT_DEVICE_NAME, LOCAL_DOCUMENT_SCHEMA_VERSION_CURRENT,
};
pub use shared::{
    shared_replica, PinCalendar, PinCatalog, SharedDocument, SharedReplica,
    SHARED_DOCUMENT_SCHEMA_VERSION_CURRENT,
};
