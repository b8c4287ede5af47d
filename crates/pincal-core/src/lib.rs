//! Pin Calendar Core Library
//!
//! Local-first calendar documents synced between tabs and devices, with
//! exactly one tab per calendar holding the device-to-device connection.
//!
//! ## Overview
//!
//! Every calendar has three Automerge documents:
//!
//! - **Ephemeral**: presence of currently connected devices, never persisted
//! - **Local**: this device's identity and the devices it knows, persisted
//!   but never sent to other devices
//! - **Shared**: the calendar content, persisted and synced with every device
//!
//! A [`SharedRepo`] coordinator per calendar holds the authoritative copies
//! and relays changes between the calendar's tabs. It elects one tab to run
//! the WebRTC adapter and re-elects when that tab stops answering.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use pincal_core::{CalendarId, CoordinatorHost, MemoryTransport, TabBootstrapper};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let host = CoordinatorHost::new(Default::default(), None);
//!     let tab = TabBootstrapper::new(Default::default(), Arc::new(MemoryTransport::new()));
//!
//!     let calendar = CalendarId::new();
//!     let app = tab.load(host.connect(), calendar, None, None, None).await?;
//!     println!("Invite another device: {}", app.invitation()?);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod coordinator;
pub mod documents;
pub mod error;
pub mod invitation;
pub mod logging;
pub mod messages;
pub mod port;
pub mod repo;
pub mod tab;
pub mod types;
pub mod versioned;
pub mod webrtc;

// Re-exports
pub use config::{CoordinatorConfig, RepoConfig, TabConfig};
pub use coordinator::{CoordinatorHost, ElectionStatus, SessionRegistry, SharedRepo, TabId};
pub use documents::{EphemeralDocument, LocalDocument, SharedDocument};
pub use error::{PincalError, PincalResult};
pub use invitation::{Invitation, InvitationAction};
pub use messages::{FromSharedRepo, ToSharedRepo};
pub use port::{message_channel, PortChannel};
pub use repo::{AdapterKind, DocHandle, DocumentStorage, Replica, Repo};
pub use tab::{CalendarApp, TabBootstrapper, TabEvent};
pub use types::*;
pub use versioned::{Versioned, VersionedReplica};
pub use webrtc::{MemoryTransport, PeerTransport, WebRtcAdapter};
