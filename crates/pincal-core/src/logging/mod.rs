//! JSONL event log for coordinator and tab processes.
//!
//! Every process writes its own append-only file, so a demo with several
//! tabs and a coordinator can be replayed as one timeline afterwards.
//!
//! ```text
//! logs/
//! └── raw/                              # one file per instance per day
//!     ├── 2026-10-16_coordinator.jsonl
//!     └── 2026-10-16_tab-1.jsonl
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use pincal_core::logging::JsonlLayer;
//! use tracing_subscriber::prelude::*;
//!
//! tracing_subscriber::registry()
//!     .with(JsonlLayer::new("./logs", "coordinator")?)
//!     .with(tracing_subscriber::fmt::layer())
//!     .init();
//! ```
//!
//! Events that carry a `calendar` field are tagged with it at the top
//! level, which makes per-session queries easy:
//!
//! ```bash
//! jq 'select(.calendar == "01J...")' logs/raw/*.jsonl
//! ```

pub mod entry;
pub mod layer;
pub mod writer;

pub use entry::JsonLogEntry;
pub use layer::JsonlLayer;
pub use writer::{read_all_entries, read_calendar_entries, InstanceLogWriter};
