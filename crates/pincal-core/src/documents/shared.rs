//! Shared document: the collaboratively edited pin catalog and calendar
//!
//! Only the top-level shape matters to the sync layer; pins, categories,
//! and calendar days are carried as opaque JSON.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::repo::DocHandle;
use crate::versioned::VersionedReplica;

pub const SHARED_DOCUMENT_SCHEMA_VERSION_CURRENT: u32 = 1;

const PIN_CATALOG_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PinCatalog {
    pub version: u32,
    #[serde(default)]
    pub pins: BTreeMap<String, Value>,
    #[serde(default)]
    pub pin_categories: BTreeMap<String, Value>,
    /// IDs of pins and categories removed on every peer
    #[serde(default)]
    pub removed: Vec<String>,
}

impl Default for PinCatalog {
    fn default() -> Self {
        Self {
            version: PIN_CATALOG_VERSION,
            pins: BTreeMap::new(),
            pin_categories: BTreeMap::new(),
            removed: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PinCalendar {
    #[serde(default)]
    pub days: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedDocument {
    pub pin_catalog: PinCatalog,
    pub pin_calendar: PinCalendar,
}

/// Shared document as stored: inside a versioned envelope
pub type SharedReplica = VersionedReplica<SharedDocument>;

/// Wrap a handle to a versioned shared document
pub fn shared_replica(handle: DocHandle) -> SharedReplica {
    VersionedReplica::new(
        handle,
        "shared",
        SHARED_DOCUMENT_SCHEMA_VERSION_CURRENT,
        Some(SharedDocument::default),
    )
}
