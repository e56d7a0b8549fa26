//! Strata Core - Entity Types
//!
//! Pure data structures shared by every Strata crate: the entity model,
//! the derived link-index records, composite persistence keys, and the
//! error taxonomy. No I/O lives here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod entities;
mod error;
pub mod keys;

pub use entities::{
    Completeness, EntityInstance, EntityInstanceName, EntityLink, EntityRef, EntityType,
    ForwardRecord, NameMap, ParentRef, ReverseRecord, DEFAULT_RELATIONSHIP,
};
pub use error::{
    ConfigError, RemoteError, StorageError, StrataError, StrataResult, ValidationError,
};
pub use keys::{CompositeKey, ForwardKey, LinkKey};

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

// ============================================================================
// SYNC LAYERS
// ============================================================================

/// A cache layer that is refreshed from its own remote endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncLayer {
    EntityTypes,
    EntityInstances,
    EntityLinks,
}

impl SyncLayer {
    pub const ALL: [SyncLayer; 3] = [
        SyncLayer::EntityTypes,
        SyncLayer::EntityInstances,
        SyncLayer::EntityLinks,
    ];

    /// Key of this layer's last-sync timestamp in the metadata table.
    pub fn metadata_key(&self) -> &'static str {
        match self {
            SyncLayer::EntityTypes => "entityTypesLastSync",
            SyncLayer::EntityInstances => "entityInstanceLastSync",
            SyncLayer::EntityLinks => "entityLinksLastSync",
        }
    }

    /// Whether the layer's endpoint accepts `since` for delta fetches.
    pub fn supports_delta(&self) -> bool {
        !matches!(self, SyncLayer::EntityTypes)
    }
}

impl std::fmt::Display for SyncLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SyncLayer::EntityTypes => "entity_types",
            SyncLayer::EntityInstances => "entity_instances",
            SyncLayer::EntityLinks => "entity_links",
        };
        f.write_str(name)
    }
}

/// Last successful sync of one layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStamp {
    pub layer: SyncLayer,
    pub synced_at: Timestamp,
}

impl SyncStamp {
    pub fn new(layer: SyncLayer, synced_at: Timestamp) -> Self {
        Self { layer, synced_at }
    }

    /// Check if this stamp is newer than another for the same layer.
    pub fn is_newer_than(&self, other: &SyncStamp) -> bool {
        self.synced_at > other.synced_at
    }
}
