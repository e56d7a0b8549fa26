//! Strata Storage - Persistent Store Trait and Backends
//!
//! Durable key-value tables that survive restarts, one per cache layer plus
//! drafts and sync metadata. Values are JSON; keys are the composite strings
//! from `strata_core::keys`.
//!
//! Two backends implement [`PersistentStore`]:
//! - [`LmdbStore`]: memory-mapped LMDB via heed, one named database per table
//! - [`MemoryStore`]: in-process maps for tests and ephemeral sessions
//!
//! All cache-side writes go through a [`StoreWriter`], a single ordered
//! write-behind queue, so writes for one key apply in submission order and
//! never block the in-memory path.

pub mod lmdb;
pub mod memory;
pub mod sync_meta;
pub mod writer;

pub use lmdb::{LmdbStore, LmdbStoreError};
pub use memory::MemoryStore;
pub use sync_meta::SyncWatermarks;
pub use writer::StoreWriter;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use strata_core::{StorageError, StrataResult};

// ============================================================================
// TABLES
// ============================================================================

/// A persisted table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    EntityTypes,
    EntityInstances,
    EntityNames,
    EntityLinks,
    ForwardLinks,
    ReverseLinks,
    Drafts,
    Metadata,
}

impl Table {
    pub const ALL: [Table; 8] = [
        Table::EntityTypes,
        Table::EntityInstances,
        Table::EntityNames,
        Table::EntityLinks,
        Table::ForwardLinks,
        Table::ReverseLinks,
        Table::Drafts,
        Table::Metadata,
    ];

    /// Database name of this table.
    pub fn name(&self) -> &'static str {
        match self {
            Table::EntityTypes => "entity_types",
            Table::EntityInstances => "entity_instances",
            Table::EntityNames => "entity_names",
            Table::EntityLinks => "entity_links",
            Table::ForwardLinks => "forward_links",
            Table::ReverseLinks => "reverse_links",
            Table::Drafts => "drafts",
            Table::Metadata => "metadata",
        }
    }

    /// Tables wiped on logout. Drafts survive so unsaved edits can be
    /// recovered by the next session.
    pub fn is_session_scoped(&self) -> bool {
        !matches!(self, Table::Drafts)
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// WRITE OPERATIONS
// ============================================================================

/// One mutation of a persisted table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put {
        table: Table,
        key: String,
        value: Vec<u8>,
    },
    Delete {
        table: Table,
        key: String,
    },
    /// Remove every key starting with `prefix`.
    DeletePrefix {
        table: Table,
        prefix: String,
    },
    Clear {
        table: Table,
    },
}

impl WriteOp {
    /// Serialize `value` as JSON into a put.
    pub fn put_json<T: Serialize + ?Sized>(
        table: Table,
        key: impl Into<String>,
        value: &T,
    ) -> StrataResult<Self> {
        let key = key.into();
        let value = serde_json::to_vec(value).map_err(|e| StorageError::SerializationFailed {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        Ok(WriteOp::Put { table, key, value })
    }

    pub fn delete(table: Table, key: impl Into<String>) -> Self {
        WriteOp::Delete {
            table,
            key: key.into(),
        }
    }

    pub fn table(&self) -> Table {
        match self {
            WriteOp::Put { table, .. }
            | WriteOp::Delete { table, .. }
            | WriteOp::DeletePrefix { table, .. }
            | WriteOp::Clear { table } => *table,
        }
    }
}

/// Decode a JSON value read from a table.
pub fn decode_value<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> StrataResult<T> {
    serde_json::from_slice(bytes).map_err(|e| {
        StorageError::DeserializationFailed {
            key: key.to_string(),
            reason: e.to_string(),
        }
        .into()
    })
}

// ============================================================================
// STORE TRAIT
// ============================================================================

/// Statistics about store usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Reads that found a value.
    pub hits: u64,
    /// Reads that found nothing.
    pub misses: u64,
    /// Committed write batches.
    pub batches: u64,
    /// Individual operations across all committed batches.
    pub operations: u64,
}

impl StoreStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Durable key-value tables.
///
/// `apply` is atomic per batch: either every operation of the batch is
/// visible afterwards or none is.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    /// Read one value.
    async fn get(&self, table: Table, key: &str) -> StrataResult<Option<Vec<u8>>>;

    /// Read every entry whose key starts with `prefix`, in key order.
    /// An empty prefix scans the whole table.
    async fn scan(&self, table: Table, prefix: &str) -> StrataResult<Vec<(String, Vec<u8>)>>;

    /// Apply a batch of writes atomically.
    async fn apply(&self, batch: &[WriteOp]) -> StrataResult<()>;

    /// Get store statistics.
    async fn stats(&self) -> StrataResult<StoreStats>;
}

/// Load and decode every record of a table (or of one key prefix).
pub async fn load_records<T: DeserializeOwned>(
    store: &Arc<dyn PersistentStore>,
    table: Table,
    prefix: &str,
) -> StrataResult<Vec<(String, T)>> {
    let entries = store.scan(table, prefix).await?;
    entries
        .into_iter()
        .map(|(key, bytes)| {
            let value = decode_value(&key, &bytes)?;
            Ok((key, value))
        })
        .collect()
}

/// Load and decode one record.
pub async fn load_record<T: DeserializeOwned>(
    store: &Arc<dyn PersistentStore>,
    table: Table,
    key: &str,
) -> StrataResult<Option<T>> {
    match store.get(table, key).await? {
        Some(bytes) => Ok(Some(decode_value(key, &bytes)?)),
        None => Ok(None),
    }
}
