//! Per-layer sync watermarks.
//!
//! Each sync layer remembers the server time of its last successful fetch
//! under a fixed key of the metadata table. The next fetch sends that time
//! as `since` to receive only the delta. Watermarks only move forward: a
//! late response carrying an older time never rewinds them.
//!
//! Moving a watermark is two steps: [`SyncWatermarks::prepare`] builds the
//! metadata write, and [`SyncWatermarks::commit`] updates memory once that
//! write reached the store, so memory never runs ahead of the store.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use strata_core::{StrataResult, SyncLayer, SyncStamp, Timestamp};

use crate::{load_record, PersistentStore, Table, WriteOp};

/// In-memory view of the persisted last-sync times.
#[derive(Debug, Default)]
pub struct SyncWatermarks {
    stamps: RwLock<HashMap<SyncLayer, SyncStamp>>,
}

impl SyncWatermarks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read every layer's last-sync time from the metadata table.
    pub async fn load(store: &Arc<dyn PersistentStore>) -> StrataResult<Self> {
        let watermarks = Self::new();
        for layer in SyncLayer::ALL {
            let synced_at: Option<Timestamp> =
                load_record(store, Table::Metadata, layer.metadata_key()).await?;
            if let Some(synced_at) = synced_at {
                watermarks.commit(SyncStamp::new(layer, synced_at))?;
            }
        }
        Ok(watermarks)
    }

    /// Last successful sync of a layer, if any.
    pub fn last_sync(&self, layer: SyncLayer) -> Option<Timestamp> {
        self.stamps
            .read()
            .ok()
            .and_then(|stamps| stamps.get(&layer).map(|s| s.synced_at))
    }

    /// The metadata write that persists `stamp`, or `None` when `stamp` is
    /// not newer than what is already recorded. Memory is left unchanged.
    pub fn prepare(&self, stamp: SyncStamp) -> StrataResult<Option<WriteOp>> {
        let Ok(stamps) = self.stamps.read() else {
            return Err(strata_core::StorageError::LockPoisoned.into());
        };
        if stamps
            .get(&stamp.layer)
            .is_some_and(|current| !stamp.is_newer_than(current))
        {
            return Ok(None);
        }
        drop(stamps);

        let op = WriteOp::put_json(Table::Metadata, stamp.layer.metadata_key(), &stamp.synced_at)?;
        Ok(Some(op))
    }

    /// Move a layer's in-memory watermark forward. Returns false when
    /// `stamp` is not newer than the current one.
    pub fn commit(&self, stamp: SyncStamp) -> StrataResult<bool> {
        let Ok(mut stamps) = self.stamps.write() else {
            return Err(strata_core::StorageError::LockPoisoned.into());
        };
        if stamps
            .get(&stamp.layer)
            .is_some_and(|current| !stamp.is_newer_than(current))
        {
            return Ok(false);
        }
        stamps.insert(stamp.layer, stamp);
        Ok(true)
    }

    /// Forget every watermark so the next sync of each layer is a full one.
    pub fn clear(&self) {
        if let Ok(mut stamps) = self.stamps.write() {
            stamps.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;
    use chrono::{Duration, Utc};

    #[test]
    fn test_commit_is_monotonic() {
        let watermarks = SyncWatermarks::new();
        let now = Utc::now();

        assert!(watermarks
            .commit(SyncStamp::new(SyncLayer::EntityLinks, now))
            .expect("commit should succeed"));

        let older = SyncStamp::new(SyncLayer::EntityLinks, now - Duration::seconds(30));
        assert!(watermarks.prepare(older).expect("prepare").is_none());
        assert!(!watermarks.commit(older).expect("commit should succeed"));
        assert_eq!(watermarks.last_sync(SyncLayer::EntityLinks), Some(now));
    }

    #[test]
    fn test_prepare_leaves_memory_unchanged() {
        let watermarks = SyncWatermarks::new();
        let stamp = SyncStamp::new(SyncLayer::EntityLinks, Utc::now());

        let op = watermarks.prepare(stamp).expect("prepare should succeed");
        assert!(op.is_some());
        assert_eq!(watermarks.last_sync(SyncLayer::EntityLinks), None);
    }

    #[test]
    fn test_layers_are_independent() {
        let watermarks = SyncWatermarks::new();
        let now = Utc::now();
        watermarks
            .commit(SyncStamp::new(SyncLayer::EntityInstances, now))
            .expect("commit should succeed");

        assert_eq!(watermarks.last_sync(SyncLayer::EntityInstances), Some(now));
        assert_eq!(watermarks.last_sync(SyncLayer::EntityLinks), None);

        watermarks.clear();
        assert_eq!(watermarks.last_sync(SyncLayer::EntityInstances), None);
    }

    #[tokio::test]
    async fn test_load_reads_persisted_stamps() {
        let store: Arc<dyn PersistentStore> = Arc::new(MemoryStore::new());
        let now = Utc::now();

        let writer = SyncWatermarks::new();
        let op = writer
            .prepare(SyncStamp::new(SyncLayer::EntityLinks, now))
            .expect("prepare should succeed")
            .expect("first stamp should produce a write");
        store.apply(&[op]).await.expect("apply should succeed");

        let loaded = SyncWatermarks::load(&store)
            .await
            .expect("load should succeed");
        assert_eq!(loaded.last_sync(SyncLayer::EntityLinks), Some(now));
        assert_eq!(loaded.last_sync(SyncLayer::EntityTypes), None);
    }
}
