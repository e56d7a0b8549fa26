//! In-memory persistent store.
//!
//! Same contract as [`crate::LmdbStore`] without touching disk. Used for
//! ephemeral sessions and in tests, where write failures can be injected.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use strata_core::{StorageError, StrataResult};

use crate::{PersistentStore, StoreStats, Table, WriteOp};

type Tables = HashMap<Table, BTreeMap<String, Vec<u8>>>;

/// In-memory store backed by ordered maps.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    fail_writes: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
    batches: AtomicU64,
    operations: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `apply` fail until switched off again.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of entries in one table.
    pub fn len(&self, table: Table) -> usize {
        self.tables
            .read()
            .map(|tables| tables.get(&table).map_or(0, BTreeMap::len))
            .unwrap_or(0)
    }

    /// Check if every table is empty.
    pub fn is_empty(&self) -> bool {
        self.tables
            .read()
            .map(|tables| tables.values().all(BTreeMap::is_empty))
            .unwrap_or(true)
    }

    fn apply_op(tables: &mut Tables, op: &WriteOp) {
        let rows = tables.entry(op.table()).or_default();
        match op {
            WriteOp::Put { key, value, .. } => {
                rows.insert(key.clone(), value.clone());
            }
            WriteOp::Delete { key, .. } => {
                rows.remove(key);
            }
            WriteOp::DeletePrefix { prefix, .. } => {
                rows.retain(|key, _| !key.starts_with(prefix.as_str()));
            }
            WriteOp::Clear { .. } => rows.clear(),
        }
    }
}

#[async_trait]
impl PersistentStore for MemoryStore {
    async fn get(&self, table: Table, key: &str) -> StrataResult<Option<Vec<u8>>> {
        let tables = self.tables.read().map_err(|_| StorageError::LockPoisoned)?;
        let value = tables.get(&table).and_then(|rows| rows.get(key)).cloned();
        if value.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        Ok(value)
    }

    async fn scan(&self, table: Table, prefix: &str) -> StrataResult<Vec<(String, Vec<u8>)>> {
        let tables = self.tables.read().map_err(|_| StorageError::LockPoisoned)?;
        let Some(rows) = tables.get(&table) else {
            return Ok(Vec::new());
        };
        Ok(rows
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn apply(&self, batch: &[WriteOp]) -> StrataResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::WriteRejected {
                reason: format!("{} operations rejected", batch.len()),
            }
            .into());
        }
        if batch.is_empty() {
            return Ok(());
        }

        let mut tables = self.tables.write().map_err(|_| StorageError::LockPoisoned)?;
        for op in batch {
            Self::apply_op(&mut tables, op);
        }

        self.batches.fetch_add(1, Ordering::Relaxed);
        self.operations
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    async fn stats(&self) -> StrataResult<StoreStats> {
        Ok(StoreStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            operations: self.operations.load(Ordering::Relaxed),
        })
    }
}
