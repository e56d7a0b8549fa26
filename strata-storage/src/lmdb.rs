//! LMDB-backed persistent store.
//!
//! Uses the heed crate (Rust bindings for LMDB) to provide a memory-mapped
//! key-value store with one named database per [`Table`].
//!
//! # Atomicity
//!
//! Every `apply` runs in a single LMDB write transaction, so a batch that
//! mixes index puts and deletes across several tables commits as a unit.
//! Reads use their own read transaction and never observe a half-applied
//! batch.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions, RwTxn};
use strata_core::{StorageError, StrataError, StrataResult};

use crate::{PersistentStore, StoreStats, Table, WriteOp};

/// Error type for LMDB store operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbStoreError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open a named database within the environment.
    #[error("Failed to open database {table}: {reason}")]
    DbOpen { table: Table, reason: String },

    /// Transaction error.
    #[error("Transaction error on {table}: {reason}")]
    Transaction { table: String, reason: String },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LmdbStoreError {
    fn txn(table: impl std::fmt::Display, e: impl std::fmt::Display) -> Self {
        LmdbStoreError::Transaction {
            table: table.to_string(),
            reason: e.to_string(),
        }
    }
}

/// Convert LmdbStoreError to StrataError.
impl From<LmdbStoreError> for StrataError {
    fn from(e: LmdbStoreError) -> Self {
        match e {
            LmdbStoreError::Transaction { table, reason } => {
                StrataError::Storage(StorageError::TransactionFailed { table, reason })
            }
            other => StrataError::Storage(StorageError::OpenFailed {
                path: String::new(),
                reason: other.to_string(),
            }),
        }
    }
}

/// LMDB-backed store.
///
/// # Example
///
/// ```ignore
/// use strata_storage::{LmdbStore, PersistentStore, Table, WriteOp};
///
/// let store = LmdbStore::open("/var/lib/strata", 256)?;
/// store.apply(&[WriteOp::put_json(Table::EntityNames, "task:t1", &"Write docs")?]).await?;
/// let bytes = store.get(Table::EntityNames, "task:t1").await?;
/// ```
pub struct LmdbStore {
    env: Env,
    databases: HashMap<Table, Database<Str, Bytes>>,
    hits: AtomicU64,
    misses: AtomicU64,
    batches: AtomicU64,
    operations: AtomicU64,
}

impl LmdbStore {
    /// Open (or create) a store.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `max_size_mb` - Maximum size of the map in megabytes
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory cannot be created
    /// - LMDB environment cannot be opened
    /// - A table database cannot be created
    pub fn open<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbStoreError> {
        std::fs::create_dir_all(&path)?;

        // SAFETY: the environment is opened once per path by this process.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(Table::ALL.len() as u32)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbStoreError::EnvOpen(e.to_string()))?;

        let mut wtxn = env
            .write_txn()
            .map_err(|e| LmdbStoreError::txn("env", e))?;

        let mut databases = HashMap::with_capacity(Table::ALL.len());
        for table in Table::ALL {
            let db: Database<Str, Bytes> = env
                .create_database(&mut wtxn, Some(table.name()))
                .map_err(|e| LmdbStoreError::DbOpen {
                    table,
                    reason: e.to_string(),
                })?;
            databases.insert(table, db);
        }

        wtxn.commit().map_err(|e| LmdbStoreError::txn("env", e))?;

        tracing::debug!(
            path = %path.as_ref().display(),
            max_size_mb,
            tables = databases.len(),
            "LMDB store opened"
        );

        Ok(Self {
            env,
            databases,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            batches: AtomicU64::new(0),
            operations: AtomicU64::new(0),
        })
    }

    fn db(&self, table: Table) -> Result<Database<Str, Bytes>, LmdbStoreError> {
        self.databases
            .get(&table)
            .copied()
            .ok_or_else(|| LmdbStoreError::DbOpen {
                table,
                reason: "database not opened".to_string(),
            })
    }

    /// Number of entries in one table.
    pub fn len(&self, table: Table) -> Result<u64, LmdbStoreError> {
        let db = self.db(table)?;
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| LmdbStoreError::txn(table, e))?;
        db.len(&rtxn).map_err(|e| LmdbStoreError::txn(table, e))
    }

    fn apply_op(&self, wtxn: &mut RwTxn<'_>, op: &WriteOp) -> Result<(), LmdbStoreError> {
        let table = op.table();
        let db = self.db(table)?;
        match op {
            WriteOp::Put { key, value, .. } => db
                .put(wtxn, key, value)
                .map_err(|e| LmdbStoreError::txn(table, e)),
            WriteOp::Delete { key, .. } => db
                .delete(wtxn, key)
                .map(|_| ())
                .map_err(|e| LmdbStoreError::txn(table, e)),
            WriteOp::DeletePrefix { prefix, .. } => {
                let keys: Vec<String> = {
                    let iter = db
                        .prefix_iter(wtxn, prefix)
                        .map_err(|e| LmdbStoreError::txn(table, e))?;
                    let mut keys = Vec::new();
                    for entry in iter {
                        let (key, _) = entry.map_err(|e| LmdbStoreError::txn(table, e))?;
                        keys.push(key.to_string());
                    }
                    keys
                };
                for key in &keys {
                    db.delete(wtxn, key)
                        .map_err(|e| LmdbStoreError::txn(table, e))?;
                }
                Ok(())
            }
            WriteOp::Clear { .. } => db.clear(wtxn).map_err(|e| LmdbStoreError::txn(table, e)),
        }
    }
}

#[async_trait]
impl PersistentStore for LmdbStore {
    async fn get(&self, table: Table, key: &str) -> StrataResult<Option<Vec<u8>>> {
        let db = self.db(table)?;
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| LmdbStoreError::txn(table, e))?;

        match db.get(&rtxn, key) {
            Ok(Some(bytes)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(bytes.to_vec()))
            }
            Ok(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            Err(e) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Err(LmdbStoreError::txn(table, e).into())
            }
        }
    }

    async fn scan(&self, table: Table, prefix: &str) -> StrataResult<Vec<(String, Vec<u8>)>> {
        let db = self.db(table)?;
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| LmdbStoreError::txn(table, e))?;

        let iter = db
            .prefix_iter(&rtxn, prefix)
            .map_err(|e| LmdbStoreError::txn(table, e))?;

        let mut entries = Vec::new();
        for entry in iter {
            let (key, bytes) = entry.map_err(|e| LmdbStoreError::txn(table, e))?;
            entries.push((key.to_string(), bytes.to_vec()));
        }
        Ok(entries)
    }

    async fn apply(&self, batch: &[WriteOp]) -> StrataResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| LmdbStoreError::txn("batch", e))?;

        for op in batch {
            // Dropping the transaction on error aborts the whole batch.
            self.apply_op(&mut wtxn, op)?;
        }

        wtxn.commit()
            .map_err(|e| LmdbStoreError::txn("batch", e))?;

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
