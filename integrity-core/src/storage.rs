//! Storage layer using RocksDB
//!
//! The store is a pessimistic `TransactionDB`. Every multi-row write runs in
//! one [`WriteTxn`]; read-then-write paths lock the row they validate against
//! with `get_for_update`, so two workers racing on the same lot, wallet or
//! entity serialize on the row lock instead of both passing a stale check.
//!
//! # Column Families
//!
//! Each record family lives in its own column family. Families are either
//! append-only (the wrapper refuses to overwrite or delete an existing key)
//! or mutable (heads, cursors, job rows, request status).
//!
//! - `accounts`, `account_codes` - chart of accounts, code uniqueness
//! - `journal_entries`, `journal_lines`, `account_lines` - double-entry book
//! - `reversals` - one marker per reversed record
//! - `inventory_lots`, `lot_heads`, `allocation_log`, `lot_allocations`
//! - `wallet_transactions`, `wallet_index`, `wallet_heads`, `override_audit`
//! - `job_executions` - idempotency keys
//! - `entity_states`, `transition_log`, `investments`, `journeys`
//! - `context_snapshots`, `snapshot_heads`, `approval_requests`, `governance_log`
//! - `meta` - chain heads and counters

use crate::{
    error::{Error, Result},
    Config,
};
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, Direction as ScanDirection, IteratorMode,
    MultiThreaded, Options, Transaction, TransactionDB, TransactionDBOptions, TransactionOptions,
    WriteOptions,
};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;

type Db = TransactionDB<MultiThreaded>;

/// Column family names
pub mod cf {
    /// Chart of accounts
    pub const ACCOUNTS: &str = "accounts";
    /// Account code -> account id
    pub const ACCOUNT_CODES: &str = "account_codes";
    /// Journal entry headers
    pub const ENTRIES: &str = "journal_entries";
    /// Journal lines keyed by entry
    pub const LINES: &str = "journal_lines";
    /// Journal lines keyed by account and date
    pub const ACCOUNT_LINES: &str = "account_lines";
    /// Reversal markers
    pub const REVERSALS: &str = "reversals";
    /// Inventory lots
    pub const LOTS: &str = "inventory_lots";
    /// Per-lot allocation cursor
    pub const LOT_HEADS: &str = "lot_heads";
    /// Allocation log rows
    pub const ALLOCATIONS: &str = "allocation_log";
    /// Lot -> allocation rows in sequence order
    pub const LOT_ALLOCATIONS: &str = "lot_allocations";
    /// Wallet transactions
    pub const TRANSACTIONS: &str = "wallet_transactions";
    /// Wallet -> transactions in sequence order
    pub const WALLET_INDEX: &str = "wallet_index";
    /// Per-wallet cursor
    pub const WALLET_HEADS: &str = "wallet_heads";
    /// Admin override audit rows
    pub const OVERRIDES: &str = "override_audit";
    /// Idempotency keys
    pub const JOBS: &str = "job_executions";
    /// Current state per state-machine entity
    pub const ENTITY_STATES: &str = "entity_states";
    /// Transition history
    pub const TRANSITIONS: &str = "transition_log";
    /// Investments
    pub const INVESTMENTS: &str = "investments";
    /// Investor journeys
    pub const JOURNEYS: &str = "journeys";
    /// Platform context snapshots
    pub const SNAPSHOTS: &str = "context_snapshots";
    /// Company -> current snapshot
    pub const SNAPSHOT_HEADS: &str = "snapshot_heads";
    /// Maker-checker requests
    pub const APPROVALS: &str = "approval_requests";
    /// Governance decisions
    pub const GOVERNANCE_LOG: &str = "governance_log";
    /// Chain heads and counters
    pub const META: &str = "meta";
}

/// Whether a column family accepts overwrites
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutability {
    /// Insert once, never overwrite or delete
    AppendOnly,
    /// Rows may be replaced
    Mutable,
}

const TABLES: &[(&str, Mutability)] = &[
    (cf::ACCOUNTS, Mutability::Mutable),
    (cf::ACCOUNT_CODES, Mutability::Mutable),
    (cf::ENTRIES, Mutability::AppendOnly),
    (cf::LINES, Mutability::AppendOnly),
    (cf::ACCOUNT_LINES, Mutability::AppendOnly),
    (cf::REVERSALS, Mutability::AppendOnly),
    (cf::LOTS, Mutability::AppendOnly),
    (cf::LOT_HEADS, Mutability::Mutable),
    (cf::ALLOCATIONS, Mutability::AppendOnly),
    (cf::LOT_ALLOCATIONS, Mutability::AppendOnly),
    (cf::TRANSACTIONS, Mutability::AppendOnly),
    (cf::WALLET_INDEX, Mutability::AppendOnly),
    (cf::WALLET_HEADS, Mutability::Mutable),
    (cf::OVERRIDES, Mutability::AppendOnly),
    (cf::JOBS, Mutability::Mutable),
    (cf::ENTITY_STATES, Mutability::Mutable),
    (cf::TRANSITIONS, Mutability::AppendOnly),
    (cf::INVESTMENTS, Mutability::AppendOnly),
    (cf::JOURNEYS, Mutability::Mutable),
    (cf::SNAPSHOTS, Mutability::AppendOnly),
    (cf::SNAPSHOT_HEADS, Mutability::Mutable),
    (cf::APPROVALS, Mutability::Mutable),
    (cf::GOVERNANCE_LOG, Mutability::AppendOnly),
    (cf::META, Mutability::Mutable),
];

fn mutability(name: &str) -> Result<Mutability> {
    TABLES
        .iter()
        .find(|(table, _)| *table == name)
        .map(|(_, m)| *m)
        .ok_or_else(|| Error::Storage(format!("Column family {} not registered", name)))
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

/// Storage wrapper for RocksDB
pub struct Storage {
    db: Arc<Db>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").field("path", &self.db.path()).finish()
    }
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        // Create directory if not exists
        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);
        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let mut txn_db_opts = TransactionDBOptions::default();
        txn_db_opts.set_txn_lock_timeout(config.rocksdb.lock_timeout_ms);

        let cf_descriptors = TABLES
            .iter()
            .map(|(name, _)| ColumnFamilyDescriptor::new(*name, Self::cf_options()));

        let db: Db = TransactionDB::open_cf_descriptors(&db_opts, &txn_db_opts, path, cf_descriptors)?;

        tracing::info!(
            path = ?path,
            column_families = TABLES.len(),
            "Opened RocksDB transaction store"
        );

        Ok(Self { db: Arc::new(db) })
    }

    fn cf_options() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    /// Start an atomic write unit
    pub fn begin(&self) -> WriteTxn<'_> {
        let mut txn_opts = TransactionOptions::default();
        txn_opts.set_deadlock_detect(true);
        WriteTxn {
            db: &self.db,
            txn: self.db.transaction_opt(&WriteOptions::default(), &txn_opts),
        }
    }

    /// Read a committed row
    pub fn get<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        let handle = self.cf_handle(cf)?;
        match self.db.get_cf(&handle, key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Read a committed row that must exist
    pub fn require<T: DeserializeOwned>(&self, cf: &str, key: &[u8], what: &str) -> Result<T> {
        self.get(cf, key)?
            .ok_or_else(|| Error::NotFound(what.to_string()))
    }

    /// All rows whose key starts with `prefix`, in key order
    pub fn scan_prefix<T: DeserializeOwned>(
        &self,
        cf: &str,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, T)>> {
        let handle = self.cf_handle(cf)?;
        let iter = self
            .db
            .iterator_cf(&handle, IteratorMode::From(prefix, ScanDirection::Forward));

        let mut rows = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            rows.push((key.to_vec(), decode(&value)?));
        }
        Ok(rows)
    }

    /// Every row in a column family, in key order
    pub fn scan_all<T: DeserializeOwned>(&self, cf: &str) -> Result<Vec<(Vec<u8>, T)>> {
        self.scan_prefix(cf, &[])
    }
}

/// One atomic unit of work against the store
///
/// Dropping a `WriteTxn` without [`WriteTxn::commit`] discards every staged
/// write and releases its row locks.
pub struct WriteTxn<'a> {
    db: &'a Db,
    txn: Transaction<'a, Db>,
}

impl<'a> WriteTxn<'a> {
    fn handle(&self, name: &str) -> Result<Arc<BoundColumnFamily<'a>>> {
        let db: &'a Db = self.db;
        db.cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    /// Read a row and hold an exclusive lock on its key until commit.
    ///
    /// The lock is taken even when the key does not exist yet, so this also
    /// serializes concurrent inserts of the same key.
    pub fn lock<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        let handle = self.handle(cf)?;
        match self.txn.get_for_update_cf(&handle, key, true)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Read a row under a shared lock: concurrent readers proceed, an
    /// exclusive [`WriteTxn::lock`] on the same key waits for them.
    pub fn lock_shared<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        let handle = self.handle(cf)?;
        match self.txn.get_for_update_cf(&handle, key, false)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Read a row (sees this unit's own staged writes), without locking
    pub fn get<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        let handle = self.handle(cf)?;
        match self.txn.get_cf(&handle, key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Insert a row whose key must not exist yet.
    ///
    /// This is the only write allowed on append-only families.
    pub fn insert<T: Serialize>(&self, cf: &str, key: &[u8], value: &T) -> Result<()> {
        let handle = self.handle(cf)?;
        if self.txn.get_for_update_cf(&handle, key, true)?.is_some() {
            return Err(Error::InvariantViolation(format!(
                "duplicate key in {}",
                cf
            )));
        }
        self.txn.put_cf(&handle, key, encode(value)?)?;
        Ok(())
    }

    /// Insert or replace a row in a mutable family
    pub fn put<T: Serialize>(&self, cf: &str, key: &[u8], value: &T) -> Result<()> {
        if mutability(cf)? == Mutability::AppendOnly {
            return Err(Error::InvariantViolation(format!(
                "{} is append-only; rows cannot be rewritten",
                cf
            )));
        }
        let handle = self.handle(cf)?;
        self.txn.put_cf(&handle, key, encode(value)?)?;
        Ok(())
    }

    /// Delete a row from a mutable family
    pub fn delete(&self, cf: &str, key: &[u8]) -> Result<()> {
        if mutability(cf)? == Mutability::AppendOnly {
            return Err(Error::InvariantViolation(format!(
                "{} is append-only; rows cannot be deleted",
                cf
            )));
        }
        let handle = self.handle(cf)?;
        self.txn.delete_cf(&handle, key)?;
        Ok(())
    }

    /// Commit every staged write atomically
    pub fn commit(self) -> Result<()> {
        self.txn.commit()?;
        Ok(())
    }
}

/// Key encoding helpers
///
/// Numbers are big-endian so RocksDB's byte order matches numeric order.
pub mod keys {
    use chrono::{DateTime, Utc};

    /// Concatenate key parts
    pub fn join(parts: &[&[u8]]) -> Vec<u8> {
        let mut key = Vec::with_capacity(parts.iter().map(|p| p.len()).sum());
        for part in parts {
            key.extend_from_slice(part);
        }
        key
    }

    /// Sequence number segment
    pub fn seq(n: u64) -> [u8; 8] {
        n.to_be_bytes()
    }

    /// Timestamp segment; sign bit flipped so pre-epoch dates still sort first
    pub fn timestamp(at: DateTime<Utc>) -> [u8; 8] {
        ((at.timestamp_millis() as u64) ^ (1u64 << 63)).to_be_bytes()
    }

    /// Length-prefixed string segment (prefix-free for variable-length parts)
    pub fn text(s: &str) -> crate::Result<Vec<u8>> {
        let len = u16::try_from(s.len()).map_err(|_| {
            crate::Error::InvalidRequest(format!("key segment of {} bytes exceeds {}", s.len(), u16::MAX))
        })?;
        let mut key = len.to_be_bytes().to_vec();
        key.extend_from_slice(s.as_bytes());
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_storage() -> (Storage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        (Storage::open(&config).unwrap(), temp_dir)
    }

    #[test]
    fn test_storage_open() {
        let (storage, _temp) = test_storage();
        for (name, _) in TABLES {
            assert!(storage.db.cf_handle(name).is_some(), "missing {}", name);
        }
    }

    #[test]
    fn test_append_only_rejects_overwrite() {
        let (storage, _temp) = test_storage();

        let txn = storage.begin();
        txn.insert(cf::ENTRIES, b"entry-1", &42u64).unwrap();
        txn.commit().unwrap();

        let txn = storage.begin();
        assert!(txn.insert(cf::ENTRIES, b"entry-1", &43u64).is_err());
        assert!(txn.put(cf::ENTRIES, b"entry-1", &43u64).is_err());
        assert!(txn.delete(cf::ENTRIES, b"entry-1").is_err());
        drop(txn);

        let value: u64 = storage.require(cf::ENTRIES, b"entry-1", "entry").unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_uncommitted_writes_are_discarded() {
        let (storage, _temp) = test_storage();

        {
            let txn = storage.begin();
            txn.insert(cf::LINES, b"a", &1u64).unwrap();
            txn.insert(cf::LINES, b"b", &2u64).unwrap();
            // dropped without commit
        }

        let rows: Vec<(Vec<u8>, u64)> = storage.scan_all(cf::LINES).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_scan_prefix_stops_at_prefix_boundary() {
        let (storage, _temp) = test_storage();

        let txn = storage.begin();
        for (key, value) in [(b"aa1", 1u64), (b"aa2", 2), (b"ab1", 3)] {
            txn.insert(cf::LINES, key, &value).unwrap();
        }
        txn.commit().unwrap();

        let rows: Vec<(Vec<u8>, u64)> = storage.scan_prefix(cf::LINES, b"aa").unwrap();
        assert_eq!(rows.iter().map(|(_, v)| *v).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_timestamp_keys_sort_chronologically() {
        let early = chrono::DateTime::from_timestamp(-10, 0).unwrap();
        let late = chrono::DateTime::from_timestamp(10, 0).unwrap();
        assert!(keys::timestamp(early) < keys::timestamp(late));
    }

    #[test]
    fn test_text_segment_rejects_oversized_strings() {
        let fits = "k".repeat(u16::MAX as usize);
        let key = keys::text(&fits).unwrap();
        assert_eq!(&key[..2], &u16::MAX.to_be_bytes());
        assert_eq!(key.len(), fits.len() + 2);

        let oversized = "k".repeat(u16::MAX as usize + 1);
        assert!(matches!(keys::text(&oversized), Err(Error::InvalidRequest(_))));
    }
}
