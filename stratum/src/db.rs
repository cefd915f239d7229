//! The database facade.
//!
//! Owns exactly one B+ tree (which owns the buffer pool and disk manager),
//! one WAL and one transaction manager. A process-wide read/write lock
//! serializes writers against readers; writes are globally serialized.
//!
//! Mutations are buffered on their transaction and recorded in the WAL
//! first; the tree is only touched at commit, by replaying the transaction's
//! operations in order. On startup the WAL is replayed, applying only
//! transactions whose commit record is present.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{self, AtomicBool};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::btree::BPlusTree;
use crate::codec::{Codec, KeyOrder, NaturalOrder};
use crate::error::{Error, Result};
use crate::transaction::{CasCheck, Transaction, TransactionManager};
use crate::wal::{OpKind, Wal, WalEntry};

const DEFAULT_TREE_ORDER: usize = 128;
const DEFAULT_BUFFER_POOL_SIZE: usize = 1000;

/// Tuning knobs for [`Database::open_with`].
#[derive(Debug, Clone, Copy)]
pub struct Options {
    /// Maximum keys per tree node before it splits.
    pub order: usize,
    /// Buffer pool capacity in pages.
    pub buffer_pool_size: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            order: DEFAULT_TREE_ORDER,
            buffer_pool_size: DEFAULT_BUFFER_POOL_SIZE,
        }
    }
}

/// An embedded, persistent, transactional ordered key-value store.
pub struct Database<K, V> {
    tree: BPlusTree<K, V>,
    manager: TransactionManager<K, V>,
    wal: Arc<Wal<K, V>>,
    key_order: Arc<dyn KeyOrder<K>>,
    lock: RwLock<()>,
    closed: AtomicBool,
}

impl<K, V> Database<K, V>
where
    K: Clone + fmt::Debug,
    V: Clone + PartialEq + fmt::Debug,
{
    /// Opens a database in `directory` with natural key ordering and default
    /// options. Files are `data.db` and `wal.log`.
    pub fn open<P: AsRef<Path>>(
        directory: P,
        key_codec: Arc<dyn Codec<K>>,
        value_codec: Arc<dyn Codec<V>>,
    ) -> Result<Self>
    where
        K: Ord,
    {
        let directory = directory.as_ref();
        Self::open_with(
            directory.join("data.db"),
            directory.join("wal.log"),
            Options::default(),
            key_codec,
            value_codec,
            Arc::new(NaturalOrder),
        )
    }

    /// Opens a database with explicit file paths, options and key ordering.
    /// Recovery runs to completion before any request is served.
    pub fn open_with<P: AsRef<Path>>(
        data_path: P,
        wal_path: P,
        options: Options,
        key_codec: Arc<dyn Codec<K>>,
        value_codec: Arc<dyn Codec<V>>,
        key_order: Arc<dyn KeyOrder<K>>,
    ) -> Result<Self> {
        let wal = Arc::new(Wal::open(
            wal_path,
            Arc::clone(&key_codec),
            Arc::clone(&value_codec),
        )?);
        let manager = TransactionManager::new(Arc::clone(&wal));
        let tree = BPlusTree::open(
            data_path,
            options.order,
            options.buffer_pool_size,
            key_codec,
            value_codec,
            Arc::clone(&key_order),
        )?;

        let database = Database {
            tree,
            manager,
            wal,
            key_order,
            lock: RwLock::new(()),
            closed: AtomicBool::new(false),
        };
        database.recover()?;
        Ok(database)
    }

    fn check_closed(&self) -> Result<()> {
        if self.closed.load(atomic::Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn require_active(&self, transaction: &Transaction<K, V>) -> Result<()> {
        if !transaction.is_active() {
            return Err(Error::TransactionNotActive(transaction.id()));
        }
        Ok(())
    }

    fn values_equal(&self, a: &Option<V>, b: &Option<V>) -> bool {
        match (a, b) {
            (None, None) => true,
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// Latest pending operation for `key` inside `transaction`, if any.
    /// `Some(None)` means the key is pending deletion.
    fn pending_value(&self, key: &K, transaction: &Transaction<K, V>) -> Option<Option<V>> {
        for entry in transaction.operations().iter().rev() {
            let Some(entry_key) = &entry.key else {
                continue;
            };
            if self.key_order.compare(entry_key, key) == Ordering::Equal {
                if entry.op == OpKind::Delete {
                    return Some(None);
                }
                return Some(entry.value.clone());
            }
        }
        None
    }

    /// Gets the committed value for a key.
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        self.check_closed()?;
        let _guard = self.lock.read();
        self.tree.search(key)
    }

    /// Gets a key as seen by `transaction`: its own pending writes win over
    /// the committed tree.
    pub fn get_tx(&self, key: &K, transaction: &Transaction<K, V>) -> Result<Option<V>> {
        self.check_closed()?;
        if !transaction.is_active() {
            return self.get(key);
        }

        let _guard = self.lock.read();
        if let Some(pending) = self.pending_value(key, transaction) {
            return Ok(pending);
        }
        self.tree.search(key)
    }

    /// Inserts or updates a key with autocommit.
    pub fn put(&self, key: K, value: V) -> Result<()> {
        let transaction = self.begin_transaction()?;
        match self
            .put_tx(key, value, &transaction)
            .and_then(|()| self.commit_transaction(&transaction))
        {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = self.rollback_transaction(&transaction);
                Err(e)
            }
        }
    }

    /// Inserts or updates a key inside a transaction. The prior committed
    /// value decides between an insert and an update record.
    pub fn put_tx(&self, key: K, value: V, transaction: &Transaction<K, V>) -> Result<()> {
        self.check_closed()?;
        self.require_active(transaction)?;

        let _guard = self.lock.write();
        let old_value = self.tree.search(&key)?;
        let op = if old_value.is_some() {
            OpKind::Update
        } else {
            OpKind::Insert
        };
        let entry = WalEntry::data(transaction.id(), op, key, Some(value), old_value);
        self.manager.add_operation(transaction, entry)
    }

    /// Deletes a key with autocommit. Returns whether the key was present.
    pub fn delete(&self, key: &K) -> Result<bool> {
        let transaction = self.begin_transaction()?;
        match self
            .delete_tx(key, &transaction)
            .and_then(|deleted| self.commit_transaction(&transaction).map(|()| deleted))
        {
            Ok(deleted) => Ok(deleted),
            Err(e) => {
                let _ = self.rollback_transaction(&transaction);
                Err(e)
            }
        }
    }

    /// Deletes a key inside a transaction. A missing key records nothing.
    pub fn delete_tx(&self, key: &K, transaction: &Transaction<K, V>) -> Result<bool> {
        self.check_closed()?;
        self.require_active(transaction)?;

        let _guard = self.lock.write();
        let Some(old_value) = self.tree.search(key)? else {
            return Ok(false);
        };

        let entry = WalEntry::data(
            transaction.id(),
            OpKind::Delete,
            key.clone(),
            None,
            Some(old_value),
        );
        self.manager.add_operation(transaction, entry)?;
        Ok(true)
    }

    /// Values for every key in `[start_key, end_key]`, in key order.
    pub fn range(&self, start_key: &K, end_key: &K) -> Result<Vec<V>> {
        self.check_closed()?;
        let _guard = self.lock.read();
        Ok(self
            .collect_range(start_key, end_key)?
            .into_iter()
            .map(|(_, v)| v)
            .collect())
    }

    /// Range query as seen by `transaction`: pending operations overlay the
    /// committed scan.
    pub fn range_tx(
        &self,
        start_key: &K,
        end_key: &K,
        transaction: &Transaction<K, V>,
    ) -> Result<Vec<V>> {
        self.check_closed()?;
        if !transaction.is_active() {
            return self.range(start_key, end_key);
        }

        let _guard = self.lock.read();
        let mut pairs = self.collect_range(start_key, end_key)?;

        for entry in transaction.operations() {
            let Some(key) = &entry.key else {
                continue;
            };
            if self.key_order.compare(key, start_key) == Ordering::Less
                || self.key_order.compare(key, end_key) == Ordering::Greater
            {
                continue;
            }

            let position = pairs.binary_search_by(|(k, _)| self.key_order.compare(k, key));
            match entry.op {
                OpKind::Delete => {
                    if let Ok(index) = position {
                        pairs.remove(index);
                    }
                }
                _ => {
                    if let Some(value) = entry.value.clone() {
                        match position {
                            Ok(index) => pairs[index].1 = value,
                            Err(index) => pairs.insert(index, (key.clone(), value)),
                        }
                    }
                }
            }
        }

        Ok(pairs.into_iter().map(|(_, v)| v).collect())
    }

    fn collect_range(&self, start_key: &K, end_key: &K) -> Result<Vec<(K, V)>> {
        self.tree.range(start_key, end_key)?.collect()
    }

    /// Whether a key is present in the committed state.
    pub fn contains_key(&self, key: &K) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Whether a key is present as seen by `transaction`.
    pub fn contains_key_tx(&self, key: &K, transaction: &Transaction<K, V>) -> Result<bool> {
        Ok(self.get_tx(key, transaction)?.is_some())
    }

    /// Number of committed key-value pairs.
    pub fn size(&self) -> Result<usize> {
        self.check_closed()?;
        let _guard = self.lock.read();
        self.tree.size()
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.check_closed()?;
        let _guard = self.lock.read();
        self.tree.is_empty()
    }

    /// Conditionally updates a key with autocommit. Returns `false` when the
    /// current value does not match `expected` at operation time or at
    /// commit time.
    pub fn compare_and_set(&self, key: K, expected: Option<V>, new_value: V) -> Result<bool> {
        let transaction = self.begin_transaction()?;
        match self.compare_and_set_tx(key, expected, new_value, &transaction) {
            Ok(false) => {
                self.rollback_transaction(&transaction)?;
                Ok(false)
            }
            Ok(true) => match self.commit_transaction(&transaction) {
                Ok(()) => Ok(true),
                Err(Error::CompareAndSetFailed { .. }) => Ok(false),
                Err(e) => {
                    let _ = self.rollback_transaction(&transaction);
                    Err(e)
                }
            },
            Err(e) => {
                let _ = self.rollback_transaction(&transaction);
                Err(e)
            }
        }
    }

    /// Conditional update inside a transaction. A `true` return means the
    /// operation was recorded; the precondition is checked again at commit
    /// against the committed tree, and a mismatch there aborts the
    /// transaction with [`Error::CompareAndSetFailed`].
    pub fn compare_and_set_tx(
        &self,
        key: K,
        expected: Option<V>,
        new_value: V,
        transaction: &Transaction<K, V>,
    ) -> Result<bool> {
        self.check_closed()?;
        self.require_active(transaction)?;

        let _guard = self.lock.write();
        let current = match self.pending_value(&key, transaction) {
            Some(pending) => pending,
            None => self.tree.search(&key)?,
        };

        if !self.values_equal(&current, &expected) {
            return Ok(false);
        }

        let op = if current.is_some() {
            OpKind::Update
        } else {
            OpKind::Insert
        };
        let entry = WalEntry::data(
            transaction.id(),
            op,
            key.clone(),
            Some(new_value),
            current,
        );
        self.manager.add_operation(transaction, entry)?;
        transaction.push_cas_check(CasCheck { key, expected })?;
        Ok(true)
    }

    /// Starts a new transaction.
    pub fn begin_transaction(&self) -> Result<Transaction<K, V>> {
        self.check_closed()?;
        self.manager.begin()
    }

    /// Commits a transaction: validates compare-and-set preconditions
    /// against the committed tree, applies the buffered operations in order,
    /// then durably records the commit. A failed precondition rolls the
    /// transaction back and nothing is applied.
    pub fn commit_transaction(&self, transaction: &Transaction<K, V>) -> Result<()> {
        self.check_closed()?;
        self.require_active(transaction)?;
        let _guard = self.lock.write();

        for check in transaction.cas_checks() {
            let actual = self.tree.search(&check.key)?;
            if !self.values_equal(&actual, &check.expected) {
                self.manager.rollback(transaction)?;
                return Err(Error::cas_failed(&check.key, &check.expected, &actual));
            }
        }

        for entry in transaction.operations() {
            match entry.op {
                OpKind::Insert | OpKind::Update | OpKind::CompareAndSet => {
                    if let (Some(key), Some(value)) = (entry.key, entry.value) {
                        self.tree.insert(key, value)?;
                    }
                }
                OpKind::Delete => {
                    if let Some(key) = entry.key {
                        self.tree.delete(&key)?;
                    }
                }
                OpKind::TxBegin | OpKind::TxCommit | OpKind::TxRollback => {}
            }
        }

        self.manager.commit(transaction)
    }

    /// Rolls back a transaction, discarding its buffered operations.
    pub fn rollback_transaction(&self, transaction: &Transaction<K, V>) -> Result<()> {
        self.check_closed()?;
        self.require_active(transaction)?;
        let _guard = self.lock.write();
        self.manager.rollback(transaction)
    }

    /// Forces buffered log records to durable storage.
    pub fn flush(&self) -> Result<()> {
        self.check_closed()?;
        self.wal.flush()
    }

    /// Shuts the database down: active transactions are rolled back, the
    /// tree is flushed and synced, and every later call fails.
    pub fn close(&self) -> Result<()> {
        if self.closed.load(atomic::Ordering::SeqCst) {
            return Ok(());
        }

        info!("shutting down database");
        let _guard = self.lock.write();
        self.manager.shutdown()?;
        self.tree.sync()?;
        self.wal.close()?;
        self.closed.store(true, atomic::Ordering::SeqCst);
        info!("database shutdown complete");
        Ok(())
    }

    /// Replays the WAL into the tree. Only transactions whose commit record
    /// is present are applied, in ascending commit order; mid-flight
    /// transactions are rolled back with a warning.
    fn recover(&self) -> Result<()> {
        info!("starting database recovery");

        self.manager.recover()?;

        let mut pending: HashMap<u64, Vec<WalEntry<K, V>>> = HashMap::new();
        let mut committed: Vec<Vec<WalEntry<K, V>>> = Vec::new();

        for entry in self.wal.read_all()? {
            match entry.op {
                OpKind::TxBegin => {
                    pending.insert(entry.transaction_id, Vec::new());
                }
                OpKind::TxCommit => {
                    if let Some(operations) = pending.remove(&entry.transaction_id) {
                        committed.push(operations);
                    }
                }
                OpKind::TxRollback => {
                    pending.remove(&entry.transaction_id);
                }
                OpKind::Insert | OpKind::Update | OpKind::Delete | OpKind::CompareAndSet => {
                    pending
                        .entry(entry.transaction_id)
                        .or_default()
                        .push(entry);
                }
            }
        }

        let mut applied = 0usize;
        for operations in committed {
            for entry in operations {
                match entry.op {
                    OpKind::Insert | OpKind::Update | OpKind::CompareAndSet => {
                        if let (Some(key), Some(value)) = (entry.key, entry.value) {
                            self.tree.insert(key, value)?;
                            applied += 1;
                        }
                    }
                    OpKind::Delete => {
                        if let Some(key) = entry.key {
                            self.tree.delete(&key)?;
                            applied += 1;
                        }
                    }
                    _ => {}
                }
            }
        }

        self.tree.sync()?;
        info!(applied, "database recovery completed");
        Ok(())
    }

    /// Structural statistics of the underlying tree.
    pub fn tree_stats(&self) -> Result<crate::btree::TreeStats> {
        self.check_closed()?;
        let _guard = self.lock.read();
        self.tree.stats()
    }
}
