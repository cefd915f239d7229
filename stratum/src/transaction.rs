//! Transactions and the transaction manager.
//!
//! A transaction buffers its data operations until commit; the tree is never
//! touched before then. The WAL is the authority: a transaction is committed
//! exactly when its commit record is durably present.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::wal::{OpKind, Wal, WalEntry};

/// Lifecycle states. A transaction is created `Active` and terminates
/// exactly once as `Committed` or `Aborted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Active,
    Committed,
    Aborted,
}

/// A commit-time compare-and-set precondition.
#[derive(Debug, Clone)]
pub struct CasCheck<K, V> {
    pub key: K,
    pub expected: Option<V>,
}

struct TxInner<K, V> {
    id: u64,
    state: Mutex<TxState>,
    operations: Mutex<Vec<WalEntry<K, V>>>,
    cas_checks: Mutex<Vec<CasCheck<K, V>>>,
}

/// A transaction handle. Cheap to clone; all clones share the same state.
pub struct Transaction<K, V> {
    inner: Arc<TxInner<K, V>>,
}

impl<K, V> Clone for Transaction<K, V> {
    fn clone(&self) -> Self {
        Transaction {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> Transaction<K, V>
where
    K: Clone,
    V: Clone,
{
    fn new(id: u64) -> Self {
        Transaction {
            inner: Arc::new(TxInner {
                id,
                state: Mutex::new(TxState::Active),
                operations: Mutex::new(Vec::new()),
                cas_checks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn state(&self) -> TxState {
        *self.inner.state.lock()
    }

    pub fn is_active(&self) -> bool {
        self.state() == TxState::Active
    }

    fn set_state(&self, state: TxState) {
        *self.inner.state.lock() = state;
    }

    /// Appends a data operation to this transaction's buffer.
    fn push_operation(&self, entry: WalEntry<K, V>) -> Result<()> {
        if !self.is_active() {
            return Err(Error::TransactionNotActive(self.id()));
        }
        self.inner.operations.lock().push(entry);
        Ok(())
    }

    /// A snapshot of the buffered operations, in submission order.
    pub fn operations(&self) -> Vec<WalEntry<K, V>> {
        self.inner.operations.lock().clone()
    }

    pub(crate) fn push_cas_check(&self, check: CasCheck<K, V>) -> Result<()> {
        if !self.is_active() {
            return Err(Error::TransactionNotActive(self.id()));
        }
        self.inner.cas_checks.lock().push(check);
        Ok(())
    }

    /// A snapshot of the compare-and-set preconditions.
    pub fn cas_checks(&self) -> Vec<CasCheck<K, V>> {
        self.inner.cas_checks.lock().clone()
    }
}

/// Coordinates transaction lifecycle against the WAL: begin, commit,
/// rollback, recovery of the active-transaction table, and shutdown.
pub struct TransactionManager<K, V> {
    wal: Arc<Wal<K, V>>,
    active: Mutex<HashMap<u64, Transaction<K, V>>>,
    next_transaction_id: AtomicU64,
}

impl<K, V> TransactionManager<K, V>
where
    K: Clone,
    V: Clone,
{
    pub fn new(wal: Arc<Wal<K, V>>) -> Self {
        TransactionManager {
            wal,
            active: Mutex::new(HashMap::new()),
            next_transaction_id: AtomicU64::new(0),
        }
    }

    /// Starts a transaction: the begin record is durable before the handle
    /// is returned.
    pub fn begin(&self) -> Result<Transaction<K, V>> {
        let id = self.next_transaction_id.fetch_add(1, Ordering::SeqCst) + 1;
        let transaction = Transaction::new(id);
        self.active.lock().insert(id, transaction.clone());

        let mut entry = WalEntry::marker(id, OpKind::TxBegin);
        self.wal.append(&mut entry)?;
        self.wal.flush()?;

        debug!(transaction_id = id, "started transaction");
        Ok(transaction)
    }

    /// Logs a data operation and buffers it on the transaction. The record
    /// is not flushed here; durability comes with the terminator.
    pub fn add_operation(
        &self,
        transaction: &Transaction<K, V>,
        mut entry: WalEntry<K, V>,
    ) -> Result<()> {
        if !transaction.is_active() {
            return Err(Error::TransactionNotActive(transaction.id()));
        }
        self.wal.append(&mut entry)?;
        transaction.push_operation(entry)
    }

    /// Commits: appends the commit record, flushes, then marks the
    /// transaction committed. Tree application happens before this call.
    pub fn commit(&self, transaction: &Transaction<K, V>) -> Result<()> {
        if !transaction.is_active() {
            return Err(Error::TransactionNotActive(transaction.id()));
        }

        let mut entry = WalEntry::marker(transaction.id(), OpKind::TxCommit);
        self.wal.append(&mut entry)?;
        self.wal.flush()?;

        transaction.set_state(TxState::Committed);
        self.active.lock().remove(&transaction.id());
        debug!(transaction_id = transaction.id(), "committed transaction");
        Ok(())
    }

    /// Rolls back: marks the transaction aborted and durably records the
    /// rollback. No tree mutation has happened, so none is undone.
    pub fn rollback(&self, transaction: &Transaction<K, V>) -> Result<()> {
        if !transaction.is_active() {
            return Err(Error::TransactionNotActive(transaction.id()));
        }

        transaction.set_state(TxState::Aborted);

        let mut entry = WalEntry::marker(transaction.id(), OpKind::TxRollback);
        self.wal.append(&mut entry)?;
        self.wal.flush()?;

        self.active.lock().remove(&transaction.id());
        debug!(transaction_id = transaction.id(), "rolled back transaction");
        Ok(())
    }

    pub fn is_transaction_active(&self, id: u64) -> bool {
        self.active
            .lock()
            .get(&id)
            .map(|t| t.is_active())
            .unwrap_or(false)
    }

    /// Rebuilds the active-transaction table from the log and rolls back
    /// every transaction that never reached a terminator (a crash left it
    /// mid-flight).
    pub fn recover(&self) -> Result<()> {
        for entry in self.wal.read_all()? {
            match entry.op {
                OpKind::TxBegin => {
                    let transaction = Transaction::new(entry.transaction_id);
                    self.active.lock().insert(entry.transaction_id, transaction);
                }
                OpKind::TxCommit => {
                    if let Some(t) = self.active.lock().remove(&entry.transaction_id) {
                        t.set_state(TxState::Committed);
                    }
                }
                OpKind::TxRollback => {
                    if let Some(t) = self.active.lock().remove(&entry.transaction_id) {
                        t.set_state(TxState::Aborted);
                    }
                }
                OpKind::Insert | OpKind::Update | OpKind::Delete | OpKind::CompareAndSet => {
                    let transaction = self.active.lock().get(&entry.transaction_id).cloned();
                    if let Some(t) = transaction {
                        t.push_operation(entry)?;
                    }
                }
            }
        }

        let orphans: Vec<Transaction<K, V>> = self.active.lock().values().cloned().collect();
        for transaction in orphans {
            warn!(
                transaction_id = transaction.id(),
                "rolling back orphaned transaction"
            );
            self.rollback(&transaction)?;
        }
        Ok(())
    }

    /// Rolls back all still-active transactions and clears state.
    pub fn shutdown(&self) -> Result<()> {
        let active: Vec<Transaction<K, V>> = self.active.lock().values().cloned().collect();
        for transaction in active {
            warn!(
                transaction_id = transaction.id(),
                "rolling back active transaction during shutdown"
            );
            self.rollback(&transaction)?;
        }
        self.active.lock().clear();
        Ok(())
    }
}
