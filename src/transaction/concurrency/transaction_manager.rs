use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use parking_lot::Mutex;

use crate::common::types::TxnId;
use crate::transaction::concurrency::lock_manager::LockManager;
use crate::transaction::concurrency::transaction::{
    IsolationLevel, Transaction, TransactionError, TransactionState,
};

/// Shared map of live transactions. The transaction manager registers and
/// retires entries; the deadlock detector reads it to translate txn ids
/// back into transactions it can abort.
#[derive(Clone, Default)]
pub struct TransactionRegistry {
    inner: Arc<Mutex<HashMap<TxnId, Arc<Transaction>>>>,
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, txn_id: TxnId) -> Option<Arc<Transaction>> {
        self.inner.lock().get(&txn_id).cloned()
    }

    pub fn live_ids(&self) -> Vec<TxnId> {
        self.inner.lock().keys().copied().collect()
    }

    fn insert(&self, txn: Arc<Transaction>) {
        self.inner.lock().insert(txn.id(), txn);
    }

    fn remove(&self, txn_id: TxnId) {
        self.inner.lock().remove(&txn_id);
    }
}

/// Creates and tracks transactions. Commit and abort release every lock
/// the transaction still holds before retiring it from the registry.
pub struct TransactionManager {
    next_txn_id: AtomicU32,
    registry: TransactionRegistry,
    lock_manager: Arc<LockManager>,
}

impl TransactionManager {
    pub fn new(lock_manager: Arc<LockManager>, registry: TransactionRegistry) -> Self {
        Self {
            next_txn_id: AtomicU32::new(1),
            registry,
            lock_manager,
        }
    }

    /// Begin a new transaction with a fresh monotonic id.
    pub fn begin(&self, isolation_level: IsolationLevel) -> Arc<Transaction> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let txn = Arc::new(Transaction::new(txn_id, isolation_level));
        self.registry.insert(txn.clone());
        txn
    }

    pub fn commit(&self, txn: &Arc<Transaction>) -> Result<(), TransactionError> {
        match txn.state() {
            TransactionState::Committed | TransactionState::Aborted => {
                return Err(TransactionError::InvalidState(txn.id()));
            }
            _ => {}
        }
        self.lock_manager.release_all(txn);
        txn.set_state(TransactionState::Committed);
        self.registry.remove(txn.id());
        Ok(())
    }

    /// Abort a transaction, releasing its locks. Aborting a transaction the
    /// deadlock detector already marked aborted just finishes the cleanup.
    pub fn abort(&self, txn: &Arc<Transaction>) -> Result<(), TransactionError> {
        if txn.state() == TransactionState::Committed {
            return Err(TransactionError::InvalidState(txn.id()));
        }
        self.lock_manager.release_all(txn);
        txn.set_state(TransactionState::Aborted);
        self.registry.remove(txn.id());
        Ok(())
    }

    pub fn get_transaction(&self, txn_id: TxnId) -> Option<Arc<Transaction>> {
        self.registry.get(txn_id)
    }
}
