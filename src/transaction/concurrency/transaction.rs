use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::{Rid, TxnId};

/// Transaction isolation levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
}

/// Lifecycle of a transaction under strict two-phase locking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

impl TransactionState {
    fn as_u8(self) -> u8 {
        match self {
            TransactionState::Growing => 0,
            TransactionState::Shrinking => 1,
            TransactionState::Committed => 2,
            TransactionState::Aborted => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => TransactionState::Growing,
            1 => TransactionState::Shrinking,
            2 => TransactionState::Committed,
            _ => TransactionState::Aborted,
        }
    }
}

/// Why a transaction was aborted by the lock manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    LockOnShrinking,
    LockSharedOnReadUncommitted,
    UnlockOnShrinking,
    UpgradeConflict,
    Deadlock,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            AbortReason::LockOnShrinking => "lock requested in the shrinking phase",
            AbortReason::LockSharedOnReadUncommitted => {
                "shared lock requested under read-uncommitted"
            }
            AbortReason::UnlockOnShrinking => "unlock while shrinking under read-uncommitted",
            AbortReason::UpgradeConflict => "another transaction is already upgrading",
            AbortReason::Deadlock => "chosen as deadlock victim",
        };
        f.write_str(text)
    }
}

/// Errors that can occur during transaction processing
#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Transaction {txn_id} aborted: {reason}")]
    Abort { txn_id: TxnId, reason: AbortReason },

    #[error("Transaction {0} not found")]
    NotFound(TxnId),

    #[error("Transaction {0} is already committed or aborted")]
    InvalidState(TxnId),
}

impl TransactionError {
    pub fn abort_reason(&self) -> Option<AbortReason> {
        match self {
            TransactionError::Abort { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

/// An active database transaction.
///
/// The state is an atomic so the deadlock detector can abort a transaction
/// from its own thread; a waiter blocked in the lock manager rechecks the
/// state after every condition-variable wake.
pub struct Transaction {
    id: TxnId,
    isolation_level: IsolationLevel,
    state: AtomicU8,
    shared_lock_set: Mutex<HashSet<Rid>>,
    exclusive_lock_set: Mutex<HashSet<Rid>>,
}

impl Transaction {
    pub fn new(id: TxnId, isolation_level: IsolationLevel) -> Self {
        Self {
            id,
            isolation_level,
            state: AtomicU8::new(TransactionState::Growing.as_u8()),
            shared_lock_set: Mutex::new(HashSet::new()),
            exclusive_lock_set: Mutex::new(HashSet::new()),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn state(&self) -> TransactionState {
        TransactionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: TransactionState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    pub fn is_shared_locked(&self, rid: Rid) -> bool {
        self.shared_lock_set.lock().contains(&rid)
    }

    pub fn is_exclusive_locked(&self, rid: Rid) -> bool {
        self.exclusive_lock_set.lock().contains(&rid)
    }

    pub fn shared_lock_set(&self) -> &Mutex<HashSet<Rid>> {
        &self.shared_lock_set
    }

    pub fn exclusive_lock_set(&self) -> &Mutex<HashSet<Rid>> {
        &self.exclusive_lock_set
    }

    /// Every rid this transaction currently holds a lock on, in any mode.
    pub fn held_locks(&self) -> Vec<Rid> {
        let mut rids: Vec<Rid> = self.shared_lock_set.lock().iter().copied().collect();
        rids.extend(self.exclusive_lock_set.lock().iter().copied());
        rids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_transaction_is_growing() {
        let txn = Transaction::new(1, IsolationLevel::RepeatableRead);
        assert_eq!(txn.id(), 1);
        assert_eq!(txn.state(), TransactionState::Growing);
        assert_eq!(txn.isolation_level(), IsolationLevel::RepeatableRead);
        assert!(txn.held_locks().is_empty());
    }

    #[test]
    fn test_state_transitions_are_visible() {
        let txn = Transaction::new(2, IsolationLevel::ReadCommitted);
        txn.set_state(TransactionState::Shrinking);
        assert_eq!(txn.state(), TransactionState::Shrinking);
        txn.set_state(TransactionState::Aborted);
        assert_eq!(txn.state(), TransactionState::Aborted);
    }

    #[test]
    fn test_lock_set_bookkeeping() {
        let txn = Transaction::new(3, IsolationLevel::RepeatableRead);
        let rid = Rid::new(4, 2);

        txn.shared_lock_set().lock().insert(rid);
        assert!(txn.is_shared_locked(rid));
        assert!(!txn.is_exclusive_locked(rid));

        txn.shared_lock_set().lock().remove(&rid);
        txn.exclusive_lock_set().lock().insert(rid);
        assert!(!txn.is_shared_locked(rid));
        assert!(txn.is_exclusive_locked(rid));
        assert_eq!(txn.held_locks(), vec![rid]);
    }
}
