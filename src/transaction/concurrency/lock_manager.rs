use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::common::types::{Rid, TxnId};
use crate::transaction::concurrency::transaction::{
    AbortReason, IsolationLevel, Transaction, TransactionError, TransactionState,
};
use crate::transaction::concurrency::transaction_manager::TransactionRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug, Clone)]
struct LockRequest {
    txn_id: TxnId,
    mode: LockMode,
    granted: bool,
}

#[derive(Default)]
struct QueueState {
    requests: VecDeque<LockRequest>,
    upgrading: bool,
}

/// Per-record lock queue: FIFO requests, a condition variable for waiters,
/// and the single-upgrader flag.
#[derive(Default)]
struct RecordQueue {
    state: Mutex<QueueState>,
    cv: Condvar,
}

pub struct LockManagerConfig {
    /// How often the background detector scans for wait-for cycles.
    pub detection_interval: Duration,
    /// Spawn the background detector thread. Tests that drive
    /// `detect_once` themselves can turn it off.
    pub run_detector: bool,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self {
            detection_interval: Duration::from_millis(50),
            run_detector: true,
        }
    }
}

struct LockManagerInner {
    lock_table: Mutex<HashMap<Rid, Arc<RecordQueue>>>,
    /// waiter -> set of holders it waits on; owned by the cycle detector
    waits_for: Mutex<BTreeMap<TxnId, BTreeSet<TxnId>>>,
    registry: TransactionRegistry,
    shutdown: AtomicBool,
    detection_interval: Duration,
}

/// Tuple-level strict two-phase locking with FIFO fairness, shared/exclusive
/// modes, lock upgrade, and deadlock resolution by victim abort.
pub struct LockManager {
    inner: Arc<LockManagerInner>,
    detector: Mutex<Option<JoinHandle<()>>>,
}

impl LockManager {
    pub fn new(registry: TransactionRegistry) -> Self {
        Self::with_config(registry, LockManagerConfig::default())
    }

    pub fn with_config(registry: TransactionRegistry, config: LockManagerConfig) -> Self {
        let inner = Arc::new(LockManagerInner {
            lock_table: Mutex::new(HashMap::new()),
            waits_for: Mutex::new(BTreeMap::new()),
            registry,
            shutdown: AtomicBool::new(false),
            detection_interval: config.detection_interval,
        });

        let detector = if config.run_detector {
            let worker = inner.clone();
            let handle = thread::Builder::new()
                .name("cycle-detector".to_string())
                .spawn(move || run_cycle_detection(worker))
                .expect("failed to spawn the cycle detector");
            Some(handle)
        } else {
            None
        };

        Self {
            inner,
            detector: Mutex::new(detector),
        }
    }

    /// Acquire a shared lock on `rid`, blocking until the grant predicate
    /// holds. Returns false if the transaction is already aborted.
    pub fn lock_shared(&self, txn: &Transaction, rid: Rid) -> Result<bool, TransactionError> {
        debug_assert!(!txn.is_shared_locked(rid), "shared lock requested twice");
        debug_assert!(
            !txn.is_exclusive_locked(rid),
            "shared lock requested while holding exclusive"
        );

        if txn.state() == TransactionState::Aborted {
            return Ok(false);
        }
        if txn.isolation_level() == IsolationLevel::ReadUncommitted {
            return Err(self.abort(txn, AbortReason::LockSharedOnReadUncommitted));
        }
        if txn.state() == TransactionState::Shrinking {
            return Err(self.abort(txn, AbortReason::LockOnShrinking));
        }

        let queue = self.inner.record_queue(rid);
        let mut state = queue.state.lock();
        let txn_id = txn.id();
        state.requests.push_back(LockRequest {
            txn_id,
            mode: LockMode::Shared,
            granted: false,
        });

        while !should_grant(&state.requests, txn_id) {
            queue.cv.wait(&mut state);
            if txn.state() == TransactionState::Aborted {
                state.requests.retain(|r| r.txn_id != txn_id);
                queue.cv.notify_all();
                return Err(TransactionError::Abort {
                    txn_id,
                    reason: AbortReason::Deadlock,
                });
            }
        }

        grant(&mut state.requests, txn_id);
        drop(state);

        txn.shared_lock_set().lock().insert(rid);
        Ok(true)
    }

    /// Acquire an exclusive lock on `rid`. Valid in every isolation level.
    pub fn lock_exclusive(&self, txn: &Transaction, rid: Rid) -> Result<bool, TransactionError> {
        debug_assert!(
            !txn.is_shared_locked(rid),
            "exclusive lock requested while holding shared; upgrade instead"
        );
        debug_assert!(!txn.is_exclusive_locked(rid), "exclusive lock requested twice");

        if txn.state() == TransactionState::Aborted {
            return Ok(false);
        }
        if txn.state() == TransactionState::Shrinking {
            return Err(self.abort(txn, AbortReason::LockOnShrinking));
        }

        let queue = self.inner.record_queue(rid);
        let mut state = queue.state.lock();
        let txn_id = txn.id();
        state.requests.push_back(LockRequest {
            txn_id,
            mode: LockMode::Exclusive,
            granted: false,
        });

        while !should_grant(&state.requests, txn_id) {
            queue.cv.wait(&mut state);
            if txn.state() == TransactionState::Aborted {
                state.requests.retain(|r| r.txn_id != txn_id);
                queue.cv.notify_all();
                return Err(TransactionError::Abort {
                    txn_id,
                    reason: AbortReason::Deadlock,
                });
            }
        }

        grant(&mut state.requests, txn_id);
        drop(state);

        txn.exclusive_lock_set().lock().insert(rid);
        Ok(true)
    }

    /// Upgrade a held shared lock to exclusive. Only one transaction per
    /// record may be upgrading; a second one aborts with `UpgradeConflict`.
    /// The upgraded request jumps ahead of all other waiters.
    pub fn lock_upgrade(&self, txn: &Transaction, rid: Rid) -> Result<bool, TransactionError> {
        debug_assert!(txn.is_shared_locked(rid), "upgrade requires a held shared lock");
        debug_assert!(!txn.is_exclusive_locked(rid), "upgrade of an exclusive lock");

        if txn.state() == TransactionState::Aborted {
            return Ok(false);
        }
        if txn.state() == TransactionState::Shrinking {
            return Err(self.abort(txn, AbortReason::LockOnShrinking));
        }

        let queue = self.inner.record_queue(rid);
        let mut state = queue.state.lock();
        if state.upgrading {
            drop(state);
            return Err(self.abort(txn, AbortReason::UpgradeConflict));
        }
        state.upgrading = true;

        // Replace the shared request with an exclusive one placed right
        // behind the granted prefix, ahead of every other waiter.
        let txn_id = txn.id();
        state.requests.retain(|r| r.txn_id != txn_id);
        let position = state
            .requests
            .iter()
            .position(|r| !r.granted)
            .unwrap_or(state.requests.len());
        state.requests.insert(
            position,
            LockRequest {
                txn_id,
                mode: LockMode::Exclusive,
                granted: false,
            },
        );

        while !should_grant(&state.requests, txn_id) {
            queue.cv.wait(&mut state);
            if txn.state() == TransactionState::Aborted {
                state.requests.retain(|r| r.txn_id != txn_id);
                state.upgrading = false;
                queue.cv.notify_all();
                return Err(TransactionError::Abort {
                    txn_id,
                    reason: AbortReason::Deadlock,
                });
            }
        }

        grant(&mut state.requests, txn_id);
        state.upgrading = false;
        drop(state);

        txn.shared_lock_set().lock().remove(&rid);
        txn.exclusive_lock_set().lock().insert(rid);
        Ok(true)
    }

    /// Release this transaction's lock on `rid` and wake the queue. The
    /// first exclusive release moves the transaction into its shrinking
    /// phase (read-uncommitted has no shrinking phase at all).
    pub fn unlock(&self, txn: &Transaction, rid: Rid) -> Result<bool, TransactionError> {
        if txn.isolation_level() == IsolationLevel::ReadUncommitted
            && txn.state() == TransactionState::Shrinking
        {
            return Err(self.abort(txn, AbortReason::UnlockOnShrinking));
        }

        let queue = self.inner.record_queue(rid);
        {
            let mut state = queue.state.lock();
            let txn_id = txn.id();
            state.requests.retain(|r| r.txn_id != txn_id);
            queue.cv.notify_all();
        }

        if self.enters_shrinking(txn, rid) {
            txn.set_state(TransactionState::Shrinking);
        }

        txn.shared_lock_set().lock().remove(&rid);
        txn.exclusive_lock_set().lock().remove(&rid);
        Ok(true)
    }

    /// Drop every lock the transaction still holds, waking all affected
    /// queues. Used by commit and abort, which bypass the shrinking policy.
    pub fn release_all(&self, txn: &Transaction) {
        let txn_id = txn.id();
        let mut rids: Vec<Rid> = txn.shared_lock_set().lock().drain().collect();
        rids.extend(txn.exclusive_lock_set().lock().drain());

        for rid in rids {
            if let Some(queue) = self.inner.existing_queue(rid) {
                let mut state = queue.state.lock();
                state.requests.retain(|r| r.txn_id != txn_id);
                queue.cv.notify_all();
            }
        }
    }

    /// Run one build-detect-abort pass of the deadlock detector
    /// synchronously. The background thread runs exactly this.
    pub fn detect_once(&self) {
        self.inner.detect_and_break_cycles();
    }

    fn enters_shrinking(&self, txn: &Transaction, rid: Rid) -> bool {
        txn.state() == TransactionState::Growing
            && txn.isolation_level() != IsolationLevel::ReadUncommitted
            && txn.is_exclusive_locked(rid)
    }

    fn abort(&self, txn: &Transaction, reason: AbortReason) -> TransactionError {
        txn.set_state(TransactionState::Aborted);
        TransactionError::Abort {
            txn_id: txn.id(),
            reason,
        }
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.detector.lock().take() {
            let _ = handle.join();
        }
    }
}

/// A request is granted iff every request ahead of it is granted and
/// compatible: only shared-before-shared coexists, and an ungranted request
/// ahead always blocks, which keeps the queue FIFO and writers unstarved.
fn should_grant(requests: &VecDeque<LockRequest>, txn_id: TxnId) -> bool {
    let mode = match requests.iter().find(|r| r.txn_id == txn_id) {
        Some(request) => request.mode,
        None => return false,
    };

    for request in requests {
        if request.txn_id == txn_id {
            return true;
        }
        if !request.granted {
            return false;
        }
        if request.mode == LockMode::Exclusive || mode == LockMode::Exclusive {
            return false;
        }
    }
    false
}

fn grant(requests: &mut VecDeque<LockRequest>, txn_id: TxnId) {
    if let Some(request) = requests.iter_mut().find(|r| r.txn_id == txn_id) {
        request.granted = true;
    }
}

fn run_cycle_detection(inner: Arc<LockManagerInner>) {
    while !inner.shutdown.load(Ordering::SeqCst) {
        thread::sleep(inner.detection_interval);
        inner.detect_and_break_cycles();
    }
}

impl LockManagerInner {
    /// Locate or create the queue for a record. The global latch is held
    /// only for the table lookup; all further work uses the queue latch.
    fn record_queue(&self, rid: Rid) -> Arc<RecordQueue> {
        let mut table = self.lock_table.lock();
        table.entry(rid).or_default().clone()
    }

    fn existing_queue(&self, rid: Rid) -> Option<Arc<RecordQueue>> {
        self.lock_table.lock().get(&rid).cloned()
    }

    fn detect_and_break_cycles(&self) {
        self.build_graph();
        while let Some(victim) = self.find_cycle_victim() {
            log::warn!("aborting transaction {} to break a deadlock", victim);
            if let Some(txn) = self.registry.get(victim) {
                txn.set_state(TransactionState::Aborted);
            }
            self.remove_from_graph(victim);
            self.notify_queues_holding(victim);
        }
        self.waits_for.lock().clear();
    }

    /// Rebuild the wait-for graph: for every record, each waiting request
    /// points at each granted one, skipping transactions already aborted.
    fn build_graph(&self) {
        let table = self.lock_table.lock();
        let mut graph = self.waits_for.lock();
        graph.clear();

        for queue in table.values() {
            let state = queue.state.lock();
            let mut granted = Vec::new();
            let mut waiting = Vec::new();
            for request in &state.requests {
                if self.is_aborted(request.txn_id) {
                    continue;
                }
                if request.granted {
                    granted.push(request.txn_id);
                } else {
                    waiting.push(request.txn_id);
                }
            }
            for &waiter in &waiting {
                let edges = graph.entry(waiter).or_default();
                for &holder in &granted {
                    if holder != waiter {
                        edges.insert(holder);
                    }
                }
            }
        }
    }

    fn is_aborted(&self, txn_id: TxnId) -> bool {
        self.registry
            .get(txn_id)
            .map_or(false, |txn| txn.state() == TransactionState::Aborted)
    }

    /// Deterministic DFS over the graph (sources and destinations in
    /// ascending txn id). On a back edge, the largest id on the recorded
    /// route, the youngest transaction in the cycle, is the victim.
    fn find_cycle_victim(&self) -> Option<TxnId> {
        let graph = self.waits_for.lock();
        let mut visited = BTreeSet::new();

        for &start in graph.keys() {
            if visited.contains(&start) {
                continue;
            }
            let mut route = BTreeSet::new();
            if Self::has_cycle(&graph, start, &mut visited, &mut route) {
                return route.iter().next_back().copied();
            }
        }
        None
    }

    fn has_cycle(
        graph: &BTreeMap<TxnId, BTreeSet<TxnId>>,
        source: TxnId,
        visited: &mut BTreeSet<TxnId>,
        route: &mut BTreeSet<TxnId>,
    ) -> bool {
        if route.contains(&source) {
            return true;
        }
        if visited.contains(&source) {
            return false;
        }
        visited.insert(source);
        route.insert(source);

        if let Some(destinations) = graph.get(&source) {
            for &destination in destinations {
                if Self::has_cycle(graph, destination, visited, route) {
                    return true;
                }
            }
        }

        route.remove(&source);
        false
    }

    fn remove_from_graph(&self, victim: TxnId) {
        let mut graph = self.waits_for.lock();
        graph.remove(&victim);
        for edges in graph.values_mut() {
            edges.remove(&victim);
        }
    }

    /// Wake every queue holding a request from the victim so its waiter can
    /// observe the abort and clean itself up.
    fn notify_queues_holding(&self, victim: TxnId) {
        let table = self.lock_table.lock();
        for queue in table.values() {
            let state = queue.state.lock();
            if state.requests.iter().any(|r| r.txn_id == victim) {
                queue.cv.notify_all();
            }
        }
    }
}
