//! The transaction manager: operation dispatch, wait-for graph, lock
//! waiting queues, deadlock resolution, commit validation and the retry
//! queue that implements cooperative blocking.

mod deadlock;

use std::collections::VecDeque;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info};

use crate::lock::{Lock, LockKind};
use crate::op::Op;
use crate::output::OutputSink;
use crate::result::{Acquire, ReadOutcome};
use crate::site::Site;
use crate::transaction::{Transaction, TxKind, TxStatus};
use crate::{SiteId, Tick, TxId, VarId, N_SITES};

/// The coordinator on top of the site fleet.
///
/// Processes one operation per tick, single-threaded and cooperative: an
/// operation that cannot proceed returns a blocked status, is parked in the
/// retry queue and re-attempted every following tick until it proceeds or
/// its transaction aborts. All observable results flow through the sink.
pub struct TransactionManager<S> {
    global_time: Tick,
    transactions: FxHashMap<TxId, Transaction>,
    sites: Vec<Site>,
    /// Ticks at which each site failed, oldest first.
    sites_fail_time: FxHashMap<SiteId, Vec<Tick>>,
    /// `tx -> set of transactions it waits on`.
    wait_for_graph: FxHashMap<TxId, FxHashSet<TxId>>,
    /// Per-variable FIFO of lock requests that could not be granted on
    /// arrival. Strict FIFO prevents starvation; granting never reorders.
    lock_waiting_queue: FxHashMap<VarId, VecDeque<(TxId, LockKind)>>,
    /// Blocked operations, re-attempted each tick in arrival order.
    op_retry_queue: Vec<(Op, TxId)>,
    sink: S,
}

impl<S: OutputSink> TransactionManager<S> {
    pub fn new(sink: S) -> TransactionManager<S> {
        TransactionManager {
            global_time: 0,
            transactions: FxHashMap::default(),
            sites: (1..=N_SITES).map(Site::new).collect(),
            sites_fail_time: FxHashMap::default(),
            wait_for_graph: FxHashMap::default(),
            lock_waiting_queue: FxHashMap::default(),
            op_retry_queue: Vec::new(),
            sink,
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    pub fn global_time(&self) -> Tick {
        self.global_time
    }

    pub fn transaction(&self, tx: TxId) -> Option<&Transaction> {
        self.transactions.get(&tx)
    }

    pub fn site(&self, site: SiteId) -> Option<&Site> {
        (site as usize).checked_sub(1).and_then(|i| self.sites.get(i))
    }

    /// Process one tick.
    ///
    /// Pipeline: resolve a deadlock if one exists, re-attempt parked
    /// operations, run the new operation (if any), re-attempt parked
    /// operations again (a release in step three may unblock earlier
    /// waiters the same tick), park the new operation if it blocked, then
    /// advance the clock.
    ///
    /// Returns `false` exactly when the input has ended (`op` is `None`)
    /// and the retry queue is empty, i.e. the driver may terminate.
    pub fn execute(&mut self, op: Option<Op>) -> bool {
        self.resolve_deadlock();
        self.drain_retry_queue();

        let mut failed_owner = None;
        if let Some(op) = &op {
            let (success, owner) = self.dispatch(op);
            if !success {
                failed_owner = owner;
            }
        }

        self.drain_retry_queue();

        if let (Some(op), Some(owner)) = (&op, failed_owner) {
            let owner_live = self
                .transactions
                .get(&owner)
                .is_some_and(|t| t.status != TxStatus::Aborted);
            let already_parked = self.op_retry_queue.iter().any(|(parked, _)| parked == op);
            if owner_live && !already_parked {
                self.op_retry_queue.push((op.clone(), owner));
            }
        }

        self.global_time += 1;
        op.is_some() || !self.op_retry_queue.is_empty()
    }

    /// Drive a whole operation stream to completion, pumping empty ticks
    /// after the input ends until the retry queue drains.
    pub fn run(&mut self, ops: impl IntoIterator<Item = Op>) {
        let mut ops = ops.into_iter();
        loop {
            let op = ops.next();
            if !self.execute(op) {
                break;
            }
        }
    }

    fn dispatch(&mut self, op: &Op) -> (bool, Option<TxId>) {
        let success = match *op {
            Op::Begin(tx) => self.begin(tx, TxKind::ReadWrite),
            Op::BeginRo(tx) => self.begin(tx, TxKind::ReadOnly),
            Op::Read(tx, var) => self.read(tx, var),
            Op::Write(tx, var, value) => self.write(tx, var, value),
            Op::End(tx) => self.end(tx),
            Op::Fail(site) => self.fail_site(site),
            Op::Recover(site) => self.recover_site(site),
            Op::Dump => self.dump(),
        };
        (success, op.owner())
    }

    fn drain_retry_queue(&mut self) {
        let snapshot = self.op_retry_queue.clone();
        for (op, owner) in snapshot {
            // An abort earlier in this drain may have evicted the entry.
            let still_parked = self.op_retry_queue.iter().any(|(p, o)| *p == op && *o == owner);
            if !still_parked {
                continue;
            }
            let (success, _) = self.dispatch(&op);
            if success {
                self.op_retry_queue.retain(|(p, o)| !(*p == op && *o == owner));
                if let Some(t) = self.transactions.get_mut(&owner) {
                    if t.status == TxStatus::Blocked {
                        t.status = TxStatus::Running;
                    }
                }
            }
        }
    }

    /// The sites hosting `var`, as indices into `self.sites`, in index
    /// order. Reads try them in this order, writes go to all of them.
    fn relevant_site_indices(var: VarId) -> Vec<usize> {
        if var % 2 == 0 {
            (0..N_SITES as usize).collect()
        } else {
            vec![(var % N_SITES) as usize]
        }
    }

    fn begin(&mut self, tx: TxId, kind: TxKind) -> bool {
        let start = self.global_time;
        debug!(tx, ?kind, start, "transaction begins");
        self.transactions.insert(tx, Transaction::new(tx, kind, start));
        true
    }

    fn read(&mut self, tx: TxId, var: VarId) -> bool {
        let Some(t) = self.transactions.get(&tx) else {
            info!(tx, "read ignored, transaction is not active");
            return true;
        };
        if !t.is_active() {
            info!(tx, "read ignored, transaction is not active");
            return true;
        }
        if t.is_read_only() {
            let start_tick = t.start_tick;
            return self.read_from_snapshot(tx, var, start_tick);
        }

        // Earlier requests are already waiting for this variable: unless we
        // hold a lock on it, we must wait in line behind them rather than
        // race the queue.
        if let Some(queue) = self.lock_waiting_queue.get(&var).filter(|q| !q.is_empty()) {
            let relevant = Self::relevant_site_indices(var);
            let holds_lock = relevant.iter().any(|&si| {
                let site = &self.sites[si];
                site.is_up() && site.dm.lock_on(var).is_some_and(|lock| lock.is_held_by(tx))
            });
            if !holds_lock {
                if queue.iter().any(|&(waiter, _)| waiter == tx) {
                    return false;
                }
                let edges = self.queue_tail_edges(var);
                self.add_wait_edges(tx, edges);
                self.push_waiter(var, tx, LockKind::Read);
                info!(tx, var, "read queued behind earlier lock requests");
                return false;
            }
        }

        // Reading our own uncommitted write never touches a site.
        if let Some(&value) = self.transactions.get(&tx).and_then(|t| t.uncommitted.get(&var)) {
            debug!(tx, var, value, "read served from uncommitted writes");
            self.sink.print_var(var, value);
            return true;
        }

        let relevant = Self::relevant_site_indices(var);
        for &si in &relevant {
            if !self.sites[si].is_up() {
                continue;
            }
            match self.sites[si].dm.read(var, tx) {
                ReadOutcome::Unavailable => {}
                ReadOutcome::Conflict(blockers) => {
                    self.add_wait_edges(tx, blockers);
                    if let Some(t) = self.transactions.get_mut(&tx) {
                        t.status = TxStatus::Blocked;
                    }
                    self.push_waiter(var, tx, LockKind::Read);
                    info!(tx, var, "read blocked on lock conflict");
                    return false;
                }
                ReadOutcome::Value(value) => {
                    let tick = self.global_time;
                    self.sites[si].record_first_access(tx, tick);
                    debug!(tx, var, value, site = self.sites[si].index, "read");
                    self.sink.print_var(var, value);
                    return true;
                }
            }
        }

        // Every relevant site was down or not ready; retry later.
        info!(tx, var, "read blocked, no site can serve the variable");
        false
    }

    fn write(&mut self, tx: TxId, var: VarId, value: i64) -> bool {
        let Some(t) = self.transactions.get(&tx) else {
            info!(tx, "write ignored, transaction is not active");
            return true;
        };
        if !t.is_active() {
            info!(tx, "write ignored, transaction is not active");
            return true;
        }

        // Queue gating as for reads. A transaction that already solely
        // holds the lock somewhere (its own write lock, or a sole read lock
        // eligible for promotion) bypasses the queue.
        if let Some(queue) = self.lock_waiting_queue.get(&var).filter(|q| !q.is_empty()) {
            let relevant = Self::relevant_site_indices(var);
            let holds_lock = relevant.iter().any(|&si| {
                let site = &self.sites[si];
                site.is_up() && site.dm.lock_on(var).is_some_and(|lock| lock.is_solely_held_by(tx))
            });
            if !holds_lock {
                if queue.iter().any(|&(waiter, _)| waiter == tx) {
                    return false;
                }
                let edges = self.queue_tail_edges(var);
                self.add_wait_edges(tx, edges);
                self.push_waiter(var, tx, LockKind::Write);
                info!(tx, var, "write queued behind earlier lock requests");
                return false;
            }
        }

        // Pre-check every up replica before locking any, so a write either
        // takes the lock on all of them or on none.
        let relevant = Self::relevant_site_indices(var);
        let mut unavailable = 0;
        let mut blockers: FxHashSet<TxId> = FxHashSet::default();
        let mut refused = false;
        for &si in &relevant {
            if !self.sites[si].is_up() {
                unavailable += 1;
                continue;
            }
            if let Acquire::Conflict(holders) = self.sites[si].dm.try_write(var, tx) {
                refused = true;
                blockers.extend(holders);
            }
        }
        blockers.remove(&tx);

        if refused {
            self.add_wait_edges(tx, blockers);
            if let Some(t) = self.transactions.get_mut(&tx) {
                t.status = TxStatus::Blocked;
            }
            self.push_waiter(var, tx, LockKind::Write);
            info!(tx, var, "write blocked on lock conflict");
            return false;
        }
        if unavailable == relevant.len() {
            info!(tx, var, "write blocked, every hosting site is down");
            return false;
        }

        let tick = self.global_time;
        for &si in &relevant {
            if !self.sites[si].is_up() {
                continue;
            }
            let granted = self.sites[si].dm.write(var, tx);
            debug_assert!(granted.granted());
            self.sites[si].record_first_access(tx, tick);
        }
        if let Some(t) = self.transactions.get_mut(&tx) {
            t.buffer_write(var, value);
        }
        debug!(tx, var, value, "write locked on all up replicas, value buffered");
        true
    }

    /// Multiversion read for a read-only transaction.
    ///
    /// Picks, per site, the newest version at or before the reader's start
    /// tick, rejecting versions whose site failed between the version's
    /// commit and the reader's start. Unreplicated variables skip the
    /// failure-window test: their version list is the only copy and
    /// persists across failure, so nothing can be missing from it.
    fn read_from_snapshot(&mut self, tx: TxId, var: VarId, start_tick: Tick) -> bool {
        let relevant = Self::relevant_site_indices(var);
        let mut down = 0;
        for &si in &relevant {
            if !self.sites[si].is_up() {
                down += 1;
                continue;
            }
            let (first_fail, last_fail) = if var % 2 == 0 {
                match self.sites_fail_time.get(&self.sites[si].index) {
                    Some(fails) => (fails.first().copied(), fails.last().copied()),
                    None => (None, None),
                }
            } else {
                (None, None)
            };
            if let Some(value) = self.sites[si].dm.read_from_snapshot(var, start_tick, first_fail, last_fail)
            {
                debug!(tx, var, value, site = self.sites[si].index, "snapshot read");
                self.sink.print_var(var, value);
                return true;
            }
        }
        if down == relevant.len() {
            // Every hosting site is down; retry once one comes back.
            info!(tx, var, "snapshot read blocked, every hosting site is down");
            return false;
        }
        // Some site could answer but no version is visible: no later tick
        // will change that, so the reader cannot ever succeed.
        info!(tx, var, "no version visible at the reader's start tick, aborting");
        self.abort_transaction(tx);
        false
    }

    fn end(&mut self, tx: TxId) -> bool {
        let Some(t) = self.transactions.get(&tx) else {
            info!(tx, "end ignored, unknown transaction");
            return true;
        };
        if !t.is_active() {
            info!(tx, "end ignored, transaction already finished");
            return true;
        }
        let read_only = t.is_read_only();

        // Earlier operations of this transaction may still be parked for
        // retry; commit only after they have drained, in FIFO order.
        if self
            .op_retry_queue
            .iter()
            .any(|(op, owner)| *owner == tx && !matches!(op, Op::End(_)))
        {
            debug!(tx, "end deferred behind parked operations");
            return false;
        }

        if read_only {
            return self.commit_transaction(tx);
        }

        // Available-copies validation: every site this transaction touched
        // must have stayed up since its first access there. The status of a
        // site right now is not enough; a fail-and-recover in between also
        // invalidates.
        let mut invalidated = false;
        for site in &self.sites {
            let Some(&first_access) = site.first_access_time.get(&tx) else {
                continue;
            };
            let last_fail = self.sites_fail_time.get(&site.index).and_then(|f| f.last()).copied();
            if let Some(last_fail) = last_fail {
                if first_access < last_fail {
                    info!(tx, site = site.index, "aborting, site failed after first access");
                    invalidated = true;
                    break;
                }
            }
        }
        if invalidated {
            return self.abort_transaction(tx);
        }
        self.commit_transaction(tx)
    }

    fn commit_transaction(&mut self, tx: TxId) -> bool {
        let tick = self.global_time;

        // Apply buffered writes as new versions on every up replica. Down
        // sites are skipped: the transaction only ever touched them while
        // they were up, and a mid-transaction failure aborts in `end`.
        let mut writes: Vec<(VarId, i64)> = self
            .transactions
            .get(&tx)
            .map(|t| t.uncommitted.iter().map(|(&var, &value)| (var, value)).collect())
            .unwrap_or_default();
        writes.sort_unstable();
        for (var, value) in writes {
            for &si in &Self::relevant_site_indices(var) {
                if self.sites[si].is_up() {
                    self.sites[si].dm.commit_var(var, value, tick);
                }
            }
        }

        for site in &mut self.sites {
            if site.is_up() {
                site.dm.release_all(tx);
            }
        }
        self.advance_waiting_queues();
        self.wait_for_graph.remove(&tx);
        self.remove_wait_edges_to(tx);
        if let Some(t) = self.transactions.get_mut(&tx) {
            t.status = TxStatus::Committed;
        }
        info!(tx, tick, "transaction committed");
        self.sink.report_transaction(tx, true);
        true
    }

    fn abort_transaction(&mut self, tx: TxId) -> bool {
        for site in &mut self.sites {
            if site.is_up() {
                site.dm.release_all(tx);
            }
        }
        // An aborted transaction never releases anything again; leaving its
        // queued requests behind would let the advancement loop grant it a
        // lock that wedges the variable.
        for queue in self.lock_waiting_queue.values_mut() {
            queue.retain(|&(waiter, _)| waiter != tx);
        }
        self.advance_waiting_queues();
        self.wait_for_graph.remove(&tx);
        self.remove_wait_edges_to(tx);
        self.op_retry_queue.retain(|(_, owner)| *owner != tx);
        if let Some(t) = self.transactions.get_mut(&tx) {
            t.status = TxStatus::Aborted;
        }
        info!(tx, "transaction aborted");
        self.sink.report_transaction(tx, false);
        true
    }

    /// After a release wave, try to serve the head of every non-empty
    /// waiting queue. Contiguous read requests at the head are granted in
    /// one wave; a write request is granted only when nobody else holds any
    /// lock on the variable. Requests behind the head never jump it.
    fn advance_waiting_queues(&mut self) {
        let mut vars: Vec<VarId> = self
            .lock_waiting_queue
            .iter()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(&var, _)| var)
            .collect();
        vars.sort_unstable();
        for var in vars {
            self.advance_queue_for(var);
        }
    }

    fn advance_queue_for(&mut self, var: VarId) {
        let relevant = Self::relevant_site_indices(var);
        if !relevant.iter().any(|&si| self.sites[si].is_up()) {
            // Nothing can be granted while every replica is down.
            return;
        }
        loop {
            let head = self.lock_waiting_queue.get(&var).and_then(|q| q.front()).copied();
            let Some((head_tx, head_kind)) = head else { return };
            match head_kind {
                LockKind::Read => {
                    let conflict = relevant.iter().any(|&si| {
                        let site = &self.sites[si];
                        site.is_up()
                            && matches!(site.dm.lock_on(var), Some(Lock::Write { holder }) if *holder != head_tx)
                    });
                    if conflict {
                        return;
                    }
                    for &si in &relevant {
                        if self.sites[si].is_up() {
                            let granted = self.sites[si].dm.acquire_read(var, head_tx);
                            debug_assert!(granted.granted());
                        }
                    }
                    debug!(tx = head_tx, var, "waiting read granted from queue head");
                    if let Some(queue) = self.lock_waiting_queue.get_mut(&var) {
                        queue.pop_front();
                    }
                    // Further contiguous reads may share the lock.
                }
                LockKind::Write => {
                    let held_by_other = relevant.iter().any(|&si| {
                        let site = &self.sites[si];
                        site.is_up()
                            && site.dm.lock_on(var).is_some_and(|lock| !lock.is_solely_held_by(head_tx))
                    });
                    if held_by_other {
                        return;
                    }
                    for &si in &relevant {
                        if self.sites[si].is_up() {
                            let granted = self.sites[si].dm.acquire_write(var, head_tx);
                            debug_assert!(granted.granted());
                        }
                    }
                    debug!(tx = head_tx, var, "waiting write granted from queue head");
                    if let Some(queue) = self.lock_waiting_queue.get_mut(&var) {
                        queue.pop_front();
                    }
                    // The write lock now excludes everything behind it.
                    return;
                }
            }
        }
    }

    fn fail_site(&mut self, site: SiteId) -> bool {
        let tick = self.global_time;
        let slot = (site as usize).checked_sub(1).and_then(|i| self.sites.get_mut(i));
        if let Some(s) = slot {
            s.fail();
            self.sites_fail_time.entry(site).or_default().push(tick);
        }
        true
    }

    fn recover_site(&mut self, site: SiteId) -> bool {
        let slot = (site as usize).checked_sub(1).and_then(|i| self.sites.get_mut(i));
        if let Some(s) = slot {
            s.recover();
        }
        true
    }

    fn dump(&mut self) -> bool {
        for si in 0..self.sites.len() {
            let entries = self.sites[si].dm.dump();
            let index = self.sites[si].index;
            self.sink.dump_site(index, &entries);
        }
        true
    }

    /// Whom a newly queued request must wait on, given `var`'s current
    /// waiting queue. A write request at the tail blocks the newcomer
    /// directly; read requests at the tail do not block one another, so the
    /// newcomer inherits the union of whatever the contiguous trailing
    /// reads are waiting on. Reads and writes queue under the same rule.
    fn queue_tail_edges(&self, var: VarId) -> Vec<TxId> {
        let Some(queue) = self.lock_waiting_queue.get(&var) else {
            return Vec::new();
        };
        match queue.back() {
            Some(&(tail, LockKind::Write)) => vec![tail],
            Some(&(_, LockKind::Read)) => {
                let mut union = FxHashSet::default();
                for &(waiter, kind) in queue.iter().rev() {
                    if kind != LockKind::Read {
                        break;
                    }
                    if let Some(waits) = self.wait_for_graph.get(&waiter) {
                        union.extend(waits.iter().copied());
                    }
                }
                union.into_iter().collect()
            }
            None => Vec::new(),
        }
    }

    /// Record that `tx` waits on each of `blockers`. Self-edges are never
    /// recorded and empty sets never linger in the graph.
    fn add_wait_edges(&mut self, tx: TxId, blockers: impl IntoIterator<Item = TxId>) {
        let edges = self.wait_for_graph.entry(tx).or_default();
        for blocker in blockers {
            if blocker != tx {
                edges.insert(blocker);
            }
        }
        if edges.is_empty() {
            self.wait_for_graph.remove(&tx);
        }
    }

    fn remove_wait_edges_to(&mut self, target: TxId) {
        self.wait_for_graph.retain(|_, edges| {
            edges.remove(&target);
            !edges.is_empty()
        });
    }

    fn push_waiter(&mut self, var: VarId, tx: TxId, kind: LockKind) {
        self.lock_waiting_queue.entry(var).or_default().push_back((tx, kind));
    }

    /// Break at most one cycle per tick by aborting its youngest member
    /// (largest start tick, ties toward the larger id). A remaining cycle
    /// is caught on the next tick.
    fn resolve_deadlock(&mut self) {
        let Some(cycle) = deadlock::find_cycle(&self.wait_for_graph) else {
            return;
        };
        let victim = cycle
            .iter()
            .filter_map(|&id| self.transactions.get(&id).map(|t| (t.start_tick, id)))
            .max()
            .map(|(_, id)| id);
        if let Some(victim) = victim {
            info!(victim, "aborting youngest transaction to break deadlock");
            self.abort_transaction(victim);
        }
    }
}
