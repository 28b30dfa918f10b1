use std::collections::hash_map::Entry;

use rustc_hash::FxHashMap;
use tracing::{debug, info};

use crate::lock::{Lock, LockKind};
use crate::result::{Acquire, ReadOutcome};
use crate::{SiteId, Tick, TxId, VarId, N_SITES, N_VARS};

/// Availability of one variable copy at one site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarStatus {
    /// Reads are permitted under the available-copies rule.
    Ready,
    /// The site is down; nothing is served.
    Unavailable,
    /// The site recovered but this replicated copy has not seen a committed
    /// write yet, so reads would be stale. Writes are accepted.
    Recovering,
}

/// One committed version of a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub tick: Tick,
    pub value: i64,
}

/// `true` iff `site` hosts a copy of `var`.
///
/// Even-indexed variables are replicated everywhere; odd-indexed variable
/// `i` lives only on site `(i % 10) + 1`.
pub fn hosts(site: SiteId, var: VarId) -> bool {
    var % 2 == 0 || var % N_SITES + 1 == site
}

/// The data manager of one site.
///
/// Owns the per-variable version lists (the durable record that survives
/// failure), the availability state machine, and the lock table (which does
/// not survive failure). It knows nothing about other sites, and nothing
/// about transactions beyond the ids it records in lock entries.
#[derive(Debug, Clone)]
pub struct DataManager {
    site: SiteId,
    versions: FxHashMap<VarId, Vec<Version>>,
    status: FxHashMap<VarId, VarStatus>,
    locks: FxHashMap<VarId, Lock>,
}

impl DataManager {
    /// A fresh data manager with the initial version `(0, 10 * index)` for
    /// every hosted variable.
    pub fn new(site: SiteId) -> DataManager {
        let mut versions = FxHashMap::default();
        let mut status = FxHashMap::default();
        for var in 1..=N_VARS {
            if hosts(site, var) {
                versions.insert(var, vec![Version { tick: 0, value: i64::from(var) * 10 }]);
                status.insert(var, VarStatus::Ready);
            }
        }
        DataManager { site, versions, status, locks: FxHashMap::default() }
    }

    pub fn var_status(&self, var: VarId) -> Option<VarStatus> {
        self.status.get(&var).copied()
    }

    /// Lock information is lost on failure; the version lists persist.
    pub fn fail(&mut self) {
        self.locks.clear();
        for status in self.status.values_mut() {
            *status = VarStatus::Unavailable;
        }
        info!(site = self.site, "site failed, lock table erased");
    }

    /// Replicated copies come back `Recovering` until a committed write
    /// refreshes them. Unreplicated copies are immediately `Ready`: no
    /// writes were possible elsewhere during the outage and the version
    /// list persisted.
    pub fn recover(&mut self) {
        for (var, status) in &mut self.status {
            *status = if var % 2 == 0 { VarStatus::Recovering } else { VarStatus::Ready };
        }
        info!(site = self.site, "site recovered");
    }

    /// Latest committed value, only while the copy is `Ready`.
    pub fn latest_committed(&self, var: VarId) -> Option<i64> {
        if self.status.get(&var) != Some(&VarStatus::Ready) {
            return None;
        }
        self.versions.get(&var).and_then(|versions| versions.last()).map(|v| v.value)
    }

    /// Serve a read for `tx`: take (or share) the read lock and return the
    /// latest committed value.
    ///
    /// `Unavailable` is returned when the copy is not `Ready`, so the caller
    /// can distinguish "try another replica" from "wait for these holders".
    pub fn read(&mut self, var: VarId, tx: TxId) -> ReadOutcome {
        if self.status.get(&var) != Some(&VarStatus::Ready) {
            return ReadOutcome::Unavailable;
        }
        match self.acquire_read(var, tx) {
            Acquire::Granted => match self.latest_committed(var) {
                Some(value) => {
                    debug!(site = self.site, var, value, tx, "read served");
                    ReadOutcome::Value(value)
                }
                // Ready copies always carry at least the initial version.
                None => ReadOutcome::Unavailable,
            },
            Acquire::Conflict(blockers) => {
                debug!(site = self.site, var, tx, ?blockers, "read lock refused");
                ReadOutcome::Conflict(blockers)
            }
        }
    }

    /// Take the write lock for `tx`.
    ///
    /// No value is applied here; the transaction manager buffers the value
    /// and applies it at commit via [`DataManager::commit_var`].
    pub fn write(&mut self, var: VarId, tx: TxId) -> Acquire {
        debug_assert_ne!(self.status.get(&var), Some(&VarStatus::Unavailable));
        self.acquire_write(var, tx)
    }

    /// Append a committed version. A `Recovering` copy becomes `Ready`
    /// again once it has a fresh committed write.
    pub fn commit_var(&mut self, var: VarId, value: i64, tick: Tick) {
        if let Some(versions) = self.versions.get_mut(&var) {
            versions.push(Version { tick, value });
            debug!(site = self.site, var, value, tick, "version committed");
        }
        if self.status.get(&var) == Some(&VarStatus::Recovering) {
            self.status.insert(var, VarStatus::Ready);
        }
    }

    /// Grant a read lock unless a conflicting write lock is in the way.
    /// Re-granting to an existing holder is idempotent, and a transaction
    /// holding the write lock may of course read.
    pub fn acquire_read(&mut self, var: VarId, tx: TxId) -> Acquire {
        match self.locks.entry(var) {
            Entry::Vacant(entry) => {
                entry.insert(Lock::read(tx));
                Acquire::Granted
            }
            Entry::Occupied(mut entry) => match entry.get_mut() {
                Lock::Read { holders } => {
                    holders.insert(tx);
                    Acquire::Granted
                }
                Lock::Write { holder } if *holder == tx => Acquire::Granted,
                Lock::Write { holder } => Acquire::Conflict(vec![*holder]),
            },
        }
    }

    /// Grant a write lock if the variable is unlocked, already write-held by
    /// `tx`, or read-held by `tx` alone (promotion).
    pub fn acquire_write(&mut self, var: VarId, tx: TxId) -> Acquire {
        match self.locks.entry(var) {
            Entry::Vacant(entry) => {
                entry.insert(Lock::write(tx));
                Acquire::Granted
            }
            Entry::Occupied(mut entry) => {
                if entry.get().is_solely_held_by(tx) {
                    if entry.get().kind() == LockKind::Read {
                        info!(site = self.site, var, tx, "promoting read lock to write lock");
                    }
                    *entry.get_mut() = Lock::write(tx);
                    Acquire::Granted
                } else {
                    Acquire::Conflict(entry.get().holders())
                }
            }
        }
    }

    /// Same predicate as [`DataManager::acquire_write`] but without
    /// mutating the table. The manager pre-checks every replica with this
    /// before acquiring on any, so a write either locks all up replicas or
    /// none.
    pub fn try_write(&self, var: VarId, tx: TxId) -> Acquire {
        match self.locks.get(&var) {
            None => Acquire::Granted,
            Some(lock) if lock.is_solely_held_by(tx) => Acquire::Granted,
            Some(lock) => Acquire::Conflict(lock.holders()),
        }
    }

    /// Drop `tx` from every lock entry, removing entries that become empty.
    /// Tolerates transactions that hold nothing here.
    pub fn release_all(&mut self, tx: TxId) {
        let site = self.site;
        self.locks.retain(|var, lock| match lock {
            Lock::Read { holders } => {
                if holders.remove(&tx) {
                    debug!(site, var, tx, "read lock released");
                }
                !holders.is_empty()
            }
            Lock::Write { holder } => {
                if *holder == tx {
                    debug!(site, var, tx, "write lock released");
                    false
                } else {
                    true
                }
            }
        });
    }

    /// Current lock entry for `var`, if any.
    pub fn lock_on(&self, var: VarId) -> Option<&Lock> {
        self.locks.get(&var)
    }

    /// Latest committed value of every hosted variable, sorted by index.
    /// Dumps report the durable record, so availability is ignored.
    pub fn dump(&self) -> Vec<(VarId, i64)> {
        let mut entries: Vec<(VarId, i64)> = self
            .versions
            .iter()
            .filter_map(|(var, versions)| versions.last().map(|v| (*var, v.value)))
            .collect();
        entries.sort_unstable();
        entries
    }

    /// Multiversion read for read-only transactions.
    ///
    /// Scans newest-first for the first version with `tick <= start_tick`
    /// and accepts it iff no failure of this site intersected
    /// `[tick, start_tick]`: the site either never failed, first failed
    /// after the reader began, or last failed before the version was
    /// written. If the candidate version is disqualified, no older version
    /// is considered.
    pub fn read_from_snapshot(
        &self,
        var: VarId,
        start_tick: Tick,
        first_fail: Option<Tick>,
        last_fail: Option<Tick>,
    ) -> Option<i64> {
        let versions = self.versions.get(&var)?;
        for version in versions.iter().rev() {
            if version.tick <= start_tick {
                let intact = match (first_fail, last_fail) {
                    (None, _) => true,
                    (Some(first), _) if first > start_tick => true,
                    (_, Some(last)) if last < version.tick => true,
                    _ => false,
                };
                if intact {
                    debug!(site = self.site, var, value = version.value, "snapshot read served");
                }
                return intact.then_some(version.value);
            }
        }
        None
    }
}
