use rustc_hash::FxHashMap;

use crate::{Tick, TxId, VarId};

/// Whether a transaction takes locks or reads from a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxKind {
    /// Two-phase locking under the available-copies rule.
    ReadWrite,
    /// Lock-free; every read resolves against the version lists at the
    /// transaction's start tick.
    ReadOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Running,
    Blocked,
    Committed,
    Aborted,
}

/// One transaction as the manager tracks it.
///
/// Writes stay local in `uncommitted` until commit; only then are they
/// applied as new versions on every up site hosting the variable.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: TxId,
    pub kind: TxKind,
    pub start_tick: Tick,
    pub status: TxStatus,
    pub uncommitted: FxHashMap<VarId, i64>,
}

impl Transaction {
    pub fn new(id: TxId, kind: TxKind, start_tick: Tick) -> Transaction {
        Transaction {
            id,
            kind,
            start_tick,
            status: TxStatus::Running,
            uncommitted: FxHashMap::default(),
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.kind == TxKind::ReadOnly
    }

    /// Running or blocked; committed and aborted transactions ignore further
    /// operations.
    pub fn is_active(&self) -> bool {
        matches!(self.status, TxStatus::Running | TxStatus::Blocked)
    }

    /// Buffer a write locally. Later writes to the same variable replace
    /// earlier ones.
    pub fn buffer_write(&mut self, var: VarId, value: i64) {
        self.uncommitted.insert(var, value);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn starts_running() {
        let t = Transaction::new(1, TxKind::ReadWrite, 5);
        assert!(t.is_active());
        assert!(!t.is_read_only());
        assert_eq!(t.start_tick, 5);
    }

    #[test]
    fn buffered_writes_replace() {
        let mut t = Transaction::new(1, TxKind::ReadWrite, 0);
        t.buffer_write(4, 10);
        t.buffer_write(4, 11);
        assert_eq!(t.uncommitted.get(&4), Some(&11));
    }
}
