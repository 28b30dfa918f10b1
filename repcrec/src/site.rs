use rustc_hash::FxHashMap;
use tracing::info;

use crate::data_manager::DataManager;
use crate::{SiteId, Tick, TxId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteStatus {
    Up,
    Down,
    /// Back up, but replicated variables are stale until written. The
    /// per-variable gating lives in the data manager; at the site level a
    /// recovering site accepts traffic like an up one.
    Recovering,
}

/// One site: a data manager plus the bookkeeping the transaction manager
/// needs for commit validation.
#[derive(Debug, Clone)]
pub struct Site {
    pub index: SiteId,
    pub status: SiteStatus,
    pub dm: DataManager,
    /// Tick of each transaction's first successful access here. Compared
    /// against the site's failure history at commit time: the test is not
    /// whether the site is up at `end`, but whether it stayed up since the
    /// transaction first touched it.
    pub first_access_time: FxHashMap<TxId, Tick>,
}

impl Site {
    pub fn new(index: SiteId) -> Site {
        Site {
            index,
            status: SiteStatus::Up,
            dm: DataManager::new(index),
            first_access_time: FxHashMap::default(),
        }
    }

    /// Down sites serve nothing; up and recovering sites both take traffic.
    pub fn is_up(&self) -> bool {
        self.status != SiteStatus::Down
    }

    pub fn fail(&mut self) {
        self.dm.fail();
        self.status = SiteStatus::Down;
        info!(site = self.index, "site is down");
    }

    pub fn recover(&mut self) {
        self.dm.recover();
        self.status = SiteStatus::Recovering;
        info!(site = self.index, "site is recovering");
    }

    /// Record `tx`'s first successful access; later accesses keep the
    /// original tick.
    pub fn record_first_access(&mut self, tx: TxId, tick: Tick) {
        self.first_access_time.entry(tx).or_insert(tick);
    }
}
