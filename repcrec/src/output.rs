use crate::{SiteId, TxId, VarId};

/// Sink for the engine's observable results.
///
/// The exact text format is the sink's business; the engine only promises to
/// deliver the (variable, value), (transaction, outcome) and
/// (site, variable, value) tuples. [`StdoutSink`] renders them as the
/// classic report lines, [`MemorySink`] records them for inspection.
pub trait OutputSink {
    /// A successful read observed `value` for `var`.
    fn print_var(&mut self, var: VarId, value: i64);

    /// Transaction `tx` reached its final state.
    fn report_transaction(&mut self, tx: TxId, committed: bool);

    /// One site's slice of a `dump()`: latest committed values of all
    /// variables it hosts, sorted by variable index.
    fn dump_site(&mut self, site: SiteId, entries: &[(VarId, i64)]);
}

/// Renders results as report lines on stdout.
///
/// Diagnostics go to `tracing` (stderr in the shipped binary), so stdout
/// stays a clean report stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutSink;

impl OutputSink for StdoutSink {
    fn print_var(&mut self, var: VarId, value: i64) {
        println!("x{var}: {value}");
    }

    fn report_transaction(&mut self, tx: TxId, committed: bool) {
        if committed {
            println!("T{tx} commits.");
        } else {
            println!("T{tx} aborts.");
        }
    }

    fn dump_site(&mut self, site: SiteId, entries: &[(VarId, i64)]) {
        let line: Vec<String> = entries.iter().map(|(var, value)| format!("x{var}: {value}")).collect();
        println!("site {site} - {}", line.join(", "));
    }
}

/// One recorded sink event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    VarRead { var: VarId, value: i64 },
    TransactionEnded { tx: TxId, committed: bool },
    SiteDump { site: SiteId, entries: Vec<(VarId, i64)> },
}

/// Records every event in order. Used by tests and benchmarks.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MemorySink {
    pub events: Vec<Event>,
}

impl OutputSink for MemorySink {
    fn print_var(&mut self, var: VarId, value: i64) {
        self.events.push(Event::VarRead { var, value });
    }

    fn report_transaction(&mut self, tx: TxId, committed: bool) {
        self.events.push(Event::TransactionEnded { tx, committed });
    }

    fn dump_site(&mut self, site: SiteId, entries: &[(VarId, i64)]) {
        self.events.push(Event::SiteDump { site, entries: entries.to_vec() });
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn memory_sink_records_in_order() {
        let mut sink = MemorySink::default();
        sink.print_var(3, 30);
        sink.report_transaction(1, true);
        sink.dump_site(2, &[(2, 20), (4, 40)]);

        assert_eq!(
            sink.events,
            vec![
                Event::VarRead { var: 3, value: 30 },
                Event::TransactionEnded { tx: 1, committed: true },
                Event::SiteDump { site: 2, entries: vec![(2, 20), (4, 40)] },
            ]
        );
    }
}
