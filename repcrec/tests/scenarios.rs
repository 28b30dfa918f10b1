//! End-to-end scripts driven through the engine, asserting on the recorded
//! event stream.

use repcrec::{Event, MemorySink, Op, TransactionManager, N_SITES};

fn run_script(script: &str) -> Vec<Event> {
    let mut engine = TransactionManager::new(MemorySink::default());
    let ops = script.lines().filter_map(|line| {
        let line = line.trim();
        (!line.is_empty()).then(|| line.parse::<Op>().unwrap())
    });
    engine.run(ops);
    engine.into_sink().events
}

fn committed(tx: u32) -> Event {
    Event::TransactionEnded { tx, committed: true }
}

fn aborted(tx: u32) -> Event {
    Event::TransactionEnded { tx, committed: false }
}

fn read(var: u32, value: i64) -> Event {
    Event::VarRead { var, value }
}

#[test]
fn committed_write_visible_to_later_transaction() {
    let events = run_script(
        "begin(T1)
         W(T1,x1,101)
         end(T1)
         begin(T2)
         R(T2,x1)
         end(T2)",
    );
    assert_eq!(events, vec![committed(1), read(1, 101), committed(2)]);
}

#[test]
fn write_waiters_commit_in_fifo_order() {
    // T2 waits on T1; no cycle. After T1 commits, T2 unblocks the same
    // tick and its value lands as the newer version.
    let events = run_script(
        "begin(T1)
         begin(T2)
         W(T1,x1,1)
         W(T2,x1,2)
         end(T1)
         end(T2)
         dump()",
    );
    assert_eq!(events[..2], [committed(1), committed(2)]);
    let site2 = &events[3];
    let Event::SiteDump { site: 2, entries } = site2 else {
        panic!("expected dump of site 2, got {site2:?}");
    };
    assert!(entries.contains(&(1, 2)));
}

#[test]
fn deadlock_aborts_youngest_member() {
    // T1 and T2 wait on each other; T2 (the later start) is the victim and
    // T1 goes on to commit.
    let events = run_script(
        "begin(T1)
         begin(T2)
         W(T1,x1,1)
         W(T2,x2,2)
         W(T1,x2,10)
         W(T2,x1,20)
         end(T1)",
    );
    assert_eq!(events, vec![aborted(2), committed(1)]);
}

#[test]
fn replica_failure_after_write_aborts_at_end() {
    // x2 is replicated; T1's write touched site 2, which then failed
    // before end, so the commit validation fails.
    let events = run_script(
        "begin(T1)
         W(T1,x2,50)
         fail(2)
         end(T1)",
    );
    assert_eq!(events, vec![aborted(1)]);
}

#[test]
fn failure_of_untouched_site_does_not_abort() {
    // x1 lives on site 2 only; site 3 failing is none of T1's business.
    let events = run_script(
        "begin(T1)
         W(T1,x1,10)
         fail(3)
         end(T1)",
    );
    assert_eq!(events, vec![committed(1)]);
}

#[test]
fn failure_before_first_access_does_not_abort() {
    // Site 3 was already down when T1 wrote, so T1 never touched it; the
    // write reaches the nine surviving replicas and commits.
    let events = run_script(
        "begin(T1)
         fail(3)
         W(T1,x2,50)
         end(T1)
         recover(3)
         begin(T2)
         R(T2,x2)
         end(T2)",
    );
    assert_eq!(events, vec![committed(1), read(2, 50), committed(2)]);
}

#[test]
fn snapshot_read_sees_version_from_before_start() {
    // T1 began before T2's commit, so it must see the initial 40, not 99.
    let events = run_script(
        "beginRO(T1)
         begin(T2)
         W(T2,x4,99)
         end(T2)
         R(T1,x4)
         end(T1)",
    );
    assert_eq!(events, vec![committed(2), read(4, 40), committed(1)]);
}

#[test]
fn snapshot_read_sees_committed_writes_before_start() {
    let events = run_script(
        "begin(T1)
         W(T1,x4,99)
         end(T1)
         beginRO(T2)
         begin(T3)
         W(T3,x4,123)
         end(T3)
         R(T2,x4)
         end(T2)",
    );
    assert_eq!(events, vec![committed(1), committed(3), read(4, 99), committed(2)]);
}

#[test]
fn recovering_replica_not_read_until_written() {
    // After recover(2), x2 is Recovering on site 2 and reads route to any
    // other up site. Once T1 commits a write, site 2 serves x2 again (shown
    // by failing site 1, the replica that answered before).
    let events = run_script(
        "fail(2)
         recover(2)
         begin(T1)
         R(T1,x2)
         W(T1,x2,55)
         end(T1)
         fail(1)
         begin(T2)
         R(T2,x2)
         end(T2)",
    );
    assert_eq!(
        events,
        vec![read(2, 20), committed(1), read(2, 55), committed(2)]
    );
}

#[test]
fn odd_variable_read_blocks_until_recovery() {
    // x3 lives only on site 4; while it is down the read parks in the
    // retry queue and completes the tick the site comes back.
    let events = run_script(
        "fail(4)
         begin(T1)
         R(T1,x3)
         recover(4)
         end(T1)",
    );
    assert_eq!(events, vec![read(3, 30), committed(1)]);
}

#[test]
fn replicated_read_blocks_while_all_sites_down() {
    let mut script = String::new();
    for site in 1..=N_SITES {
        script.push_str(&format!("fail({site})\n"));
    }
    // After recover(1), x2 is still Recovering there; the read stays
    // parked until T2's commit refreshes the copy.
    script.push_str(
        "begin(T1)
         R(T1,x2)
         recover(1)
         begin(T2)
         W(T2,x2,7)
         end(T2)
         end(T1)",
    );
    let events = run_script(&script);
    assert_eq!(events, vec![committed(2), read(2, 7), committed(1)]);
}

#[test]
fn sole_read_holder_upgrades_without_queueing() {
    let events = run_script(
        "begin(T1)
         R(T1,x2)
         W(T1,x2,9)
         R(T1,x2)
         end(T1)",
    );
    assert_eq!(events, vec![read(2, 20), read(2, 9), committed(1)]);
}

#[test]
fn shared_read_lock_defers_upgrade_until_other_reader_ends() {
    let events = run_script(
        "begin(T1)
         begin(T2)
         R(T1,x2)
         R(T2,x2)
         W(T1,x2,9)
         end(T2)
         end(T1)",
    );
    assert_eq!(
        events,
        vec![read(2, 20), read(2, 20), committed(2), committed(1)]
    );
}

#[test]
fn ro_transaction_aborts_when_no_version_is_visible() {
    // Site 1 failed and recovered before the reader began, disqualifying
    // its initial version of x2; every other replica is down. Some site
    // could answer, so this is not a retry case: the reader aborts.
    let mut script = String::from("fail(1)\nrecover(1)\n");
    for site in 2..=N_SITES {
        script.push_str(&format!("fail({site})\n"));
    }
    script.push_str(
        "beginRO(T1)
         R(T1,x2)",
    );
    let events = run_script(&script);
    assert_eq!(events, vec![aborted(1)]);
}

#[test]
fn ro_read_of_unreplicated_variable_ignores_failure_window() {
    // x1's single copy survives fail/recover untouched, so the snapshot
    // read is served even though site 2 failed after the version landed.
    let events = run_script(
        "begin(T1)
         W(T1,x1,11)
         end(T1)
         beginRO(T2)
         fail(2)
         recover(2)
         R(T2,x1)
         end(T2)",
    );
    assert_eq!(events, vec![committed(1), read(1, 11), committed(2)]);
}

#[test]
fn ro_read_retries_while_sole_host_is_down() {
    let events = run_script(
        "beginRO(T1)
         fail(2)
         R(T1,x1)
         recover(2)
         end(T1)",
    );
    assert_eq!(events, vec![read(1, 10), committed(1)]);
}

#[test]
fn write_queue_is_served_fifo() {
    let events = run_script(
        "begin(T1)
         begin(T2)
         begin(T3)
         W(T1,x1,1)
         W(T2,x1,2)
         W(T3,x1,3)
         end(T1)
         end(T2)
         end(T3)
         dump()",
    );
    assert_eq!(events[..3], [committed(1), committed(2), committed(3)]);
    let Event::SiteDump { site: 2, entries } = &events[4] else {
        panic!("expected dump of site 2, got {:?}", events[4]);
    };
    assert!(entries.contains(&(1, 3)));
}

#[test]
fn read_waits_behind_queued_write() {
    // T3's read arrives after T2's queued write and must not jump it: the
    // value T3 observes is T2's, not T1's.
    let events = run_script(
        "begin(T1)
         begin(T2)
         begin(T3)
         W(T1,x2,5)
         W(T2,x2,6)
         R(T3,x2)
         end(T1)
         end(T2)
         end(T3)",
    );
    assert_eq!(
        events,
        vec![committed(1), committed(2), read(2, 6), committed(3)]
    );
}

#[test]
fn write_waits_behind_queued_reads() {
    // T1 and T2 queue reads behind T3's write lock; T4's write queues
    // behind the reads. When T3 commits, both reads are granted in one
    // wave, and the write is served only after both readers end.
    let events = run_script(
        "begin(T1)
         begin(T2)
         begin(T3)
         begin(T4)
         W(T3,x2,5)
         R(T1,x2)
         R(T2,x2)
         W(T4,x2,6)
         end(T3)
         end(T1)
         end(T2)
         end(T4)",
    );
    assert_eq!(
        events,
        vec![
            committed(3),
            read(2, 5),
            read(2, 5),
            committed(1),
            committed(2),
            committed(4),
        ]
    );
}

#[test]
fn write_behind_queued_reads_can_deadlock_through_inherited_edges() {
    // The leading read waits on T3, so T4's queued write inherits an edge
    // to T3. T3 then blocks on x4, which T4 holds: the cycle T3 <-> T4
    // closes through the inherited edge and the youngest member (T4) is
    // the victim. T3 commits, the reads are granted, and T1/T2 follow.
    let events = run_script(
        "begin(T1)
         begin(T2)
         begin(T3)
         begin(T4)
         W(T3,x2,5)
         R(T1,x2)
         R(T2,x2)
         W(T4,x4,40)
         W(T4,x2,6)
         W(T3,x4,44)
         end(T3)
         end(T1)
         end(T2)",
    );
    assert_eq!(
        events,
        vec![
            aborted(4),
            committed(3),
            read(2, 5),
            read(2, 5),
            committed(1),
            committed(2),
        ]
    );
}

#[test]
fn dump_reports_initial_values_per_site() {
    let events = run_script("dump()");
    assert_eq!(events.len(), N_SITES as usize);
    for (i, event) in events.iter().enumerate() {
        let Event::SiteDump { site, entries } = event else {
            panic!("expected a site dump, got {event:?}");
        };
        assert_eq!(*site, i as u32 + 1);
        assert!(entries.iter().all(|&(var, value)| value == i64::from(var) * 10));
        // Site 1 hosts only the ten replicated variables; site 2 also
        // hosts x1 and x11.
        match site {
            1 => assert_eq!(entries.len(), 10),
            2 => assert_eq!(entries.len(), 12),
            _ => {}
        }
    }
}

#[test]
fn aborted_transaction_writes_never_land() {
    let events = run_script(
        "begin(T1)
         W(T1,x2,50)
         fail(2)
         end(T1)
         recover(2)
         begin(T2)
         R(T2,x2)
         end(T2)",
    );
    // T1 aborted, so every replica still serves the initial value.
    assert_eq!(events, vec![aborted(1), read(2, 20), committed(2)]);
}

#[test]
fn read_only_transaction_commits_unconditionally() {
    let events = run_script(
        "beginRO(T1)
         R(T1,x6)
         fail(6)
         end(T1)",
    );
    assert_eq!(events, vec![read(6, 60), committed(1)]);
}
