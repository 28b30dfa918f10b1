use criterion::{black_box, criterion_group, criterion_main, Criterion};

use repcrec::{MemorySink, Op, TransactionManager};

fn run(ops: &[Op]) -> usize {
    let mut engine = TransactionManager::new(MemorySink::default());
    engine.run(ops.iter().cloned());
    engine.into_sink().events.len()
}

/// Five writers on disjoint unreplicated variables: no contention, the
/// dispatch path dominates.
fn disjoint_writers() -> Vec<Op> {
    let mut ops = Vec::new();
    for tx in 1..=5 {
        ops.push(Op::Begin(tx));
    }
    for tx in 1..=5 {
        let var = 2 * tx - 1;
        ops.push(Op::Write(tx, var, i64::from(var)));
        ops.push(Op::Read(tx, var));
    }
    for tx in 1..=5 {
        ops.push(Op::End(tx));
    }
    ops
}

/// Eight writers fighting over one replicated variable: the waiting queue
/// and retry machinery dominate.
fn contended_writers() -> Vec<Op> {
    let mut ops = Vec::new();
    for tx in 1..=8 {
        ops.push(Op::Begin(tx));
    }
    for tx in 1..=8 {
        ops.push(Op::Write(tx, 2, i64::from(tx)));
    }
    for tx in 1..=8 {
        ops.push(Op::End(tx));
    }
    ops
}

/// Fail/recover churn followed by snapshot reads and a dump.
fn failover_snapshots() -> Vec<Op> {
    let mut ops = vec![Op::Begin(1), Op::Write(1, 2, 42), Op::End(1)];
    for site in 1..=5 {
        ops.push(Op::Fail(site));
        ops.push(Op::Recover(site));
    }
    ops.push(Op::BeginRo(2));
    for var in [2, 4, 6, 8] {
        ops.push(Op::Read(2, var));
    }
    ops.push(Op::End(2));
    ops.push(Op::Dump);
    ops
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine");

    let script = disjoint_writers();
    group.bench_function("disjoint-writers", |b| b.iter(|| run(black_box(&script))));

    let script = contended_writers();
    group.bench_function("contended-writers", |b| b.iter(|| run(black_box(&script))));

    let script = failover_snapshots();
    group.bench_function("failover-snapshots", |b| b.iter(|| run(black_box(&script))));

    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
