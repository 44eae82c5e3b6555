use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use tandem_core::{transform, transform_against, ClientId, Operation};

fn typing_history(doc_len: usize, count: usize) -> Vec<Operation> {
    let mut len = doc_len;
    (0..count)
        .map(|i| {
            let op = Operation::insert_at(ClientId(3), i as u64, len, (i * 7) % (len + 1), "x");
            len += 1;
            op
        })
        .collect()
}

fn bench_transform_pair(c: &mut Criterion) {
    let a = Operation::insert_at(ClientId(1), 0, 4096, 1000, "hello");
    let b = Operation::delete_range(ClientId(2), 0, 4096, 900, 1100);

    c.bench_function("transform_insert_vs_delete", |bench| {
        bench.iter(|| black_box(transform(black_box(&a), black_box(&b)).unwrap()))
    });
}

fn bench_rebase_against_history(c: &mut Criterion) {
    let mut group = c.benchmark_group("Rebase");
    for depth in [10usize, 100, 1000] {
        let history = typing_history(4096, depth);
        let op = Operation::insert_at(ClientId(1), 0, 4096, 2048, "y");
        group.throughput(Throughput::Elements(depth as u64));
        group.bench_function(format!("rebase_depth_{depth}"), |bench| {
            bench.iter(|| black_box(transform_against(black_box(&op), history.iter()).unwrap()))
        });
    }
    group.finish();
}

fn bench_compose(c: &mut Criterion) {
    let history = typing_history(4096, 200);
    c.bench_function("compose_200_keystrokes", |bench| {
        bench.iter(|| {
            let mut acc = history[0].clone();
            for op in &history[1..] {
                acc = acc.compose(op).unwrap();
            }
            black_box(acc)
        })
    });
}

criterion_group!(benches, bench_transform_pair, bench_rebase_against_history, bench_compose);
criterion_main!(benches);
