//! Self-ping throughput: inject into the local window, drain, dispatch.
//!
//! Run with:
//! ```bash
//! cargo bench --bench pingpong
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use amsgq::inproc::{InprocFabric, InprocRma};
use amsgq::{ActionRegistry, Amsgq};

fn bench_self_pingpong(c: &mut Criterion) {
    let mut group = c.benchmark_group("self_pingpong");

    for payload_size in [8usize, 64, 256] {
        group.throughput(Throughput::Bytes(payload_size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(payload_size),
            &payload_size,
            |b, &payload_size| {
                let sink = Arc::new(AtomicU64::new(0));
                let sink_in_handler = sink.clone();
                let mut registry = ActionRegistry::new();
                let echo = registry.register(move |data| {
                    sink_in_handler.fetch_add(data.len() as u64, Ordering::Relaxed);
                });

                let rma = InprocFabric::create(1).into_iter().next().unwrap();
                let q = Amsgq::<InprocRma>::builder(Arc::new(registry))
                    .msg_size(256)
                    .msg_count(64)
                    .open(rma)
                    .unwrap();

                let payload = vec![0xA5u8; payload_size];
                b.iter(|| {
                    q.try_send(0, echo, &payload).unwrap();
                    q.process().unwrap();
                });

                assert!(sink.load(Ordering::Relaxed) > 0);
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_self_pingpong);
criterion_main!(benches);
