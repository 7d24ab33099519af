use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::collections::BTreeMap;

use persist_core::testing::TestEngine;
use persist_core::{PersistentAtom, PersistentMap, PersistentOptions, Unsubscribe};

/// One external change routed through a shared channel with many bound keys.
fn bench_shared_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("shared_dispatch");

    for bound in [10usize, 100, 1000] {
        let engine = TestEngine::new();
        let handle = engine.handle();
        let mut atoms = Vec::with_capacity(bound);
        let mut listeners: Vec<Unsubscribe> = Vec::with_capacity(bound);
        for i in 0..bound {
            let atom = PersistentAtom::with_options(
                format!("key-{i}"),
                String::new(),
                PersistentOptions::new().engine(&handle),
            )
            .unwrap();
            listeners.push(atom.listen(|_| {}));
            atoms.push(atom);
        }

        let mut n = 0u64;
        group.bench_with_input(BenchmarkId::from_parameter(bound), &bound, |b, _| {
            b.iter(|| {
                n += 1;
                engine
                    .set_key(black_box("key-0"), Some(&n.to_string()))
                    .unwrap();
            });
        });
    }
    group.finish();
}

fn bench_map_set_key(c: &mut Criterion) {
    let engine = TestEngine::per_key();
    let handle = engine.handle();
    let map: PersistentMap<String> = PersistentMap::with_options(
        "bench:",
        BTreeMap::new(),
        PersistentOptions::new().engine(&handle),
    )
    .unwrap();
    let _listener = map.listen(|_| {});

    let mut n = 0u64;
    c.bench_function("map_set_key", |b| {
        b.iter(|| {
            n += 1;
            map.set_key(black_box("entry"), Some(n.to_string())).unwrap();
        });
    });
}

criterion_group!(benches, bench_shared_dispatch, bench_map_set_key);
criterion_main!(benches);
