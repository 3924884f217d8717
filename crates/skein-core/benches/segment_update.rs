use std::sync::atomic::{AtomicU64, Ordering};

use skein_core::GraphSegment;

static SEQ: AtomicU64 = AtomicU64::new(0);

fn bench_region_name() -> String {
    format!(
        "skein-bench-{}-{}",
        std::process::id(),
        SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

#[divan::bench(args = [1_000, 10_000])]
fn insert_edges(bencher: divan::Bencher, n: u64) {
    bencher.bench(|| {
        let name = bench_region_name();
        let mut seg = GraphSegment::allocate(&name, 4096).unwrap();
        for i in 0..n {
            seg.insert_edge(i % 4096, (i * 7 + 1) % 4096, 1).unwrap();
        }
        seg.release();
    });
}

#[divan::bench(args = [10_000])]
fn consistency_check(bencher: divan::Bencher, n: u64) {
    let name = bench_region_name();
    let mut seg = GraphSegment::allocate(&name, 4096).unwrap();
    for i in 0..n {
        seg.insert_edge(i % 4096, (i * 7 + 1) % 4096, 1).unwrap();
    }
    bencher.bench(|| seg.consistency_check());
    seg.release();
}

fn main() {
    divan::main();
}
