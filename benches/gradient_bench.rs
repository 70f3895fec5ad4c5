//! Gradient-pass throughput benchmarks: a forward–backward pass over a
//! single lattice and over a small synthetic dataset.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use latgrad::dataset::Dataset;
use latgrad::gradient::{run_pass, GradientConfig};
use latgrad::lattice::{Lattice, RawArc};
use latgrad::model::Model;
use latgrad::pattern::Pattern;
use latgrad::pool::StringPool;

/// A chain lattice of `len` arcs: 0 -> 1 -> ... -> len, one distinct label
/// per arc.
fn chain_lattice(len: u32, model: &Model, pool: &StringPool) -> Lattice {
    let arcs: Vec<RawArc> = (0..len)
        .map(|i| {
            let ilbl = model.src_vocab.intern(&format!("s{i}"), pool);
            let olbl = model.tgt_vocab.intern(&format!("t{i}"), pool);
            RawArc { src: i, dst: i + 1, ilbl, olbl, wgh: vec![] }
        })
        .collect();
    Lattice::build(arcs, (len + 1) as usize, len, 1).unwrap()
}

fn bench_single_lattice(c: &mut Criterion) {
    let mut group = c.benchmark_group("gradient_single_lattice");

    for len in [4u32, 16, 64] {
        group.bench_with_input(BenchmarkId::from_parameter(len), &len, |b, &len| {
            let model = Model::new(0);
            let pool = StringPool::new(true);
            let pattern = Pattern::compile("0s0,1s0", &pool).unwrap();
            let lat = chain_lattice(len, &model, &pool);
            let dataset = Dataset { lattices: vec![lat] };
            let cfg = GradientConfig { cache_lvl: 4, nthreads: 1, ref_freq: false };

            b.iter(|| {
                black_box(run_pass(&model, &dataset, &[pattern.clone()], &pool, &cfg));
            });
        });
    }
    group.finish();
}

fn bench_dataset_parallelism(c: &mut Criterion) {
    let mut group = c.benchmark_group("gradient_dataset_threads");

    for nthreads in [1usize, 2, 4] {
        group.bench_with_input(BenchmarkId::from_parameter(nthreads), &nthreads, |b, &nthreads| {
            let model = Model::new(0);
            let pool = StringPool::new(true);
            let pattern = Pattern::compile("0s0", &pool).unwrap();
            let lattices: Vec<Lattice> = (0..32).map(|_| chain_lattice(8, &model, &pool)).collect();
            let dataset = Dataset { lattices };
            let cfg = GradientConfig { cache_lvl: 4, nthreads, ref_freq: false };

            b.iter(|| {
                black_box(run_pass(&model, &dataset, &[pattern.clone()], &pool, &cfg));
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_single_lattice, bench_dataset_parallelism);
criterion_main!(benches);
