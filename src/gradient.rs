//! Forward–backward gradient computation over a dataset of acyclic
//! lattices (spec component 7): ψ computation, log-space forward and
//! backward passes, and atomic accumulation of expected feature counts.

use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::debug;

use crate::dataset::Dataset;
use crate::lattice::{Lattice, MAX_REAL};
use crate::model::Model;
use crate::pattern::{eval_pattern, ArcLabels, Pattern, PatternKind};
use crate::pool::StringPool;

#[derive(Debug, Clone, Copy)]
pub struct GradientConfig {
    /// 0..4; lower values free more transient state after each lattice.
    pub cache_lvl: u8,
    pub nthreads: usize,
    /// Count feature frequency on the reference side instead of the
    /// (default) hypothesis side.
    pub ref_freq: bool,
}

impl Default for GradientConfig {
    fn default() -> Self {
        Self {
            cache_lvl: 4,
            nthreads: num_cpus::get(),
            ref_freq: false,
        }
    }
}

/// logsumexp with the `-inf` absorbing element: an all-`-inf` input (no
/// summands, e.g. a state with no in-arcs) returns `-inf` rather than NaN.
pub fn logsumexp(values: impl Iterator<Item = f64>) -> f64 {
    let values: Vec<f64> = values.collect();
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    let sum: f64 = values.iter().map(|&v| (v - max).exp()).sum();
    max + sum.ln()
}

/// Materialize unigram (per-arc) and bigram (per-state-pair) feature
/// lists for `lat`, per spec.md §4.3.
fn materialize_features(lat: &Lattice, patterns: &[Pattern], model: &Model, pool: &StringPool, count_frequency: bool) {
    let unigram_patterns: Vec<&Pattern> = patterns.iter().filter(|p| p.kind == PatternKind::Unigram).collect();
    let bigram_patterns: Vec<&Pattern> = patterns.iter().filter(|p| p.kind == PatternKind::Bigram).collect();

    for arc in &lat.arcs {
        let arc_labels = [ArcLabels { ilbl: arc.ilbl, olbl: arc.olbl }];
        let mut keys = Vec::with_capacity(unigram_patterns.len());
        for p in &unigram_patterns {
            let values = eval_pattern(p, &arc_labels, &model.src_vocab, &model.tgt_vocab, pool);
            if let Some(f) = model.add_feature(p.tag, &values, count_frequency) {
                keys.push(f.key);
            }
        }
        arc.set_unigram(keys);
    }

    if bigram_patterns.is_empty() {
        return;
    }

    for state in &lat.states {
        let ni = state.in_arcs.len();
        let no = state.out_arcs.len();
        if ni == 0 || no == 0 {
            continue;
        }
        let mut mat = crate::lattice::FlatMatrix::<Vec<u64>>::new(ni, no);
        for (i_idx, &in_idx) in state.in_arcs.iter().enumerate() {
            for (o_idx, &out_idx) in state.out_arcs.iter().enumerate() {
                let in_arc = &lat.arcs[in_idx as usize];
                let out_arc = &lat.arcs[out_idx as usize];
                let arc_labels = [
                    ArcLabels { ilbl: in_arc.ilbl, olbl: in_arc.olbl },
                    ArcLabels { ilbl: out_arc.ilbl, olbl: out_arc.olbl },
                ];
                let mut keys = Vec::with_capacity(bigram_patterns.len());
                for p in &bigram_patterns {
                    let values = eval_pattern(p, &arc_labels, &model.src_vocab, &model.tgt_vocab, pool);
                    if let Some(f) = model.add_feature(p.tag, &values, count_frequency) {
                        keys.push(f.key);
                    }
                }
                *mat.get_mut(i_idx, o_idx) = keys;
            }
        }
        state.set_bigram(mat);
    }
}

/// Set ψ on every arc and every (in, out) pair of every state, per
/// spec.md §4.6(a). The `Σ_{i≥1} dense_feature_i.x · E.wgh[i]` term is a
/// genuine loop over `1..MAX_REAL`, gated per-slot on `stt[tag_i] ≤
/// iteration`; with `MAX_REAL == 1` (see `lattice::MAX_REAL`) the range is
/// empty and the loop runs zero times, but raising `MAX_REAL` activates it
/// without touching this code.
fn compute_psi(lat: &Lattice, model: &Model) {
    let iteration = model.iteration();
    for arc in &lat.arcs {
        let unigram_sum = arc.with_unigram(|keys| {
            keys.iter()
                .filter_map(|k| model.table.find(*k))
                .map(|f| f.x())
                .sum::<f64>()
        });
        let mut psi = unigram_sum + arc.wgh[0];
        for i in 1..MAX_REAL {
            let dense = &model.dense[i - 1];
            if model.stt[dense.tag() as usize] <= iteration {
                psi += dense.x() * arc.wgh[i];
            }
        }
        arc.set_psi(psi);
    }

    for state in &lat.states {
        let ni = state.in_arcs.len();
        let no = state.out_arcs.len();
        if ni == 0 || no == 0 {
            continue;
        }
        let mut mat = crate::lattice::FlatMatrix::<f64>::new(ni, no);
        for i in 0..ni {
            for o in 0..no {
                let sum = state.with_bigram(i, o, |keys| {
                    keys.iter()
                        .filter_map(|k| model.table.find(*k))
                        .map(|f| f.x())
                        .sum::<f64>()
                });
                *mat.get_mut(i, o) = sum;
            }
        }
        state.set_psi(mat);
    }
}

/// Forward pass in log-space, spec.md §4.6(b).
fn forward_pass(lat: &Lattice) {
    for arc_idx in lat.fwd_order() {
        let e = &lat.arcs[arc_idx as usize];
        let v = &lat.states[e.src as usize];
        if v.in_arcs.is_empty() {
            e.set_alpha(e.psi());
            continue;
        }
        let o = v.out_index(arc_idx).expect("arc missing from its own source state's out-list");
        let terms = v.in_arcs.iter().map(|&in_idx| {
            let i = v.in_index(in_idx).unwrap();
            lat.arcs[in_idx as usize].alpha() + v.psi_at(i, o) + e.psi()
        });
        e.set_alpha(logsumexp(terms));
    }
}

/// Backward pass in log-space, spec.md §4.6(c).
fn backward_pass(lat: &Lattice) {
    for arc_idx in lat.bwd_order() {
        let e = &lat.arcs[arc_idx as usize];
        if e.dst == lat.final_state {
            e.set_beta(0.0);
            continue;
        }
        let v = &lat.states[e.dst as usize];
        let i = v.in_index(arc_idx).expect("arc missing from its own target state's in-list");
        let terms = v.out_arcs.iter().map(|&out_idx| {
            let o = v.out_index(out_idx).unwrap();
            let out_arc = &lat.arcs[out_idx as usize];
            out_arc.psi() + v.psi_at(i, o) + out_arc.beta()
        });
        e.set_beta(logsumexp(terms));
    }
}

/// Normalize and accumulate expected feature counts, spec.md §4.6(d),
/// including the dense-feature gradient terms `multiplier · p_E · E.wgh[i]`
/// for `i in 1..MAX_REAL`. Unlike ψ's activation-window gate in
/// `compute_psi`, spec.md §4.6(d) states no gating condition for this
/// accumulation, so every dense slot always accumulates.
/// Returns `multiplier · Z`, this lattice's contribution to the objective.
fn accumulate_expectations(lat: &Lattice, model: &Model) -> f64 {
    let multiplier = lat.multiplier as f64;
    let z = logsumexp(
        lat.arcs
            .iter()
            .filter(|e| e.dst == lat.final_state)
            .map(|e| e.alpha()),
    );

    for e in &lat.arcs {
        let p_e = (e.alpha() + e.beta() - z).exp();
        e.with_unigram(|keys| {
            for &k in keys {
                if let Some(f) = model.table.find(k) {
                    f.add_g(multiplier * p_e);
                }
            }
        });
        for i in 1..MAX_REAL {
            model.dense[i - 1].add_g(multiplier * p_e * e.wgh[i]);
        }
    }

    for state in &lat.states {
        let ni = state.in_arcs.len();
        let no = state.out_arcs.len();
        if ni == 0 || no == 0 {
            continue;
        }
        for (i_idx, &in_idx) in state.in_arcs.iter().enumerate() {
            for (o_idx, &out_idx) in state.out_arcs.iter().enumerate() {
                let in_arc = &lat.arcs[in_idx as usize];
                let out_arc = &lat.arcs[out_idx as usize];
                let p_io = (in_arc.alpha() + state.psi_at(i_idx, o_idx) + out_arc.psi() + out_arc.beta() - z).exp();
                state.with_bigram(i_idx, o_idx, |keys| {
                    for &k in keys {
                        if let Some(f) = model.table.find(k) {
                            f.add_g(multiplier * p_io);
                        }
                    }
                });
            }
        }
    }

    multiplier * z
}

/// Materialize feature lists and ψ without running forward/backward or
/// accumulating expectations — what the decoder needs, reusing the same
/// template machinery as a training pass. Decoding never counts feature
/// frequency (there is no training side to attribute it to).
pub(crate) fn materialize_and_score_for_decode(lat: &Lattice, model: &Model, patterns: &[Pattern], pool: &StringPool) {
    materialize_features(lat, patterns, model, pool, false);
    compute_psi(lat, model);
}

/// Run every step of spec.md §4.6 on one lattice, then apply the
/// cache-level resource policy.
fn process_lattice(lat: &Lattice, model: &Model, patterns: &[Pattern], pool: &StringPool, cfg: &GradientConfig) -> f64 {
    let count_frequency = if cfg.ref_freq { lat.multiplier < 0 } else { lat.multiplier > 0 };
    materialize_features(lat, patterns, model, pool, count_frequency);
    compute_psi(lat, model);
    forward_pass(lat);
    backward_pass(lat);
    let contribution = accumulate_expectations(lat, model);

    if cfg.cache_lvl < 4 {
        lat.reset_scores();
    }
    if cfg.cache_lvl < 3 {
        lat.drop_feature_lists();
    }
    if cfg.cache_lvl < 2 {
        lat.drop_orders();
    }
    // spec.md §5's cache_lvl < 1 tier additionally frees adjacency arrays;
    // `cli::Optimization::cache_lvl` rejects 0 at parse time (see DESIGN.md),
    // so that tier is unreachable here and in/out-arc lists always stay
    // resident across iterations.

    contribution
}

/// Run one full gradient pass over `dataset`, dispatching lattices to a
/// fixed worker pool via a shared atomic index (spec.md §5), and return the
/// dataset's total log-likelihood contribution (negative when dominated by
/// reference lattices, per the sign convention in spec.md §4.6).
pub fn run_pass(model: &Model, dataset: &Dataset, patterns: &[Pattern], pool: &StringPool, cfg: &GradientConfig) -> f64 {
    let nthreads = cfg.nthreads.max(1);
    let next = AtomicUsize::new(0);
    let lattices = &dataset.lattices;

    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..nthreads)
            .map(|_| {
                scope.spawn(|| {
                    let mut partial = 0.0;
                    loop {
                        let idx = next.fetch_add(1, Ordering::Relaxed);
                        let Some(lat) = lattices.get(idx) else { break };
                        partial += process_lattice(lat, model, patterns, pool, cfg);
                    }
                    partial
                })
            })
            .collect();
        let total: f64 = handles.into_iter().map(|h| h.join().expect("gradient worker panicked")).sum();
        debug!(lattices = lattices.len(), nthreads, total, "gradient pass complete");
        total
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lattice::RawArc;

    fn single_arc_dataset(multiplier: i8, src_vocab: &crate::label::Vocab, tgt_vocab: &crate::label::Vocab, pool: &StringPool) -> Dataset {
        let ilbl = src_vocab.intern("a", pool);
        let olbl = tgt_vocab.intern("b", pool);
        let arcs = vec![RawArc { src: 0, dst: 1, ilbl, olbl, wgh: vec![] }];
        let lat = Lattice::build(arcs, 2, 1, multiplier).unwrap();
        Dataset { lattices: vec![lat] }
    }

    #[test]
    fn single_arc_pass_produces_finite_objective() {
        let model = Model::new(0);
        let pool = StringPool::new(true);
        let ds = single_arc_dataset(1, &model.src_vocab, &model.tgt_vocab, &pool);
        let pattern = Pattern::compile("0s0", &pool).unwrap();
        let cfg = GradientConfig { cache_lvl: 4, nthreads: 1, ref_freq: false };
        let total = run_pass(&model, &ds, &[pattern], &pool, &cfg);
        assert!(total.is_finite());
    }

    #[test]
    fn single_arc_path_has_probability_one() {
        let model = Model::new(0);
        let pool = StringPool::new(true);
        let ds = single_arc_dataset(1, &model.src_vocab, &model.tgt_vocab, &pool);
        let pattern = Pattern::compile("0s0", &pool).unwrap();
        let cfg = GradientConfig { cache_lvl: 4, nthreads: 1, ref_freq: false };
        run_pass(&model, &ds, &[pattern], &pool, &cfg);
        // Only one path through a single-arc lattice: its feature must
        // receive an expected count of exactly multiplier * 1.
        let feature = model.table.iter().next().unwrap().1;
        assert!((feature.g() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn reference_and_hypothesis_multipliers_cancel_when_identical() {
        let model = Model::new(0);
        let pool = StringPool::new(true);
        let hyp = single_arc_dataset(1, &model.src_vocab, &model.tgt_vocab, &pool);
        let reference = single_arc_dataset(-1, &model.src_vocab, &model.tgt_vocab, &pool);
        let pattern = Pattern::compile("0s0", &pool).unwrap();
        let cfg = GradientConfig { cache_lvl: 4, nthreads: 1, ref_freq: false };
        run_pass(&model, &hyp, &[pattern.clone()], &pool, &cfg);
        run_pass(&model, &reference, &[pattern], &pool, &cfg);
        let feature = model.table.iter().next().unwrap().1;
        assert!(feature.g().abs() < 1e-9);
    }
}
