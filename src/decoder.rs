//! Viterbi decoder (spec component 9, spec.md §4.8): shares ψ computation
//! with the gradient engine, replaces logsumexp with max, and backtracks
//! through recorded predecessor arcs to recover the best path.

use std::io::Write;

use crate::label::Vocab;
use crate::lattice::Lattice;
use crate::model::Model;
use crate::pattern::Pattern;
use crate::pool::StringPool;

/// One arc of the decoded path, in forward (start-to-end) order.
pub struct PathArc {
    pub in_label: String,
    pub out_label: String,
}

fn arc_labels_as_strings(lat: &Lattice, arc_idx: u32, src_vocab: &Vocab, tgt_vocab: &Vocab, pool: &StringPool) -> (String, String) {
    let arc = &lat.arcs[arc_idx as usize];
    let ilbl = src_vocab.get(arc.ilbl);
    let olbl = tgt_vocab.get(arc.olbl);
    (pool.get(ilbl.raw).to_string(), pool.get(olbl.raw).to_string())
}

/// Forward max-plus pass: identical arc/state ψ setup to the gradient
/// engine, but `E.alpha` is the best (not summed) incoming score, and
/// `eback` records which in-arc achieved it.
fn forward_viterbi(lat: &Lattice) {
    for arc_idx in lat.fwd_order() {
        let e = &lat.arcs[arc_idx as usize];
        let v = &lat.states[e.src as usize];
        if v.in_arcs.is_empty() {
            e.set_alpha(e.psi());
            e.set_eback(-1);
            continue;
        }
        let o = v.out_index(arc_idx).expect("arc missing from its own source state's out-list");
        let mut best_score = f64::NEG_INFINITY;
        let mut best_arc: i64 = -1;
        for &in_idx in &v.in_arcs {
            let i = v.in_index(in_idx).unwrap();
            let score = lat.arcs[in_idx as usize].alpha() + v.psi_at(i, o) + e.psi();
            if score > best_score {
                best_score = score;
                best_arc = in_idx as i64;
            }
        }
        e.set_alpha(best_score);
        e.set_eback(best_arc);
    }
}

/// Decode the single best path through `lat` under `model`'s current
/// weights, using `patterns` to (re)materialize features and ψ exactly as
/// the gradient engine does.
pub fn decode(lat: &Lattice, model: &Model, patterns: &[Pattern], pool: &StringPool) -> Vec<PathArc> {
    crate::gradient::materialize_and_score_for_decode(lat, model, patterns, pool);
    forward_viterbi(lat);

    let best_final = lat
        .arcs
        .iter()
        .enumerate()
        .filter(|(_, e)| e.dst == lat.final_state)
        .max_by(|(_, a), (_, b)| a.alpha().partial_cmp(&b.alpha()).expect("alpha is never NaN"));

    let Some((mut arc_idx, _)) = best_final.map(|(i, e)| (i as i64, e)) else {
        return Vec::new();
    };

    let mut reversed = Vec::new();
    while arc_idx >= 0 {
        let e = &lat.arcs[arc_idx as usize];
        let (in_label, out_label) = arc_labels_as_strings(lat, arc_idx as u32, &model.src_vocab, &model.tgt_vocab, pool);
        reversed.push(PathArc { in_label, out_label });
        arc_idx = e.eback();
    }
    reversed.reverse();
    reversed
}

/// Alternate mode: dump the full weighted arc table (every arc's ψ) as a
/// compact WFST text file, for downstream composition by external tools.
pub fn dump_weighted_fst(
    lat: &Lattice,
    model: &Model,
    patterns: &[Pattern],
    pool: &StringPool,
    out: &mut impl Write,
) -> std::io::Result<()> {
    crate::gradient::materialize_and_score_for_decode(lat, model, patterns, pool);
    for arc in &lat.arcs {
        let (in_label, out_label) = arc_labels_as_strings_by_ids(arc.ilbl, arc.olbl, &model.src_vocab, &model.tgt_vocab, pool);
        writeln!(out, "{} {} {} {} {}", arc.src, arc.dst, in_label, out_label, arc.psi())?;
    }
    writeln!(out, "{}", lat.final_state)?;
    writeln!(out, "EOS")?;
    Ok(())
}

fn arc_labels_as_strings_by_ids(ilbl: crate::label::LabelId, olbl: crate::label::LabelId, src_vocab: &Vocab, tgt_vocab: &Vocab, pool: &StringPool) -> (String, String) {
    let i = src_vocab.get(ilbl);
    let o = tgt_vocab.get(olbl);
    (pool.get(i.raw).to_string(), pool.get(o.raw).to_string())
}
