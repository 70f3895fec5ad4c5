//! End-to-end scenarios straight out of the testable-properties list:
//! trivial single-arc training, hypothesis/reference disagreement, the
//! equality item, topological rejection, pruning after a tag's removal
//! iteration, and decoding with and without a tie-breaking feature.

use latgrad::dataset::Dataset;
use latgrad::gradient::{run_pass, GradientConfig};
use latgrad::lattice::{Lattice, RawArc};
use latgrad::model::Model;
use latgrad::pattern::Pattern;
use latgrad::pool::StringPool;
use latgrad::rprop::{self, RpropConfig};
use latgrad::{decoder, Error};

fn default_grad_cfg() -> GradientConfig {
    GradientConfig { cache_lvl: 4, nthreads: 1, ref_freq: false }
}

/// S1 — trivial single-arc: one hypothesis lattice, one pattern, one
/// gradient pass gives the sole feature an expected count of exactly 1.
#[test]
fn s1_trivial_single_arc_hypothesis_alone() {
    let model = Model::new(0);
    let pool = StringPool::new(true);
    let ilbl = model.src_vocab.intern("a", &pool);
    let olbl = model.tgt_vocab.intern("b", &pool);
    let lat = Lattice::build(vec![RawArc { src: 0, dst: 1, ilbl, olbl, wgh: vec![] }], 2, 1, 1).unwrap();
    let dataset = Dataset { lattices: vec![lat] };
    let pattern = Pattern::compile("0:u:0s0", &pool).unwrap();

    run_pass(&model, &dataset, &[pattern], &pool, &default_grad_cfg());

    let (_, feature) = model.table.iter().next().expect("one feature should have been created");
    assert!((feature.g() - 1.0).abs() < 1e-9);
}

/// S1 continued — adding the matching reference lattice cancels the
/// gradient back to zero.
#[test]
fn s1_hypothesis_and_reference_cancel() {
    let model = Model::new(0);
    let pool = StringPool::new(true);
    let ilbl = model.src_vocab.intern("a", &pool);
    let olbl = model.tgt_vocab.intern("b", &pool);
    let pattern = Pattern::compile("0:u:0s0", &pool).unwrap();

    let hyp = Dataset {
        lattices: vec![Lattice::build(vec![RawArc { src: 0, dst: 1, ilbl, olbl, wgh: vec![] }], 2, 1, 1).unwrap()],
    };
    let reference = Dataset {
        lattices: vec![Lattice::build(vec![RawArc { src: 0, dst: 1, ilbl, olbl, wgh: vec![] }], 2, 1, -1).unwrap()],
    };

    let hyp_ll = run_pass(&model, &hyp, &[pattern.clone()], &pool, &default_grad_cfg());
    let ref_ll = run_pass(&model, &reference, &[pattern], &pool, &default_grad_cfg());

    let (_, feature) = model.table.iter().next().unwrap();
    assert!(feature.g().abs() < 1e-9);
    assert!((hyp_ll + ref_ll).abs() < 1e-9);
}

/// S2 — disagreement: a two-way hypothesis lattice against a reference
/// that only agrees with one branch. After one full train iteration the
/// agreeing feature's weight moves positive, the disagreeing one negative.
#[test]
fn s2_disagreement_pushes_weights_apart() {
    let model = Model::new(0);
    let pool = StringPool::new(true);
    let a = model.src_vocab.intern("a", &pool);
    let b = model.src_vocab.intern("b", &pool);
    let x = model.tgt_vocab.intern("x", &pool);
    let y = model.tgt_vocab.intern("y", &pool);

    let hyp = Dataset {
        lattices: vec![Lattice::build(
            vec![
                RawArc { src: 0, dst: 1, ilbl: a, olbl: x, wgh: vec![] },
                RawArc { src: 0, dst: 1, ilbl: b, olbl: y, wgh: vec![] },
            ],
            2,
            1,
            1,
        )
        .unwrap()],
    };
    let reference = Dataset {
        lattices: vec![Lattice::build(vec![RawArc { src: 0, dst: 1, ilbl: a, olbl: x, wgh: vec![] }], 2, 1, -1).unwrap()],
    };
    // Bare "0s0" (no name component) so its key is exactly the content hash
    // of the single source-token item, matching `content_matches` below.
    let pattern = Pattern::compile("0s0", &pool).unwrap();

    run_pass(&model, &hyp, &[pattern.clone()], &pool, &default_grad_cfg());
    run_pass(&model, &reference, &[pattern], &pool, &default_grad_cfg());
    rprop::sweep(&model, &RpropConfig::default());

    let key_a = model.src_vocab.get(a).raw;
    let key_b = model.src_vocab.get(b).raw;
    let feature_a = model
        .table
        .iter()
        .find(|(_, f)| f.tag() == 0 && content_matches(f.key, key_a))
        .map(|(_, f)| f)
        .expect("feature for 'a' should exist");
    let feature_b = model
        .table
        .iter()
        .find(|(_, f)| f.tag() == 0 && content_matches(f.key, key_b))
        .map(|(_, f)| f)
        .expect("feature for 'b' should exist");

    assert!(feature_a.x() > 0.0, "feature firing on the agreeing branch should move positive");
    assert!(feature_b.x() < 0.0, "feature firing on the disagreeing branch should move negative");
}

/// Identify a one-item unigram feature by recomputing its key from the
/// same content hash the pattern compiler would produce.
fn content_matches(key: u64, raw_hash: u64) -> bool {
    key & (u64::MAX >> 8) == latgrad::hash::hash_u64_seq(&[raw_hash])
}

/// S3 — equality item: agreeing and disagreeing arcs fire distinct,
/// separately-keyed features.
#[test]
fn s3_equality_item_distinguishes_true_and_false() {
    let model = Model::new(0);
    let pool = StringPool::new(true);
    let pattern = Pattern::compile("0:eq:0s0=0t0", &pool).unwrap();

    let foo_s = model.src_vocab.intern("foo", &pool);
    let foo_t = model.tgt_vocab.intern("foo", &pool);
    let bar_t = model.tgt_vocab.intern("bar", &pool);

    let agree = Dataset {
        lattices: vec![Lattice::build(vec![RawArc { src: 0, dst: 1, ilbl: foo_s, olbl: foo_t, wgh: vec![] }], 2, 1, 1).unwrap()],
    };
    let disagree = Dataset {
        lattices: vec![Lattice::build(vec![RawArc { src: 0, dst: 1, ilbl: foo_s, olbl: bar_t, wgh: vec![] }], 2, 1, 1).unwrap()],
    };

    run_pass(&model, &agree, &[pattern.clone()], &pool, &default_grad_cfg());
    run_pass(&model, &disagree, &[pattern], &pool, &default_grad_cfg());

    assert_eq!(model.table.len(), 2, "true and false must be distinct feature entries");
}

/// S4 — topological check: a cyclic lattice is rejected as invalid, not
/// silently accepted.
#[test]
fn s4_cyclic_lattice_rejected() {
    let err = Lattice::build(
        vec![
            RawArc { src: 0, dst: 1, ilbl: 0, olbl: 0, wgh: vec![] },
            RawArc { src: 1, dst: 2, ilbl: 0, olbl: 0, wgh: vec![] },
            RawArc { src: 2, dst: 0, ilbl: 0, olbl: 0, wgh: vec![] },
        ],
        3,
        2,
        1,
    )
    .unwrap_err();
    assert!(matches!(err, Error::FstInvalid(_)));
}

/// S5 — pruning: a feature whose net gradient stays exactly zero across
/// iterations is removed once `iteration >= rem[tag]`.
#[test]
fn s5_zero_weight_feature_pruned_after_removal_iteration() {
    let mut model = Model::new(0);
    model.rem[0] = 5;
    let pool = StringPool::new(true);
    let ilbl = model.src_vocab.intern("a", &pool);
    let olbl = model.tgt_vocab.intern("b", &pool);
    let pattern = Pattern::compile("0:u:0s0", &pool).unwrap();

    // Hypothesis and reference are identical, so the feature's expected
    // count cancels to exactly zero every iteration and its weight never
    // moves off of zero.
    let hyp = Dataset {
        lattices: vec![Lattice::build(vec![RawArc { src: 0, dst: 1, ilbl, olbl, wgh: vec![] }], 2, 1, 1).unwrap()],
    };
    let reference = Dataset {
        lattices: vec![Lattice::build(vec![RawArc { src: 0, dst: 1, ilbl, olbl, wgh: vec![] }], 2, 1, -1).unwrap()],
    };

    for it in 0..10 {
        model.set_iteration(it);
        run_pass(&model, &hyp, &[pattern.clone()], &pool, &default_grad_cfg());
        run_pass(&model, &reference, &[pattern.clone()], &pool, &default_grad_cfg());
        rprop::sweep(&model, &RpropConfig::default());
    }

    assert_eq!(model.table.len(), 0, "the zero-weight feature must be pruned by iteration 10");
}

/// S6 — decoding: with zero feature weights the higher-bias path wins;
/// a strong feature on the losing branch's source label flips the
/// decision.
#[test]
fn s6_decoder_prefers_higher_score_path_and_feature_can_flip_it() {
    let model = Model::new(0);
    let pool = StringPool::new(true);
    let a = model.src_vocab.intern("a", &pool);
    let b = model.src_vocab.intern("b", &pool);
    let c = model.src_vocab.intern("c", &pool);
    let d = model.src_vocab.intern("d", &pool);
    let ta = model.tgt_vocab.intern("a", &pool);
    let tb = model.tgt_vocab.intern("b", &pool);
    let tc = model.tgt_vocab.intern("c", &pool);
    let td = model.tgt_vocab.intern("d", &pool);

    let arcs = vec![
        RawArc { src: 0, dst: 1, ilbl: a, olbl: ta, wgh: vec![2.0] },
        RawArc { src: 0, dst: 2, ilbl: b, olbl: tb, wgh: vec![1.0] },
        RawArc { src: 1, dst: 3, ilbl: c, olbl: tc, wgh: vec![1.0] },
        RawArc { src: 2, dst: 3, ilbl: d, olbl: td, wgh: vec![3.0] },
    ];
    let lat = Lattice::build(arcs, 4, 3, 0).unwrap();
    // Bare "0s0" so the feature key we force below (by hand) matches exactly
    // what the decoder's own materialization would compute.
    let pattern = Pattern::compile("0s0", &pool).unwrap();

    let path = decoder::decode(&lat, &model, &[pattern.clone()], &pool);
    let labels: Vec<&str> = path.iter().map(|p| p.in_label.as_str()).collect();
    assert_eq!(labels, vec!["b", "d"], "path through b,d (score 4.0) beats a,c (score 3.0)");

    // Force-create a feature on source "a" with a large positive weight.
    let feature = model.add_feature(0, &[model.src_vocab.get(a).raw], false).unwrap();
    latgrad::atomic_f64::store_f64(&feature.x, 10.0);

    let flipped = decoder::decode(&lat, &model, &[pattern], &pool);
    let flipped_labels: Vec<&str> = flipped.iter().map(|p| p.in_label.as_str()).collect();
    assert_eq!(flipped_labels, vec!["a", "c"], "a strong enough feature on 'a' should flip the decoded path");
}
