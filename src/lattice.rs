//! The WFST lattice structure: arcs, states, adjacency, and the two
//! topological arc orderings used by the gradient engine and decoder.
//!
//! Per the design note on pointer-heavy per-lattice data, bigram feature
//! lists and bigram ψ live in a flat, owned buffer with a precomputed
//! stride (`FlatMatrix`) rather than nested `Vec<Vec<_>>`, giving O(1)
//! access to `V.psi[i][o]` and dropping cleanly under the cache-level
//! policy.
//!
//! Transient per-arc/per-state fields (ψ, α, β, feature lists) use atomics
//! and `parking_lot::Mutex` rather than `Cell`/`RefCell`: the gradient
//! engine's worker pool claims whole lattices by index and each lattice is
//! touched by exactly one thread at a time, but a shared `&[Lattice]` still
//! has to be `Sync` for that claiming scheme to type-check.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::atomic_f64::{load_f64, new_atomic_f64, store_f64};
use crate::error::{Error, Result};
use crate::label::LabelId;

/// Number of pre-assigned real-valued weight slots on an arc: the bias
/// plus coefficients of "dense" features identified by tag. Kept as a
/// named constant, parameterized rather than hardcoded to zero, per the
/// open question in the spec's design notes.
pub const MAX_REAL: usize = 1;

/// A flat, owned 2-D buffer with a precomputed row stride. Used for
/// per-state bigram ψ and bigram feature lists, giving O(1) `(i, o)`
/// access without nested heap allocations.
#[derive(Debug, Clone)]
pub struct FlatMatrix<T> {
    cols: usize,
    data: Vec<T>,
}

impl<T: Clone + Default> FlatMatrix<T> {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            cols: cols.max(1),
            data: vec![T::default(); rows * cols.max(1)],
        }
    }

    pub fn get(&self, i: usize, o: usize) -> &T {
        &self.data[i * self.cols + o]
    }

    pub fn get_mut(&mut self, i: usize, o: usize) -> &mut T {
        &mut self.data[i * self.cols + o]
    }
}

/// One arc of the lattice (spec's `Arc (E)`, renamed `Edge` here to avoid
/// colliding with `std::sync::Arc`).
#[derive(Debug)]
pub struct Edge {
    pub src: u32,
    pub dst: u32,
    pub ilbl: LabelId,
    pub olbl: LabelId,
    pub wgh: [f64; MAX_REAL],
    psi: AtomicU64,
    alpha: AtomicU64,
    beta: AtomicU64,
    /// Decoder backpointer: index of the best predecessor arc, or `-1`.
    eback: AtomicI64,
    /// Unigram feature keys firing on this arc; `None` once freed under
    /// the cache-level policy.
    unigram: Mutex<Option<Vec<u64>>>,
}

impl Edge {
    fn new(src: u32, dst: u32, ilbl: LabelId, olbl: LabelId, wgh: [f64; MAX_REAL]) -> Self {
        Self {
            src,
            dst,
            ilbl,
            olbl,
            wgh,
            psi: new_atomic_f64(0.0),
            alpha: new_atomic_f64(f64::NEG_INFINITY),
            beta: new_atomic_f64(f64::NEG_INFINITY),
            eback: AtomicI64::new(-1),
            unigram: Mutex::new(None),
        }
    }

    pub fn psi(&self) -> f64 {
        load_f64(&self.psi)
    }
    pub fn set_psi(&self, v: f64) {
        store_f64(&self.psi, v);
    }
    pub fn alpha(&self) -> f64 {
        load_f64(&self.alpha)
    }
    pub fn set_alpha(&self, v: f64) {
        store_f64(&self.alpha, v);
    }
    pub fn beta(&self) -> f64 {
        load_f64(&self.beta)
    }
    pub fn set_beta(&self, v: f64) {
        store_f64(&self.beta, v);
    }
    pub fn eback(&self) -> i64 {
        self.eback.load(Ordering::Relaxed)
    }
    pub fn set_eback(&self, v: i64) {
        self.eback.store(v, Ordering::Relaxed);
    }

    pub fn set_unigram(&self, keys: Vec<u64>) {
        *self.unigram.lock() = Some(keys);
    }

    pub fn with_unigram<R>(&self, f: impl FnOnce(&[u64]) -> R) -> R {
        let guard = self.unigram.lock();
        f(guard.as_deref().unwrap_or(&[]))
    }

    fn drop_unigram(&self) {
        *self.unigram.lock() = None;
    }
}

/// One state of the lattice.
#[derive(Debug)]
pub struct State {
    pub in_arcs: Vec<u32>,
    pub out_arcs: Vec<u32>,
    bigram: Mutex<Option<FlatMatrix<Vec<u64>>>>,
    psi: Mutex<Option<FlatMatrix<f64>>>,
}

impl State {
    fn empty() -> Self {
        Self {
            in_arcs: Vec::new(),
            out_arcs: Vec::new(),
            bigram: Mutex::new(None),
            psi: Mutex::new(None),
        }
    }

    /// Index of arc `arc_idx` within this state's in-arc list.
    pub fn in_index(&self, arc_idx: u32) -> Option<usize> {
        self.in_arcs.iter().position(|&a| a == arc_idx)
    }

    /// Index of arc `arc_idx` within this state's out-arc list.
    pub fn out_index(&self, arc_idx: u32) -> Option<usize> {
        self.out_arcs.iter().position(|&a| a == arc_idx)
    }

    pub fn set_bigram(&self, m: FlatMatrix<Vec<u64>>) {
        *self.bigram.lock() = Some(m);
    }

    pub fn set_psi(&self, m: FlatMatrix<f64>) {
        *self.psi.lock() = Some(m);
    }

    pub fn with_bigram<R>(&self, i: usize, o: usize, f: impl FnOnce(&[u64]) -> R) -> R {
        let guard = self.bigram.lock();
        match guard.as_ref() {
            Some(m) => f(m.get(i, o)),
            None => f(&[]),
        }
    }

    pub fn psi_at(&self, i: usize, o: usize) -> f64 {
        self.psi.lock().as_ref().map(|m| *m.get(i, o)).unwrap_or(0.0)
    }

    fn drop_bigram(&self) {
        *self.bigram.lock() = None;
    }

    fn drop_psi(&self) {
        *self.psi.lock() = None;
    }
}

/// A raw arc as parsed from the text format, before adjacency/ordering is
/// computed.
#[derive(Debug, Clone)]
pub struct RawArc {
    pub src: u32,
    pub dst: u32,
    pub ilbl: LabelId,
    pub olbl: LabelId,
    pub wgh: Vec<f64>,
}

/// An acyclic WFST with a unique initial state (index 0) and unique final
/// state, plus both topological arc orderings.
#[derive(Debug)]
pub struct Lattice {
    pub arcs: Vec<Edge>,
    pub states: Vec<State>,
    pub final_state: u32,
    /// Reference (-1), test (0), or hypothesis (+1).
    pub multiplier: i8,
    fwd_order: Mutex<Option<Vec<u32>>>,
    bwd_order: Mutex<Option<Vec<u32>>>,
}

impl Lattice {
    /// Build adjacency (`fst_add_states`), compute both topological
    /// orderings and validate uniqueness/acyclicity/reachability
    /// (`fst_add_sort`), in one pass.
    pub fn build(raw_arcs: Vec<RawArc>, nstates: usize, final_state: u32, multiplier: i8) -> Result<Self> {
        let mut states: Vec<State> = (0..nstates).map(|_| State::empty()).collect();
        let mut arcs: Vec<Edge> = Vec::with_capacity(raw_arcs.len());

        for raw in &raw_arcs {
            let mut wgh = [0.0; MAX_REAL];
            for (slot, w) in wgh.iter_mut().zip(raw.wgh.iter()) {
                *slot = *w;
            }
            arcs.push(Edge::new(raw.src, raw.dst, raw.ilbl, raw.olbl, wgh));
        }

        for (idx, raw) in raw_arcs.iter().enumerate() {
            states[raw.src as usize].out_arcs.push(idx as u32);
            states[raw.dst as usize].in_arcs.push(idx as u32);
        }

        let sources: Vec<u32> = (0..nstates as u32)
            .filter(|&s| states[s as usize].in_arcs.is_empty())
            .collect();
        let sinks: Vec<u32> = (0..nstates as u32)
            .filter(|&s| states[s as usize].out_arcs.is_empty())
            .collect();

        if sources.len() != 1 || sources[0] != 0 {
            return Err(Error::FstInvalid(format!(
                "expected exactly one source state at index 0, found {:?}",
                sources
            )));
        }
        if sinks.len() != 1 || sinks[0] != final_state {
            return Err(Error::FstInvalid(format!(
                "expected exactly one sink state at the declared final state {}, found {:?}",
                final_state, sinks
            )));
        }

        let fwd_states = topo_state_order(&states, &arcs, true)
            .ok_or_else(|| Error::FstInvalid("cycle detected".into()))?;
        let bwd_states = topo_state_order(&states, &arcs, false)
            .ok_or_else(|| Error::FstInvalid("cycle detected".into()))?;

        check_reachable_from(&states, &arcs, 0, nstates, true)?;
        check_reachable_from(&states, &arcs, final_state, nstates, false)?;

        let mut fwd_order = Vec::with_capacity(arcs.len());
        for s in &fwd_states {
            fwd_order.extend_from_slice(&states[*s as usize].out_arcs);
        }
        let mut bwd_order = Vec::with_capacity(arcs.len());
        for s in &bwd_states {
            bwd_order.extend_from_slice(&states[*s as usize].in_arcs);
        }

        Ok(Self {
            arcs,
            states,
            final_state,
            multiplier,
            fwd_order: Mutex::new(Some(fwd_order)),
            bwd_order: Mutex::new(Some(bwd_order)),
        })
    }

    pub fn nstates(&self) -> usize {
        self.states.len()
    }

    pub fn fwd_order(&self) -> Vec<u32> {
        self.fwd_order
            .lock()
            .clone()
            .expect("fwd_order accessed after being dropped by cache policy")
    }

    pub fn bwd_order(&self) -> Vec<u32> {
        self.bwd_order
            .lock()
            .clone()
            .expect("bwd_order accessed after being dropped by cache policy")
    }

    /// Free the topological orderings (cache level < 2).
    pub fn drop_orders(&self) {
        *self.fwd_order.lock() = None;
        *self.bwd_order.lock() = None;
    }

    /// Free bigram/unigram feature lists (cache level < 3).
    pub fn drop_feature_lists(&self) {
        for arc in &self.arcs {
            arc.drop_unigram();
        }
        for state in &self.states {
            state.drop_bigram();
        }
    }

    /// Free α/β/ψ (cache level < 4).
    pub fn reset_scores(&self) {
        for arc in &self.arcs {
            arc.set_psi(0.0);
            arc.set_alpha(f64::NEG_INFINITY);
            arc.set_beta(f64::NEG_INFINITY);
        }
        for state in &self.states {
            state.drop_psi();
        }
    }
}

/// Kahn's algorithm over the state DAG. `forward == true` produces a
/// source-first order (states with no incoming arcs come first);
/// `forward == false` produces a sink-first order (a topological order of
/// the reversed graph). Returns `None` on a cycle.
fn topo_state_order(states: &[State], arcs: &[Edge], forward: bool) -> Option<Vec<u32>> {
    let n = states.len();
    let mut remaining: Vec<usize> = (0..n)
        .map(|s| {
            if forward {
                states[s].in_arcs.len()
            } else {
                states[s].out_arcs.len()
            }
        })
        .collect();
    let mut queue: VecDeque<u32> = (0..n as u32).filter(|&s| remaining[s as usize] == 0).collect();
    let mut order = Vec::with_capacity(n);

    while let Some(s) = queue.pop_front() {
        order.push(s);
        let frontier_arcs = if forward {
            &states[s as usize].out_arcs
        } else {
            &states[s as usize].in_arcs
        };
        for &arc_idx in frontier_arcs {
            let neighbor = if forward {
                arcs[arc_idx as usize].dst
            } else {
                arcs[arc_idx as usize].src
            };
            remaining[neighbor as usize] -= 1;
            if remaining[neighbor as usize] == 0 {
                queue.push_back(neighbor);
            }
        }
    }

    if order.len() == n {
        Some(order)
    } else {
        None
    }
}

/// Verify every state other than `from` is reachable from `from`
/// (`forward == true`, following out-arcs) or reaches `from`
/// (`forward == false`, following in-arcs backwards from `from`).
fn check_reachable_from(
    states: &[State],
    arcs: &[Edge],
    from: u32,
    nstates: usize,
    forward: bool,
) -> Result<()> {
    let mut seen = vec![false; nstates];
    let mut queue = VecDeque::new();
    seen[from as usize] = true;
    queue.push_back(from);
    while let Some(s) = queue.pop_front() {
        let frontier_arcs = if forward {
            &states[s as usize].out_arcs
        } else {
            &states[s as usize].in_arcs
        };
        for &arc_idx in frontier_arcs {
            let neighbor = if forward {
                arcs[arc_idx as usize].dst
            } else {
                arcs[arc_idx as usize].src
            };
            if !seen[neighbor as usize] {
                seen[neighbor as usize] = true;
                queue.push_back(neighbor);
            }
        }
    }
    if seen.iter().all(|&s| s) {
        Ok(())
    } else {
        let direction = if forward { "from the initial state" } else { "to the final state" };
        Err(Error::FstInvalid(format!(
            "not every state is reachable {}",
            direction
        )))
    }
}
