//! Feature table and per-tag activation windows (spec component 4).

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::atomic_f64::{atomic_add_f64, load_f64, new_atomic_f64, store_f64};
use crate::concurrent_map::ConcurrentMap;
use crate::error::{Error, Result};
use crate::hash::hash_u64_seq;
use crate::label::Vocab;
use crate::lattice::MAX_REAL;

pub const NUM_TAGS: usize = 128;

/// One sparse feature: current weight, accumulated gradient, and the RPROP
/// bookkeeping fields needed to adapt its step size.
pub struct Feature {
    pub key: u64,
    pub x: AtomicU64,
    pub g: AtomicU64,
    pub g_prev: AtomicU64,
    pub stp: AtomicU64,
    pub last_delta: AtomicU64,
    pub frq: AtomicU32,
}

impl Feature {
    pub(crate) fn zeroed(key: u64) -> Self {
        Self {
            key,
            x: new_atomic_f64(0.0),
            g: new_atomic_f64(0.0),
            g_prev: new_atomic_f64(0.0),
            stp: new_atomic_f64(0.0),
            last_delta: new_atomic_f64(0.0),
            frq: AtomicU32::new(0),
        }
    }

    pub fn tag(&self) -> u8 {
        (self.key >> 56) as u8
    }

    pub fn x(&self) -> f64 {
        load_f64(&self.x)
    }

    pub fn g(&self) -> f64 {
        load_f64(&self.g)
    }

    pub fn add_g(&self, delta: f64) {
        atomic_add_f64(&self.g, delta);
    }
}

/// Owns the feature table, the two label vocabularies, and per-tag
/// activation windows `[stt[tag], rem[tag])`.
pub struct Model {
    pub table: ConcurrentMap<Feature>,
    pub src_vocab: Vocab,
    pub tgt_vocab: Vocab,
    pub stt: [u32; NUM_TAGS],
    pub rem: [u32; NUM_TAGS],
    pub iteration: AtomicU32,
    pub min_freq: u32,
    /// The dense-feature coefficients of spec.md §3/§4.6, one per arc weight
    /// slot `1..MAX_REAL` (slot 0 is always the arc's own bias, summed
    /// directly in `gradient::compute_psi`). `dense[i - 1]` is
    /// `dense_feature_i`, tagged `i`, held outside `table` since it is
    /// addressed by weight-vector position rather than by pattern content
    /// hash. Length is `MAX_REAL.saturating_sub(1)`; with `MAX_REAL == 1`
    /// this is empty and the dense path is a genuine no-op loop rather than
    /// hardcoded-absent.
    pub dense: Vec<Arc<Feature>>,
    dump: Option<Mutex<BufWriter<File>>>,
}

impl Model {
    pub fn new(min_freq: u32) -> Self {
        Self {
            table: ConcurrentMap::new(),
            src_vocab: Vocab::new(),
            tgt_vocab: Vocab::new(),
            stt: [0; NUM_TAGS],
            rem: [u32::MAX; NUM_TAGS],
            iteration: AtomicU32::new(0),
            min_freq,
            dense: (1..MAX_REAL).map(|i| Arc::new(Feature::zeroed((i as u64) << 56))).collect(),
            dump: None,
        }
    }

    pub fn with_dump_sink(mut self, file: File) -> Self {
        self.dump = Some(Mutex::new(BufWriter::new(file)));
        self
    }

    pub fn iteration(&self) -> u32 {
        self.iteration.load(Ordering::Relaxed)
    }

    pub fn set_iteration(&self, it: u32) {
        self.iteration.store(it, Ordering::Relaxed);
    }

    fn build_key(tag: u8, hashes: &[u64]) -> u64 {
        let content = hash_u64_seq(hashes);
        ((tag as u64) << 56) | content
    }

    /// Look up or, if the tag's activation window admits the current
    /// iteration, create the feature keyed by `tag` and `hashes`.
    ///
    /// Mirrors spec.md's `add_feature`: existing features always get a
    /// frequency bump (if `count_frequency`); new features are gated on
    /// `iteration ∈ [stt[tag], rem[tag])` and, once created, optionally
    /// dumped as `key space-separated content hashes`.
    pub fn add_feature(&self, tag: u8, hashes: &[u64], count_frequency: bool) -> Option<Arc<Feature>> {
        let key = Self::build_key(tag, hashes);
        if let Some(existing) = self.table.find(key) {
            if count_frequency {
                existing.frq.fetch_add(1, Ordering::Relaxed);
            }
            return Some(existing);
        }

        let tag_idx = tag as usize;
        let iteration = self.iteration();
        if iteration < self.stt[tag_idx] || iteration >= self.rem[tag_idx] {
            return None;
        }

        let feature = self.table.insert(key, Feature::zeroed(key));
        if count_frequency {
            feature.frq.fetch_add(1, Ordering::Relaxed);
        }
        self.emit_dump_line(key, hashes);
        Some(feature)
    }

    fn emit_dump_line(&self, key: u64, hashes: &[u64]) {
        let Some(sink) = &self.dump else { return };
        let mut w = sink.lock();
        let _ = write!(w, "{:016x}", key);
        for h in hashes {
            let _ = write!(w, " {:016x}", h);
        }
        let _ = writeln!(w);
    }

    /// Remove every feature whose weight has collapsed to exactly zero.
    /// Requires no concurrent readers/writers (run between iterations).
    pub fn shrink(&self) {
        self.table.retain(|_, f| f.x() != 0.0);
    }

    /// Raw insert bypassing the activation-window gate, used by `load` to
    /// admit features whose tag window would otherwise reject them at the
    /// model's current iteration; the next RPROP sweep reconciles this
    /// (a zero-weight feature past its `rem` window is pruned there).
    fn raw_insert(&self, key: u64, x: f64) {
        let feature = self.table.insert(key, Feature::zeroed(key));
        store_f64(&feature.x, x);
    }

    /// Load a model weight file: `<16-hex-digit key> <decimal weight>` per line.
    pub fn load(&self, path: &Path) -> Result<()> {
        let file = File::open(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|source| Error::Io {
                path: path.to_path_buf(),
                source,
            })?;
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key_tok, x_tok)) = line.split_once(' ') else {
                return Err(Error::Format {
                    path: path.to_path_buf(),
                    line: lineno + 1,
                    message: "expected '<hex-key> <weight>'".into(),
                });
            };
            let key = u64::from_str_radix(key_tok.trim(), 16).map_err(|_| Error::Format {
                path: path.to_path_buf(),
                line: lineno + 1,
                message: format!("invalid hex key {:?}", key_tok),
            })?;
            let x: f64 = x_tok.trim().parse().map_err(|_| Error::Format {
                path: path.to_path_buf(),
                line: lineno + 1,
                message: format!("invalid weight {:?}", x_tok),
            })?;
            self.raw_insert(key, x);
        }
        Ok(())
    }

    /// Save every feature's key and weight, one per line. `compact` skips
    /// zero-weight features without requiring a prior `shrink()`.
    pub fn save(&self, path: &Path, compact: bool) -> Result<()> {
        let file = File::create(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut w = BufWriter::new(file);
        for (key, f) in self.table.iter() {
            let x = f.x();
            if compact && x == 0.0 {
                continue;
            }
            writeln!(w, "{:016x} {}", key, x).map_err(|source| Error::Io {
                path: path.to_path_buf(),
                source,
            })?;
        }
        Ok(())
    }
}
