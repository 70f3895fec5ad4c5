//! Command-line surface (spec.md §6), grouped into flattened sub-structs the
//! way the teacher crate's richer CLIs (`coding_agent_cli`) group theirs.

use std::path::PathBuf;
use std::str::FromStr;

use clap::{Args, Parser};

use crate::model::NUM_TAGS;

#[derive(Parser)]
#[command(name = "latgrad")]
#[command(about = "Discriminative WFST training and Viterbi decoding")]
pub struct Cli {
    #[command(flatten)]
    pub global: Global,
    #[command(flatten)]
    pub model_io: ModelIo,
    #[command(flatten)]
    pub data: Data,
    #[command(flatten)]
    pub features: Features,
    #[command(flatten)]
    pub optimization: Optimization,
    #[command(flatten)]
    pub string_pool: StringPoolArgs,
}

#[derive(Args)]
pub struct Global {
    /// Print per-iteration progress to stderr.
    #[arg(short, long)]
    pub verbose: bool,

    /// Worker thread count (defaults to available parallelism).
    #[arg(long)]
    pub nthreads: Option<usize>,
}

#[derive(Args)]
pub struct ModelIo {
    /// Load an existing model weight file before training/decoding.
    #[arg(long = "mdl-load")]
    pub mdl_load: Option<PathBuf>,

    /// Save the final model weight file.
    #[arg(long = "mdl-save")]
    pub mdl_save: Option<PathBuf>,

    /// Save a model snapshot every iteration; `%d` is replaced by the
    /// iteration number.
    #[arg(long = "mdl-save-otf")]
    pub mdl_save_otf: Option<String>,

    /// Skip zero-weight features when saving, without a separate shrink pass.
    #[arg(long = "mdl-compact")]
    pub mdl_compact: bool,

    /// Dump every created feature's key and content hashes as it is created.
    /// Forces single-threaded execution.
    #[arg(long = "ftr-dump")]
    pub ftr_dump: Option<PathBuf>,
}

#[derive(Args)]
pub struct Data {
    #[arg(long = "train-spc")]
    pub train_spc: Option<PathBuf>,
    #[arg(long = "train-ref")]
    pub train_ref: Option<PathBuf>,
    #[arg(long = "devel-spc")]
    pub devel_spc: Option<PathBuf>,
    #[arg(long = "devel-out")]
    pub devel_out: Option<PathBuf>,
    #[arg(long = "test-spc")]
    pub test_spc: Option<PathBuf>,
    #[arg(long = "test-out")]
    pub test_out: Option<PathBuf>,
    #[arg(long = "test-fst")]
    pub test_fst: Option<PathBuf>,
}

#[derive(Args)]
pub struct Features {
    /// `T:pattern-string`, repeatable.
    #[arg(long = "pattern")]
    pub pattern: Vec<String>,

    /// `T:N`, repeatable: first iteration at which tag T's features may be created.
    #[arg(long = "tag-start")]
    pub tag_start: Vec<TagValue<u32>>,

    /// `T:N`, repeatable: iteration at which tag T's zero-weight features are pruned.
    #[arg(long = "tag-remove")]
    pub tag_remove: Vec<TagValue<u32>>,

    #[arg(long = "tag-rho1")]
    pub tag_rho1: Vec<TagValue<f64>>,
    #[arg(long = "tag-rho2")]
    pub tag_rho2: Vec<TagValue<f64>>,
    #[arg(long = "tag-rho3")]
    pub tag_rho3: Vec<TagValue<f64>>,

    /// Count feature frequency on the reference side instead of hypothesis.
    #[arg(long = "ref-freq")]
    pub ref_freq: bool,

    /// Minimum reference-occurrence frequency for a feature to survive RPROP.
    #[arg(long = "min-freq", default_value_t = 0)]
    pub min_freq: u32,
}

#[derive(Args)]
pub struct Optimization {
    /// 1..4; lower values free more transient per-lattice state sooner.
    /// Level 0 (spec.md §5's "also free the adjacency arrays" tier) is not
    /// supported: this crate keeps the dataset resident in memory across
    /// `--iterations` rather than re-parsing lattices from disk between
    /// passes, so a lattice's `in_arcs`/`out_arcs` must stay available for
    /// the next iteration to reuse. Rejected at parse time.
    #[arg(long = "cache-lvl", default_value_t = 4, value_parser = clap::value_parser!(u8).range(1..=4))]
    pub cache_lvl: u8,

    #[arg(long = "iterations", default_value_t = 1)]
    pub iterations: u32,

    #[arg(long = "rbp-stpinc", default_value_t = 1.2)]
    pub stpinc: f64,
    #[arg(long = "rbp-stpdec", default_value_t = 0.5)]
    pub stpdec: f64,
    #[arg(long = "rbp-stpmin", default_value_t = 1e-8)]
    pub stpmin: f64,
    #[arg(long = "rbp-stpmax", default_value_t = 50.0)]
    pub stpmax: f64,
}

#[derive(Args)]
pub struct StringPoolArgs {
    #[arg(long = "str-load")]
    pub str_load: Option<PathBuf>,
    #[arg(long = "str-save")]
    pub str_save: Option<PathBuf>,
    /// Store every interned string, not just mandatory ones.
    #[arg(long = "str-all")]
    pub str_all: bool,
}

/// Parses a repeatable `tag:value` CLI switch, e.g. `--tag-start 3:10`.
#[derive(Debug, Clone, Copy)]
pub struct TagValue<T> {
    pub tag: u8,
    pub value: T,
}

impl<T: FromStr> FromStr for TagValue<T> {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (tag_str, value_str) = s
            .split_once(':')
            .ok_or_else(|| format!("expected 'TAG:VALUE', got {:?}", s))?;
        let tag: u8 = tag_str
            .parse()
            .map_err(|_| format!("invalid tag {:?}: must be 0..{}", tag_str, NUM_TAGS - 1))?;
        if tag as usize >= NUM_TAGS {
            return Err(format!("tag {} out of range 0..{}", tag, NUM_TAGS - 1));
        }
        let value = value_str
            .parse()
            .map_err(|_| format!("invalid value {:?}", value_str))?;
        Ok(Self { tag, value })
    }
}

/// Expand a single `%d` template token with the iteration number, the same
/// narrow `-otf` mini-format spec.md §6 specifies.
pub fn expand_otf_template(template: &str, iteration: u32) -> String {
    match template.split_once("%d") {
        Some((before, after)) => format!("{before}{iteration}{after}"),
        None => template.to_string(),
    }
}
