//! Binary entry point: parses the CLI surface, wires dataset loading,
//! model I/O, the feature generator, the gradient/RPROP training loop, and
//! the Viterbi decoder together.

use std::fs::File;

use anyhow::{bail, Context, Result};
use clap::Parser;

use latgrad::cli::{expand_otf_template, Cli};
use latgrad::dataset::Dataset;
use latgrad::decoder;
use latgrad::gradient::{self, GradientConfig};
use latgrad::model::Model;
use latgrad::pattern::Pattern;
use latgrad::pool::StringPool;
use latgrad::rprop::{self, RpropConfig};

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if cli.features.pattern.is_empty() {
        bail!("missing required input: at least one --pattern is required");
    }
    let have_train = cli.data.train_spc.is_some() && cli.data.train_ref.is_some();
    let have_test = cli.data.test_spc.is_some();
    if !have_train && !have_test {
        bail!("missing required input: need either (--train-spc and --train-ref) or --test-spc");
    }

    let pool = StringPool::new(cli.string_pool.str_all);
    if let Some(path) = &cli.string_pool.str_load {
        pool.load(path).context("loading string pool")?;
    }

    let model = build_model(&cli)?;
    let patterns = compile_patterns(&cli.features.pattern, &pool)?;

    let nthreads = cli.global.nthreads.unwrap_or_else(num_cpus::get);
    let cache_lvl = if cli.model_io.ftr_dump.is_some() { 4 } else { cli.optimization.cache_lvl };
    let effective_nthreads = if cli.model_io.ftr_dump.is_some() { 1 } else { nthreads };

    if have_train {
        train(&cli, &model, &pool, &patterns, effective_nthreads, cache_lvl)?;
    }

    if let (Some(test_spc), Some(test_out)) = (&cli.data.test_spc, &cli.data.test_out) {
        decode_dataset(&model, &pool, &patterns, test_spc, test_out)?;
    }
    if let (Some(test_spc), Some(test_fst)) = (&cli.data.test_spc, &cli.data.test_fst) {
        dump_dataset(&model, &pool, &patterns, test_spc, test_fst)?;
    }

    if let Some(path) = &cli.model_io.mdl_save {
        if cli.model_io.mdl_compact {
            model.save(path, true).context("saving model")?;
        } else {
            model.shrink();
            model.save(path, false).context("saving model")?;
        }
    }
    if let Some(path) = &cli.string_pool.str_save {
        pool.save(path).context("saving string pool")?;
    }

    Ok(())
}

fn build_model(cli: &Cli) -> Result<Model> {
    let mut model = Model::new(cli.features.min_freq);
    for tv in &cli.features.tag_start {
        model.stt[tv.tag as usize] = tv.value;
    }
    for tv in &cli.features.tag_remove {
        model.rem[tv.tag as usize] = tv.value;
    }
    if let Some(path) = &cli.model_io.mdl_load {
        model.load(path).context("loading model")?;
    }
    if let Some(path) = &cli.model_io.ftr_dump {
        let file = File::create(path).context("creating feature dump file")?;
        model = model.with_dump_sink(file);
    }
    Ok(model)
}

fn compile_patterns(specs: &[String], pool: &StringPool) -> Result<Vec<Pattern>> {
    specs
        .iter()
        .map(|s| Pattern::compile(s, pool).map_err(anyhow::Error::from))
        .collect()
}

fn rprop_config(cli: &Cli) -> RpropConfig {
    let mut cfg = RpropConfig {
        stpinc: cli.optimization.stpinc,
        stpdec: cli.optimization.stpdec,
        stpmin: cli.optimization.stpmin,
        stpmax: cli.optimization.stpmax,
        ..RpropConfig::default()
    };
    for tv in &cli.features.tag_rho1 {
        cfg.rho1[tv.tag as usize] = Some(tv.value);
    }
    for tv in &cli.features.tag_rho2 {
        cfg.rho2[tv.tag as usize] = Some(tv.value);
    }
    for tv in &cli.features.tag_rho3 {
        cfg.rho3[tv.tag as usize] = Some(tv.value);
    }
    cfg
}

fn train(cli: &Cli, model: &Model, pool: &StringPool, patterns: &[Pattern], nthreads: usize, cache_lvl: u8) -> Result<()> {
    let train_spc = cli.data.train_spc.as_ref().unwrap();
    let train_ref = cli.data.train_ref.as_ref().unwrap();

    let hyp = Dataset::load(train_spc, 1, &model.src_vocab, &model.tgt_vocab, pool).context("loading hypothesis training lattices")?;
    let reference = Dataset::load(train_ref, -1, &model.src_vocab, &model.tgt_vocab, pool).context("loading reference training lattices")?;

    let grad_cfg = GradientConfig {
        cache_lvl,
        nthreads,
        ref_freq: cli.features.ref_freq,
    };
    let rprop_cfg = rprop_config(cli);

    for it in 0..cli.optimization.iterations {
        model.set_iteration(it);
        let hyp_ll = gradient::run_pass(model, &hyp, patterns, pool, &grad_cfg);
        let ref_ll = gradient::run_pass(model, &reference, patterns, pool, &grad_cfg);
        let (live, reg) = rprop::sweep(model, &rprop_cfg);
        let objective = hyp_ll + ref_ll + reg;

        if cli.global.verbose {
            tracing::info!(iteration = it, objective, live_features = live, "training iteration complete");
        }

        if let Some(template) = &cli.model_io.mdl_save_otf {
            let path = expand_otf_template(template, it);
            model.save(std::path::Path::new(&path), false).with_context(|| format!("saving on-the-fly snapshot {path}"))?;
        }
    }

    if let (Some(devel_spc), Some(devel_out)) = (&cli.data.devel_spc, &cli.data.devel_out) {
        decode_dataset(model, pool, patterns, devel_spc, devel_out)?;
    }

    Ok(())
}

fn decode_dataset(model: &Model, pool: &StringPool, patterns: &[Pattern], input: &std::path::Path, output: &std::path::Path) -> Result<()> {
    let dataset = Dataset::load(input, 0, &model.src_vocab, &model.tgt_vocab, pool).context("loading decode input lattices")?;
    let mut out = std::io::BufWriter::new(File::create(output).context("creating decode output file")?);
    use std::io::Write;
    for lat in &dataset.lattices {
        let path = decoder::decode(lat, model, patterns, pool);
        let rendered: Vec<String> = path.iter().map(|a| format!("{}:{}", a.in_label, a.out_label)).collect();
        writeln!(out, "{}", rendered.join(" "))?;
    }
    Ok(())
}

fn dump_dataset(model: &Model, pool: &StringPool, patterns: &[Pattern], input: &std::path::Path, output: &std::path::Path) -> Result<()> {
    let dataset = Dataset::load(input, 0, &model.src_vocab, &model.tgt_vocab, pool).context("loading dump input lattices")?;
    let mut out = std::io::BufWriter::new(File::create(output).context("creating fst dump file")?);
    for lat in &dataset.lattices {
        decoder::dump_weighted_fst(lat, model, patterns, pool, &mut out)?;
    }
    Ok(())
}
