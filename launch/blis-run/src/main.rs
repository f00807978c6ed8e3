//! Thin JSON-in/JSON-out runner (spec.md §6, SPEC_FULL.md §0).
//!
//! `blis-run <config.json> <workload.json>` reads a [`blis_core::Config`]
//! and a [`blis_workload::WorkloadSpec`], drives the engine to completion,
//! and writes exactly one [`blis_core::SimulationReport`] JSON value to
//! stdout. Diagnostics (timing, progress) go to stderr through `tracing`
//! and never interleave with the deterministic stream — this binary is
//! intentionally the only writer of stdout, and writes to it exactly once.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use blis_core::rng::PartitionedRng;
use blis_core::{ClusterOrchestrator, Config};
use blis_workload::WorkloadSpec;

fn init_diagnostics() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}

struct Args {
    config_path: PathBuf,
    workload_path: PathBuf,
}

fn parse_args() -> Result<Args> {
    let mut args = std::env::args_os().skip(1);
    let config_path = args
        .next()
        .context("usage: blis-run <config.json> <workload.json>")?
        .into();
    let workload_path = args
        .next()
        .context("usage: blis-run <config.json> <workload.json>")?
        .into();
    Ok(Args {
        config_path,
        workload_path,
    })
}

fn load_config(path: &PathBuf) -> Result<Config> {
    let raw = fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
    let config: Config = serde_json::from_str(&raw).context("parsing config JSON")?;
    config.validate_all().context("validating config")?;
    Ok(config)
}

fn load_workload_spec(path: &PathBuf) -> Result<WorkloadSpec> {
    let raw = fs::read_to_string(path).with_context(|| format!("reading workload {}", path.display()))?;
    serde_json::from_str(&raw).context("parsing workload spec JSON")
}

fn run() -> Result<()> {
    let args = parse_args()?;
    let config = load_config(&args.config_path)?;
    let workload_spec = load_workload_spec(&args.workload_path)?;

    tracing::info!(
        model = %config.model,
        num_instances = config.num_instances,
        horizon_ticks = config.horizon_ticks,
        "starting run"
    );

    let rng = PartitionedRng::new(config.seed);
    let workload = blis_workload::generate(&workload_spec, &rng).context("generating workload")?;
    anyhow::ensure!(
        workload.is_sorted_by_arrival(),
        "generated workload violates non-decreasing arrival order (INV-6 precondition)"
    );

    let mut cluster = ClusterOrchestrator::new(config).context("constructing cluster orchestrator")?;
    for request in workload.into_requests() {
        cluster.submit(request).context("submitting request")?;
    }

    cluster.run().context("running simulation")?;

    tracing::info!(
        completed = cluster.completed().len(),
        rejected = cluster.rejected().len(),
        dropped_unservable = cluster.dropped_unservable().len(),
        "run finished"
    );

    let report = cluster.into_simulation_report();
    serde_json::to_writer(std::io::stdout(), &report).context("writing simulation report")?;
    println!();
    Ok(())
}

fn main() -> Result<()> {
    init_diagnostics();
    if let Err(err) = run() {
        tracing::error!(error = %err, "blis-run failed");
        return Err(err);
    }
    Ok(())
}
