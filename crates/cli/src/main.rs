//! dpsynth command-line interface.
//!
//! Loads an integer-coded CSV dataset with its JSON domain, builds a
//! degree-k marginal workload, runs the AIM mechanism, reports the average
//! workload error of the synthetic rows, and optionally saves them.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing_subscriber::EnvFilter;

use dpsynth::{Aim, AimOptions, Clique, Dataset};

/// Generate differentially-private synthetic data with AIM.
#[derive(Parser, Debug)]
#[command(name = "dpsynth", version, about)]
struct Cli {
    /// CSV dataset of integer-coded records.
    #[arg(long)]
    dataset: PathBuf,

    /// JSON domain file mapping attribute to cardinality.
    #[arg(long)]
    domain: PathBuf,

    /// Privacy parameter epsilon.
    #[arg(long, default_value_t = 1.0)]
    epsilon: f64,

    /// Privacy parameter delta.
    #[arg(long, default_value_t = 1e-9)]
    delta: f64,

    /// Maximum model size in megabytes.
    #[arg(long, default_value_t = 80.0)]
    max_model_size: f64,

    /// Maximum optimizer iterations per fit.
    #[arg(long, default_value_t = 1000)]
    max_iters: usize,

    /// Degree of the marginals in the workload.
    #[arg(long, default_value_t = 2)]
    degree: usize,

    /// Subsample the workload to this many marginals.
    #[arg(long)]
    num_marginals: Option<usize>,

    /// Skip workload marginals with more cells than this.
    #[arg(long, default_value_t = 10_000)]
    max_cells: usize,

    /// Number of synthetic rows (defaults to the estimated total).
    #[arg(long)]
    rows: Option<usize>,

    /// Seed for all randomness in the run.
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Write the synthetic rows to this CSV path.
    #[arg(long)]
    save: Option<PathBuf>,
}

/// All size-`k` attribute combinations, in order.
fn combinations(attrs: &[String], k: usize) -> Vec<Clique> {
    fn recurse(attrs: &[String], k: usize, start: usize, current: &mut Vec<String>, out: &mut Vec<Clique>) {
        if current.len() == k {
            out.push(Clique::new(current.iter().cloned()));
            return;
        }
        for i in start..attrs.len() {
            current.push(attrs[i].clone());
            recurse(attrs, k, i + 1, current, out);
            current.pop();
        }
    }
    let mut out = Vec::new();
    recurse(attrs, k, 0, &mut Vec::new(), &mut out);
    out
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    anyhow::ensure!(cli.degree >= 1, "--degree must be at least 1");
    let data = Dataset::load(&cli.dataset, &cli.domain)
        .with_context(|| format!("loading dataset {}", cli.dataset.display()))?;
    let mut rng = ChaCha8Rng::seed_from_u64(cli.seed);

    let mut cliques: Vec<Clique> = combinations(data.domain().attrs(), cli.degree)
        .into_iter()
        .filter(|cl| {
            data.domain()
                .size_of(cl)
                .map(|s| s <= cli.max_cells)
                .unwrap_or(false)
        })
        .collect();
    if let Some(n) = cli.num_marginals {
        cliques.shuffle(&mut rng);
        cliques.truncate(n);
        cliques.sort();
    }
    anyhow::ensure!(!cliques.is_empty(), "workload is empty; relax --max-cells or --degree");
    let workload: Vec<(Clique, f64)> = cliques.into_iter().map(|cl| (cl, 1.0)).collect();

    let mech = Aim::new(cli.epsilon, cli.delta)?
        .with_max_model_size(cli.max_model_size)
        .with_max_iters(cli.max_iters);
    let opts = AimOptions {
        num_synth_rows: cli.rows,
        ..Default::default()
    };
    let run = mech.run(&data, &workload, opts, &mut rng)?;

    if let Some(path) = &cli.save {
        run.synthetic
            .save(path)
            .with_context(|| format!("saving synthetic rows to {}", path.display()))?;
    }

    let n = data.len() as f64;
    let m = run.synthetic.len() as f64;
    let mut errors = Vec::with_capacity(workload.len());
    for (cl, wgt) in &workload {
        let real = data.project(cl)?.datavector();
        let synth = run.synthetic.project(cl)?.datavector();
        let l1: f64 = real
            .iter()
            .zip(synth.iter())
            .map(|(a, b)| (a / n - b / m).abs())
            .sum();
        errors.push(0.5 * wgt * l1);
    }
    let avg = errors.iter().sum::<f64>() / errors.len() as f64;

    println!("rho used: {:.6} of {:.6}", run.budget.used(), run.budget.total());
    println!("average workload error: {avg:.6}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combinations_enumerate_pairs() {
        let attrs: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let pairs = combinations(&attrs, 2);
        assert_eq!(
            pairs,
            vec![
                Clique::new(["a", "b"]),
                Clique::new(["a", "c"]),
                Clique::new(["b", "c"]),
            ]
        );
    }

    #[test]
    fn cli_parses_defaults() {
        let cli = Cli::parse_from(["dpsynth", "--dataset", "d.csv", "--domain", "d.json"]);
        assert_eq!(cli.epsilon, 1.0);
        assert_eq!(cli.degree, 2);
        assert_eq!(cli.max_cells, 10_000);
    }
}
