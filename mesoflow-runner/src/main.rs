mod rank;

use clap::Parser;
use log::{error, info, warn};
use mesoflow_config::{load_config, Config};
use mesoflow_core::{ProcessGroup, ThreadGroup};
use mesoflow_transport::MeshLink;
use rank::{Rank, RankSummary, RunError};
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the simulation configuration file (JSON or TOML)
    #[arg(short, long, default_value = "mesoflow.json")]
    config: PathBuf,

    /// Resume from the newest complete checkpoint in this folder
    #[arg(short, long)]
    restart: Option<PathBuf>,

    /// Override the step count of the configuration
    #[arg(short, long)]
    steps: Option<u64>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = match load_config(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load config {}: {}", args.config.display(), e);
            process::exit(1);
        }
    };
    if let Some(steps) = args.steps {
        config.steps = steps;
    }
    info!("Using configuration from {}", args.config.display());

    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    if let Err(e) = ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst)) {
        warn!("Ctrl+C handler not installed: {}", e);
    }

    match run(&config, args.restart.as_deref(), stop) {
        Ok(summaries) => report(&summaries),
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    }
}

/// Spawn one thread per rank and wait for all of them. The first rank error is
/// returned at once; ranks still blocked in collectives are left to the caller.
fn run(config: &Config, restart: Option<&Path>, stop: Arc<AtomicBool>) -> Result<Vec<RankSummary>, RunError> {
    let seed = config.seed.unwrap_or_else(rand::random);
    info!(
        "Running {} collections on {} ranks up to step {} (seed {})",
        config.collections.len(),
        config.ranks,
        config.steps,
        seed
    );

    let (done_tx, done_rx) = crossbeam_channel::unbounded();
    let mut handles = Vec::with_capacity(config.ranks);
    for (group, link) in ThreadGroup::create(config.ranks).into_iter().zip(MeshLink::mesh(config.ranks)) {
        let rank = group.rank();
        let config = config.clone();
        let restart = restart.map(Path::to_path_buf);
        let stop = Arc::clone(&stop);
        let done = done_tx.clone();
        let handle = thread::Builder::new()
            .name(format!("rank-{rank}"))
            .spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    Rank::start(&config, seed, group, link, restart.as_deref())?.run(&stop)
                }))
                .unwrap_or(Err(RunError::Panicked));
                // Fails only once main stopped listening.
                let _ = done.send((rank, result));
            })
            .map_err(RunError::Spawn)?;
        handles.push(handle);
    }
    drop(done_tx);

    let mut summaries = Vec::with_capacity(config.ranks);
    for (rank, result) in done_rx.iter().take(config.ranks) {
        match result {
            Ok(summary) => summaries.push(summary),
            Err(e) => {
                return Err(RunError::Rank {
                    rank,
                    source: Box::new(e),
                })
            }
        }
    }
    for handle in handles {
        let _ = handle.join();
    }
    summaries.sort_by_key(|s| s.rank);
    Ok(summaries)
}

fn report(summaries: &[RankSummary]) {
    let Some(first) = summaries.first() else {
        return;
    };
    let mut totals: BTreeMap<&str, usize> = BTreeMap::new();
    for summary in summaries {
        for (name, count) in &summary.entities {
            *totals.entry(name.as_str()).or_default() += count;
        }
    }
    info!("Finished at step {} (t = {:.4})", first.step, first.time);
    for (name, count) in totals {
        info!("  {}: {} entities", name, count);
    }
}
