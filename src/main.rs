use std::path::PathBuf;

use clap::Parser;
use damson::cost::{AnalyticalCostModel, CostModel};
use damson::database::{TuningDatabase, TuningRecord};
use damson::evolution::EvolutionarySearch;
use damson::task::{demo_matmul_task, TargetKind};
use damson::tuning::TuningOptions;
use log::{info, warn};

#[derive(clap::Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(long, short, default_value = "64")]
    m: i64,
    #[arg(long, short, default_value = "64")]
    n: i64,
    #[arg(long, short, default_value = "32")]
    k: i64,
    #[arg(long, default_value = "4")]
    rounds: usize,
    #[arg(long, default_value = "8")]
    samples: usize,
    #[arg(long, default_value = "1")]
    seed: i64,
    #[arg(long, default_value = "tuning.log")]
    database: PathBuf,
    #[arg(long)]
    gpu: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = Args::parse();
    let target = if args.gpu {
        TargetKind::Gpu
    } else {
        TargetKind::Cpu
    };
    let task = demo_matmul_task(args.m, args.n, args.k, target);
    info!("tuning {}", task.key);

    let database = TuningDatabase::new(Some(&args.database));
    match database.load() {
        Ok(n) => info!("loaded {} database records", n),
        Err(err) => warn!("database load failed, starting cold: {}", err),
    }

    let cost_model = AnalyticalCostModel;
    let mut search = EvolutionarySearch::new(task.clone(), &cost_model, &database, args.seed);
    let options = TuningOptions {
        num_samples_per_iteration: args.samples,
        ..Default::default()
    };

    let mut best_cost = f64::INFINITY;
    let start_time = std::time::Instant::now();
    for round in 0..args.rounds {
        let candidates = search.search_eps_greedy(&options)?;
        info!("round {}: {} candidates", round, candidates.len());
        for state in &candidates {
            // Stand-in for a real measurement pass.
            let measured = cost_model.predict(state.schedule.module())?;
            let record = TuningRecord::new(
                task.key.clone(),
                state.schedule.trace().clone(),
                state.predicted_cost,
            );
            let fingerprint = record.trace.byte_fingerprint();
            database.insert(record);
            database.update_measured(&task.key, fingerprint, measured);

            if measured < best_cost {
                best_cost = measured;
                info!("new best ({:.2}):", best_cost);
                for line in state.schedule.trace().to_string().lines() {
                    info!("  {}", line);
                }
            }
        }
    }
    info!(
        "tuning took {:?}, best predicted cost {:.2}",
        start_time.elapsed(),
        best_cost
    );

    database.flush()?;
    database.compact()?;
    Ok(())
}
