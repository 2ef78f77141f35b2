mod args;
mod logging;
mod workload;

use clap::Parser;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::Level;

use crate::args::{Args, SimConfig};
use crate::logging::LogWriter;
use crate::workload::run;

fn main() {
    let args = Args::parse();
    let config = SimConfig::from_args(args);
    let writer = LogWriter::new(config.log.clone()).unwrap_or_else(|err| {
        eprintln!("failed to open log file: {err}");
        std::process::exit(1);
    });

    tracing_subscriber::fmt()
        .with_writer(writer)
        .with_target(false)
        .with_max_level(Level::INFO)
        .init();

    let config_json = serde_json::to_string_pretty(&config).unwrap_or_else(|_| "{}".to_string());
    tracing::info!("config: {}", config_json);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|err| {
            eprintln!("failed to start tokio runtime: {err}");
            std::process::exit(1);
        });

    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let seed = config.seed;
    let code = match runtime.block_on(run(config, &mut rng)) {
        Ok(report) => {
            let report_json =
                serde_json::to_string_pretty(&report).unwrap_or_else(|_| "{}".to_string());
            tracing::info!("report: {}", report_json);
            if report.violations.is_empty() {
                0
            } else {
                tracing::error!(seed, violations = report.violations.len(), "invariants violated");
                1
            }
        }
        Err(err) => {
            tracing::error!(seed, error = %err, "simulation aborted");
            1
        }
    };
    std::process::exit(code);
}
