use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about = "Webhook-burst simulator for sql-coordinator")]
pub(crate) struct Args {
    /// Database file; defaults to a seed-named file in the temp dir.
    #[arg(long)]
    pub(crate) db: Option<PathBuf>,
    #[arg(long, value_parser = humantime::parse_duration)]
    pub(crate) duration: Option<Duration>,
    #[arg(long, default_value_t = 2_000)]
    pub(crate) events: u64,
    #[arg(long)]
    pub(crate) seed: Option<u64>,
    #[arg(long, default_value_t = 8)]
    pub(crate) tasks: usize,
    #[arg(long, default_value_t = 5)]
    pub(crate) busy_timeout_ms: u64,
    #[arg(long, default_value_t = 5)]
    pub(crate) max_attempts: u32,
    #[arg(long, default_value_t = 20)]
    pub(crate) base_delay_ms: u64,
    #[arg(long, default_value_t = 0.1)]
    pub(crate) label_failure_rate: f64,
    #[arg(long, default_value_t = 0.05)]
    pub(crate) abort_rate: f64,
    #[arg(long, default_value_t = 0.002)]
    pub(crate) invalidate_rate: f64,
    /// Run a second, independent supervisor against the same file.
    #[arg(long)]
    pub(crate) rival: bool,
    #[arg(long, default_value_t = 3)]
    pub(crate) rival_hold_ms: u64,
    #[arg(long)]
    pub(crate) log: Option<PathBuf>,
    #[arg(long)]
    pub(crate) quick: bool,
    #[arg(long)]
    pub(crate) stress: bool,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct SimConfig {
    pub(crate) db: PathBuf,
    pub(crate) duration_ms: Option<u64>,
    pub(crate) events: u64,
    pub(crate) seed: u64,
    pub(crate) tasks: usize,
    pub(crate) busy_timeout_ms: u64,
    pub(crate) max_attempts: u32,
    pub(crate) base_delay_ms: u64,
    pub(crate) label_failure_rate: f64,
    pub(crate) abort_rate: f64,
    pub(crate) invalidate_rate: f64,
    pub(crate) rival: bool,
    pub(crate) rival_hold_ms: u64,
    pub(crate) log: Option<PathBuf>,
    pub(crate) preset: Option<String>,
}

impl SimConfig {
    pub(crate) fn from_args(args: Args) -> Self {
        let seed = args.seed.unwrap_or_else(random_seed);
        let mut config = SimConfig {
            db: args
                .db
                .unwrap_or_else(|| std::env::temp_dir().join(format!("sql-coordinator-sim-{seed}.db"))),
            duration_ms: args
                .duration
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            events: args.events,
            seed,
            tasks: args.tasks.max(1),
            busy_timeout_ms: args.busy_timeout_ms,
            max_attempts: args.max_attempts.max(1),
            base_delay_ms: args.base_delay_ms,
            label_failure_rate: clamp_rate(args.label_failure_rate),
            abort_rate: clamp_rate(args.abort_rate),
            invalidate_rate: clamp_rate(args.invalidate_rate),
            rival: args.rival,
            rival_hold_ms: args.rival_hold_ms,
            log: args.log,
            preset: None,
        };

        if args.quick {
            config.apply_quick();
        }
        if args.stress {
            config.apply_stress();
        }

        config
    }

    fn apply_quick(&mut self) {
        self.preset = Some("quick".to_string());
        self.events = 500;
        self.duration_ms = None;
        self.tasks = 4;
        self.label_failure_rate = 0.1;
        self.abort_rate = 0.05;
        self.invalidate_rate = 0.002;
        self.rival = false;
    }

    fn apply_stress(&mut self) {
        self.preset = Some("stress".to_string());
        self.events = 50_000;
        self.duration_ms = None;
        self.tasks = 32;
        self.busy_timeout_ms = 0;
        self.max_attempts = 8;
        self.label_failure_rate = 0.2;
        self.abort_rate = 0.1;
        self.invalidate_rate = 0.005;
        self.rival = true;
        self.rival_hold_ms = 5;
    }
}

fn clamp_rate(value: f64) -> f64 {
    if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) }
}

fn random_seed() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    now.as_secs() ^ u64::from(now.subsec_nanos())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_rate_limits_bounds() {
        assert_eq!(clamp_rate(-1.0), 0.0);
        assert_eq!(clamp_rate(2.0), 1.0);
        assert_eq!(clamp_rate(0.5), 0.5);
        assert_eq!(clamp_rate(f64::NAN), 0.0);
    }

    #[test]
    fn stress_preset_turns_on_the_rival() {
        let args = Args::parse_from(["simulator", "--stress", "--seed", "7"]);
        let config = SimConfig::from_args(args);
        assert!(config.rival);
        assert_eq!(config.seed, 7);
        assert_eq!(config.preset.as_deref(), Some("stress"));
        assert!(config.db.ends_with("sql-coordinator-sim-7.db"));
    }
}
