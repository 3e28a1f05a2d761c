//! Racetrack command-line driver
//!
//! Runs the concurrent worker harness against a fresh event loop, either with
//! random choices (optionally seeded) or by enumerating every plan for a small
//! thread × round grid. Exits non-zero on the first failed run.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use racetrack_engine::harness::{Harness, HarnessConfig, RandomChoices, RunSummary};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "racetrack")]
#[command(about = "Race stop, clock and subscribe calls against a shared event loop", long_about = None)]
#[command(version)]
struct Cli {
    /// Log level when RUST_LOG is unset (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run randomly chosen plans
    Run {
        /// Worker threads
        #[arg(short, long)]
        threads: Option<usize>,
        /// Rounds per worker
        #[arg(short, long)]
        rounds: Option<usize>,
        /// Seed for the choice generator
        #[arg(short, long)]
        seed: Option<u64>,
        /// Number of independent runs
        #[arg(short, long)]
        iterations: Option<usize>,
        /// Do not force readiness after subscribing
        #[arg(long)]
        no_poke: bool,
        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Run every plan for a thread × round grid
    Exhaustive {
        /// Worker threads
        #[arg(short, long, default_value_t = 2)]
        threads: usize,
        /// Rounds per worker
        #[arg(short, long, default_value_t = 2)]
        rounds: usize,
    },
}

fn init_tracing(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("invalid log level '{level}'"))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;

    match cli.command {
        Commands::Run {
            threads,
            rounds,
            seed,
            iterations,
            no_poke,
            config,
        } => {
            let mut settings = match config {
                Some(path) => HarnessConfig::load(&path)
                    .with_context(|| format!("failed to load {}", path.display()))?,
                None => HarnessConfig::default(),
            };
            if let Some(threads) = threads {
                settings.threads = threads;
            }
            if let Some(rounds) = rounds {
                settings.rounds = rounds;
            }
            if let Some(iterations) = iterations {
                settings.iterations = iterations;
            }
            if seed.is_some() {
                settings.seed = seed;
            }
            if no_poke {
                settings.poke = false;
            }

            let mut choices = match settings.seed {
                Some(seed) => RandomChoices::from_seed(seed),
                None => RandomChoices::from_entropy(),
            };
            info!(
                threads = settings.threads,
                rounds = settings.rounds,
                iterations = settings.iterations,
                seed = ?settings.seed,
                "starting random runs"
            );
            let summary = Harness::new(settings)
                .run_iterations(&mut choices)
                .context("harness run failed")?;
            print_summary(&summary);
        }

        Commands::Exhaustive { threads, rounds } => {
            let settings = HarnessConfig {
                threads,
                rounds,
                ..HarnessConfig::default()
            };
            let summary = Harness::new(settings)
                .run_exhaustive()
                .context("exhaustive run failed")?;
            print_summary(&summary);
        }
    }

    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!("runs:               {}", summary.runs);
    println!("stop calls:         {}", summary.stops);
    println!("clock reads:        {}", summary.clock_reads);
    println!("subscriptions:      {}", summary.subscribes);
    println!(
        "cleanups:           {} scheduled, {} refused",
        summary.cleanups_scheduled, summary.cleanups_refused
    );
    println!("tasks canceled:     {}", summary.tasks_canceled);
    println!(
        "readiness events:   {} observed, {} dropped",
        summary.events_observed, summary.events_dropped
    );
    println!("handles reclaimed:  {}", summary.handles_reclaimed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_flags_parse() {
        let cli = Cli::try_parse_from([
            "racetrack", "--log-level", "debug", "run", "-t", "4", "--seed", "9", "--no-poke",
        ])
        .unwrap();
        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Commands::Run {
                threads,
                seed,
                no_poke,
                rounds,
                ..
            } => {
                assert_eq!(threads, Some(4));
                assert_eq!(seed, Some(9));
                assert_eq!(rounds, None);
                assert!(no_poke);
            }
            Commands::Exhaustive { .. } => panic!("expected run"),
        }
    }

    #[test]
    fn test_exhaustive_defaults() {
        let cli = Cli::try_parse_from(["racetrack", "exhaustive"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Exhaustive {
                threads: 2,
                rounds: 2
            }
        ));
    }
}
