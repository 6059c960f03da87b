//! hostcall-sim - exercise a hostcall dispatcher with simulated device threads
//!
//! Commands:
//! - `hostcall-sim run` - Run a device grid and verify every reply
//! - `hostcall-sim services` - Show the service id table

mod config;
mod sim;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use colored::Colorize;
use kaal_hostcall::{ServiceId, SERVICE_ID_DEFAULT, SERVICE_ID_FUNCTION_CALL, SERVICE_ID_PRINTF};

use crate::config::SimConfig;

#[derive(Parser)]
#[command(name = "hostcall-sim")]
#[command(author = "KaaL Team")]
#[command(version)]
#[command(about = "KaaL hostcall simulator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run simulated device threads against a dispatcher
    Run {
        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Device threads
        #[arg(short, long)]
        threads: Option<usize>,

        /// Calls per device thread
        #[arg(long)]
        calls: Option<usize>,

        /// Slot table capacity
        #[arg(long)]
        capacity: Option<usize>,

        /// Dispatcher worker threads (0 serves on the poller)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Send printf output to stdout
        #[arg(long)]
        print: bool,
    },

    /// Show the service id table
    Services,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            threads,
            calls,
            capacity,
            workers,
            print,
        } => {
            let mut sim_config = match config {
                Some(path) => SimConfig::load(&path)?,
                None => SimConfig::default(),
            };
            if let Some(threads) = threads {
                sim_config.threads = threads;
            }
            if let Some(calls) = calls {
                sim_config.calls = calls;
            }
            if let Some(capacity) = capacity {
                sim_config.hostcall.capacity = capacity;
            }
            if let Some(workers) = workers {
                sim_config.hostcall.workers = workers;
            }
            sim_config.printf_to_stdout |= print;
            run(&sim_config)?;
        }

        Commands::Services => {
            show_services();
        }
    }

    Ok(())
}

fn run(config: &SimConfig) -> anyhow::Result<()> {
    println!(
        "{} Simulating {} device threads x {} calls ({} slots, {} workers, {:?})",
        "🚀".green(),
        config.threads,
        config.calls,
        config.hostcall.capacity,
        config.hostcall.workers,
        config.hostcall.backpressure
    );

    let report = sim::run(config)?;
    report.print();

    if !report.passed() {
        anyhow::bail!(
            "{} mismatched and {} failed calls",
            report.tally.mismatched,
            report.tally.failed
        );
    }
    Ok(())
}

fn show_services() {
    println!("{}", "Hostcall services".bold());
    for raw in [SERVICE_ID_DEFAULT, SERVICE_ID_FUNCTION_CALL, SERVICE_ID_PRINTF] {
        let id = ServiceId::from(raw);
        let about = match id {
            ServiceId::Default => "no-op, replies [0, 0]",
            ServiceId::FunctionCall => "args[0] = function id, args[1..=7] = arguments",
            ServiceId::Printf => "buffered formatted output, args[0] = control word",
            ServiceId::Other(_) => "",
        };
        println!("  {:>3}  {:<14} {}", raw, id.name().cyan(), about);
    }
    println!("  {:>3}  {:<14} {}", "3+", "unregistered".yellow(), "unknown-service sentinel unless registered");
    println!();
    println!("{}", "Simulator host functions".bold());
    println!("  {:#018x}  mix  [a0 * a1 + a2, a0 ^ a1]", sim::FN_MIX);
    println!("  {:#018x}  echo [a0, a1]", sim::FN_ECHO);
}
