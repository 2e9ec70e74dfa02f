mod commands;
mod input;
mod output;

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::process;

use commands::fund::{PathsArgs, TrialArgs, ValidateArgs};
use commands::sweep::SweepArgs;
use commands::waterfall::WaterfallArgs;

/// Structured real-estate fund simulation
#[derive(Parser)]
#[command(
    name = "fundsim",
    version,
    about = "Structured real-estate fund simulation and risk engine",
    long_about = "A CLI for simulating structured real-estate funds: correlated property \
                  price paths, priority waterfalls with coverage tests, reinvestment and \
                  nested Monte Carlo risk metrics. Configurations are JSON or YAML."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format
    #[arg(long, default_value = "json", global = true)]
    output: OutputFormat,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a fund configuration without running it
    Validate(ValidateArgs),
    /// Generate the zone price paths of one trial
    Paths(PathsArgs),
    /// Run a single trial of the fund pipeline
    Trial(TrialArgs),
    /// Run the nested Monte Carlo sweep
    Sweep(SweepArgs),
    /// Run the priority waterfall over a supplied cashflow ledger
    Waterfall(WaterfallArgs),
    /// Print version information
    Version,
}

#[derive(Debug, Clone, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Csv,
    Minimal,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result: Result<serde_json::Value, Box<dyn std::error::Error>> = match cli.command {
        Commands::Validate(args) => commands::fund::run_validate(args),
        Commands::Paths(args) => commands::fund::run_paths(args),
        Commands::Trial(args) => commands::fund::run_trial(args),
        Commands::Sweep(args) => commands::sweep::run_sweep(args),
        Commands::Waterfall(args) => commands::waterfall::run_waterfall(args),
        Commands::Version => {
            println!("fundsim {}", env!("CARGO_PKG_VERSION"));
            return;
        }
    };

    match result {
        Ok(value) => {
            output::format_output(&cli.output, &value);
            process::exit(0);
        }
        Err(e) => {
            eprintln!("{}: {}", "error".red().bold(), e);
            process::exit(1);
        }
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_millis()
        .init();
}
