use std::io::Write;
use std::sync::Arc;

use clap::Args;
use colored::Colorize;
use serde_json::{json, Value};

use fund_sim_core::monte_carlo::{run_monte_carlo, synthetic_loan_book, OuterTrialResult};
use fund_sim_core::notify::{CancellationToken, NoopNotifier, ProgressNotifier, SimulationEvent};
use fund_sim_core::Severity;

use super::load_config;

/// Arguments for the nested Monte Carlo sweep
#[derive(Args)]
pub struct SweepArgs {
    /// Path to JSON or YAML fund configuration
    #[arg(long)]
    pub input: Option<String>,
    /// Override the master seed
    #[arg(long)]
    pub seed: Option<u64>,
    /// Override the number of outer trials
    #[arg(long)]
    pub outer: Option<u32>,
    /// Override the number of inner trials per outer trial
    #[arg(long)]
    pub inner: Option<u32>,
    /// Worker threads (0 runs sequentially)
    #[arg(long)]
    pub threads: Option<usize>,
    /// Abort on the first failed trial
    #[arg(long)]
    pub fail_fast: bool,
    /// Keep every trial record instead of one summary row per outer trial
    #[arg(long)]
    pub full: bool,
    /// Report progress and guardrail findings on stderr
    #[arg(long)]
    pub progress: bool,
}

/// Progress bar and guardrail findings on stderr.
struct StderrProgress;

impl ProgressNotifier for StderrProgress {
    fn notify(&self, event: SimulationEvent) {
        let mut err = std::io::stderr().lock();
        match event {
            SimulationEvent::Progress { percent, message, .. } => {
                let _ = write!(err, "\r{:>5.1}% {message}", percent * 100.0);
                let _ = err.flush();
            }
            SimulationEvent::GuardrailViolation { violation } => {
                let label = match violation.severity {
                    Severity::Critical => "critical".red().bold(),
                    _ => "warning".yellow().bold(),
                };
                let _ = writeln!(err, "\n{label}: {}", violation.message);
            }
            SimulationEvent::Result { .. } => {
                let _ = writeln!(err);
            }
            _ => {}
        }
    }
}

pub fn run_sweep(args: SweepArgs) -> Result<Value, Box<dyn std::error::Error>> {
    let mut config = load_config(args.input.as_deref(), args.seed)?;
    let mc = &mut config.monte_carlo;
    if let Some(outer) = args.outer {
        mc.num_simulations = outer;
    }
    if let Some(inner) = args.inner {
        mc.num_inner_simulations = inner;
    }
    match args.threads {
        Some(0) => mc.parallel = false,
        Some(n) => {
            mc.parallel = true;
            mc.max_threads = Some(n);
        }
        None => {}
    }
    mc.fail_fast |= args.fail_fast;

    let show_progress = args.progress && atty::is(atty::Stream::Stderr);
    let notifier: Arc<dyn ProgressNotifier> = if show_progress {
        Arc::new(StderrProgress)
    } else {
        Arc::new(NoopNotifier)
    };
    let output = run_monte_carlo(&config, &synthetic_loan_book, notifier, &CancellationToken::new())?;
    if args.full {
        return Ok(serde_json::to_value(output)?);
    }

    let sweep = &output.result;
    let outer_trials: Vec<Value> = sweep.outer_trials.iter().map(summary_row).collect();
    Ok(json!({
        "result": {
            "status": sweep.status,
            "seed": sweep.seed,
            "succeeded": sweep.succeeded,
            "failed": sweep.failed,
            "cancelled": sweep.cancelled,
            "execution_time_ms": sweep.execution_time_ms,
            "outer_trials": outer_trials,
            "frontier": sweep.frontier,
        },
        "warnings": output.warnings,
        "methodology": output.methodology,
        "assumptions": output.assumptions,
    }))
}

/// One flat row per outer trial for table and CSV output.
fn summary_row(outer: &OuterTrialResult) -> Value {
    let risk = outer.risk.as_ref();
    json!({
        "outer": outer.outer,
        "leverage": outer.leverage,
        "succeeded": outer.succeeded,
        "failed": outer.failed,
        "mean_irr": risk.map(|r| r.mean_irr()),
        "irr_volatility": risk.map(|r| r.irr_volatility()),
        "var": risk.map(|r| r.var),
        "cvar": risk.map(|r| r.cvar),
        "probability_of_loss": risk.map(|r| r.probability_of_loss),
        "mean_multiple": risk.map(|r| r.mean_multiple),
        "guardrails": outer.guardrails.len(),
    })
}
