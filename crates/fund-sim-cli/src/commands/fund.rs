use std::sync::Arc;

use clap::Args;
use serde_json::{json, Value};

use fund_sim_core::monte_carlo::outer_variant;
use fund_sim_core::notify::{LogNotifier, NoopNotifier, ProgressNotifier};
use fund_sim_core::pipeline::run_single_trial;
use fund_sim_core::price_path::simulate_price_paths;
use fund_sim_core::TrialId;

use super::load_config;

/// Arguments for configuration validation
#[derive(Args)]
pub struct ValidateArgs {
    /// Path to JSON or YAML fund configuration
    #[arg(long)]
    pub input: Option<String>,
}

/// Arguments for price path generation
#[derive(Args)]
pub struct PathsArgs {
    /// Path to JSON or YAML fund configuration
    #[arg(long)]
    pub input: Option<String>,
    /// Outer trial (0 = unperturbed configuration)
    #[arg(long, default_value_t = 0)]
    pub outer: u32,
    /// Inner trial
    #[arg(long, default_value_t = 0)]
    pub inner: u32,
    /// Override the master seed
    #[arg(long)]
    pub seed: Option<u64>,
    /// Emit one summary row per zone instead of full paths
    #[arg(long)]
    pub summary: bool,
}

/// Arguments for a single trial
#[derive(Args)]
pub struct TrialArgs {
    /// Path to JSON or YAML fund configuration
    #[arg(long)]
    pub input: Option<String>,
    /// Outer trial (0 = unperturbed configuration)
    #[arg(long, default_value_t = 0)]
    pub outer: u32,
    /// Inner trial
    #[arg(long, default_value_t = 0)]
    pub inner: u32,
    /// Override the master seed
    #[arg(long)]
    pub seed: Option<u64>,
    /// Include per-period waterfall rows
    #[arg(long)]
    pub periods: bool,
    /// Log every pipeline stage
    #[arg(long)]
    pub trace: bool,
}

pub fn run_validate(args: ValidateArgs) -> Result<Value, Box<dyn std::error::Error>> {
    let config = load_config(args.input.as_deref(), None)?;
    config.validate()?;
    Ok(json!({
        "result": {
            "valid": true,
            "fund": config.fund.name,
            "zones": config.zones.len(),
            "tranches": config.tranches.len(),
            "leverage": config.leverage(),
            "horizon": config.fund.term_periods,
            "model": config.price_path.model.name(),
            "strategy": config.reinvestment.strategy.name(),
            "total_trials": config.monte_carlo.total_trials(),
        }
    }))
}

pub fn run_paths(args: PathsArgs) -> Result<Value, Box<dyn std::error::Error>> {
    let config = load_config(args.input.as_deref(), args.seed)?;
    let (variant, _) = outer_variant(&config, args.outer)?;
    let output = simulate_price_paths(&variant, TrialId::new(args.outer, args.inner))?;
    if !args.summary {
        return Ok(serde_json::to_value(output)?);
    }

    let zones: Vec<Value> = output
        .result
        .zones
        .iter()
        .map(|zone| {
            let low = zone.values.iter().copied().fold(f64::INFINITY, f64::min);
            let high = zone.values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            json!({
                "zone": zone.zone,
                "final": zone.values.last().copied().unwrap_or(1.0),
                "min": low,
                "max": high,
                "suburbs": zone.suburbs.len(),
            })
        })
        .collect();
    Ok(json!({
        "result": zones,
        "warnings": output.warnings,
        "methodology": output.methodology,
    }))
}

pub fn run_trial(args: TrialArgs) -> Result<Value, Box<dyn std::error::Error>> {
    let config = load_config(args.input.as_deref(), args.seed)?;
    let (variant, _) = outer_variant(&config, args.outer)?;
    let notifier: Arc<dyn ProgressNotifier> = if args.trace {
        Arc::new(LogNotifier)
    } else {
        Arc::new(NoopNotifier)
    };
    let output = run_single_trial(
        variant,
        TrialId::new(args.outer, args.inner),
        args.periods,
        notifier,
    )?;
    Ok(serde_json::to_value(output)?)
}
