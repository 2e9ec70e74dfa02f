use clap::Args;
use serde_json::Value;

use fund_sim_core::waterfall::{calculate_waterfall, WaterfallInput};

use super::load;

/// Arguments for a standalone waterfall run
#[derive(Args)]
pub struct WaterfallArgs {
    /// Path to JSON or YAML waterfall input (tranches, ledger, tests)
    #[arg(long)]
    pub input: Option<String>,
    /// Drop per-period rows from the output
    #[arg(long)]
    pub totals_only: bool,
}

pub fn run_waterfall(args: WaterfallArgs) -> Result<Value, Box<dyn std::error::Error>> {
    let waterfall_input: WaterfallInput = load(args.input.as_deref(), "the waterfall")?;
    let mut output = calculate_waterfall(&waterfall_input)?;
    if args.totals_only {
        output.result.periods.clear();
    }
    Ok(serde_json::to_value(output)?)
}
