pub mod fund;
pub mod sweep;
pub mod waterfall;

use fund_sim_core::FundConfig;
use log::debug;
use serde::de::DeserializeOwned;

use crate::input;

/// Read `--input` (JSON or YAML) or a document piped on stdin.
pub fn load<T: DeserializeOwned>(path: Option<&str>, what: &str) -> Result<T, Box<dyn std::error::Error>> {
    if let Some(path) = path {
        input::file::read_document(path)
    } else if let Some(data) = input::stdin::read_stdin()? {
        Ok(serde_json::from_value(data)?)
    } else {
        Err(format!("--input <file.json|file.yaml> or stdin required for {what}").into())
    }
}

/// Load a fund configuration and apply the Monte Carlo overrides common
/// to several commands.
pub fn load_config(path: Option<&str>, seed: Option<u64>) -> Result<FundConfig, Box<dyn std::error::Error>> {
    let mut config: FundConfig = load(path, "a fund configuration")?;
    if let Some(seed) = seed {
        config.monte_carlo.seed = seed;
    }
    debug!(
        "loaded fund '{}': {} zones, {} tranches, seed {}",
        config.fund.name,
        config.zones.len(),
        config.tranches.len(),
        config.monte_carlo.seed
    );
    Ok(config)
}
