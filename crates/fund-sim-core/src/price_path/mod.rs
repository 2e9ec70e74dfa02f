//! Stochastic property price paths.
//!
//! Zone paths are driven by one correlated normal draw per period
//! (Cholesky of the zone correlation matrix), under one of three models:
//! - Geometric Brownian motion
//! - Mean-reverting (Ornstein-Uhlenbeck on the multiplier)
//! - Regime switching (market-wide bull/bear Markov chain over GBM)
//!
//! Suburb and property paths refine their parent path with independent
//! log-normal noise.

pub mod correlation;
pub mod model;
pub mod simulator;

use std::time::Instant;

use crate::config::FundConfig;
use crate::rng::{RngFactory, Stream};
use crate::types::{with_metadata_f64, ComputationOutput, TrialId};
use crate::FundSimResult;

pub use model::{PricePathModel, Regime};
pub use simulator::{PricePathConfig, PricePathSimulator, PricePaths, ZoneDynamics};

/// Validate `config` and generate the price paths `trial` would see.
///
/// Uses the same seeded streams as the pipeline, so the paths match the
/// ones behind that trial's cashflows.
pub fn simulate_price_paths(
    config: &FundConfig,
    trial: TrialId,
) -> FundSimResult<ComputationOutput<PricePaths>> {
    let start = Instant::now();
    config.validate()?;
    let simulator = PricePathSimulator::from_config(config)?;
    let rngs = RngFactory::new(config.monte_carlo.seed);
    let paths = simulator.generate(
        &mut rngs.stream(trial, Stream::PricePath),
        &mut rngs.stream(trial, Stream::SuburbNoise),
    )?;

    let mut warnings = Vec::new();
    for zone in &paths.zones {
        let low = zone.values.iter().copied().fold(f64::INFINITY, f64::min);
        if low < 0.5 {
            warnings.push(format!(
                "Zone '{}' falls to {:.1}% of its starting value",
                zone.zone,
                low * 100.0
            ));
        }
    }

    let elapsed = start.elapsed().as_micros() as u64;
    Ok(with_metadata_f64(
        "Correlated zone price paths with suburb refinement",
        &serde_json::json!({
            "model": config.price_path.model.name(),
            "trial": trial.to_string(),
            "seed": config.monte_carlo.seed,
            "horizon": config.fund.term_periods,
            "correlated": config.correlation.is_some(),
        }),
        warnings,
        elapsed,
        paths,
    ))
}
