//! Nested Monte Carlo: outer trials vary the configuration, inner trials
//! repeat the pipeline with fresh random draws.

pub mod frontier;
pub mod orchestrator;
pub mod risk;
pub mod statistics;
pub mod stress;

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::FundSimError;
use crate::FundSimResult;

pub use frontier::{efficient_frontier, FrontierPoint};
pub use orchestrator::{
    outer_variant, run_monte_carlo, synthetic_loan_book, LoanBookFactory, OuterTrialResult,
    SweepResult, SweepStatus, TrialRecord, TrialStatus,
};
pub use risk::{compute_risk_metrics, risk_guardrails, RiskMetrics};
pub use stress::{StressOutcome, StressScenario};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonteCarloConfig {
    /// Outer trials. Outer trial 0 runs the unperturbed configuration.
    #[serde(default = "default_num_simulations")]
    pub num_simulations: u32,
    /// Inner repetitions per outer trial.
    #[serde(default = "default_num_inner_simulations")]
    pub num_inner_simulations: u32,
    /// Half-width of the uniform multiplier applied to perturbed parameters.
    #[serde(default = "default_variation_factor")]
    pub variation_factor: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_true")]
    pub parallel: bool,
    /// Worker threads; the global rayon pool when absent.
    #[serde(default)]
    pub max_threads: Option<usize>,
    /// Wall-clock budget per trial.
    #[serde(default)]
    pub trial_timeout_ms: Option<u64>,
    /// Abort the sweep on the first failed trial.
    #[serde(default)]
    pub fail_fast: bool,
    #[serde(default = "default_confidence_level")]
    pub confidence_level: f64,
    /// Annual rate for Sharpe and Sortino ratios.
    #[serde(default)]
    pub risk_free_rate: f64,
    #[serde(default)]
    pub stress_scenarios: Vec<StressScenario>,
    /// Leverage cap for efficient frontier points.
    #[serde(default)]
    pub max_leverage: Option<f64>,
    #[serde(default = "default_histogram_bins")]
    pub histogram_bins: usize,
    /// Also vary debt tranche sizes across outer trials.
    #[serde(default)]
    pub perturb_leverage: bool,
    /// Forward every trial's stage events to the notifier.
    #[serde(default)]
    pub report_trial_stages: bool,
}

fn default_num_simulations() -> u32 {
    1
}

fn default_num_inner_simulations() -> u32 {
    100
}

fn default_variation_factor() -> f64 {
    0.1
}

fn default_seed() -> u64 {
    42
}

fn default_true() -> bool {
    true
}

fn default_confidence_level() -> f64 {
    0.95
}

fn default_histogram_bins() -> usize {
    20
}

impl Default for MonteCarloConfig {
    fn default() -> Self {
        Self {
            num_simulations: default_num_simulations(),
            num_inner_simulations: default_num_inner_simulations(),
            variation_factor: default_variation_factor(),
            seed: default_seed(),
            parallel: true,
            max_threads: None,
            trial_timeout_ms: None,
            fail_fast: false,
            confidence_level: default_confidence_level(),
            risk_free_rate: 0.0,
            stress_scenarios: Vec::new(),
            max_leverage: None,
            histogram_bins: default_histogram_bins(),
            perturb_leverage: false,
            report_trial_stages: false,
        }
    }
}

impl MonteCarloConfig {
    pub fn validate(&self) -> FundSimResult<()> {
        if self.num_simulations == 0 {
            return Err(invalid("monte_carlo.num_simulations", "Must be at least 1"));
        }
        if self.num_inner_simulations == 0 {
            return Err(invalid("monte_carlo.num_inner_simulations", "Must be at least 1"));
        }
        if !(0.0..1.0).contains(&self.variation_factor) {
            return Err(invalid("monte_carlo.variation_factor", "Must be in [0, 1)"));
        }
        if self.max_threads == Some(0) {
            return Err(invalid("monte_carlo.max_threads", "Must be at least 1"));
        }
        if self.trial_timeout_ms == Some(0) {
            return Err(invalid("monte_carlo.trial_timeout_ms", "Must be at least 1"));
        }
        if !(self.confidence_level > 0.0 && self.confidence_level < 1.0) {
            return Err(invalid(
                "monte_carlo.confidence_level",
                "Confidence level must be between 0 and 1 (exclusive)",
            ));
        }
        if !self.risk_free_rate.is_finite() {
            return Err(invalid("monte_carlo.risk_free_rate", "Must be finite"));
        }
        if let Some(max) = self.max_leverage {
            if !max.is_finite() || max < 0.0 {
                return Err(invalid("monte_carlo.max_leverage", "Must be finite and >= 0"));
            }
        }
        if self.histogram_bins == 0 {
            return Err(invalid("monte_carlo.histogram_bins", "Must be at least 1"));
        }
        let mut names = HashSet::new();
        for scenario in &self.stress_scenarios {
            scenario.validate()?;
            if !names.insert(scenario.name.as_str()) {
                return Err(invalid(
                    "monte_carlo.stress_scenarios.name",
                    &format!("Duplicate scenario '{}'", scenario.name),
                ));
            }
        }
        Ok(())
    }

    /// Inner trials per configuration times (base + stress scenarios).
    pub fn total_trials(&self) -> usize {
        self.num_simulations as usize
            * self.num_inner_simulations as usize
            * (1 + self.stress_scenarios.len())
    }
}

fn invalid(field: &str, reason: &str) -> FundSimError {
    FundSimError::InvalidInput {
        field: field.into(),
        reason: reason.into(),
    }
}
