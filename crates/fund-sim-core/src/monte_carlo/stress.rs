//! Stress scenarios: shocked configurations re-run over the same trial
//! indices as the base case, so differences come from the shock alone.

use serde::{Deserialize, Serialize};

use crate::error::FundSimError;
use crate::monte_carlo::risk::RiskMetrics;
use crate::FundSimResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StressScenario {
    pub name: String,
    /// Added to every zone's annual drift.
    #[serde(default)]
    pub drift_shift: f64,
    /// Multiplies every zone's volatility.
    #[serde(default = "default_volatility_multiplier")]
    pub volatility_multiplier: f64,
    /// Added to the loan holding period bounds.
    #[serde(default)]
    pub exit_delay_periods: u32,
}

fn default_volatility_multiplier() -> f64 {
    1.0
}

impl StressScenario {
    pub fn validate(&self) -> FundSimResult<()> {
        if self.name.trim().is_empty() {
            return Err(FundSimError::InvalidInput {
                field: "monte_carlo.stress_scenarios.name".into(),
                reason: "Scenario name cannot be empty".into(),
            });
        }
        if !self.drift_shift.is_finite() {
            return Err(FundSimError::InvalidInput {
                field: format!("monte_carlo.stress_scenarios.{}.drift_shift", self.name),
                reason: "Must be finite".into(),
            });
        }
        if !self.volatility_multiplier.is_finite() || self.volatility_multiplier < 0.0 {
            return Err(FundSimError::InvalidInput {
                field: format!(
                    "monte_carlo.stress_scenarios.{}.volatility_multiplier",
                    self.name
                ),
                reason: "Must be finite and >= 0".into(),
            });
        }
        Ok(())
    }
}

/// One scenario's result for one outer trial, against the base case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StressOutcome {
    pub scenario: String,
    pub succeeded: usize,
    pub failed: usize,
    pub mean_irr: Option<f64>,
    pub var: Option<f64>,
    /// Stressed minus base.
    pub mean_irr_delta: Option<f64>,
    pub var_delta: Option<f64>,
    pub probability_of_loss: Option<f64>,
}

impl StressOutcome {
    /// Compare stressed metrics with the base case. Deltas are only
    /// reported when both sides have metrics.
    pub fn compare(
        scenario: &str,
        succeeded: usize,
        failed: usize,
        stressed: Option<&RiskMetrics>,
        base: Option<&RiskMetrics>,
    ) -> Self {
        let mean_irr = stressed.map(RiskMetrics::mean_irr);
        let var = stressed.map(|m| m.var);
        Self {
            scenario: scenario.to_string(),
            succeeded,
            failed,
            mean_irr,
            var,
            mean_irr_delta: mean_irr.zip(base.map(RiskMetrics::mean_irr)).map(|(s, b)| s - b),
            var_delta: var.zip(base.map(|m| m.var)).map(|(s, b)| s - b),
            probability_of_loss: stressed.map(|m| m.probability_of_loss),
        }
    }
}
