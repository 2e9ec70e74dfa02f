//! Risk metrics over the successful inner trials of one outer trial.
//!
//! The observed quantity is the annualised gross fund IRR of each trial.
//! VaR and CVaR are reported as positive losses of IRR:
//! `VaR = -q(1 - c)` and `CVaR = -E[IRR | IRR <= q(1 - c)]`.

use serde::{Deserialize, Serialize};

use crate::config::GuardrailConfig;
use crate::error::FundSimError;
use crate::metrics::MonteCarloTrialResult;
use crate::monte_carlo::statistics::{compute_statistics, percentile_sorted, sorted_finite, DistributionStats};
use crate::monte_carlo::stress::StressOutcome;
use crate::types::{money_to_f64, GuardrailViolation, Severity};
use crate::FundSimResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskMetrics {
    /// Successful trials the metrics were computed from.
    pub trials: usize,
    /// Trials with a defined fund IRR.
    pub irr_observations: usize,
    pub confidence_level: f64,
    pub irr: DistributionStats,
    pub var: f64,
    pub cvar: f64,
    pub sharpe_ratio: Option<f64>,
    pub sortino_ratio: Option<f64>,
    /// Share of trials returning less than the capital deployed.
    pub probability_of_loss: f64,
    pub mean_multiple: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub equity_irr: Option<DistributionStats>,
    pub mean_sponsor_promote: f64,
    #[serde(default)]
    pub stress: Vec<StressOutcome>,
}

impl RiskMetrics {
    pub fn mean_irr(&self) -> f64 {
        self.irr.mean
    }

    pub fn irr_volatility(&self) -> f64 {
        self.irr.std_dev
    }
}

/// Compute risk metrics from successful trial results.
pub fn compute_risk_metrics(
    results: &[&MonteCarloTrialResult],
    confidence_level: f64,
    risk_free_rate: f64,
    histogram_bins: usize,
) -> FundSimResult<RiskMetrics> {
    if confidence_level <= 0.0 || confidence_level >= 1.0 {
        return Err(FundSimError::InvalidInput {
            field: "confidence_level".into(),
            reason: "Confidence level must be between 0 and 1 (exclusive)".into(),
        });
    }

    let irrs: Vec<f64> = results.iter().filter_map(|r| r.fund_irr).collect();
    if irrs.is_empty() {
        return Err(FundSimError::InsufficientData(
            "No trial produced a defined fund IRR".into(),
        ));
    }
    let irr = compute_statistics(&irrs, histogram_bins)?;
    let sorted = sorted_finite(&irrs, "fund IRR")?;

    // Historical VaR at the lower tail
    let threshold = percentile_sorted(&sorted, (1.0 - confidence_level) * 100.0);
    let var = -threshold;

    // CVaR = average of IRRs at or below the VaR threshold
    let tail: Vec<f64> = sorted.iter().copied().filter(|r| *r <= threshold).collect();
    let cvar = if tail.is_empty() {
        var
    } else {
        -(tail.iter().sum::<f64>() / tail.len() as f64)
    };

    let excess = irr.mean - risk_free_rate;
    let sharpe_ratio = (irr.std_dev > f64::EPSILON).then(|| excess / irr.std_dev);
    let downside = (sorted
        .iter()
        .map(|r| (r - risk_free_rate).min(0.0).powi(2))
        .sum::<f64>()
        / sorted.len() as f64)
        .sqrt();
    let sortino_ratio = (downside > f64::EPSILON).then(|| excess / downside);

    let n = results.len() as f64;
    let losses = results.iter().filter(|r| r.fund_multiple < 1.0).count();
    let mean_multiple = results.iter().map(|r| r.fund_multiple).sum::<f64>() / n;
    let mean_sponsor_promote =
        results.iter().map(|r| money_to_f64(r.sponsor_promote)).sum::<f64>() / n;

    let equity_irrs: Vec<f64> = results.iter().filter_map(|r| r.equity_irr).collect();
    let equity_irr = if equity_irrs.is_empty() {
        None
    } else {
        Some(compute_statistics(&equity_irrs, histogram_bins)?)
    };

    Ok(RiskMetrics {
        trials: results.len(),
        irr_observations: irrs.len(),
        confidence_level,
        irr,
        var,
        cvar,
        sharpe_ratio,
        sortino_ratio,
        probability_of_loss: losses as f64 / n,
        mean_multiple,
        equity_irr,
        mean_sponsor_promote,
        stress: Vec::new(),
    })
}

/// Findings for configured thresholds the metrics breach.
pub fn risk_guardrails(metrics: &RiskMetrics, config: &GuardrailConfig) -> Vec<GuardrailViolation> {
    let mut violations = Vec::new();

    if let Some(min) = config.min_mean_irr {
        if metrics.mean_irr() < min {
            violations.push(GuardrailViolation {
                rule: "min_mean_irr".into(),
                severity: Severity::Warning,
                message: format!(
                    "Mean fund IRR {:.2}% is below the {:.2}% minimum",
                    metrics.mean_irr() * 100.0,
                    min * 100.0
                ),
                period: None,
                details: serde_json::json!({"mean_irr": metrics.mean_irr(), "threshold": min}),
            });
        }
    }
    if let Some(max) = config.max_var {
        if metrics.var > max {
            violations.push(GuardrailViolation {
                rule: "max_var".into(),
                severity: Severity::Critical,
                message: format!(
                    "IRR VaR at {:.0}% confidence is {:.2}%, above the {:.2}% limit",
                    metrics.confidence_level * 100.0,
                    metrics.var * 100.0,
                    max * 100.0
                ),
                period: None,
                details: serde_json::json!({"var": metrics.var, "threshold": max}),
            });
        }
    }
    if let Some(max) = config.max_probability_of_loss {
        if metrics.probability_of_loss > max {
            violations.push(GuardrailViolation {
                rule: "max_probability_of_loss".into(),
                severity: Severity::Critical,
                message: format!(
                    "Probability of loss {:.1}% exceeds the {:.1}% limit",
                    metrics.probability_of_loss * 100.0,
                    max * 100.0
                ),
                period: None,
                details: serde_json::json!({
                    "probability_of_loss": metrics.probability_of_loss,
                    "threshold": max,
                }),
            });
        }
    }

    violations
}
