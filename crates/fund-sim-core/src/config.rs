//! Fund configuration: one strongly-typed document, validated once before
//! any trial runs, then shared read-only by every trial.

use std::collections::HashSet;

use chrono::NaiveDate;
use rand::rngs::StdRng;
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::FundSimError;
use crate::loans::LoanBookConfig;
use crate::monte_carlo::stress::StressScenario;
use crate::monte_carlo::MonteCarloConfig;
use crate::price_path::correlation::{cholesky_lower_psd, validate_correlation_matrix};
use crate::price_path::PricePathConfig;
use crate::reinvestment::ReinvestmentConfig;
use crate::waterfall::coverage::CoverageTestConfig;
use crate::waterfall::reserve::ReserveConfig;
use crate::waterfall::tranche::{rank_tranches, TrancheConfig};
use crate::types::{f64_to_money, money_to_f64, round_money, Money};
use crate::FundSimResult;

/// Zone target allocations must sum to one within this tolerance.
pub const ALLOCATION_TOLERANCE: f64 = 1e-6;

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundTerms {
    pub name: String,
    /// Committed capital, fully deployed at inception.
    pub size: Money,
    /// Fund horizon in periods.
    pub term_periods: u32,
    #[serde(default = "default_periods_per_year")]
    pub periods_per_year: u32,
    pub start_date: NaiveDate,
}

fn default_periods_per_year() -> u32 {
    12
}

impl FundTerms {
    /// Period length in years.
    pub fn dt(&self) -> f64 {
        1.0 / f64::from(self.periods_per_year.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneConfig {
    pub name: String,
    /// Share of fund capital targeted at this zone.
    pub target_allocation: f64,
    /// Annualised drift of the zone price index.
    pub drift: f64,
    /// Annualised volatility of the zone price index.
    pub volatility: f64,
    #[serde(default)]
    pub suburbs: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WaterfallPolicy {
    /// Abort the trial when a coverage test becomes violated.
    #[serde(default)]
    pub fail_fast_on_violation: bool,
}

/// Thresholds checked against each outer trial's risk metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GuardrailConfig {
    #[serde(default)]
    pub min_mean_irr: Option<f64>,
    #[serde(default)]
    pub max_var: Option<f64>,
    #[serde(default)]
    pub max_probability_of_loss: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundConfig {
    pub fund: FundTerms,
    pub zones: Vec<ZoneConfig>,
    /// Zone correlation matrix in `zones` order. Identity when absent.
    #[serde(default)]
    pub correlation: Option<Vec<Vec<f64>>>,
    #[serde(default)]
    pub price_path: PricePathConfig,
    pub loans: LoanBookConfig,
    pub tranches: Vec<TrancheConfig>,
    #[serde(default)]
    pub reserve: Option<ReserveConfig>,
    #[serde(default)]
    pub coverage_tests: Vec<CoverageTestConfig>,
    #[serde(default)]
    pub waterfall: WaterfallPolicy,
    #[serde(default)]
    pub reinvestment: ReinvestmentConfig,
    #[serde(default)]
    pub monte_carlo: MonteCarloConfig,
    #[serde(default)]
    pub guardrails: GuardrailConfig,
}

/// Multipliers applied to a base configuration for one outer trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variation {
    pub drift_multipliers: Vec<f64>,
    pub volatility_multipliers: Vec<f64>,
    pub interest_rate_multiplier: f64,
    pub appreciation_share_multiplier: f64,
    pub leverage_multiplier: f64,
}

impl Variation {
    pub fn identity(zones: usize) -> Self {
        Self {
            drift_multipliers: vec![1.0; zones],
            volatility_multipliers: vec![1.0; zones],
            interest_rate_multiplier: 1.0,
            appreciation_share_multiplier: 1.0,
            leverage_multiplier: 1.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> FundSimError {
    FundSimError::InvalidInput {
        field: field.into(),
        reason: reason.into(),
    }
}

impl FundConfig {
    pub fn from_json(json: &str) -> FundSimResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Every precondition check. Nothing downstream re-validates.
    pub fn validate(&self) -> FundSimResult<()> {
        self.validate_fund()?;
        self.validate_zones()?;

        if let Some(matrix) = &self.correlation {
            validate_correlation_matrix(matrix, self.zones.len())?;
            cholesky_lower_psd(matrix)?;
        }

        self.price_path.model.validate()?;
        if !(self.price_path.suburb_variation >= 0.0 && self.price_path.suburb_variation.is_finite())
        {
            return Err(invalid("price_path.suburb_variation", "Must be finite and >= 0"));
        }
        if !(self.price_path.property_variation >= 0.0
            && self.price_path.property_variation.is_finite())
        {
            return Err(invalid("price_path.property_variation", "Must be finite and >= 0"));
        }

        self.loans.validate()?;

        let ranked = rank_tranches(&self.tranches, self.fund.size)?;
        let zone_names: Vec<&str> = self.zones.iter().map(|z| z.name.as_str()).collect();
        for tranche in &ranked {
            tranche.constraints.validate(&tranche.name, &zone_names)?;
        }

        if let Some(reserve) = &self.reserve {
            reserve.validate()?;
        }

        let mut test_names = HashSet::new();
        for test in &self.coverage_tests {
            test.validate(&ranked)?;
            if !test_names.insert(test.name.as_str()) {
                return Err(invalid(
                    "coverage_tests.name",
                    format!("Duplicate coverage test '{}'", test.name),
                ));
            }
        }

        self.reinvestment
            .validate(&zone_names, self.fund.term_periods)?;
        self.monte_carlo.validate()?;

        if let Some(p) = self.guardrails.max_probability_of_loss {
            if !(0.0..=1.0).contains(&p) {
                return Err(invalid("guardrails.max_probability_of_loss", "Must be in [0, 1]"));
            }
        }

        Ok(())
    }

    fn validate_fund(&self) -> FundSimResult<()> {
        if self.fund.size <= Decimal::ZERO {
            return Err(invalid("fund.size", "Fund size must be positive"));
        }
        if self.fund.term_periods == 0 {
            return Err(invalid("fund.term_periods", "Must be at least 1"));
        }
        if self.fund.periods_per_year == 0 || 12 % self.fund.periods_per_year != 0 {
            return Err(invalid(
                "fund.periods_per_year",
                "Must divide 12 (1, 2, 3, 4, 6 or 12)",
            ));
        }
        Ok(())
    }

    fn validate_zones(&self) -> FundSimResult<()> {
        if self.zones.is_empty() {
            return Err(invalid("zones", "At least one zone is required"));
        }
        let mut names = HashSet::new();
        for zone in &self.zones {
            if !names.insert(zone.name.as_str()) {
                return Err(invalid("zones.name", format!("Duplicate zone '{}'", zone.name)));
            }
            if !(0.0..=1.0).contains(&zone.target_allocation) {
                return Err(invalid(
                    format!("zones.{}.target_allocation", zone.name),
                    "Must be in [0, 1]",
                ));
            }
            if !zone.drift.is_finite() {
                return Err(invalid(format!("zones.{}.drift", zone.name), "Must be finite"));
            }
            if !zone.volatility.is_finite() || zone.volatility < 0.0 {
                return Err(invalid(
                    format!("zones.{}.volatility", zone.name),
                    "Must be finite and >= 0",
                ));
            }
            let mut suburbs = HashSet::new();
            for suburb in &zone.suburbs {
                if !suburbs.insert(suburb.as_str()) {
                    return Err(invalid(
                        format!("zones.{}.suburbs", zone.name),
                        format!("Duplicate suburb '{suburb}'"),
                    ));
                }
            }
        }
        let sum: f64 = self.zones.iter().map(|z| z.target_allocation).sum();
        if (sum - 1.0).abs() > ALLOCATION_TOLERANCE {
            return Err(FundSimError::AllocationOutOfTolerance {
                field: "zones.target_allocation".into(),
                sum,
            });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn target_weights(&self) -> Vec<f64> {
        self.zones.iter().map(|z| z.target_allocation).collect()
    }

    /// Debt tranche sizes (senior and mezzanine) over fund size.
    pub fn leverage(&self) -> f64 {
        let debt: Money = self
            .tranches
            .iter()
            .filter(|t| t.terms.is_debt())
            .map(|t| t.size)
            .sum();
        if self.fund.size.is_zero() {
            return 0.0;
        }
        money_to_f64(debt / self.fund.size)
    }

    // -----------------------------------------------------------------------
    // Variants
    // -----------------------------------------------------------------------

    /// Outer-trial variant: zone drift/volatility, loan pricing and
    /// (optionally) leverage each scaled by `1 + u`, `u ~ U(-factor, factor)`.
    ///
    /// Draw order is fixed (drift and volatility per zone, interest rate,
    /// appreciation share, leverage) so a variant depends only on its stream.
    pub fn perturbed(&self, factor: f64, rng: &mut StdRng) -> FundSimResult<(FundConfig, Variation)> {
        let mut draw = || 1.0 + factor * (2.0 * rng.gen::<f64>() - 1.0);

        let mut variant = self.clone();
        let mut variation = Variation::identity(self.zones.len());

        for (i, zone) in variant.zones.iter_mut().enumerate() {
            let drift_m = draw();
            let vol_m = draw();
            zone.drift *= drift_m;
            zone.volatility = (zone.volatility * vol_m).max(0.0);
            variation.drift_multipliers[i] = drift_m;
            variation.volatility_multipliers[i] = vol_m;
        }

        let rate_m = draw();
        let share_m = draw();
        let leverage_m = draw();

        variant.loans.interest_rate =
            (variant.loans.interest_rate * f64_to_money(rate_m, "interest rate multiplier")?)
                .max(Decimal::ZERO);
        variant.loans.appreciation_share = (variant.loans.appreciation_share
            * f64_to_money(share_m, "appreciation share multiplier")?)
        .clamp(Decimal::ZERO, Decimal::ONE);
        variation.interest_rate_multiplier = rate_m;
        variation.appreciation_share_multiplier = share_m;

        if self.monte_carlo.perturb_leverage && variant.rescale_leverage(leverage_m)? {
            variation.leverage_multiplier = leverage_m;
        }

        Ok((variant, variation))
    }

    /// Scale debt tranches by `multiplier`, moving the difference into the
    /// equity tranches pro rata. Leaves the structure untouched (and returns
    /// false) when there is no equity to absorb it.
    fn rescale_leverage(&mut self, multiplier: f64) -> FundSimResult<bool> {
        let m = f64_to_money(multiplier, "leverage multiplier")?;
        let old_debt: Money = self.tranches.iter().filter(|t| t.terms.is_debt()).map(|t| t.size).sum();
        let equity: Money = self
            .tranches
            .iter()
            .filter(|t| t.terms.is_equity())
            .map(|t| t.size)
            .sum();
        if equity <= Decimal::ZERO || old_debt <= Decimal::ZERO {
            return Ok(false);
        }
        let new_sizes: Vec<Money> = self
            .tranches
            .iter()
            .map(|t| if t.terms.is_debt() { round_money(t.size * m) } else { t.size })
            .collect();
        let new_debt: Money = self
            .tranches
            .iter()
            .zip(&new_sizes)
            .filter(|(t, _)| t.terms.is_debt())
            .map(|(_, s)| *s)
            .sum();
        let delta = old_debt - new_debt;
        if equity + delta < Decimal::ZERO {
            return Ok(false);
        }

        let equity_indices: Vec<usize> = self
            .tranches
            .iter()
            .enumerate()
            .filter(|(_, t)| t.terms.is_equity())
            .map(|(i, _)| i)
            .collect();
        let mut assigned = Decimal::ZERO;
        for (k, &i) in equity_indices.iter().enumerate() {
            let share = if k + 1 == equity_indices.len() {
                delta - assigned
            } else {
                round_money(delta * self.tranches[i].size / equity)
            };
            assigned += share;
            let resized = self.tranches[i].size + share;
            if resized < Decimal::ZERO {
                return Ok(false);
            }
            self.tranches[i].size = resized;
        }
        for (tranche, size) in self.tranches.iter_mut().zip(new_sizes) {
            if tranche.terms.is_debt() {
                tranche.size = size;
            }
        }
        Ok(true)
    }

    /// Stress variant: drift shifted, volatility scaled and exits delayed.
    pub fn stressed(&self, scenario: &StressScenario) -> FundConfig {
        let mut variant = self.clone();
        for zone in &mut variant.zones {
            zone.drift += scenario.drift_shift;
            zone.volatility = (zone.volatility * scenario.volatility_multiplier).max(0.0);
        }
        variant.loans.min_hold_periods = variant
            .loans
            .min_hold_periods
            .saturating_add(scenario.exit_delay_periods);
        variant.loans.max_hold_periods = variant
            .loans
            .max_hold_periods
            .saturating_add(scenario.exit_delay_periods);
        variant
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::reinvestment::strategy::ReinvestmentStrategy;
    use crate::waterfall::coverage::CoverageTestKind;
    use crate::waterfall::reserve::ReserveConfig;
    use crate::waterfall::tranche::TrancheTerms;
    use rand::SeedableRng;
    use rust_decimal_macros::dec;

    const SEED: u64 = 42;

    /// Small but complete fund used across unit tests.
    pub(crate) fn sample_config() -> FundConfig {
        let json = r#"{
            "fund": {
                "name": "Test Fund",
                "size": "100000000",
                "term_periods": 36,
                "periods_per_year": 12,
                "start_date": "2025-01-01"
            },
            "zones": [
                {"name": "inner", "target_allocation": 0.5, "drift": 0.05, "volatility": 0.12, "suburbs": ["north", "south"]},
                {"name": "middle", "target_allocation": 0.3, "drift": 0.04, "volatility": 0.10},
                {"name": "outer", "target_allocation": 0.2, "drift": 0.03, "volatility": 0.15}
            ],
            "correlation": [[1.0, 0.5, 0.3], [0.5, 1.0, 0.4], [0.3, 0.4, 1.0]],
            "price_path": {"model": {"type": "gbm"}, "suburb_variation": 0.03, "property_variation": 0.05},
            "loans": {
                "min_loan_size": "2000000",
                "max_loan_size": "6000000",
                "min_ltv": 0.5,
                "max_ltv": 0.75,
                "interest_rate": "0.07",
                "appreciation_share": "0.3",
                "min_hold_periods": 12,
                "max_hold_periods": 30
            },
            "tranches": [
                {"name": "Senior", "size": "60000000", "priority": 1, "terms": {"type": "senior_debt", "rate": "0.05"}},
                {"name": "Mezzanine", "size": "25000000", "priority": 2, "terms": {"type": "mezzanine", "rate": "0.09"}},
                {"name": "Equity", "size": "15000000", "priority": 3, "terms": {"type": "equity", "hurdle_rate": "0.08", "carry": "0.2"}}
            ],
            "reserve": {"target_fraction": "0.02", "min_fraction": "0.01", "max_fraction": "0.04", "replenishment_rate": "0.5"},
            "coverage_tests": [
                {"name": "senior_oc", "kind": "overcollateralization", "threshold": 1.2, "cure_periods": 3, "through_tranche": "Senior"}
            ],
            "reinvestment": {
                "strategy": {"type": "rebalance"},
                "reinvestment_period_end": 18,
                "min_reinvestment_amount": "1000000"
            },
            "monte_carlo": {"num_simulations": 2, "num_inner_simulations": 4, "variation_factor": 0.1, "seed": 42}
        }"#;
        FundConfig::from_json(json).unwrap()
    }

    #[test]
    fn test_sample_config_is_valid() {
        let config = sample_config();
        config.validate().unwrap();
        assert_eq!(config.fund.periods_per_year, 12);
        assert!(matches!(
            config.reinvestment.strategy,
            ReinvestmentStrategy::Rebalance
        ));
        assert_eq!(config.coverage_tests[0].kind, CoverageTestKind::Overcollateralization);
        assert!((config.leverage() - 0.85).abs() < 1e-12);
    }

    #[test]
    fn test_allocation_sum_out_of_tolerance() {
        let mut config = sample_config();
        config.zones[0].target_allocation = 0.6;
        assert!(matches!(
            config.validate(),
            Err(FundSimError::AllocationOutOfTolerance { .. })
        ));
    }

    #[test]
    fn test_duplicate_priority_rejected() {
        let mut config = sample_config();
        config.tranches[1].priority = 1;
        match config.validate() {
            Err(FundSimError::DuplicatePriority { priority, .. }) => assert_eq!(priority, 1),
            other => panic!("expected duplicate priority, got {other:?}"),
        }
    }

    #[test]
    fn test_tranches_exceeding_fund_size_rejected() {
        let mut config = sample_config();
        config.tranches[0].size = dec!(70_000_000);
        assert!(config.validate().unwrap_err().is_precondition());
    }

    #[test]
    fn test_non_psd_correlation_rejected() {
        let mut config = sample_config();
        config.correlation = Some(vec![
            vec![1.0, 0.9, -0.9],
            vec![0.9, 1.0, 0.9],
            vec![-0.9, 0.9, 1.0],
        ]);
        assert!(matches!(
            config.validate(),
            Err(FundSimError::NotPositiveSemiDefinite { .. })
        ));
    }

    #[test]
    fn test_invalid_reserve_ordering_rejected() {
        let mut config = sample_config();
        config.reserve = Some(ReserveConfig {
            target_fraction: dec!(0.05),
            min_fraction: dec!(0.01),
            max_fraction: dec!(0.04),
            replenishment_rate: dec!(0.5),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_perturbed_is_reproducible_and_bounded() {
        let config = sample_config();
        let (a, va) = config
            .perturbed(0.1, &mut StdRng::seed_from_u64(SEED))
            .unwrap();
        let (b, vb) = config
            .perturbed(0.1, &mut StdRng::seed_from_u64(SEED))
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(va, vb);
        for m in va.drift_multipliers.iter().chain(&va.volatility_multipliers) {
            assert!((0.9..=1.1).contains(m));
        }
        // Leverage is only perturbed on request.
        assert_eq!(va.leverage_multiplier, 1.0);
        assert_eq!(a.tranches, config.tranches);
        a.validate().unwrap();
    }

    #[test]
    fn test_perturbed_leverage_preserves_total() {
        let mut config = sample_config();
        config.monte_carlo.perturb_leverage = true;
        let (variant, variation) = config
            .perturbed(0.1, &mut StdRng::seed_from_u64(SEED))
            .unwrap();
        let before: Money = config.tranches.iter().map(|t| t.size).sum();
        let after: Money = variant.tranches.iter().map(|t| t.size).sum();
        assert_eq!(before, after);
        if variation.leverage_multiplier != 1.0 {
            assert_ne!(variant.tranches[0].size, config.tranches[0].size);
        }
        variant.validate().unwrap();
    }

    #[test]
    fn test_stressed_shifts_parameters() {
        let config = sample_config();
        let scenario = StressScenario {
            name: "downturn".into(),
            drift_shift: -0.05,
            volatility_multiplier: 2.0,
            exit_delay_periods: 6,
        };
        let stressed = config.stressed(&scenario);
        assert!((stressed.zones[0].drift - 0.0).abs() < 1e-12);
        assert!((stressed.zones[0].volatility - 0.24).abs() < 1e-12);
        assert_eq!(stressed.loans.min_hold_periods, 18);
        assert_eq!(stressed.loans.max_hold_periods, 36);
        assert!(matches!(
            stressed.tranches[0].terms,
            TrancheTerms::SeniorDebt { .. }
        ));
    }
}
