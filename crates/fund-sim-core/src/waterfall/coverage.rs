//! Overcollateralisation (OC) and interest coverage (IC) tests with a
//! cure-period lifecycle.
//!
//! - OC ratio = collateral value / cumulative fixed-claim balance through
//!   the test's tranche
//! - IC ratio = period income / cumulative coupon due through the tranche
//!
//! A failing test enters `in_cure`. Passing again at a later due date
//! before `cure_periods` have elapsed returns it to `passing`; otherwise it
//! becomes `violated` at `since + cure_periods` and stays there.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::FundSimError;
use crate::types::{money_to_f64, Money, Period};
use crate::waterfall::tranche::TrancheConfig;
use crate::FundSimResult;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverageTestKind {
    Overcollateralization,
    InterestCoverage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageTestConfig {
    pub name: String,
    pub kind: CoverageTestKind,
    /// Minimum passing ratio (1.2 = 120%).
    pub threshold: f64,
    /// Test every `frequency_periods` periods.
    #[serde(default = "default_frequency")]
    pub frequency_periods: u32,
    /// Periods a failing test may take to cure. Zero violates immediately.
    pub cure_periods: u32,
    /// Most junior tranche whose claim is included. All fixed-claim
    /// tranches when absent.
    #[serde(default)]
    pub through_tranche: Option<String>,
}

fn default_frequency() -> u32 {
    1
}

impl CoverageTestConfig {
    pub fn validate(&self, ranked: &[TrancheConfig]) -> FundSimResult<()> {
        let field = |f: &str| format!("coverage_tests.{}.{f}", self.name);
        if !(self.threshold.is_finite() && self.threshold > 0.0) {
            return Err(FundSimError::InvalidInput {
                field: field("threshold"),
                reason: "Threshold must be a positive ratio".into(),
            });
        }
        if self.frequency_periods == 0 {
            return Err(FundSimError::InvalidInput {
                field: field("frequency_periods"),
                reason: "Must be at least 1".into(),
            });
        }
        if let Some(through) = &self.through_tranche {
            match ranked.iter().find(|t| &t.name == through) {
                None => {
                    return Err(FundSimError::InvalidInput {
                        field: field("through_tranche"),
                        reason: format!("Unknown tranche '{through}'"),
                    })
                }
                Some(t) if !t.terms.has_fixed_claim() => {
                    return Err(FundSimError::InvalidInput {
                        field: field("through_tranche"),
                        reason: format!("Tranche '{through}' has no fixed claim to cover"),
                    })
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Index into `ranked` of the most junior tranche the test covers.
    pub fn level(&self, ranked: &[TrancheConfig]) -> Option<usize> {
        match &self.through_tranche {
            Some(name) => ranked.iter().position(|t| &t.name == name),
            None => ranked.iter().rposition(|t| t.terms.has_fixed_claim()),
        }
    }
}

/// Ratio of `numerator` to `denominator`; `None` when nothing is owed.
pub fn coverage_ratio(numerator: Money, denominator: Money) -> Option<f64> {
    if denominator <= Decimal::ZERO {
        None
    } else {
        Some(money_to_f64(numerator / denominator))
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CoverageState {
    Passing,
    InCure { since: Period },
    Violated { since: Period, at: Period },
}

/// One period's view of a test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageObservation {
    pub test: String,
    pub period: Period,
    /// `None` when the test was not due or nothing was owed.
    pub ratio: Option<f64>,
    /// `None` when the test was not due this period.
    pub passed: Option<bool>,
    pub state: CoverageState,
    /// Set only in the period the test became violated.
    pub newly_violated: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoverageTest {
    config: CoverageTestConfig,
    level: usize,
    state: CoverageState,
}

impl CoverageTest {
    pub fn new(config: CoverageTestConfig, ranked: &[TrancheConfig]) -> FundSimResult<Self> {
        config.validate(ranked)?;
        let level = config.level(ranked).ok_or_else(|| FundSimError::InvalidInput {
            field: format!("coverage_tests.{}", config.name),
            reason: "No fixed-claim tranche to test".into(),
        })?;
        Ok(Self {
            config,
            level,
            state: CoverageState::Passing,
        })
    }

    pub fn config(&self) -> &CoverageTestConfig {
        &self.config
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn state(&self) -> CoverageState {
        self.state
    }

    pub fn is_due(&self, period: Period) -> bool {
        period % self.config.frequency_periods == 0
    }

    /// Any state other than passing diverts residual income.
    pub fn is_diverting(&self) -> bool {
        !matches!(self.state, CoverageState::Passing)
    }

    /// Advance the lifecycle to `period`. `ratio` is only read when the
    /// test is due; `None` (nothing owed) passes.
    pub fn advance(&mut self, period: Period, ratio: Option<f64>) -> CoverageObservation {
        let mut newly_violated = false;

        if let CoverageState::InCure { since } = self.state {
            if period >= since.saturating_add(self.config.cure_periods) {
                self.state = CoverageState::Violated { since, at: period };
                newly_violated = true;
            }
        }

        let due = self.is_due(period);
        let passed = due.then(|| ratio.map_or(true, |r| r >= self.config.threshold));

        match (self.state, passed) {
            (CoverageState::Passing, Some(false)) => {
                if self.config.cure_periods == 0 {
                    self.state = CoverageState::Violated {
                        since: period,
                        at: period,
                    };
                    newly_violated = true;
                } else {
                    self.state = CoverageState::InCure { since: period };
                }
            }
            (CoverageState::InCure { .. }, Some(true)) => {
                self.state = CoverageState::Passing;
            }
            _ => {}
        }

        CoverageObservation {
            test: self.config.name.clone(),
            period,
            ratio: if due { ratio } else { None },
            passed,
            state: self.state,
            newly_violated,
        }
    }
}
