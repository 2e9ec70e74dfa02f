//! Reinvestment of capital freed by loan exits.
//!
//! Inside the reinvestment window, principal returned by exits (plus any
//! cash reserve above its floor) is redeployed through the loan book once
//! it reaches `min_reinvestment_amount`. Smaller amounts wait in the cash
//! reserve up to its cap; overflow, and everything after the window, is
//! left for distribution.

pub mod engine;
pub mod strategy;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::FundSimError;
use crate::types::{Money, Period, Rate, ZoneAmount};
use crate::FundSimResult;

pub use engine::{ReinvestmentEngine, ReinvestmentOutcome};
pub use strategy::{split_amount, ReinvestmentStrategy};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Bounds of the reinvestment cash reserve, as fractions of fund size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CashReserveConfig {
    /// Balance kept back even when reinvesting.
    pub min_fraction: Rate,
    /// Sub-threshold capital above this is distributed.
    pub max_fraction: Rate,
}

/// Tilts strategy weights toward zones with stronger trailing appreciation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicAllocationConfig {
    pub lookback_periods: u32,
    /// Largest shift applied to any single zone weight.
    pub max_adjustment: f64,
    pub sensitivity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReinvestmentConfig {
    #[serde(default)]
    pub strategy: ReinvestmentStrategy,
    /// Last period in which capital may be redeployed. Zero disables
    /// reinvestment.
    #[serde(default)]
    pub reinvestment_period_end: Period,
    #[serde(default)]
    pub min_reinvestment_amount: Money,
    #[serde(default)]
    pub cash_reserve: Option<CashReserveConfig>,
    #[serde(default)]
    pub dynamic: Option<DynamicAllocationConfig>,
    /// Cap on aggregation / waterfall / reinvestment rounds per trial.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
}

fn default_max_rounds() -> u32 {
    10
}

impl Default for ReinvestmentConfig {
    fn default() -> Self {
        Self {
            strategy: ReinvestmentStrategy::default(),
            reinvestment_period_end: 0,
            min_reinvestment_amount: Decimal::ZERO,
            cash_reserve: None,
            dynamic: None,
            max_rounds: default_max_rounds(),
        }
    }
}

impl ReinvestmentConfig {
    pub fn validate(&self, zones: &[&str], term_periods: Period) -> FundSimResult<()> {
        if self.reinvestment_period_end > term_periods {
            return Err(FundSimError::InvalidInput {
                field: "reinvestment.reinvestment_period_end".into(),
                reason: format!("Must not exceed the fund term of {term_periods} periods"),
            });
        }
        if self.min_reinvestment_amount < Decimal::ZERO {
            return Err(FundSimError::InvalidInput {
                field: "reinvestment.min_reinvestment_amount".into(),
                reason: "Cannot be negative".into(),
            });
        }
        if let Some(reserve) = &self.cash_reserve {
            if reserve.min_fraction < Decimal::ZERO
                || reserve.min_fraction > reserve.max_fraction
                || reserve.max_fraction > Decimal::ONE
            {
                return Err(FundSimError::InvalidInput {
                    field: "reinvestment.cash_reserve".into(),
                    reason: "Require 0 <= min_fraction <= max_fraction <= 1".into(),
                });
            }
        }
        if let Some(dynamic) = &self.dynamic {
            if dynamic.lookback_periods == 0 {
                return Err(FundSimError::InvalidInput {
                    field: "reinvestment.dynamic.lookback_periods".into(),
                    reason: "Must be at least 1".into(),
                });
            }
            if !(0.0..=1.0).contains(&dynamic.max_adjustment) {
                return Err(FundSimError::InvalidInput {
                    field: "reinvestment.dynamic.max_adjustment".into(),
                    reason: "Must be in [0, 1]".into(),
                });
            }
            if !dynamic.sensitivity.is_finite() {
                return Err(FundSimError::InvalidInput {
                    field: "reinvestment.dynamic.sensitivity".into(),
                    reason: "Must be finite".into(),
                });
            }
        }
        if self.max_rounds == 0 {
            return Err(FundSimError::InvalidInput {
                field: "reinvestment.max_rounds".into(),
                reason: "Must be at least 1".into(),
            });
        }
        self.strategy.validate(zones)
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReinvestmentSource {
    ExitProceeds,
    CashReserve,
}

/// One redeployment of capital. Never modified once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReinvestmentEvent {
    pub period: Period,
    pub date: NaiveDate,
    pub amount: Money,
    /// `cash_reserve` only when no exit proceeds were part of the amount.
    pub source: ReinvestmentSource,
    /// Portion of `amount` taken from the cash reserve.
    pub from_reserve: Money,
    pub strategy: String,
    pub allocations: Vec<ZoneAmount>,
    pub loan_ids: Vec<u64>,
}
