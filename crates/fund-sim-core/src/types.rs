use chrono::{Months, NaiveDate};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::FundSimError;
use crate::FundSimResult;

/// All monetary values. Wraps Decimal to prevent accidental f64 usage.
pub type Money = Decimal;

/// Rates expressed as decimals (0.05 = 5%). Never as percentages.
pub type Rate = Decimal;

/// Period index. Period 0 is fund inception; trading periods run `1..=horizon`.
pub type Period = u32;

/// Identifies one inner repetition of one outer trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrialId {
    pub outer: u32,
    pub inner: u32,
}

impl TrialId {
    pub fn new(outer: u32, inner: u32) -> Self {
        Self { outer, inner }
    }
}

impl std::fmt::Display for TrialId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.outer, self.inner)
    }
}

/// An amount earmarked for a single zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneAmount {
    pub zone: String,
    pub amount: Money,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// A structured finding raised when a risk or compliance threshold is breached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailViolation {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period: Option<Period>,
    pub details: serde_json::Value,
}

/// Standard computation output envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputationOutput<T: Serialize> {
    pub result: T,
    pub methodology: String,
    pub assumptions: serde_json::Value,
    pub warnings: Vec<String>,
    pub metadata: ComputationMetadata,
}

/// Metadata for every computation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputationMetadata {
    pub version: String,
    pub computation_time_us: u64,
    pub precision: String,
}

/// Helper to wrap computation results with metadata
pub fn with_metadata<T: Serialize>(
    methodology: &str,
    assumptions: &impl Serialize,
    warnings: Vec<String>,
    elapsed_us: u64,
    result: T,
) -> ComputationOutput<T> {
    wrap(methodology, assumptions, warnings, elapsed_us, result, "rust_decimal_128bit")
}

/// Same envelope for results dominated by stochastic `f64` statistics.
pub fn with_metadata_f64<T: Serialize>(
    methodology: &str,
    assumptions: &impl Serialize,
    warnings: Vec<String>,
    elapsed_us: u64,
    result: T,
) -> ComputationOutput<T> {
    wrap(methodology, assumptions, warnings, elapsed_us, result, "ieee754_f64")
}

fn wrap<T: Serialize>(
    methodology: &str,
    assumptions: &impl Serialize,
    warnings: Vec<String>,
    elapsed_us: u64,
    result: T,
    precision: &str,
) -> ComputationOutput<T> {
    ComputationOutput {
        result,
        methodology: methodology.to_string(),
        assumptions: serde_json::to_value(assumptions).unwrap_or_default(),
        warnings,
        metadata: ComputationMetadata {
            version: env!("CARGO_PKG_VERSION").to_string(),
            computation_time_us: elapsed_us,
            precision: precision.to_string(),
        },
    }
}

// ---------------------------------------------------------------------------
// Conversions between the Decimal ledger and the f64 stochastic layer
// ---------------------------------------------------------------------------

/// Decimal places kept on every ledger amount.
pub const MONEY_DP: u32 = 2;

/// Round a computed amount to cents. Sums of rounded amounts are exact.
pub fn round_money(amount: Money) -> Money {
    amount.round_dp(MONEY_DP)
}

pub fn money_to_f64(amount: Money) -> f64 {
    amount.to_f64().unwrap_or_default()
}

/// Convert a stochastic quantity into money, rejecting NaN and infinities.
pub fn f64_to_money(value: f64, context: &str) -> FundSimResult<Money> {
    if !value.is_finite() {
        return Err(FundSimError::NumericalInstability {
            context: format!("{context}: non-finite value {value}"),
        });
    }
    Decimal::from_f64(value).ok_or_else(|| FundSimError::NumericalInstability {
        context: format!("{context}: {value} is out of decimal range"),
    })
}

/// Calendar date of a period, counting whole months from the fund start.
pub fn period_date(start: NaiveDate, period: Period, periods_per_year: u32) -> NaiveDate {
    let months_per_period = (12 / periods_per_year.max(1)).max(1);
    start
        .checked_add_months(Months::new(period * months_per_period))
        .unwrap_or(NaiveDate::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_period_date_monthly_and_quarterly() {
        let start = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
        assert_eq!(
            period_date(start, 1, 12),
            NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()
        );
        assert_eq!(
            period_date(start, 2, 4),
            NaiveDate::from_ymd_opt(2024, 7, 31).unwrap()
        );
    }

    #[test]
    fn test_f64_to_money_rejects_nan() {
        assert!(f64_to_money(f64::NAN, "test").is_err());
        assert_eq!(f64_to_money(1.5, "test").unwrap(), dec!(1.5));
    }
}
