//! Loan records exchanged with the loan book, and the loan book interface.
//!
//! The engine never decides how loans are sized or when properties sell;
//! it asks a [`LoanBook`] to originate loans for a zone allocation and to
//! sample each loan's exit against the trial's price paths.

pub mod synthetic;

use rand::rngs::StdRng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::FundSimError;
use crate::price_path::PricePaths;
use crate::rng::{RngFactory, Stream};
use crate::types::{f64_to_money, round_money, Money, Period, Rate, TrialId, ZoneAmount};
use crate::FundSimResult;

pub use synthetic::{LoanBookConfig, SyntheticLoanBook};

/// A single property-backed loan held by the fund.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Loan {
    /// Unique within a trial.
    pub id: u64,
    pub zone: String,
    pub zone_index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suburb: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suburb_index: Option<usize>,
    pub principal: Money,
    pub ltv: f64,
    /// Annual cash interest rate.
    pub interest_rate: Rate,
    /// Fund's share of the property's value gain at exit.
    pub appreciation_share: Rate,
    pub origination_period: Period,
    /// Property value at origination (`principal / ltv`).
    pub property_value: Money,
    /// Property multiplier path from inception, `horizon + 1` points.
    #[serde(skip)]
    pub property_path: Vec<f64>,
}

impl Loan {
    /// Cash interest accrued in one period.
    pub fn interest_per_period(&self, periods_per_year: u32) -> Money {
        round_money(self.principal * self.interest_rate / Decimal::from(periods_per_year.max(1)))
    }

    /// Property value at `period`, scaled from origination along the
    /// property path.
    pub fn value_at(&self, period: Period) -> FundSimResult<Money> {
        let last = self.property_path.len().checked_sub(1).ok_or_else(|| {
            FundSimError::InsufficientData(format!("loan {} has no property path", self.id))
        })?;
        let origin = self.property_path[(self.origination_period as usize).min(last)];
        let current = self.property_path[(period as usize).min(last)];
        if origin <= 0.0 {
            return Err(FundSimError::NumericalInstability {
                context: format!("loan {} property multiplier at origination is {origin}", self.id),
            });
        }
        let ratio = f64_to_money(current / origin, "property value ratio")?;
        Ok(round_money(self.property_value * ratio))
    }

    /// Amount the fund would collect if the loan settled at `period`:
    /// principal plus the appreciation share of any gain, capped by the
    /// property's value.
    pub fn settlement_value(&self, period: Period) -> FundSimResult<Money> {
        let value = self.value_at(period)?;
        let gain = (value - self.property_value).max(Decimal::ZERO);
        let gross = self.principal + round_money(self.appreciation_share * gain);
        Ok(gross.min(value).max(Decimal::ZERO))
    }
}

/// Realised exit of a loan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoanExit {
    pub loan_id: u64,
    pub period: Period,
    pub property_value: Money,
    pub proceeds: Money,
    pub principal_repaid: Money,
    pub gain: Money,
    pub loss: Money,
}

impl LoanExit {
    /// Settle `loan` at `period`.
    pub fn settle(loan: &Loan, period: Period) -> FundSimResult<LoanExit> {
        let property_value = loan.value_at(period)?;
        let proceeds = loan.settlement_value(period)?;
        let principal_repaid = proceeds.min(loan.principal);
        Ok(LoanExit {
            loan_id: loan.id,
            period,
            property_value,
            proceeds,
            principal_repaid,
            gain: proceeds - principal_repaid,
            loss: loan.principal - principal_repaid,
        })
    }
}

/// Request to originate loans for a zone allocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OriginationRequest {
    pub period: Period,
    pub allocations: Vec<ZoneAmount>,
    /// First id to assign; ids increase by one per loan.
    pub first_id: u64,
}

/// Source of loans and loan exits.
///
/// Implementations must be pure functions of their arguments so that a
/// trial replays identically from the same random streams.
pub trait LoanBook: Send + Sync {
    /// Originate loans whose principals sum to each zone's allocation.
    fn originate(
        &self,
        request: &OriginationRequest,
        paths: &PricePaths,
        rng: &mut StdRng,
    ) -> FundSimResult<Vec<Loan>>;

    /// Sample when and for how much `loan` exits. The exit period must lie
    /// in `origination_period + 1 ..= horizon`.
    fn sample_exit(&self, loan: &Loan, paths: &PricePaths, rng: &mut StdRng)
        -> FundSimResult<LoanExit>;
}

/// Sample `loan`'s exit from the loan's own stream and check the period.
pub fn sample_checked_exit(
    book: &dyn LoanBook,
    loan: &Loan,
    paths: &PricePaths,
    rngs: &RngFactory,
    trial: TrialId,
) -> FundSimResult<LoanExit> {
    let mut rng = rngs.sub_stream(trial, Stream::LoanExit, loan.id);
    let exit = book.sample_exit(loan, paths, &mut rng)?;
    if exit.loan_id != loan.id
        || exit.period <= loan.origination_period
        || exit.period > paths.horizon()
    {
        return Err(FundSimError::WaterfallState(format!(
            "loan book returned exit at period {} for loan {} originated at period {}",
            exit.period, loan.id, loan.origination_period
        )));
    }
    Ok(exit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn loan(path: Vec<f64>) -> Loan {
        Loan {
            id: 7,
            zone: "inner".into(),
            zone_index: 0,
            suburb: None,
            suburb_index: None,
            principal: dec!(60),
            ltv: 0.6,
            interest_rate: dec!(0.06),
            appreciation_share: dec!(0.5),
            origination_period: 1,
            property_value: dec!(100),
            property_path: path,
        }
    }

    #[test]
    fn test_exit_with_gain_shares_appreciation() {
        let l = loan(vec![1.0, 1.0, 1.1, 1.25]);
        let exit = LoanExit::settle(&l, 3).unwrap();
        assert_eq!(exit.property_value, dec!(125));
        assert_eq!(exit.proceeds, dec!(72.5));
        assert_eq!(exit.principal_repaid, dec!(60));
        assert_eq!(exit.gain, dec!(12.5));
        assert_eq!(exit.loss, Decimal::ZERO);
    }

    #[test]
    fn test_exit_capped_by_collateral_value() {
        let l = loan(vec![1.0, 1.0, 0.8, 0.5]);
        let exit = LoanExit::settle(&l, 3).unwrap();
        assert_eq!(exit.proceeds, dec!(50));
        assert_eq!(exit.principal_repaid, dec!(50));
        assert_eq!(exit.loss, dec!(10));
        assert_eq!(exit.gain, Decimal::ZERO);
    }

    #[test]
    fn test_interest_per_period() {
        let l = loan(vec![1.0; 4]);
        assert_eq!(l.interest_per_period(12), dec!(0.3));
    }
}
