//! Cashflow aggregation: loan-level interest, exits and reinvestment
//! movements merged into one period-indexed ledger for the waterfall.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::FundSimError;
use crate::loans::{Loan, LoanExit};
use crate::types::{period_date, Money, Period};
use crate::FundSimResult;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Capital the reinvestment engine kept back from distribution in a period.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapitalMovement {
    pub period: Period,
    /// Deployed into new loans.
    pub reinvested: Money,
    /// Moved into the cash reserve.
    pub reserve_added: Money,
    /// Taken out of the cash reserve, to reinvest or distribute.
    pub reserve_drawn: Money,
    /// Cash reserve balance after the period.
    pub reserve_balance: Money,
}

/// Cash generated by the portfolio in one period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodCashflow {
    pub period: Period,
    pub date: NaiveDate,
    /// Cash interest from live loans.
    pub interest: Money,
    /// Exit proceeds above principal.
    pub exit_gains: Money,
    pub principal_repaid: Money,
    /// Principal not recovered at exit.
    pub losses: Money,
    pub reinvested: Money,
    pub reserve_added: Money,
    pub reserve_drawn: Money,
    /// Settlement value of live loans plus the cash reserve at period end.
    pub collateral_value: Money,
    pub live_loans: usize,
}

impl PeriodCashflow {
    /// A period with no cash movement.
    pub fn new(period: Period, date: NaiveDate) -> Self {
        Self {
            period,
            date,
            interest: Decimal::ZERO,
            exit_gains: Decimal::ZERO,
            principal_repaid: Decimal::ZERO,
            losses: Decimal::ZERO,
            reinvested: Decimal::ZERO,
            reserve_added: Decimal::ZERO,
            reserve_drawn: Decimal::ZERO,
            collateral_value: Decimal::ZERO,
            live_loans: 0,
        }
    }

    /// Interest plus exit gains.
    pub fn income(&self) -> Money {
        self.interest + self.exit_gains
    }

    /// Principal cash available to the waterfall after reinvestment.
    pub fn distributable_principal(&self) -> Money {
        (self.principal_repaid + self.reserve_drawn - self.reinvested - self.reserve_added)
            .max(Decimal::ZERO)
    }
}

/// Periods `1..=horizon` of one trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CashflowLedger {
    /// Principal deployed at inception.
    pub deployed: Money,
    pub periods: Vec<PeriodCashflow>,
}

impl CashflowLedger {
    pub fn horizon(&self) -> Period {
        self.periods.last().map_or(0, |p| p.period)
    }

    pub fn total_income(&self) -> Money {
        self.periods.iter().map(PeriodCashflow::income).sum()
    }

    pub fn total_losses(&self) -> Money {
        self.periods.iter().map(|p| p.losses).sum()
    }
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

/// Merge loans, their exits and reinvestment movements into a ledger.
///
/// Every loan must have exactly one exit in
/// `origination_period + 1 ..= horizon`. A loan earns interest in each
/// period after origination up to and including its exit period.
pub fn aggregate(
    loans: &[Loan],
    exits: &BTreeMap<u64, LoanExit>,
    movements: &[CapitalMovement],
    horizon: Period,
    periods_per_year: u32,
    start_date: NaiveDate,
) -> FundSimResult<CashflowLedger> {
    for loan in loans {
        let exit = exits.get(&loan.id).ok_or_else(|| {
            FundSimError::WaterfallState(format!("loan {} has no exit", loan.id))
        })?;
        if exit.period <= loan.origination_period || exit.period > horizon {
            return Err(FundSimError::WaterfallState(format!(
                "loan {} exits at period {} outside {}..={horizon}",
                loan.id,
                exit.period,
                loan.origination_period + 1
            )));
        }
    }

    let movements: BTreeMap<Period, &CapitalMovement> =
        movements.iter().map(|m| (m.period, m)).collect();

    let deployed: Money = loans
        .iter()
        .filter(|l| l.origination_period == 0)
        .map(|l| l.principal)
        .sum();

    let mut periods = Vec::with_capacity(horizon as usize);
    let mut reserve_balance = Decimal::ZERO;

    for period in 1..=horizon {
        let mut row = PeriodCashflow::new(period, period_date(start_date, period, periods_per_year));

        for loan in loans {
            // exits were checked above
            let Some(exit) = exits.get(&loan.id) else {
                continue;
            };
            if loan.origination_period < period && period <= exit.period {
                row.interest += loan.interest_per_period(periods_per_year);
            }
            if exit.period == period {
                row.principal_repaid += exit.principal_repaid;
                row.exit_gains += exit.gain;
                row.losses += exit.loss;
            } else if loan.origination_period <= period && period < exit.period {
                row.collateral_value += loan.settlement_value(period)?;
                row.live_loans += 1;
            }
        }

        if let Some(m) = movements.get(&period) {
            row.reinvested = m.reinvested;
            row.reserve_added = m.reserve_added;
            row.reserve_drawn = m.reserve_drawn;
            reserve_balance = m.reserve_balance;
        }
        row.collateral_value += reserve_balance;
        periods.push(row);
    }

    Ok(CashflowLedger { deployed, periods })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn start() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()
    }

    fn loan(id: u64, principal: Money, origination_period: Period) -> Loan {
        Loan {
            id,
            zone: "inner".into(),
            zone_index: 0,
            suburb: None,
            suburb_index: None,
            principal,
            ltv: 0.5,
            interest_rate: dec!(0.12),
            appreciation_share: dec!(0.5),
            origination_period,
            property_value: principal * dec!(2),
            property_path: vec![1.0, 1.0, 1.0, 1.25, 1.25],
        }
    }

    #[test]
    fn test_interest_exits_and_collateral() {
        let loans = vec![loan(0, dec!(100), 0), loan(1, dec!(50), 1)];
        let exits: BTreeMap<u64, LoanExit> = loans
            .iter()
            .zip([3, 2])
            .map(|(l, p)| (l.id, LoanExit::settle(l, p).unwrap()))
            .collect();
        let ledger = aggregate(&loans, &exits, &[], 4, 12, start()).unwrap();

        assert_eq!(ledger.deployed, dec!(100));
        assert_eq!(ledger.horizon(), 4);
        // 1% per month on loan 0; loan 1 starts earning in period 2
        assert_eq!(ledger.periods[0].interest, dec!(1));
        assert_eq!(ledger.periods[1].interest, dec!(1.5));
        assert_eq!(ledger.periods[3].interest, Decimal::ZERO);

        // loan 1 exits flat in period 2
        assert_eq!(ledger.periods[1].principal_repaid, dec!(50));
        assert_eq!(ledger.periods[1].exit_gains, Decimal::ZERO);

        // loan 0: value 200 -> 250, half the 50 gain
        assert_eq!(ledger.periods[2].principal_repaid, dec!(100));
        assert_eq!(ledger.periods[2].exit_gains, dec!(25));
        assert_eq!(ledger.periods[2].income(), dec!(26));

        assert_eq!(ledger.periods[0].collateral_value, dec!(150));
        assert_eq!(ledger.periods[0].live_loans, 2);
        assert_eq!(ledger.periods[1].collateral_value, dec!(100));
        assert_eq!(ledger.periods[3].live_loans, 0);
        assert_eq!(ledger.periods[1].date, NaiveDate::from_ymd_opt(2025, 3, 1).unwrap());
    }

    #[test]
    fn test_movements_reduce_distributable_principal() {
        let loans = vec![loan(0, dec!(100), 0)];
        let exits = BTreeMap::from([(0, LoanExit::settle(&loans[0], 2).unwrap())]);
        let movements = vec![CapitalMovement {
            period: 2,
            reinvested: Decimal::ZERO,
            reserve_added: dec!(30),
            reserve_drawn: Decimal::ZERO,
            reserve_balance: dec!(30),
        }];
        let ledger = aggregate(&loans, &exits, &movements, 3, 12, start()).unwrap();
        assert_eq!(ledger.periods[1].distributable_principal(), dec!(70));
        // reserve balance carries forward as collateral
        assert_eq!(ledger.periods[2].collateral_value, dec!(30));
    }

    #[test]
    fn test_exit_outside_horizon_rejected() {
        let loans = vec![loan(0, dec!(100), 0)];
        let mut exit = LoanExit::settle(&loans[0], 2).unwrap();
        exit.period = 9;
        let exits = BTreeMap::from([(0, exit)]);
        assert!(matches!(
            aggregate(&loans, &exits, &[], 4, 12, start()),
            Err(FundSimError::WaterfallState(_))
        ));
    }
}
