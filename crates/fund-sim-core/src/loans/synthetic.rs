//! Reference loan book with a simple, documented sampling model.
//!
//! - Loan size uniform in `[min_loan_size, max_loan_size]`; the last loan
//!   of a zone absorbs the remainder so principals sum to the allocation.
//! - LTV uniform in `[min_ltv, max_ltv]`; suburb uniform within the zone.
//! - Holding period uniform in `[min_hold_periods, max_hold_periods]`,
//!   capped at the horizon (every loan still live then exits there).
//! - Exit proceeds follow [`Loan::settlement_value`].

use rand::rngs::StdRng;
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::FundSimError;
use crate::loans::{Loan, LoanBook, LoanExit, OriginationRequest};
use crate::price_path::PricePaths;
use crate::types::{f64_to_money, round_money, Money, Rate};
use crate::FundSimResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoanBookConfig {
    pub min_loan_size: Money,
    pub max_loan_size: Money,
    pub min_ltv: f64,
    pub max_ltv: f64,
    /// Annual cash interest rate charged on every loan.
    pub interest_rate: Rate,
    /// Fund's share of property appreciation at exit.
    pub appreciation_share: Rate,
    pub min_hold_periods: u32,
    pub max_hold_periods: u32,
}

impl LoanBookConfig {
    pub fn validate(&self) -> FundSimResult<()> {
        if self.min_loan_size <= Decimal::ZERO {
            return Err(invalid("loans.min_loan_size", "Must be positive"));
        }
        if self.max_loan_size < self.min_loan_size {
            return Err(invalid("loans.max_loan_size", "Must be >= min_loan_size"));
        }
        if !(self.min_ltv > 0.0 && self.min_ltv <= self.max_ltv && self.max_ltv <= 1.0) {
            return Err(invalid("loans.ltv", "Require 0 < min_ltv <= max_ltv <= 1"));
        }
        if self.interest_rate < Decimal::ZERO {
            return Err(invalid("loans.interest_rate", "Cannot be negative"));
        }
        if self.appreciation_share < Decimal::ZERO || self.appreciation_share > Decimal::ONE {
            return Err(invalid("loans.appreciation_share", "Must be in [0, 1]"));
        }
        if self.min_hold_periods == 0 || self.max_hold_periods < self.min_hold_periods {
            return Err(invalid(
                "loans.hold_periods",
                "Require 1 <= min_hold_periods <= max_hold_periods",
            ));
        }
        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> FundSimError {
    FundSimError::InvalidInput {
        field: field.into(),
        reason: reason.into(),
    }
}

#[derive(Debug, Clone)]
pub struct SyntheticLoanBook {
    config: LoanBookConfig,
}

impl SyntheticLoanBook {
    pub fn new(config: LoanBookConfig) -> FundSimResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &LoanBookConfig {
        &self.config
    }

    fn draw_size(&self, remaining: Money, rng: &mut StdRng) -> FundSimResult<Money> {
        let u = f64_to_money(rng.gen::<f64>(), "loan size draw")?;
        let size = round_money(
            self.config.min_loan_size + (self.config.max_loan_size - self.config.min_loan_size) * u,
        );
        if size >= remaining || remaining - size < self.config.min_loan_size {
            Ok(remaining)
        } else {
            Ok(size)
        }
    }
}

impl LoanBook for SyntheticLoanBook {
    fn originate(
        &self,
        request: &OriginationRequest,
        paths: &PricePaths,
        rng: &mut StdRng,
    ) -> FundSimResult<Vec<Loan>> {
        let mut loans = Vec::new();
        let mut next_id = request.first_id;

        for allocation in &request.allocations {
            let zone_index = paths.zone_index(&allocation.zone).ok_or_else(|| {
                FundSimError::InvalidInput {
                    field: "allocations.zone".into(),
                    reason: format!("Unknown zone '{}'", allocation.zone),
                }
            })?;
            let suburbs = &paths.zones[zone_index].suburbs;

            let mut remaining = allocation.amount;
            while remaining > Decimal::ZERO {
                let principal = self.draw_size(remaining, rng)?;
                remaining -= principal;

                let ltv = self.config.min_ltv
                    + (self.config.max_ltv - self.config.min_ltv) * rng.gen::<f64>();
                let suburb_index = if suburbs.is_empty() {
                    None
                } else {
                    Some(rng.gen_range(0..suburbs.len()))
                };
                let property_path = paths.property_path(zone_index, suburb_index, rng)?;
                let property_value = round_money(principal / f64_to_money(ltv, "loan ltv")?);

                loans.push(Loan {
                    id: next_id,
                    zone: allocation.zone.clone(),
                    zone_index,
                    suburb: suburb_index.map(|s| suburbs[s].suburb.clone()),
                    suburb_index,
                    principal,
                    ltv,
                    interest_rate: self.config.interest_rate,
                    appreciation_share: self.config.appreciation_share,
                    origination_period: request.period,
                    property_value,
                    property_path,
                });
                next_id += 1;
            }
        }

        Ok(loans)
    }

    fn sample_exit(
        &self,
        loan: &Loan,
        paths: &PricePaths,
        rng: &mut StdRng,
    ) -> FundSimResult<LoanExit> {
        let hold = rng.gen_range(self.config.min_hold_periods..=self.config.max_hold_periods);
        let exit_period = loan
            .origination_period
            .saturating_add(hold)
            .min(paths.horizon())
            .max(loan.origination_period);
        LoanExit::settle(loan, exit_period)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::price_path::simulator::{SuburbPath, ZonePath};
    use crate::types::ZoneAmount;
    use rand::SeedableRng;
    use rust_decimal_macros::dec;

    const SEED: u64 = 42;

    fn config() -> LoanBookConfig {
        LoanBookConfig {
            min_loan_size: dec!(1_000_000),
            max_loan_size: dec!(3_000_000),
            min_ltv: 0.5,
            max_ltv: 0.7,
            interest_rate: dec!(0.06),
            appreciation_share: dec!(0.3),
            min_hold_periods: 12,
            max_hold_periods: 36,
        }
    }

    fn flat_paths(horizon: usize) -> PricePaths {
        PricePaths {
            model: "gbm".into(),
            dt: 1.0 / 12.0,
            zones: vec![
                ZonePath {
                    zone: "inner".into(),
                    values: vec![1.0; horizon + 1],
                    suburbs: vec![SuburbPath {
                        suburb: "north".into(),
                        values: vec![1.0; horizon + 1],
                    }],
                },
                ZonePath {
                    zone: "outer".into(),
                    values: vec![1.0; horizon + 1],
                    suburbs: vec![],
                },
            ],
            regimes: None,
            property_variation: 0.0,
        }
    }

    #[test]
    fn test_originated_principal_matches_allocation() {
        let book = SyntheticLoanBook::new(config()).unwrap();
        let request = OriginationRequest {
            period: 0,
            allocations: vec![
                ZoneAmount {
                    zone: "inner".into(),
                    amount: dec!(10_500_000),
                },
                ZoneAmount {
                    zone: "outer".into(),
                    amount: dec!(4_000_000),
                },
            ],
            first_id: 100,
        };
        let mut rng = StdRng::seed_from_u64(SEED);
        let loans = book.originate(&request, &flat_paths(60), &mut rng).unwrap();

        let inner: Money = loans.iter().filter(|l| l.zone == "inner").map(|l| l.principal).sum();
        let outer: Money = loans.iter().filter(|l| l.zone == "outer").map(|l| l.principal).sum();
        assert_eq!(inner, dec!(10_500_000));
        assert_eq!(outer, dec!(4_000_000));
        assert_eq!(loans[0].id, 100);
        assert!(loans.windows(2).all(|w| w[1].id == w[0].id + 1));
        for loan in &loans {
            assert!(loan.ltv >= 0.5 && loan.ltv <= 0.7);
            assert!(loan.principal > Decimal::ZERO);
            if loan.zone == "inner" {
                assert_eq!(loan.suburb.as_deref(), Some("north"));
            } else {
                assert!(loan.suburb.is_none());
            }
        }
    }

    #[test]
    fn test_exit_within_hold_window_and_horizon() {
        let book = SyntheticLoanBook::new(config()).unwrap();
        let paths = flat_paths(24);
        let request = OriginationRequest {
            period: 6,
            allocations: vec![ZoneAmount {
                zone: "outer".into(),
                amount: dec!(20_000_000),
            }],
            first_id: 0,
        };
        let mut rng = StdRng::seed_from_u64(SEED);
        let loans = book.originate(&request, &paths, &mut rng).unwrap();
        for loan in &loans {
            let exit = book.sample_exit(loan, &paths, &mut rng).unwrap();
            assert!(exit.period >= 18 && exit.period <= 24);
            // Flat prices: principal comes back in full, nothing more.
            assert_eq!(exit.principal_repaid, loan.principal);
            assert_eq!(exit.loss, Decimal::ZERO);
        }
    }

    #[test]
    fn test_unknown_zone_rejected() {
        let book = SyntheticLoanBook::new(config()).unwrap();
        let request = OriginationRequest {
            period: 0,
            allocations: vec![ZoneAmount {
                zone: "nowhere".into(),
                amount: dec!(1_000_000),
            }],
            first_id: 0,
        };
        let mut rng = StdRng::seed_from_u64(SEED);
        assert!(book.originate(&request, &flat_paths(12), &mut rng).is_err());
    }

    #[test]
    fn test_config_validation() {
        let mut bad = config();
        bad.max_ltv = 1.2;
        assert!(SyntheticLoanBook::new(bad).is_err());

        let mut bad = config();
        bad.min_hold_periods = 0;
        assert!(bad.validate().is_err());
    }
}
