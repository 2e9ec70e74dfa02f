use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::NaiveDate;
use log::debug;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::cashflow::CapitalMovement;
use crate::config::FundConfig;
use crate::error::FundSimError;
use crate::loans::{sample_checked_exit, Loan, LoanBook, LoanExit, OriginationRequest};
use crate::price_path::PricePaths;
use crate::reinvestment::strategy::{apply_dynamic, split_amount, AllocationContext};
use crate::reinvestment::{ReinvestmentConfig, ReinvestmentEvent, ReinvestmentSource};
use crate::rng::{RngFactory, Stream};
use crate::types::{period_date, round_money, Money, Period, TrialId};
use crate::FundSimResult;

/// Everything one pass of the reinvestment walk produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReinvestmentOutcome {
    pub events: Vec<ReinvestmentEvent>,
    /// Loans originated by reinvestment.
    pub loans: Vec<Loan>,
    pub exits: Vec<LoanExit>,
    pub movements: Vec<CapitalMovement>,
}

impl ReinvestmentOutcome {
    pub fn total_reinvested(&self) -> Money {
        self.events.iter().map(|e| e.amount).sum()
    }
}

#[derive(Debug, Clone)]
pub struct ReinvestmentEngine {
    config: ReinvestmentConfig,
    zones: Vec<String>,
    targets: Vec<f64>,
    fund_size: Money,
    periods_per_year: u32,
    start_date: NaiveDate,
}

impl ReinvestmentEngine {
    pub fn from_config(config: &FundConfig) -> Self {
        Self {
            config: config.reinvestment.clone(),
            zones: config.zones.iter().map(|z| z.name.clone()).collect(),
            targets: config.target_weights(),
            fund_size: config.fund.size,
            periods_per_year: config.fund.periods_per_year,
            start_date: config.fund.start_date,
        }
    }

    /// Walk every period from the base portfolio, redeploying freed
    /// principal. Loans originated here get ids after the base loans and
    /// their exits are sampled immediately, so a reinvested loan can itself
    /// exit and be reinvested within the window.
    pub fn run(
        &self,
        base_loans: &[Loan],
        base_exits: &BTreeMap<u64, LoanExit>,
        paths: &PricePaths,
        book: &dyn LoanBook,
        rngs: &RngFactory,
        trial: TrialId,
    ) -> FundSimResult<ReinvestmentOutcome> {
        self.run_suspended(base_loans, base_exits, paths, book, rngs, trial, &BTreeSet::new())
    }

    /// [`run`](Self::run) with reinvestment suspended in `suspended`
    /// periods: principal freed there is left to the waterfall and the cash
    /// reserve is not drawn.
    #[allow(clippy::too_many_arguments)]
    pub fn run_suspended(
        &self,
        base_loans: &[Loan],
        base_exits: &BTreeMap<u64, LoanExit>,
        paths: &PricePaths,
        book: &dyn LoanBook,
        rngs: &RngFactory,
        trial: TrialId,
        suspended: &BTreeSet<Period>,
    ) -> FundSimResult<ReinvestmentOutcome> {
        let horizon = paths.horizon();
        if paths.zones.len() != self.zones.len() {
            return Err(FundSimError::InvalidInput {
                field: "zones".into(),
                reason: format!(
                    "{} price paths for {} configured zones",
                    paths.zones.len(),
                    self.zones.len()
                ),
            });
        }

        let mut positions: HashMap<u64, (usize, Money)> = HashMap::new();
        let mut holdings = vec![Decimal::ZERO; self.zones.len()];
        for loan in base_loans {
            *zone_slot(&mut holdings, loan)? += loan.principal;
            positions.insert(loan.id, (loan.zone_index, loan.principal));
        }
        let mut exits_by_period: BTreeMap<Period, Vec<LoanExit>> = BTreeMap::new();
        for exit in base_exits.values() {
            exits_by_period.entry(exit.period).or_default().push(exit.clone());
        }

        let mut next_id = base_loans.iter().map(|l| l.id + 1).max().unwrap_or(0);
        let (reserve_floor, reserve_cap) = match &self.config.cash_reserve {
            Some(c) => (
                round_money(c.min_fraction * self.fund_size),
                round_money(c.max_fraction * self.fund_size),
            ),
            None => (Decimal::ZERO, Decimal::ZERO),
        };

        let mut outcome = ReinvestmentOutcome::default();
        let mut cash_reserve = Decimal::ZERO;

        for period in 1..=horizon {
            let mut freed = Decimal::ZERO;
            if let Some(exits) = exits_by_period.remove(&period) {
                for exit in exits {
                    freed += exit.principal_repaid;
                    if let Some((zone, principal)) = positions.remove(&exit.loan_id) {
                        holdings[zone] -= principal;
                    }
                }
            }

            let window_open = period <= self.config.reinvestment_period_end && period < horizon;
            if !window_open {
                if cash_reserve > Decimal::ZERO {
                    outcome.movements.push(CapitalMovement {
                        period,
                        reserve_drawn: cash_reserve,
                        ..CapitalMovement::default()
                    });
                    cash_reserve = Decimal::ZERO;
                }
                continue;
            }
            if suspended.contains(&period) {
                continue;
            }

            let from_reserve = (cash_reserve - reserve_floor).max(Decimal::ZERO);
            let deployable = freed + from_reserve;

            if deployable > Decimal::ZERO && deployable >= self.config.min_reinvestment_amount {
                let ctx = AllocationContext {
                    zones: &self.zones,
                    targets: &self.targets,
                    holdings: &holdings,
                    paths,
                    period,
                };
                let mut weights = self.config.strategy.weights(deployable, &ctx)?;
                if let Some(dynamic) = &self.config.dynamic {
                    weights = apply_dynamic(&weights, dynamic, paths, period);
                }
                let allocations = split_amount(deployable, &self.zones, &weights)?;

                let request = OriginationRequest {
                    period,
                    allocations: allocations.clone(),
                    first_id: next_id,
                };
                let mut rng = rngs.sub_stream(trial, Stream::Reinvestment, u64::from(period));
                let loans = book.originate(&request, paths, &mut rng)?;

                let originated: Money = loans.iter().map(|l| l.principal).sum();
                if originated > deployable {
                    return Err(FundSimError::WaterfallState(format!(
                        "loan book originated {originated} from {deployable} at period {period}"
                    )));
                }

                let mut loan_ids = Vec::with_capacity(loans.len());
                for loan in loans {
                    let exit = sample_checked_exit(book, &loan, paths, rngs, trial)?;
                    exits_by_period.entry(exit.period).or_default().push(exit.clone());
                    *zone_slot(&mut holdings, &loan)? += loan.principal;
                    positions.insert(loan.id, (loan.zone_index, loan.principal));
                    next_id = next_id.max(loan.id + 1);
                    loan_ids.push(loan.id);
                    outcome.exits.push(exit);
                    outcome.loans.push(loan);
                }

                cash_reserve -= from_reserve;
                outcome.movements.push(CapitalMovement {
                    period,
                    reinvested: originated,
                    reserve_added: Decimal::ZERO,
                    reserve_drawn: from_reserve,
                    reserve_balance: cash_reserve,
                });
                debug!(
                    "trial {trial}: reinvested {originated} at period {period} ({} loans)",
                    loan_ids.len()
                );
                outcome.events.push(ReinvestmentEvent {
                    period,
                    date: period_date(self.start_date, period, self.periods_per_year),
                    amount: originated,
                    source: if freed > Decimal::ZERO {
                        ReinvestmentSource::ExitProceeds
                    } else {
                        ReinvestmentSource::CashReserve
                    },
                    from_reserve,
                    strategy: self.config.strategy.name().to_string(),
                    allocations,
                    loan_ids,
                });
            } else if freed > Decimal::ZERO {
                let added = freed.min((reserve_cap - cash_reserve).max(Decimal::ZERO));
                if added > Decimal::ZERO {
                    cash_reserve += added;
                    outcome.movements.push(CapitalMovement {
                        period,
                        reinvested: Decimal::ZERO,
                        reserve_added: added,
                        reserve_drawn: Decimal::ZERO,
                        reserve_balance: cash_reserve,
                    });
                }
            }
        }

        Ok(outcome)
    }
}

fn zone_slot<'a>(holdings: &'a mut [Money], loan: &Loan) -> FundSimResult<&'a mut Money> {
    holdings
        .get_mut(loan.zone_index)
        .ok_or_else(|| FundSimError::InvalidInput {
            field: "loans.zone_index".into(),
            reason: format!("loan {} references zone index {}", loan.id, loan.zone_index),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_config;
    use crate::loans::{LoanBookConfig, SyntheticLoanBook};
    use crate::price_path::simulator::ZonePath;
    use crate::reinvestment::strategy::ReinvestmentStrategy;
    use crate::reinvestment::CashReserveConfig;
    use rust_decimal_macros::dec;

    const SEED: u64 = 42;

    fn flat_paths(zones: usize, horizon: usize) -> PricePaths {
        PricePaths {
            model: "gbm".into(),
            dt: 1.0 / 12.0,
            zones: (0..zones)
                .map(|_| ZonePath {
                    zone: String::new(),
                    values: vec![1.0; horizon + 1],
                    suburbs: vec![],
                })
                .collect(),
            regimes: None,
            property_variation: 0.0,
        }
    }

    fn book() -> SyntheticLoanBook {
        SyntheticLoanBook::new(LoanBookConfig {
            min_loan_size: dec!(10),
            max_loan_size: dec!(10),
            min_ltv: 0.5,
            max_ltv: 0.5,
            interest_rate: dec!(0.06),
            appreciation_share: dec!(0.3),
            min_hold_periods: 4,
            max_hold_periods: 4,
        })
        .unwrap()
    }

    fn base_loan(id: u64, zone_index: usize, principal: Money) -> Loan {
        Loan {
            id,
            zone: ["inner", "middle", "outer"][zone_index].into(),
            zone_index,
            suburb: None,
            suburb_index: None,
            principal,
            ltv: 0.5,
            interest_rate: dec!(0.06),
            appreciation_share: dec!(0.3),
            origination_period: 0,
            property_value: principal * dec!(2),
            property_path: vec![1.0; 13],
        }
    }

    fn engine(reinvestment: ReinvestmentConfig) -> ReinvestmentEngine {
        let mut config = sample_config();
        config.fund.size = dec!(100);
        config.reinvestment = reinvestment;
        ReinvestmentEngine::from_config(&config)
    }

    fn exits(loans: &[Loan], periods: &[Period]) -> BTreeMap<u64, LoanExit> {
        loans
            .iter()
            .zip(periods)
            .map(|(l, p)| (l.id, LoanExit::settle(l, *p).unwrap()))
            .collect()
    }

    #[test]
    fn test_exit_inside_window_is_redeployed_to_deficit_zone() {
        let loans = vec![
            base_loan(0, 0, dec!(50)),
            base_loan(1, 1, dec!(30)),
            base_loan(2, 2, dec!(20)),
        ];
        let exits = exits(&loans, &[2, 12, 12]);
        let engine = engine(ReinvestmentConfig {
            strategy: ReinvestmentStrategy::Rebalance,
            reinvestment_period_end: 6,
            ..ReinvestmentConfig::default()
        });
        let outcome = engine
            .run(&loans, &exits, &flat_paths(3, 12), &book(), &RngFactory::new(SEED), TrialId::new(0, 0))
            .unwrap();

        // 50 back in period 2 all goes to inner; the 10-sized loans exit 4
        // periods later and are redeployed again at 6, then distributed at 10
        assert_eq!(outcome.events.len(), 2);
        let first = &outcome.events[0];
        assert_eq!(first.period, 2);
        assert_eq!(first.amount, dec!(50));
        assert_eq!(first.source, ReinvestmentSource::ExitProceeds);
        assert_eq!(first.allocations.len(), 1);
        assert_eq!(first.allocations[0].zone, "inner");
        assert_eq!(first.loan_ids, vec![3, 4, 5, 6, 7]);
        assert_eq!(outcome.events[1].period, 6);
        assert_eq!(outcome.events[1].loan_ids[0], 8);
        assert!(outcome.exits.iter().all(|e| e.period > 2 && e.period <= 12));
        assert_eq!(outcome.total_reinvested(), dec!(100));
    }

    #[test]
    fn test_sub_threshold_capital_waits_in_cash_reserve() {
        let loans = vec![base_loan(0, 0, dec!(5)), base_loan(1, 0, dec!(5)), base_loan(2, 1, dec!(90))];
        let exits = exits(&loans, &[1, 2, 12]);
        let engine = engine(ReinvestmentConfig {
            strategy: ReinvestmentStrategy::MaintainAllocation,
            reinvestment_period_end: 6,
            min_reinvestment_amount: dec!(8),
            cash_reserve: Some(CashReserveConfig {
                min_fraction: dec!(0),
                max_fraction: dec!(0.2),
            }),
            ..ReinvestmentConfig::default()
        });
        let outcome = engine
            .run(&loans, &exits, &flat_paths(3, 12), &book(), &RngFactory::new(SEED), TrialId::new(0, 0))
            .unwrap();

        assert_eq!(outcome.movements[0].period, 1);
        assert_eq!(outcome.movements[0].reserve_added, dec!(5));
        // period 2: 5 freed + 5 held reaches the minimum
        let event = &outcome.events[0];
        assert_eq!(event.period, 2);
        assert_eq!(event.amount, dec!(10));
        assert_eq!(event.from_reserve, dec!(5));
        assert_eq!(outcome.movements[1].reserve_balance, Decimal::ZERO);
    }

    #[test]
    fn test_no_window_means_no_events() {
        let loans = vec![base_loan(0, 0, dec!(100))];
        let exits = exits(&loans, &[3]);
        let outcome = engine(ReinvestmentConfig::default())
            .run(&loans, &exits, &flat_paths(3, 12), &book(), &RngFactory::new(SEED), TrialId::new(0, 0))
            .unwrap();
        assert!(outcome.events.is_empty());
        assert!(outcome.movements.is_empty());
    }

    #[test]
    fn test_walk_is_reproducible() {
        let loans = vec![base_loan(0, 0, dec!(40)), base_loan(1, 2, dec!(60))];
        let exits = exits(&loans, &[2, 3]);
        let engine = engine(ReinvestmentConfig {
            reinvestment_period_end: 8,
            ..ReinvestmentConfig::default()
        });
        let run = || {
            engine
                .run(&loans, &exits, &flat_paths(3, 12), &book(), &RngFactory::new(SEED), TrialId::new(1, 2))
                .unwrap()
        };
        assert_eq!(run(), run());
    }
}
