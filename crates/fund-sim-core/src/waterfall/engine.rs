//! Period-by-period priority waterfall over a cashflow ledger.
//!
//! Per period:
//! 1. Reserve: release the balance above the max fraction of senior debt,
//!    then replenish toward the target from income (the whole reserve is
//!    released in the final period)
//! 2. Coupons in priority order for fixed-claim tranches, from income and
//!    then principal cash; senior shortfalls may draw on the reserve, PIK
//!    tranches capitalise, any other shortfall becomes arrears
//! 3. Coverage tests; while any is in cure or violated, residual income
//!    pays down fixed-claim principal sequentially
//! 4. Principal cash pays fixed-claim balances sequentially
//! 5. Residual to equity tranches pro rata by commitment, each through its
//!    own return-of-capital / preferred / catch-up / carry waterfall
//!
//! All arithmetic uses `rust_decimal::Decimal`.

use std::collections::BTreeSet;
use std::time::Instant;

use chrono::NaiveDate;
use log::warn;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::cashflow::CashflowLedger;
use crate::config::FundConfig;
use crate::error::FundSimError;
use crate::types::{
    round_money, with_metadata, ComputationOutput, GuardrailViolation, Money, Period, Severity,
};
use crate::waterfall::coverage::{
    coverage_ratio, CoverageObservation, CoverageState, CoverageTest, CoverageTestConfig,
    CoverageTestKind,
};
use crate::waterfall::equity::EquityAccount;
use crate::waterfall::reserve::{ReserveAccount, ReserveConfig};
use crate::waterfall::tranche::{rank_tranches, TrancheConfig, TrancheTerms, TrancheType};
use crate::FundSimResult;

// ---------------------------------------------------------------------------
// Input / Output types
// ---------------------------------------------------------------------------

/// Standalone waterfall run over a supplied ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaterfallInput {
    pub tranches: Vec<TrancheConfig>,
    #[serde(default)]
    pub reserve: Option<ReserveConfig>,
    #[serde(default)]
    pub coverage_tests: Vec<CoverageTestConfig>,
    #[serde(default = "default_periods_per_year")]
    pub periods_per_year: u32,
    #[serde(default)]
    pub fail_fast_on_violation: bool,
    pub ledger: CashflowLedger,
}

fn default_periods_per_year() -> u32 {
    12
}

/// What one tranche received in one period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranchePeriodPayment {
    pub tranche: String,
    /// Scheduled coupon plus arrears brought forward.
    pub interest_due: Money,
    pub interest_paid: Money,
    /// Coupon added to the balance of a PIK tranche.
    pub capitalised: Money,
    /// Unpaid coupon carried to the next period.
    pub arrears: Money,
    pub principal_paid: Money,
    /// Equity distribution to investors.
    pub distribution: Money,
    /// Equity distribution to the sponsor (catch-up and carry).
    pub sponsor_distribution: Money,
    /// Outstanding balance (unreturned capital for equity).
    pub ending_balance: Money,
}

impl TranchePeriodPayment {
    /// Cash to the tranche's investors.
    pub fn cash_to_investors(&self) -> Money {
        self.interest_paid + self.principal_paid + self.distribution
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaterfallPeriod {
    pub period: Period,
    pub date: NaiveDate,
    pub income: Money,
    pub principal_available: Money,
    pub reserve_released: Money,
    pub reserve_funded: Money,
    pub reserve_drawn: Money,
    pub reserve_balance: Money,
    /// Residual income redirected to principal by coverage tests.
    pub diverted: Money,
    pub payments: Vec<TranchePeriodPayment>,
    pub coverage: Vec<CoverageObservation>,
    /// Cash with no equity tranche to receive it.
    pub residual: Money,
}

impl WaterfallPeriod {
    pub fn total_paid(&self) -> Money {
        self.payments
            .iter()
            .map(|p| p.cash_to_investors() + p.sponsor_distribution)
            .sum::<Money>()
            + self.residual
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrancheSummary {
    pub name: String,
    pub tranche_type: TrancheType,
    pub committed: Money,
    pub interest_paid: Money,
    pub capitalised_interest: Money,
    pub principal_paid: Money,
    pub distributions: Money,
    pub sponsor_promote: Money,
    pub ending_balance: Money,
    pub arrears: Money,
    /// Investor cashflows: `-committed` at inception, then cash per period.
    pub cashflows: Vec<Money>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageTestOutcome {
    pub test: String,
    pub state: CoverageState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaterfallResult {
    pub periods: Vec<WaterfallPeriod>,
    pub tranches: Vec<TrancheSummary>,
    pub coverage: Vec<CoverageTestOutcome>,
    pub guardrails: Vec<GuardrailViolation>,
    pub sponsor_promote: Money,
    pub residual: Money,
    /// Gross fund cashflows: `-deployed` at inception, then everything paid
    /// out per period (sponsor promote included).
    pub fund_cashflows: Vec<Money>,
}

impl WaterfallResult {
    pub fn tranche(&self, name: &str) -> Option<&TrancheSummary> {
        self.tranches.iter().find(|t| t.name == name)
    }

    /// Periods that ended with a coverage test in cure or violated.
    pub fn diverting_periods(&self) -> BTreeSet<Period> {
        self.periods
            .iter()
            .filter(|p| p.coverage.iter().any(|o| o.state != CoverageState::Passing))
            .map(|p| p.period)
            .collect()
    }

    /// Combined investor cashflows of all equity tranches.
    pub fn equity_cashflows(&self) -> Vec<Money> {
        let mut combined: Vec<Money> = Vec::new();
        for tranche in self
            .tranches
            .iter()
            .filter(|t| t.tranche_type == TrancheType::Equity)
        {
            if combined.len() < tranche.cashflows.len() {
                combined.resize(tranche.cashflows.len(), Decimal::ZERO);
            }
            for (slot, cf) in combined.iter_mut().zip(&tranche.cashflows) {
                *slot += *cf;
            }
        }
        combined
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WaterfallEngine {
    ranked: Vec<TrancheConfig>,
    reserve: Option<ReserveConfig>,
    tests: Vec<CoverageTestConfig>,
    periods_per_year: u32,
    fail_fast_on_violation: bool,
}

/// Mutable per-tranche state during a run.
struct TrancheState {
    balance: Money,
    arrears: Money,
    summary: TrancheSummary,
}

impl WaterfallEngine {
    pub fn new(
        tranches: &[TrancheConfig],
        reserve: Option<ReserveConfig>,
        tests: Vec<CoverageTestConfig>,
        periods_per_year: u32,
        fail_fast_on_violation: bool,
    ) -> FundSimResult<Self> {
        let committed: Money = tranches.iter().map(|t| t.size).sum();
        let ranked = rank_tranches(tranches, committed)?;
        if let Some(reserve) = &reserve {
            reserve.validate()?;
        }
        for test in &tests {
            test.validate(&ranked)?;
        }
        if periods_per_year == 0 {
            return Err(FundSimError::InvalidInput {
                field: "periods_per_year".into(),
                reason: "Must be at least 1".into(),
            });
        }
        Ok(Self {
            ranked,
            reserve,
            tests,
            periods_per_year,
            fail_fast_on_violation,
        })
    }

    pub fn from_config(config: &FundConfig) -> FundSimResult<Self> {
        Self::new(
            &config.tranches,
            config.reserve.clone(),
            config.coverage_tests.clone(),
            config.fund.periods_per_year,
            config.waterfall.fail_fast_on_violation,
        )
    }

    pub fn ranked(&self) -> &[TrancheConfig] {
        &self.ranked
    }

    /// Distribute every period of `ledger`.
    pub fn run(&self, ledger: &CashflowLedger) -> FundSimResult<WaterfallResult> {
        let ppy = Decimal::from(self.periods_per_year);

        let mut states: Vec<TrancheState> = self
            .ranked
            .iter()
            .map(|t| TrancheState {
                balance: if t.terms.has_fixed_claim() { t.size } else { Decimal::ZERO },
                arrears: Decimal::ZERO,
                summary: TrancheSummary {
                    name: t.name.clone(),
                    tranche_type: t.terms.tranche_type(),
                    committed: t.size,
                    interest_paid: Decimal::ZERO,
                    capitalised_interest: Decimal::ZERO,
                    principal_paid: Decimal::ZERO,
                    distributions: Decimal::ZERO,
                    sponsor_promote: Decimal::ZERO,
                    ending_balance: t.size,
                    arrears: Decimal::ZERO,
                    cashflows: vec![-t.size],
                },
            })
            .collect();
        let mut equity: Vec<Option<EquityAccount>> =
            self.ranked.iter().map(EquityAccount::from_tranche).collect();
        let equity_committed: Money = equity.iter().flatten().map(|e| e.committed).sum();
        let equity_count = equity.iter().flatten().count();

        let mut tests: Vec<CoverageTest> = self
            .tests
            .iter()
            .map(|t| CoverageTest::new(t.clone(), &self.ranked))
            .collect::<FundSimResult<_>>()?;
        let mut reserve = self.reserve.clone().map(ReserveAccount::new);

        let mut periods = Vec::with_capacity(ledger.periods.len());
        let mut guardrails = Vec::new();
        let mut fund_cashflows = vec![-ledger.deployed];
        let mut residual_total = Decimal::ZERO;
        let mut reserve_was_below = false;
        let last_index = ledger.periods.len().saturating_sub(1);

        for (index, row) in ledger.periods.iter().enumerate() {
            let last = index == last_index;
            let period = row.period;
            let senior_outstanding = senior_balance(&self.ranked, &states);

            let mut income = row.income();
            let mut principal = row.distributable_principal();
            let mut reserve_released = Decimal::ZERO;
            let mut reserve_funded = Decimal::ZERO;
            let mut reserve_drawn = Decimal::ZERO;

            // 1. Reserve
            if let Some(account) = reserve.as_mut() {
                reserve_released = if last {
                    account.release_all()
                } else {
                    account.release_excess(senior_outstanding)
                };
                income += reserve_released;
                if !last {
                    reserve_funded = account.replenish(senior_outstanding, income);
                    income -= reserve_funded;
                }
            }
            let available = income + principal;

            for account in equity.iter_mut().flatten() {
                account.accrue(self.periods_per_year);
            }

            let mut payments: Vec<TranchePeriodPayment> = states
                .iter()
                .map(|s| TranchePeriodPayment {
                    tranche: s.summary.name.clone(),
                    interest_due: Decimal::ZERO,
                    interest_paid: Decimal::ZERO,
                    capitalised: Decimal::ZERO,
                    arrears: Decimal::ZERO,
                    principal_paid: Decimal::ZERO,
                    distribution: Decimal::ZERO,
                    sponsor_distribution: Decimal::ZERO,
                    ending_balance: s.balance,
                })
                .collect();

            // 2. Coupons
            for (i, tranche) in self.ranked.iter().enumerate() {
                let Some(rate) = tranche.terms.coupon_rate() else {
                    continue;
                };
                let state = &mut states[i];
                let scheduled = round_money(state.balance * rate / ppy);
                payments[i].interest_due = scheduled + state.arrears;

                if tranche.terms.is_pik() {
                    state.balance += scheduled;
                    payments[i].capitalised = scheduled;
                    payments[i].ending_balance = state.balance;
                    continue;
                }

                let due = scheduled + state.arrears;
                let from_income = due.min(income);
                income -= from_income;
                let from_principal = (due - from_income).min(principal);
                principal -= from_principal;
                let mut paid = from_income + from_principal;

                if paid < due && matches!(tranche.terms, TrancheTerms::SeniorDebt { .. }) {
                    if let Some(account) = reserve.as_mut() {
                        let drawn = account.draw(due - paid);
                        reserve_drawn += drawn;
                        paid += drawn;
                    }
                }

                state.arrears = due - paid;
                payments[i].interest_paid = paid;
                payments[i].arrears = state.arrears;
            }

            // 3. Coverage tests
            let mut observations = Vec::with_capacity(tests.len());
            for test in tests.iter_mut() {
                let ratio = if test.is_due(period) {
                    self.test_ratio(test, row.collateral_value, row.income(), &states, &payments)
                } else {
                    None
                };
                let observation = test.advance(period, ratio);
                if observation.newly_violated {
                    warn!("coverage test '{}' violated at period {period}", observation.test);
                    guardrails.push(violation_guardrail(test, &observation));
                    if self.fail_fast_on_violation {
                        return Err(FundSimError::CoverageViolation {
                            test: observation.test,
                            period,
                        });
                    }
                }
                observations.push(observation);
            }

            let mut diverted = Decimal::ZERO;
            if tests.iter().any(CoverageTest::is_diverting) {
                diverted = pay_down_sequential(&self.ranked, &mut states, &mut payments, &mut income);
            }

            // 4. Principal
            pay_down_sequential(&self.ranked, &mut states, &mut payments, &mut principal);

            // 5. Equity
            let mut residual = income + principal;
            if equity_count > 0 {
                let mut assigned = Decimal::ZERO;
                let mut seen = 0;
                for (i, slot) in equity.iter_mut().enumerate() {
                    let Some(account) = slot.as_mut() else {
                        continue;
                    };
                    seen += 1;
                    let share = if seen == equity_count {
                        residual - assigned
                    } else if equity_committed > Decimal::ZERO {
                        round_money(residual * account.committed / equity_committed)
                    } else {
                        Decimal::ZERO
                    };
                    assigned += share;
                    let split = account.distribute(share);
                    payments[i].distribution = split.to_investors();
                    payments[i].sponsor_distribution = split.to_sponsor();
                    payments[i].ending_balance = account.unreturned_capital;
                }
                residual = Decimal::ZERO;
            }
            residual_total += residual;

            let reserve_balance = reserve.as_ref().map_or(Decimal::ZERO, ReserveAccount::balance);
            let period_record = WaterfallPeriod {
                period,
                date: row.date,
                income: row.income(),
                principal_available: row.distributable_principal(),
                reserve_released,
                reserve_funded,
                reserve_drawn,
                reserve_balance,
                diverted,
                payments,
                coverage: observations,
                residual,
            };

            let paid_out = period_record.total_paid();
            if paid_out - (available + reserve_drawn) > payment_tolerance() {
                return Err(FundSimError::WaterfallState(format!(
                    "period {period} paid {paid_out} from {} available",
                    available + reserve_drawn
                )));
            }
            fund_cashflows.push(paid_out);

            for (state, payment) in states.iter_mut().zip(&period_record.payments) {
                let s = &mut state.summary;
                s.interest_paid += payment.interest_paid;
                s.capitalised_interest += payment.capitalised;
                s.principal_paid += payment.principal_paid;
                s.distributions += payment.distribution;
                s.sponsor_promote += payment.sponsor_distribution;
                s.arrears = state.arrears;
                s.cashflows.push(payment.cash_to_investors());
            }

            // Reserve floor
            let senior_after = senior_balance(&self.ranked, &states);
            if let Some(account) = reserve.as_ref() {
                let below = !last && senior_after > Decimal::ZERO && account.below_minimum(senior_after);
                if below && !reserve_was_below {
                    guardrails.push(GuardrailViolation {
                        rule: "reserve_below_minimum".into(),
                        severity: Severity::Warning,
                        message: format!(
                            "Reserve {} is below its minimum against senior debt {senior_after}",
                            account.balance()
                        ),
                        period: Some(period),
                        details: serde_json::json!({
                            "balance": account.balance().to_string(),
                            "senior_outstanding": senior_after.to_string(),
                        }),
                    });
                }
                reserve_was_below = below;
            }

            periods.push(period_record);
        }

        for ((state, account), tranche) in states.iter_mut().zip(&equity).zip(&self.ranked) {
            state.summary.ending_balance = match account {
                Some(account) => account.unreturned_capital,
                None if tranche.terms.has_fixed_claim() => state.balance,
                None => Decimal::ZERO,
            };
        }

        let tranches: Vec<TrancheSummary> = states.into_iter().map(|s| s.summary).collect();
        let sponsor_promote = tranches.iter().map(|t| t.sponsor_promote).sum();

        Ok(WaterfallResult {
            periods,
            tranches,
            coverage: tests
                .iter()
                .map(|t| CoverageTestOutcome {
                    test: t.config().name.clone(),
                    state: t.state(),
                })
                .collect(),
            guardrails,
            sponsor_promote,
            residual: residual_total,
            fund_cashflows,
        })
    }

    fn test_ratio(
        &self,
        test: &CoverageTest,
        collateral: Money,
        income: Money,
        states: &[TrancheState],
        payments: &[TranchePeriodPayment],
    ) -> Option<f64> {
        let covered = || {
            self.ranked
                .iter()
                .enumerate()
                .take(test.level() + 1)
                .filter(|(_, t)| t.terms.has_fixed_claim())
                .map(|(i, _)| i)
        };
        match test.config().kind {
            CoverageTestKind::Overcollateralization => {
                let owed: Money = covered().map(|i| states[i].balance).sum();
                coverage_ratio(collateral, owed)
            }
            CoverageTestKind::InterestCoverage => {
                let due: Money = covered().map(|i| payments[i].interest_due).sum();
                coverage_ratio(income, due)
            }
        }
    }
}

/// Overpayment allowed before a period is rejected. Amounts are rounded to
/// cents, so only precision lost on user-supplied ledgers lands here.
fn payment_tolerance() -> Money {
    Decimal::new(1, 4)
}

fn senior_balance(ranked: &[TrancheConfig], states: &[TrancheState]) -> Money {
    ranked
        .iter()
        .zip(states)
        .filter(|(t, _)| matches!(t.terms, TrancheTerms::SeniorDebt { .. }))
        .map(|(_, s)| s.balance)
        .sum()
}

/// Pay fixed-claim balances in priority order out of `cash`; returns the
/// total paid.
fn pay_down_sequential(
    ranked: &[TrancheConfig],
    states: &mut [TrancheState],
    payments: &mut [TranchePeriodPayment],
    cash: &mut Money,
) -> Money {
    let mut total = Decimal::ZERO;
    for (i, tranche) in ranked.iter().enumerate() {
        if !tranche.terms.has_fixed_claim() || *cash <= Decimal::ZERO {
            continue;
        }
        let pay = states[i].balance.min(*cash);
        states[i].balance -= pay;
        *cash -= pay;
        total += pay;
        payments[i].principal_paid += pay;
        payments[i].ending_balance = states[i].balance;
    }
    total
}

fn violation_guardrail(test: &CoverageTest, observation: &CoverageObservation) -> GuardrailViolation {
    let since = match observation.state {
        CoverageState::Violated { since, .. } => since,
        _ => observation.period,
    };
    GuardrailViolation {
        rule: "coverage_violation".into(),
        severity: Severity::Critical,
        message: format!(
            "Coverage test '{}' failed at period {since} and was not cured by period {}",
            observation.test, observation.period
        ),
        period: Some(observation.period),
        details: serde_json::json!({
            "test": observation.test,
            "kind": test.config().kind,
            "threshold": test.config().threshold,
            "failed_since": since,
            "ratio": observation.ratio,
        }),
    }
}

/// Run a waterfall over a supplied ledger.
pub fn calculate_waterfall(input: &WaterfallInput) -> FundSimResult<ComputationOutput<WaterfallResult>> {
    let start = Instant::now();
    let engine = WaterfallEngine::new(
        &input.tranches,
        input.reserve.clone(),
        input.coverage_tests.clone(),
        input.periods_per_year,
        input.fail_fast_on_violation,
    )?;
    let result = engine.run(&input.ledger)?;

    let mut warnings: Vec<String> = result.guardrails.iter().map(|g| g.message.clone()).collect();
    if result.residual > Decimal::ZERO {
        warnings.push(format!(
            "{} of residual cash had no equity tranche to receive it",
            result.residual
        ));
    }

    let elapsed = start.elapsed().as_micros() as u64;
    Ok(with_metadata(
        "Sequential priority waterfall with reserve, coverage tests and equity carry",
        &serde_json::json!({
            "num_tranches": input.tranches.len(),
            "num_periods": input.ledger.periods.len(),
            "periods_per_year": input.periods_per_year,
            "reserve": input.reserve.is_some(),
            "coverage_tests": input.coverage_tests.len(),
        }),
        warnings,
        elapsed,
        result,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cashflow::PeriodCashflow;
    use crate::waterfall::allocation::AllocationConstraints;
    use rust_decimal_macros::dec;

    fn tranche(name: &str, size: Money, priority: u32, terms: TrancheTerms) -> TrancheConfig {
        TrancheConfig {
            name: name.into(),
            size,
            priority,
            terms,
            constraints: AllocationConstraints::default(),
        }
    }

    fn ledger(flows: &[(Money, Money, Money)]) -> CashflowLedger {
        let start = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        CashflowLedger {
            deployed: dec!(100),
            periods: flows
                .iter()
                .enumerate()
                .map(|(i, (interest, principal, collateral))| PeriodCashflow {
                    interest: *interest,
                    principal_repaid: *principal,
                    collateral_value: *collateral,
                    ..PeriodCashflow::new(i as u32 + 1, start)
                })
                .collect(),
        }
    }

    fn senior_equity() -> Vec<TrancheConfig> {
        vec![
            tranche("Senior", dec!(80), 1, TrancheTerms::SeniorDebt { rate: dec!(0.12) }),
            tranche(
                "Equity",
                dec!(20),
                2,
                TrancheTerms::Equity {
                    hurdle_rate: dec!(0.12),
                    catch_up: dec!(1),
                    carry: dec!(0.2),
                },
            ),
        ]
    }

    #[test]
    fn test_senior_shortfall_becomes_arrears() {
        let engine = WaterfallEngine::new(&senior_equity(), None, vec![], 12, false).unwrap();
        // coupon 0.8 per month
        let result = engine
            .run(&ledger(&[(dec!(0.5), dec!(0), dec!(100)), (dec!(2), dec!(0), dec!(100))]))
            .unwrap();
        let p1 = &result.periods[0].payments[0];
        assert_eq!(p1.interest_paid, dec!(0.5));
        assert_eq!(p1.arrears, dec!(0.3));
        let p2 = &result.periods[1].payments[0];
        assert_eq!(p2.interest_due, dec!(1.1));
        assert_eq!(p2.interest_paid, dec!(1.1));
        assert_eq!(p2.arrears, Decimal::ZERO);
        // equity saw nothing in period 1
        assert_eq!(result.periods[0].payments[1].distribution, Decimal::ZERO);
    }

    #[test]
    fn test_reserve_covers_senior_shortfall() {
        let reserve = ReserveConfig {
            target_fraction: dec!(0.05),
            min_fraction: dec!(0.01),
            max_fraction: dec!(0.1),
            replenishment_rate: dec!(1),
        };
        let engine = WaterfallEngine::new(&senior_equity(), Some(reserve), vec![], 12, false).unwrap();
        let result = engine
            .run(&ledger(&[
                (dec!(10), dec!(0), dec!(100)),
                (dec!(0), dec!(0), dec!(100)),
                (dec!(0), dec!(0), dec!(100)),
            ]))
            .unwrap();
        // target 4 funded first, then the coupon
        assert_eq!(result.periods[0].reserve_funded, dec!(4));
        assert_eq!(result.periods[0].payments[0].interest_paid, dec!(0.8));
        // no income: coupon drawn from the reserve
        assert_eq!(result.periods[1].reserve_drawn, dec!(0.8));
        assert_eq!(result.periods[1].payments[0].arrears, Decimal::ZERO);
        // final period releases the rest
        assert_eq!(result.periods[2].reserve_released, dec!(3.2));
        assert_eq!(result.periods[2].reserve_balance, Decimal::ZERO);
    }

    #[test]
    fn test_pik_capitalises_and_never_takes_cash() {
        let tranches = vec![
            tranche("Senior", dec!(60), 1, TrancheTerms::SeniorDebt { rate: dec!(0.12) }),
            tranche(
                "Mezz",
                dec!(20),
                2,
                TrancheTerms::Mezzanine {
                    rate: dec!(0.12),
                    pik: true,
                },
            ),
        ];
        let engine = WaterfallEngine::new(&tranches, None, vec![], 12, false).unwrap();
        let result = engine.run(&ledger(&[(dec!(0.5), dec!(0), dec!(100))])).unwrap();
        let period = &result.periods[0];
        assert_eq!(period.payments[0].arrears, dec!(0.1));
        assert_eq!(period.payments[1].capitalised, dec!(0.2));
        assert_eq!(period.payments[1].interest_paid, Decimal::ZERO);
        assert_eq!(period.payments[1].ending_balance, dec!(20.2));
        assert_eq!(result.tranches[1].ending_balance, dec!(20.2));
    }

    #[test]
    fn test_principal_sequential_then_equity() {
        let engine = WaterfallEngine::new(&senior_equity(), None, vec![], 12, false).unwrap();
        let result = engine
            .run(&ledger(&[(dec!(0.8), dec!(90), dec!(100))]))
            .unwrap();
        let period = &result.periods[0];
        assert_eq!(period.payments[0].principal_paid, dec!(80));
        assert_eq!(period.payments[0].ending_balance, Decimal::ZERO);
        // 10 left: return of capital only
        assert_eq!(period.payments[1].distribution, dec!(10));
        assert_eq!(period.payments[1].ending_balance, dec!(10));
        assert_eq!(result.sponsor_promote, Decimal::ZERO);
        assert_eq!(result.fund_cashflows, vec![dec!(-100), dec!(90.8)]);
    }

    #[test]
    fn test_diversion_while_in_cure() {
        let test = CoverageTestConfig {
            name: "senior_oc".into(),
            kind: CoverageTestKind::Overcollateralization,
            threshold: 1.2,
            frequency_periods: 1,
            cure_periods: 3,
            through_tranche: Some("Senior".into()),
        };
        let engine = WaterfallEngine::new(&senior_equity(), None, vec![test], 12, false).unwrap();
        // collateral 90 against 80 senior: ratio 1.125 fails
        let result = engine.run(&ledger(&[(dec!(5), dec!(0), dec!(90))])).unwrap();
        let period = &result.periods[0];
        assert_eq!(period.coverage[0].state, CoverageState::InCure { since: 1 });
        assert_eq!(period.diverted, dec!(4.2));
        assert_eq!(period.payments[0].principal_paid, dec!(4.2));
        assert_eq!(period.payments[1].distribution, Decimal::ZERO);
    }

    #[test]
    fn test_fail_fast_on_violation() {
        let test = CoverageTestConfig {
            name: "senior_oc".into(),
            kind: CoverageTestKind::Overcollateralization,
            threshold: 1.2,
            frequency_periods: 1,
            cure_periods: 0,
            through_tranche: None,
        };
        let lenient = WaterfallEngine::new(&senior_equity(), None, vec![test.clone()], 12, false).unwrap();
        let flows = [(dec!(1), dec!(0), dec!(50))];
        let result = lenient.run(&ledger(&flows)).unwrap();
        assert_eq!(result.guardrails.len(), 1);
        assert_eq!(result.guardrails[0].severity, Severity::Critical);

        let strict = WaterfallEngine::new(&senior_equity(), None, vec![test], 12, true).unwrap();
        assert!(matches!(
            strict.run(&ledger(&flows)),
            Err(FundSimError::CoverageViolation { period: 1, .. })
        ));
    }

    #[test]
    fn test_calculate_waterfall_envelope() {
        let input = WaterfallInput {
            tranches: vec![tranche("Senior", dec!(100), 1, TrancheTerms::SeniorDebt { rate: dec!(0.12) })],
            reserve: None,
            coverage_tests: vec![],
            periods_per_year: 12,
            fail_fast_on_violation: false,
            ledger: ledger(&[(dec!(3), dec!(0), dec!(100))]),
        };
        let output = calculate_waterfall(&input).unwrap();
        assert_eq!(output.result.residual, dec!(2));
        assert_eq!(output.warnings.len(), 1);
        assert_eq!(output.metadata.precision, "rust_decimal_128bit");
    }
}
