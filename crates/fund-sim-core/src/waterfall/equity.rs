//! Equity-tranche distribution waterfall (European, cumulative).
//!
//! Cash reaching an equity tranche is split tier by tier:
//! return of capital -> preferred return -> sponsor catch-up -> carry.
//! The preferred return accrues every period on unreturned capital, so the
//! sponsor participates only once the hurdle is cleared on a cumulative
//! basis.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{round_money, Money, Rate};
use crate::waterfall::tranche::{TrancheConfig, TrancheTerms};

/// One period's split of the cash an equity tranche received.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EquityDistribution {
    pub return_of_capital: Money,
    pub preferred_return: Money,
    /// Catch-up tier, investor and sponsor portions.
    pub catch_up_investor: Money,
    pub catch_up_sponsor: Money,
    /// Carried-interest split of the remainder.
    pub carry_investor: Money,
    pub carry_sponsor: Money,
}

impl EquityDistribution {
    pub fn to_investors(&self) -> Money {
        self.return_of_capital + self.preferred_return + self.catch_up_investor + self.carry_investor
    }

    pub fn to_sponsor(&self) -> Money {
        self.catch_up_sponsor + self.carry_sponsor
    }

    pub fn total(&self) -> Money {
        self.to_investors() + self.to_sponsor()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityAccount {
    pub name: String,
    pub committed: Money,
    hurdle_rate: Rate,
    catch_up: Rate,
    carry: Rate,
    /// Capital not yet returned.
    pub unreturned_capital: Money,
    /// Preferred return accrued and not yet paid.
    pub preferred_owed: Money,
    pub preferred_paid: Money,
    /// Cumulative amount that has passed through the catch-up tier.
    pub catch_up_distributed: Money,
    pub sponsor_total: Money,
    pub investor_total: Money,
}

impl EquityAccount {
    /// `None` for tranches that are not equity.
    pub fn from_tranche(tranche: &TrancheConfig) -> Option<Self> {
        match &tranche.terms {
            TrancheTerms::Equity {
                hurdle_rate,
                catch_up,
                carry,
            } => Some(Self {
                name: tranche.name.clone(),
                committed: tranche.size,
                hurdle_rate: *hurdle_rate,
                catch_up: *catch_up,
                carry: *carry,
                unreturned_capital: tranche.size,
                preferred_owed: Decimal::ZERO,
                preferred_paid: Decimal::ZERO,
                catch_up_distributed: Decimal::ZERO,
                sponsor_total: Decimal::ZERO,
                investor_total: Decimal::ZERO,
            }),
            _ => None,
        }
    }

    /// Accrue one period of preferred return on unreturned capital.
    pub fn accrue(&mut self, periods_per_year: u32) -> Money {
        let accrued = round_money(
            self.unreturned_capital * self.hurdle_rate / Decimal::from(periods_per_year.max(1)),
        );
        self.preferred_owed += accrued;
        accrued
    }

    /// Distribute `cash` through the tiers. All of it is distributed.
    pub fn distribute(&mut self, cash: Money) -> EquityDistribution {
        let mut remaining = cash.max(Decimal::ZERO);
        let mut out = EquityDistribution::default();

        // Return of capital
        let roc = remaining.min(self.unreturned_capital);
        self.unreturned_capital -= roc;
        remaining -= roc;
        out.return_of_capital = roc;

        // Preferred return
        let pref = remaining.min(self.preferred_owed);
        self.preferred_owed -= pref;
        self.preferred_paid += pref;
        remaining -= pref;
        out.preferred_return = pref;

        // Cash left here means capital and preferred return are fully paid.
        if remaining > Decimal::ZERO {
            // Catch-up: sponsor brought to `carry` of cumulative profit
            let target = round_money(self.carry / (Decimal::ONE - self.carry) * self.preferred_paid);
            let tier = remaining.min((target - self.catch_up_distributed).max(Decimal::ZERO));
            self.catch_up_distributed += tier;
            remaining -= tier;
            out.catch_up_sponsor = round_money(tier * self.catch_up);
            out.catch_up_investor = tier - out.catch_up_sponsor;

            // Carry split
            out.carry_sponsor = round_money(remaining * self.carry);
            out.carry_investor = remaining - out.carry_sponsor;
        }

        self.sponsor_total += out.to_sponsor();
        self.investor_total += out.to_investors();
        out
    }
}
