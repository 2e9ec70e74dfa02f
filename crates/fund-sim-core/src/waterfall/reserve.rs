use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::FundSimError;
use crate::types::{round_money, Money, Rate};
use crate::FundSimResult;

/// Liquidity reserve sized against outstanding senior debt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReserveConfig {
    pub target_fraction: Rate,
    pub min_fraction: Rate,
    pub max_fraction: Rate,
    /// Share of the shortfall to target restored per period.
    pub replenishment_rate: Rate,
}

impl ReserveConfig {
    pub fn validate(&self) -> FundSimResult<()> {
        if self.min_fraction < Decimal::ZERO
            || self.min_fraction > self.target_fraction
            || self.target_fraction > self.max_fraction
        {
            return Err(FundSimError::InvalidInput {
                field: "reserve".into(),
                reason: "Require 0 <= min_fraction <= target_fraction <= max_fraction".into(),
            });
        }
        if self.replenishment_rate <= Decimal::ZERO || self.replenishment_rate > Decimal::ONE {
            return Err(FundSimError::InvalidInput {
                field: "reserve.replenishment_rate".into(),
                reason: "Must be in (0, 1]".into(),
            });
        }
        Ok(())
    }
}

/// Reserve balance. Only the waterfall engine moves cash in or out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReserveAccount {
    config: ReserveConfig,
    balance: Money,
}

impl ReserveAccount {
    pub fn new(config: ReserveConfig) -> Self {
        Self {
            config,
            balance: Decimal::ZERO,
        }
    }

    pub fn balance(&self) -> Money {
        self.balance
    }

    /// Release and return the balance above `max_fraction x senior`.
    pub fn release_excess(&mut self, senior_outstanding: Money) -> Money {
        let cap = round_money(self.config.max_fraction * senior_outstanding);
        let excess = (self.balance - cap).max(Decimal::ZERO);
        self.balance -= excess;
        excess
    }

    /// Move up to `replenishment_rate` of the shortfall to target out of
    /// `available`; returns the amount taken.
    pub fn replenish(&mut self, senior_outstanding: Money, available: Money) -> Money {
        let target = round_money(self.config.target_fraction * senior_outstanding);
        let shortfall = (target - self.balance).max(Decimal::ZERO);
        let funded = round_money(shortfall * self.config.replenishment_rate)
            .min(available.max(Decimal::ZERO));
        self.balance += funded;
        funded
    }

    /// Draw up to `amount`; returns the amount drawn.
    pub fn draw(&mut self, amount: Money) -> Money {
        let drawn = amount.max(Decimal::ZERO).min(self.balance);
        self.balance -= drawn;
        drawn
    }

    /// Empty the account (fund wind-down).
    pub fn release_all(&mut self) -> Money {
        std::mem::take(&mut self.balance)
    }

    pub fn below_minimum(&self, senior_outstanding: Money) -> bool {
        self.balance < self.config.min_fraction * senior_outstanding
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn account() -> ReserveAccount {
        ReserveAccount::new(ReserveConfig {
            target_fraction: dec!(0.05),
            min_fraction: dec!(0.02),
            max_fraction: dec!(0.08),
            replenishment_rate: dec!(0.5),
        })
    }

    #[test]
    fn test_replenish_restores_fraction_of_shortfall() {
        let mut r = account();
        // target 5 on senior 100, shortfall 5, half restored
        assert_eq!(r.replenish(dec!(100), dec!(10)), dec!(2.5));
        assert_eq!(r.replenish(dec!(100), dec!(10)), dec!(1.25));
        assert_eq!(r.balance(), dec!(3.75));
        assert!(!r.below_minimum(dec!(100)));
    }

    #[test]
    fn test_replenish_limited_by_available_cash() {
        let mut r = account();
        assert_eq!(r.replenish(dec!(100), dec!(1)), dec!(1));
        assert!(r.below_minimum(dec!(100)));
    }

    #[test]
    fn test_release_above_max_after_paydown() {
        let mut r = account();
        r.replenish(dec!(100), dec!(10));
        r.replenish(dec!(100), dec!(10));
        // senior paid down to 20: cap 1.6
        assert_eq!(r.release_excess(dec!(20)), dec!(2.15));
        assert_eq!(r.balance(), dec!(1.6));
    }

    #[test]
    fn test_draw_and_release_all() {
        let mut r = account();
        r.replenish(dec!(100), dec!(10));
        assert_eq!(r.draw(dec!(1)), dec!(1));
        assert_eq!(r.draw(dec!(100)), dec!(1.5));
        assert_eq!(r.release_all(), Decimal::ZERO);
    }

    #[test]
    fn test_config_ordering() {
        let bad = ReserveConfig {
            target_fraction: dec!(0.01),
            min_fraction: dec!(0.02),
            max_fraction: dec!(0.08),
            replenishment_rate: dec!(0.5),
        };
        assert!(bad.validate().is_err());
    }
}
