use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::FundSimError;
use crate::price_path::PricePaths;
use crate::reinvestment::DynamicAllocationConfig;
use crate::types::{f64_to_money, money_to_f64, round_money, Money, Period, ZoneAmount};
use crate::FundSimResult;

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReinvestmentStrategy {
    /// Keep the current realised zone mix (the target mix when empty).
    #[default]
    MaintainAllocation,
    /// Fill the largest deficit against the target mix first.
    Rebalance,
    /// Favour zones whose trailing appreciation clears a threshold.
    Opportunistic {
        appreciation_threshold: f64,
        lookback_periods: u32,
    },
    /// Target mix scaled by per-zone preference multipliers.
    Custom { preferences: BTreeMap<String, f64> },
}

/// What a strategy sees when choosing weights.
#[derive(Debug, Clone, Copy)]
pub struct AllocationContext<'a> {
    pub zones: &'a [String],
    /// Configured target mix, summing to one.
    pub targets: &'a [f64],
    /// Principal of live loans per zone.
    pub holdings: &'a [Money],
    pub paths: &'a PricePaths,
    pub period: Period,
}

impl ReinvestmentStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            ReinvestmentStrategy::MaintainAllocation => "maintain_allocation",
            ReinvestmentStrategy::Rebalance => "rebalance",
            ReinvestmentStrategy::Opportunistic { .. } => "opportunistic",
            ReinvestmentStrategy::Custom { .. } => "custom",
        }
    }

    pub fn validate(&self, zones: &[&str]) -> FundSimResult<()> {
        match self {
            ReinvestmentStrategy::Opportunistic {
                appreciation_threshold,
                lookback_periods,
            } => {
                if !appreciation_threshold.is_finite() {
                    return Err(FundSimError::InvalidInput {
                        field: "reinvestment.strategy.appreciation_threshold".into(),
                        reason: "Must be finite".into(),
                    });
                }
                if *lookback_periods == 0 {
                    return Err(FundSimError::InvalidInput {
                        field: "reinvestment.strategy.lookback_periods".into(),
                        reason: "Must be at least 1".into(),
                    });
                }
            }
            ReinvestmentStrategy::Custom { preferences } => {
                for (zone, multiplier) in preferences {
                    if !zones.contains(&zone.as_str()) {
                        return Err(FundSimError::InvalidInput {
                            field: "reinvestment.strategy.preferences".into(),
                            reason: format!("Unknown zone '{zone}'"),
                        });
                    }
                    if !(multiplier.is_finite() && *multiplier >= 0.0) {
                        return Err(FundSimError::InvalidInput {
                            field: format!("reinvestment.strategy.preferences.{zone}"),
                            reason: "Multiplier must be finite and >= 0".into(),
                        });
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Zone weights (summing to one) for deploying `amount`.
    pub fn weights(&self, amount: Money, ctx: &AllocationContext<'_>) -> FundSimResult<Vec<f64>> {
        let weights = match self {
            ReinvestmentStrategy::MaintainAllocation => {
                let held: Money = ctx.holdings.iter().copied().sum();
                if held <= Decimal::ZERO {
                    ctx.targets.to_vec()
                } else {
                    ctx.holdings.iter().map(|h| money_to_f64(*h / held)).collect()
                }
            }
            ReinvestmentStrategy::Rebalance => rebalance(amount, ctx)?,
            ReinvestmentStrategy::Opportunistic {
                appreciation_threshold,
                lookback_periods,
            } => {
                let appreciation: Vec<f64> = (0..ctx.zones.len())
                    .map(|i| ctx.paths.trailing_appreciation(i, ctx.period, *lookback_periods))
                    .collect();
                let qualifying: Vec<bool> =
                    appreciation.iter().map(|a| *a >= *appreciation_threshold).collect();
                if !qualifying.iter().any(|q| *q) {
                    ctx.targets.to_vec()
                } else {
                    let raw: Vec<f64> = appreciation
                        .iter()
                        .zip(&qualifying)
                        .map(|(a, q)| if *q { a.max(0.0) } else { 0.0 })
                        .collect();
                    if raw.iter().sum::<f64>() > 0.0 {
                        raw
                    } else {
                        qualifying.iter().map(|q| if *q { 1.0 } else { 0.0 }).collect()
                    }
                }
            }
            ReinvestmentStrategy::Custom { preferences } => {
                let raw: Vec<f64> = ctx
                    .zones
                    .iter()
                    .zip(ctx.targets)
                    .map(|(zone, target)| target * preferences.get(zone).copied().unwrap_or(1.0))
                    .collect();
                if raw.iter().sum::<f64>() > 0.0 {
                    raw
                } else {
                    ctx.targets.to_vec()
                }
            }
        };
        Ok(normalise(weights).unwrap_or_else(|| ctx.targets.to_vec()))
    }
}

/// Largest deficit against `targets x (held + amount)` first, then the
/// next; whatever is left after every deficit is filled follows the target
/// mix.
fn rebalance(amount: Money, ctx: &AllocationContext<'_>) -> FundSimResult<Vec<f64>> {
    if amount <= Decimal::ZERO {
        return Ok(ctx.targets.to_vec());
    }
    let held: Money = ctx.holdings.iter().copied().sum();
    let total_after = held + amount;

    let mut deficits: Vec<(usize, Money)> = Vec::with_capacity(ctx.zones.len());
    for (i, (target, holding)) in ctx.targets.iter().zip(ctx.holdings).enumerate() {
        let deficit = f64_to_money(*target, "target allocation")? * total_after - *holding;
        deficits.push((i, deficit));
    }
    deficits.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    let mut allocated = vec![Decimal::ZERO; ctx.zones.len()];
    let mut remaining = amount;
    for (i, deficit) in deficits {
        if remaining <= Decimal::ZERO || deficit <= Decimal::ZERO {
            break;
        }
        let fill = deficit.min(remaining);
        allocated[i] += fill;
        remaining -= fill;
    }
    if remaining > Decimal::ZERO {
        for (slot, target) in allocated.iter_mut().zip(ctx.targets) {
            *slot += remaining * f64_to_money(*target, "target allocation")?;
        }
    }

    Ok(allocated.iter().map(|a| money_to_f64(*a / amount)).collect())
}

fn normalise(weights: Vec<f64>) -> Option<Vec<f64>> {
    let clean: Vec<f64> = weights
        .into_iter()
        .map(|w| if w.is_finite() { w.max(0.0) } else { 0.0 })
        .collect();
    let sum: f64 = clean.iter().sum();
    if sum <= 0.0 {
        return None;
    }
    Some(clean.into_iter().map(|w| w / sum).collect())
}

// ---------------------------------------------------------------------------
// Dynamic allocation
// ---------------------------------------------------------------------------

/// Shift each weight by `sensitivity x (appreciation - mean appreciation)`,
/// capped at `max_adjustment`, then renormalise.
pub fn apply_dynamic(
    weights: &[f64],
    config: &DynamicAllocationConfig,
    paths: &PricePaths,
    period: Period,
) -> Vec<f64> {
    if weights.is_empty() {
        return Vec::new();
    }
    let appreciation: Vec<f64> = (0..weights.len())
        .map(|i| paths.trailing_appreciation(i, period, config.lookback_periods))
        .collect();
    let mean = appreciation.iter().sum::<f64>() / appreciation.len() as f64;
    let shifted: Vec<f64> = weights
        .iter()
        .zip(&appreciation)
        .map(|(w, a)| {
            let adjustment = (config.sensitivity * (a - mean))
                .clamp(-config.max_adjustment, config.max_adjustment);
            w + adjustment
        })
        .collect();
    normalise(shifted).unwrap_or_else(|| weights.to_vec())
}

// ---------------------------------------------------------------------------
// Splitting
// ---------------------------------------------------------------------------

/// Split `amount` across `zones` by `weights`, to the cent. The last zone
/// with positive weight takes the rounding remainder; zero amounts are
/// dropped.
pub fn split_amount(amount: Money, zones: &[String], weights: &[f64]) -> FundSimResult<Vec<ZoneAmount>> {
    let weights = normalise(weights.to_vec()).ok_or_else(|| FundSimError::InvalidInput {
        field: "reinvestment.weights".into(),
        reason: "Zone weights sum to zero".into(),
    })?;
    let last = weights.iter().rposition(|w| *w > 0.0).unwrap_or(0);

    let mut out = Vec::new();
    let mut assigned = Decimal::ZERO;
    for (i, (zone, weight)) in zones.iter().zip(&weights).enumerate() {
        let share = if i == last {
            amount - assigned
        } else {
            round_money(amount * f64_to_money(*weight, "zone weight")?)
        };
        assigned += share;
        if share > Decimal::ZERO {
            out.push(ZoneAmount {
                zone: zone.clone(),
                amount: share,
            });
        }
        if i == last {
            break;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::price_path::simulator::ZonePath;
    use rust_decimal_macros::dec;

    fn zones() -> Vec<String> {
        vec!["a".into(), "b".into(), "c".into()]
    }

    /// Zone a doubles over the window, b is flat, c falls 10%.
    fn paths() -> PricePaths {
        let path = |end: f64| ZonePath {
            zone: String::new(),
            values: vec![1.0, 1.0, end],
            suburbs: vec![],
        };
        PricePaths {
            model: "gbm".into(),
            dt: 1.0,
            zones: vec![path(2.0), path(1.0), path(0.9)],
            regimes: None,
            property_variation: 0.0,
        }
    }

    fn ctx<'a>(
        zones: &'a [String],
        holdings: &'a [Money],
        paths: &'a PricePaths,
    ) -> AllocationContext<'a> {
        AllocationContext {
            zones,
            targets: &[0.5, 0.3, 0.2],
            holdings,
            paths,
            period: 2,
        }
    }

    #[test]
    fn test_rebalance_fills_single_deficit_entirely() {
        let zones = zones();
        let paths = paths();
        let holdings = [dec!(30), dec!(30), dec!(20)];
        // after 10 more: targets 45 / 27 / 18, only zone a is short
        let w = ReinvestmentStrategy::Rebalance
            .weights(dec!(10), &ctx(&zones, &holdings, &paths))
            .unwrap();
        assert_eq!(w, vec![1.0, 0.0, 0.0]);
        let split = split_amount(dec!(10), &zones, &w).unwrap();
        assert_eq!(
            split,
            vec![ZoneAmount {
                zone: "a".into(),
                amount: dec!(10)
            }]
        );
    }

    #[test]
    fn test_rebalance_remainder_follows_targets() {
        let zones = zones();
        let paths = paths();
        let holdings = [dec!(0), dec!(0), dec!(0)];
        let w = ReinvestmentStrategy::Rebalance
            .weights(dec!(100), &ctx(&zones, &holdings, &paths))
            .unwrap();
        let split = split_amount(dec!(100), &zones, &w).unwrap();
        let amounts: Vec<Money> = split.iter().map(|z| z.amount).collect();
        assert_eq!(amounts, vec![dec!(50), dec!(30), dec!(20)]);
    }

    #[test]
    fn test_maintain_uses_realised_mix() {
        let zones = zones();
        let paths = paths();
        let holdings = [dec!(10), dec!(10), dec!(0)];
        let w = ReinvestmentStrategy::MaintainAllocation
            .weights(dec!(10), &ctx(&zones, &holdings, &paths))
            .unwrap();
        assert_eq!(w, vec![0.5, 0.5, 0.0]);

        let empty = [dec!(0), dec!(0), dec!(0)];
        let w = ReinvestmentStrategy::MaintainAllocation
            .weights(dec!(10), &ctx(&zones, &empty, &paths))
            .unwrap();
        assert!((w[0] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_opportunistic_threshold_and_fallback() {
        let zones = zones();
        let paths = paths();
        let holdings = [dec!(0), dec!(0), dec!(0)];
        let hot = ReinvestmentStrategy::Opportunistic {
            appreciation_threshold: 0.05,
            lookback_periods: 2,
        };
        assert_eq!(
            hot.weights(dec!(10), &ctx(&zones, &holdings, &paths)).unwrap(),
            vec![1.0, 0.0, 0.0]
        );
        let unreachable = ReinvestmentStrategy::Opportunistic {
            appreciation_threshold: 5.0,
            lookback_periods: 2,
        };
        let w = unreachable.weights(dec!(10), &ctx(&zones, &holdings, &paths)).unwrap();
        assert!((w[1] - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_custom_preferences_renormalised() {
        let zones = zones();
        let paths = paths();
        let holdings = [dec!(0), dec!(0), dec!(0)];
        let custom = ReinvestmentStrategy::Custom {
            preferences: BTreeMap::from([("a".to_string(), 0.0), ("c".to_string(), 2.0)]),
        };
        let w = custom.weights(dec!(10), &ctx(&zones, &holdings, &paths)).unwrap();
        // 0 / 0.3 / 0.4 renormalised
        assert!(w[0].abs() < 1e-12);
        assert!((w[1] - 0.3 / 0.7).abs() < 1e-12);
        assert!((w[2] - 0.4 / 0.7).abs() < 1e-12);
    }

    #[test]
    fn test_dynamic_tilt_is_capped() {
        let paths = paths();
        let config = DynamicAllocationConfig {
            lookback_periods: 2,
            max_adjustment: 0.1,
            sensitivity: 1.0,
        };
        let w = apply_dynamic(&[0.4, 0.3, 0.3], &config, &paths, 2);
        // appreciation 1.0 / 0.0 / -0.1, mean 0.3: shifts +0.1 / -0.1 / -0.1
        assert!((w[0] - 0.5 / 0.9).abs() < 1e-12);
        assert!((w[1] - 0.2 / 0.9).abs() < 1e-12);
        assert!((w.iter().sum::<f64>() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_split_amount_is_exact() {
        let zones = zones();
        let split = split_amount(dec!(100), &zones, &[1.0, 1.0, 1.0]).unwrap();
        let total: Money = split.iter().map(|z| z.amount).sum();
        assert_eq!(total, dec!(100));
        assert_eq!(split[0].amount, dec!(33.33));
        assert_eq!(split[2].amount, dec!(33.34));
        assert!(split_amount(dec!(1), &zones, &[0.0, 0.0, 0.0]).is_err());
    }
}
