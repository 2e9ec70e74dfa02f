use std::collections::{HashMap, HashSet};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::FundSimError;
use crate::types::{Money, Rate};
use crate::waterfall::allocation::AllocationConstraints;
use crate::FundSimResult;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Type-specific economics of a tranche. All rates are annual.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TrancheTerms {
    SeniorDebt {
        rate: Rate,
    },
    Mezzanine {
        rate: Rate,
        /// Capitalise the coupon into the balance instead of paying cash.
        #[serde(default)]
        pik: bool,
    },
    PreferredEquity {
        preferred_return: Rate,
    },
    Equity {
        /// Preferred return accrued on unreturned capital.
        hurdle_rate: Rate,
        /// Sponsor share of distributions during the catch-up tier.
        #[serde(default = "default_catch_up")]
        catch_up: Rate,
        /// Sponsor share of profit once caught up.
        carry: Rate,
    },
}

fn default_catch_up() -> Rate {
    Decimal::ONE
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrancheType {
    SeniorDebt,
    Mezzanine,
    PreferredEquity,
    Equity,
}

impl TrancheTerms {
    pub fn tranche_type(&self) -> TrancheType {
        match self {
            TrancheTerms::SeniorDebt { .. } => TrancheType::SeniorDebt,
            TrancheTerms::Mezzanine { .. } => TrancheType::Mezzanine,
            TrancheTerms::PreferredEquity { .. } => TrancheType::PreferredEquity,
            TrancheTerms::Equity { .. } => TrancheType::Equity,
        }
    }

    /// Coupon (or preferred coupon) rate for tranches with a fixed claim.
    pub fn coupon_rate(&self) -> Option<Rate> {
        match self {
            TrancheTerms::SeniorDebt { rate } | TrancheTerms::Mezzanine { rate, .. } => Some(*rate),
            TrancheTerms::PreferredEquity { preferred_return } => Some(*preferred_return),
            TrancheTerms::Equity { .. } => None,
        }
    }

    /// Senior and mezzanine debt.
    pub fn is_debt(&self) -> bool {
        matches!(
            self,
            TrancheTerms::SeniorDebt { .. } | TrancheTerms::Mezzanine { .. }
        )
    }

    /// Tranches with a balance repaid from principal cash.
    pub fn has_fixed_claim(&self) -> bool {
        !self.is_equity()
    }

    pub fn is_equity(&self) -> bool {
        matches!(self, TrancheTerms::Equity { .. })
    }

    pub fn is_pik(&self) -> bool {
        matches!(self, TrancheTerms::Mezzanine { pik: true, .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrancheConfig {
    pub name: String,
    /// Committed size.
    pub size: Money,
    /// Lower is paid first.
    pub priority: u32,
    pub terms: TrancheTerms,
    #[serde(default)]
    pub constraints: AllocationConstraints,
}

// ---------------------------------------------------------------------------
// Ranking
// ---------------------------------------------------------------------------

/// Validate tranche terms and return the tranches in payment order.
///
/// Rejects empty structures, duplicate names, tied priorities and total
/// commitments above `fund_size`.
pub fn rank_tranches(tranches: &[TrancheConfig], fund_size: Money) -> FundSimResult<Vec<TrancheConfig>> {
    if tranches.is_empty() {
        return Err(FundSimError::InsufficientData(
            "At least one tranche is required".into(),
        ));
    }

    let mut by_priority: HashMap<u32, &str> = HashMap::new();
    let mut names: HashSet<&str> = HashSet::new();
    for tranche in tranches {
        if !names.insert(tranche.name.as_str()) {
            return Err(FundSimError::InvalidInput {
                field: "tranches.name".into(),
                reason: format!("Duplicate tranche '{}'", tranche.name),
            });
        }
        if let Some(first) = by_priority.insert(tranche.priority, tranche.name.as_str()) {
            return Err(FundSimError::DuplicatePriority {
                priority: tranche.priority,
                first: first.to_string(),
                second: tranche.name.clone(),
            });
        }
        validate_terms(tranche)?;
    }

    let total: Money = tranches.iter().map(|t| t.size).sum();
    if total > fund_size {
        return Err(FundSimError::InvalidInput {
            field: "tranches.size".into(),
            reason: format!("Tranche sizes sum to {total}, above fund size {fund_size}"),
        });
    }

    let mut ranked = tranches.to_vec();
    ranked.sort_by_key(|t| t.priority);
    Ok(ranked)
}

fn validate_terms(tranche: &TrancheConfig) -> FundSimResult<()> {
    let field = |f: &str| format!("tranches.{}.{f}", tranche.name);
    if tranche.size < Decimal::ZERO {
        return Err(FundSimError::InvalidInput {
            field: field("size"),
            reason: "Tranche size cannot be negative".into(),
        });
    }
    if let Some(rate) = tranche.terms.coupon_rate() {
        if rate < Decimal::ZERO {
            return Err(FundSimError::InvalidInput {
                field: field("rate"),
                reason: "Rate cannot be negative".into(),
            });
        }
    }
    if let TrancheTerms::Equity {
        hurdle_rate,
        catch_up,
        carry,
    } = &tranche.terms
    {
        if *hurdle_rate < Decimal::ZERO {
            return Err(FundSimError::InvalidInput {
                field: field("hurdle_rate"),
                reason: "Hurdle rate cannot be negative".into(),
            });
        }
        if *carry < Decimal::ZERO || *carry >= Decimal::ONE {
            return Err(FundSimError::InvalidInput {
                field: field("carry"),
                reason: "Carry must be in [0, 1)".into(),
            });
        }
        if *catch_up <= Decimal::ZERO || *catch_up > Decimal::ONE {
            return Err(FundSimError::InvalidInput {
                field: field("catch_up"),
                reason: "Catch-up share must be in (0, 1]".into(),
            });
        }
    }
    Ok(())
}
