//! Loan-to-tranche allocation.
//!
//! Each loan goes to the first tranche, in priority order, whose LTV band
//! contains the loan's LTV and whose zone cap and remaining capacity admit
//! the loan's principal. Loans no tranche can take are reported.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::FundSimError;
use crate::loans::Loan;
use crate::types::{f64_to_money, GuardrailViolation, Money, Severity};
use crate::waterfall::tranche::TrancheConfig;
use crate::FundSimResult;

/// Eligibility rules a tranche applies to the loans it funds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllocationConstraints {
    #[serde(default)]
    pub min_ltv: Option<f64>,
    #[serde(default)]
    pub max_ltv: Option<f64>,
    /// Per-zone cap as a share of the tranche's committed size.
    #[serde(default)]
    pub max_zone_share: BTreeMap<String, f64>,
}

impl AllocationConstraints {
    pub fn validate(&self, tranche: &str, zones: &[&str]) -> FundSimResult<()> {
        let lo = self.min_ltv.unwrap_or(0.0);
        let hi = self.max_ltv.unwrap_or(1.0);
        if !(0.0..=1.0).contains(&lo) || !(0.0..=1.0).contains(&hi) || lo > hi {
            return Err(FundSimError::InvalidInput {
                field: format!("tranches.{tranche}.constraints.ltv"),
                reason: "LTV band must satisfy 0 <= min_ltv <= max_ltv <= 1".into(),
            });
        }
        for (zone, share) in &self.max_zone_share {
            if !zones.contains(&zone.as_str()) {
                return Err(FundSimError::InvalidInput {
                    field: format!("tranches.{tranche}.constraints.max_zone_share"),
                    reason: format!("Unknown zone '{zone}'"),
                });
            }
            if !(0.0..=1.0).contains(share) {
                return Err(FundSimError::InvalidInput {
                    field: format!("tranches.{tranche}.constraints.max_zone_share.{zone}"),
                    reason: "Zone share must be in [0, 1]".into(),
                });
            }
        }
        Ok(())
    }

    fn admits_ltv(&self, ltv: f64) -> bool {
        self.min_ltv.map_or(true, |lo| ltv >= lo) && self.max_ltv.map_or(true, |hi| ltv <= hi)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrancheAllocation {
    pub tranche: String,
    pub capacity: Money,
    pub allocated: Money,
    pub loan_ids: Vec<u64>,
    pub zone_mix: BTreeMap<String, Money>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationReport {
    pub tranches: Vec<TrancheAllocation>,
    pub unallocated_loan_ids: Vec<u64>,
    pub unallocated_principal: Money,
}

impl AllocationReport {
    /// Warning-severity finding when some loans fit no tranche.
    pub fn guardrail(&self) -> Option<GuardrailViolation> {
        if self.unallocated_loan_ids.is_empty() {
            return None;
        }
        Some(GuardrailViolation {
            rule: "unallocated_loans".into(),
            severity: Severity::Warning,
            message: format!(
                "{} loans ({} principal) fit no tranche's constraints",
                self.unallocated_loan_ids.len(),
                self.unallocated_principal
            ),
            period: None,
            details: serde_json::json!({
                "loan_ids": self.unallocated_loan_ids,
                "principal": self.unallocated_principal.to_string(),
            }),
        })
    }
}

/// Allocate `loans` (in id order) across `ranked` tranches.
pub fn allocate_loans(ranked: &[TrancheConfig], loans: &[Loan]) -> FundSimResult<AllocationReport> {
    let mut allocations: Vec<TrancheAllocation> = ranked
        .iter()
        .map(|t| TrancheAllocation {
            tranche: t.name.clone(),
            capacity: t.size,
            allocated: Decimal::ZERO,
            loan_ids: Vec::new(),
            zone_mix: BTreeMap::new(),
        })
        .collect();

    let mut ordered: Vec<&Loan> = loans.iter().collect();
    ordered.sort_by_key(|l| l.id);

    let mut unallocated_loan_ids = Vec::new();
    let mut unallocated_principal = Decimal::ZERO;

    'loans: for loan in ordered {
        for (tranche, slot) in ranked.iter().zip(allocations.iter_mut()) {
            if !tranche.constraints.admits_ltv(loan.ltv) {
                continue;
            }
            if slot.allocated + loan.principal > slot.capacity {
                continue;
            }
            if let Some(share) = tranche.constraints.max_zone_share.get(&loan.zone) {
                let cap = tranche.size * f64_to_money(*share, "zone share")?;
                let held = slot.zone_mix.get(&loan.zone).copied().unwrap_or_default();
                if held + loan.principal > cap {
                    continue;
                }
            }
            slot.allocated += loan.principal;
            slot.loan_ids.push(loan.id);
            *slot.zone_mix.entry(loan.zone.clone()).or_default() += loan.principal;
            continue 'loans;
        }
        unallocated_loan_ids.push(loan.id);
        unallocated_principal += loan.principal;
    }

    Ok(AllocationReport {
        tranches: allocations,
        unallocated_loan_ids,
        unallocated_principal,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waterfall::tranche::TrancheTerms;
    use rust_decimal_macros::dec;

    fn loan(id: u64, zone: &str, principal: Money, ltv: f64) -> Loan {
        Loan {
            id,
            zone: zone.into(),
            zone_index: 0,
            suburb: None,
            suburb_index: None,
            principal,
            ltv,
            interest_rate: dec!(0.06),
            appreciation_share: dec!(0.3),
            origination_period: 0,
            property_value: principal,
            property_path: vec![1.0],
        }
    }

    fn tranches() -> Vec<TrancheConfig> {
        vec![
            TrancheConfig {
                name: "Senior".into(),
                size: dec!(60),
                priority: 1,
                terms: TrancheTerms::SeniorDebt { rate: dec!(0.05) },
                constraints: AllocationConstraints {
                    min_ltv: None,
                    max_ltv: Some(0.65),
                    max_zone_share: BTreeMap::from([("outer".to_string(), 0.25)]),
                },
            },
            TrancheConfig {
                name: "Mezz".into(),
                size: dec!(40),
                priority: 2,
                terms: TrancheTerms::Mezzanine {
                    rate: dec!(0.09),
                    pik: false,
                },
                constraints: AllocationConstraints::default(),
            },
        ]
    }

    #[test]
    fn test_priority_ltv_and_zone_caps() {
        let loans = vec![
            loan(0, "inner", dec!(30), 0.6),
            loan(1, "inner", dec!(20), 0.7),  // LTV too high for senior
            loan(2, "outer", dec!(10), 0.5),  // fits the 15 outer cap
            loan(3, "outer", dec!(10), 0.5),  // would breach senior's outer cap
            loan(4, "inner", dec!(25), 0.6),  // senior full, mezz has 10 left
        ];
        let report = allocate_loans(&tranches(), &loans).unwrap();
        assert_eq!(report.tranches[0].loan_ids, vec![0, 2]);
        assert_eq!(report.tranches[0].allocated, dec!(40));
        assert_eq!(report.tranches[1].loan_ids, vec![1, 3]);
        assert_eq!(report.unallocated_loan_ids, vec![4]);
        assert_eq!(report.unallocated_principal, dec!(25));
        let warning = report.guardrail().unwrap();
        assert_eq!(warning.severity, Severity::Warning);
        assert_eq!(warning.rule, "unallocated_loans");
    }

    #[test]
    fn test_everything_allocated_has_no_guardrail() {
        let loans = vec![loan(0, "inner", dec!(10), 0.5)];
        let report = allocate_loans(&tranches(), &loans).unwrap();
        assert!(report.guardrail().is_none());
    }

    #[test]
    fn test_unknown_zone_in_constraints_rejected() {
        let c = AllocationConstraints {
            min_ltv: None,
            max_ltv: None,
            max_zone_share: BTreeMap::from([("mars".to_string(), 0.5)]),
        };
        assert!(c.validate("Senior", &["inner", "outer"]).is_err());
    }
}
