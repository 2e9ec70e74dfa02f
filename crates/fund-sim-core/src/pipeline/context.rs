use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cashflow::CashflowLedger;
use crate::config::FundConfig;
use crate::loans::{Loan, LoanExit};
use crate::metrics::MonteCarloTrialResult;
use crate::price_path::PricePaths;
use crate::reinvestment::ReinvestmentOutcome;
use crate::types::{GuardrailViolation, Money, TrialId};
use crate::waterfall::{AllocationReport, WaterfallResult};

/// Pipeline stages in execution order. The three round stages repeat
/// until the reinvestment log reaches a fixpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    PricePath,
    LoanSampling,
    CashflowAggregation,
    Waterfall,
    Reinvestment,
    Metrics,
}

impl Stage {
    /// Module name reported to the notifier.
    pub fn name(&self) -> &'static str {
        match self {
            Stage::PricePath => "price_path",
            Stage::LoanSampling => "loan_sampling",
            Stage::CashflowAggregation => "cashflow_aggregation",
            Stage::Waterfall => "waterfall",
            Stage::Reinvestment => "reinvestment",
            Stage::Metrics => "metrics",
        }
    }

    pub fn is_round_stage(&self) -> bool {
        matches!(
            self,
            Stage::CashflowAggregation | Stage::Waterfall | Stage::Reinvestment
        )
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Everything one trial accumulates. Owned by a single trial and moved
/// from stage to stage.
#[derive(Debug, Clone)]
pub struct SimulationContext {
    pub config: Arc<FundConfig>,
    pub trial: TrialId,
    pub paths: Option<PricePaths>,
    /// Loans originated at inception.
    pub base_loans: Vec<Loan>,
    pub base_exits: BTreeMap<u64, LoanExit>,
    pub allocation: Option<AllocationReport>,
    pub ledger: Option<CashflowLedger>,
    pub waterfall: Option<WaterfallResult>,
    /// Reinvestment state of the latest round.
    pub reinvestment: ReinvestmentOutcome,
    /// Findings raised outside the waterfall (allocation, round limit).
    pub guardrails: Vec<GuardrailViolation>,
    pub round: u32,
    /// Set once a reinvestment round reproduces the previous event log.
    pub converged: bool,
    pub metrics: Option<MonteCarloTrialResult>,
}

impl SimulationContext {
    pub fn new(config: Arc<FundConfig>, trial: TrialId) -> Self {
        Self {
            config,
            trial,
            paths: None,
            base_loans: Vec::new(),
            base_exits: BTreeMap::new(),
            allocation: None,
            ledger: None,
            waterfall: None,
            reinvestment: ReinvestmentOutcome::default(),
            guardrails: Vec::new(),
            round: 0,
            converged: false,
            metrics: None,
        }
    }

    /// Base loans followed by loans originated through reinvestment.
    pub fn all_loans(&self) -> Vec<Loan> {
        self.base_loans
            .iter()
            .chain(&self.reinvestment.loans)
            .cloned()
            .collect()
    }

    pub fn all_exits(&self) -> BTreeMap<u64, LoanExit> {
        let mut exits = self.base_exits.clone();
        for exit in &self.reinvestment.exits {
            exits.insert(exit.loan_id, exit.clone());
        }
        exits
    }

    /// Every finding of the trial: allocation first, then the waterfall's.
    pub fn all_guardrails(&self) -> Vec<GuardrailViolation> {
        let mut all = self.guardrails.clone();
        if let Some(waterfall) = &self.waterfall {
            all.extend(waterfall.guardrails.iter().cloned());
        }
        all
    }

    /// Compact per-stage payload for `intermediate_result` events.
    pub fn stage_summary(&self, stage: Stage) -> serde_json::Value {
        match stage {
            Stage::PricePath => serde_json::json!({
                "zones": self.paths.as_ref().map(|p| p
                    .zones
                    .iter()
                    .map(|z| serde_json::json!({
                        "zone": z.zone,
                        "final_value": z.values.last().copied().unwrap_or(1.0),
                    }))
                    .collect::<Vec<_>>()),
            }),
            Stage::LoanSampling => serde_json::json!({
                "loans": self.base_loans.len(),
                "deployed": self.base_loans.iter().map(|l| l.principal).sum::<Money>(),
                "unallocated": self.allocation.as_ref().map_or(0, |a| a.unallocated_loan_ids.len()),
            }),
            Stage::CashflowAggregation => serde_json::json!({
                "round": self.round,
                "total_income": self.ledger.as_ref().map(CashflowLedger::total_income),
                "total_losses": self.ledger.as_ref().map(CashflowLedger::total_losses),
            }),
            Stage::Waterfall => serde_json::json!({
                "round": self.round,
                "sponsor_promote": self.waterfall.as_ref().map(|w| w.sponsor_promote),
                "residual": self.waterfall.as_ref().map(|w| w.residual),
                "guardrails": self.waterfall.as_ref().map_or(0, |w| w.guardrails.len()),
            }),
            Stage::Reinvestment => serde_json::json!({
                "round": self.round,
                "events": self.reinvestment.events.len(),
                "reinvested": self.reinvestment.total_reinvested(),
                "converged": self.converged,
            }),
            Stage::Metrics => serde_json::to_value(&self.metrics).unwrap_or_default(),
        }
    }
}
