//! Per-trial summary metrics extracted once the pipeline reaches its
//! fixpoint.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::cashflow::CashflowLedger;
use crate::error::FundSimError;
use crate::reinvestment::ReinvestmentOutcome;
use crate::time_value::{irr, multiple};
use crate::types::{money_to_f64, GuardrailViolation, Money, TrialId};
use crate::waterfall::{TrancheType, WaterfallResult};
use crate::FundSimResult;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrancheReturn {
    pub name: String,
    pub tranche_type: TrancheType,
    pub committed: Money,
    /// Cash received by the tranche's investors over the horizon.
    pub total_received: Money,
    /// Annualised; `None` when the cashflows never change sign.
    pub irr: Option<f64>,
    pub multiple: f64,
}

/// Summary of one inner trial. Produced once and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonteCarloTrialResult {
    pub trial: TrialId,
    /// Gross fund IRR over deployed capital, annualised.
    pub fund_irr: Option<f64>,
    pub fund_multiple: f64,
    pub equity_irr: Option<f64>,
    pub equity_multiple: f64,
    pub tranche_returns: Vec<TrancheReturn>,
    pub guardrails: Vec<GuardrailViolation>,
    pub reinvestment_events: usize,
    pub total_reinvested: Money,
    pub sponsor_promote: Money,
    pub total_income: Money,
    pub total_losses: Money,
    /// Aggregation / waterfall / reinvestment rounds until the fixpoint.
    pub rounds: u32,
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

fn to_f64_flows(flows: &[Money], context: &str) -> FundSimResult<Vec<f64>> {
    flows
        .iter()
        .map(|cf| {
            let value = money_to_f64(*cf);
            if value.is_finite() {
                Ok(value)
            } else {
                Err(FundSimError::NumericalInstability {
                    context: format!("{context}: non-finite cashflow {cf}"),
                })
            }
        })
        .collect()
}

/// Summarise a finished trial.
pub fn extract_metrics(
    trial: TrialId,
    waterfall: &WaterfallResult,
    reinvestment: &ReinvestmentOutcome,
    ledger: &CashflowLedger,
    guardrails: Vec<GuardrailViolation>,
    periods_per_year: u32,
    rounds: u32,
) -> FundSimResult<MonteCarloTrialResult> {
    let fund_flows = to_f64_flows(&waterfall.fund_cashflows, "fund cashflows")?;
    let equity_flows = to_f64_flows(&waterfall.equity_cashflows(), "equity cashflows")?;

    let tranche_returns = waterfall
        .tranches
        .iter()
        .map(|t| {
            let flows = to_f64_flows(&t.cashflows, &t.name)?;
            let total_received = t.cashflows.iter().skip(1).copied().sum::<Money>();
            Ok(TrancheReturn {
                name: t.name.clone(),
                tranche_type: t.tranche_type,
                committed: t.committed,
                total_received,
                irr: irr(&flows, periods_per_year),
                multiple: multiple(&flows),
            })
        })
        .collect::<FundSimResult<Vec<_>>>()?;

    let (equity_irr, equity_multiple) = if equity_flows.is_empty() {
        (None, 0.0)
    } else {
        (irr(&equity_flows, periods_per_year), multiple(&equity_flows))
    };

    Ok(MonteCarloTrialResult {
        trial,
        fund_irr: irr(&fund_flows, periods_per_year),
        fund_multiple: multiple(&fund_flows),
        equity_irr,
        equity_multiple,
        tranche_returns,
        guardrails,
        reinvestment_events: reinvestment.events.len(),
        total_reinvested: reinvestment.total_reinvested(),
        sponsor_promote: waterfall.sponsor_promote,
        total_income: ledger.total_income(),
        total_losses: ledger.total_losses().max(Decimal::ZERO),
        rounds,
    })
}
