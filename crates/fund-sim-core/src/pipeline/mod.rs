//! Single-trial orchestration.
//!
//! Price paths → loan sampling → [aggregation → waterfall → reinvestment]*
//! → metrics. The bracketed stages repeat until a reinvestment round
//! reproduces the previous round's event log.

pub mod context;
pub mod runner;

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::config::FundConfig;
use crate::error::FundSimError;
use crate::metrics::MonteCarloTrialResult;
use crate::notify::ProgressNotifier;
use crate::reinvestment::ReinvestmentEvent;
use crate::types::{with_metadata, ComputationOutput, TrialId};
use crate::waterfall::engine::{CoverageTestOutcome, TrancheSummary, WaterfallPeriod};
use crate::waterfall::AllocationReport;
use crate::FundSimResult;

pub use context::{SimulationContext, Stage};
pub use runner::{Pipeline, PipelineOutcome};

/// Detailed view of one trial.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialReport {
    pub metrics: MonteCarloTrialResult,
    pub tranches: Vec<TrancheSummary>,
    pub coverage: Vec<CoverageTestOutcome>,
    pub reinvestment_events: Vec<ReinvestmentEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocation: Option<AllocationReport>,
    /// Per-period waterfall rows, only when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub periods: Option<Vec<WaterfallPeriod>>,
}

/// Outcome of [`run_single_trial`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SingleTrialResult {
    Completed(Box<TrialReport>),
    Cancelled { stage: Stage },
}

/// Validate `config` and run one trial against the reference loan book.
pub fn run_single_trial(
    config: FundConfig,
    trial: TrialId,
    include_periods: bool,
    notifier: Arc<dyn ProgressNotifier>,
) -> FundSimResult<ComputationOutput<SingleTrialResult>> {
    let start = Instant::now();
    config.validate()?;
    let config = Arc::new(config);
    let pipeline = Pipeline::synthetic(Arc::clone(&config))?.with_notifier(notifier);

    let mut warnings = Vec::new();
    let result = match pipeline.run(trial)? {
        PipelineOutcome::Cancelled { stage } => SingleTrialResult::Cancelled { stage },
        PipelineOutcome::Completed(ctx) => {
            let ctx = *ctx;
            let (metrics, waterfall) = match (ctx.metrics, ctx.waterfall) {
                (Some(m), Some(w)) => (m, w),
                _ => {
                    return Err(FundSimError::WaterfallState(
                        "completed trial has no metrics".into(),
                    ))
                }
            };
            warnings.extend(metrics.guardrails.iter().map(|g| g.message.clone()));
            if metrics.fund_irr.is_none() {
                warnings.push("Fund IRR undefined: cashflows never change sign".into());
            }
            SingleTrialResult::Completed(Box::new(TrialReport {
                metrics,
                tranches: waterfall.tranches,
                coverage: waterfall.coverage,
                reinvestment_events: ctx.reinvestment.events,
                allocation: ctx.allocation,
                periods: include_periods.then_some(waterfall.periods),
            }))
        }
    };

    let elapsed = start.elapsed().as_micros() as u64;
    Ok(with_metadata(
        "Single fund trial: correlated price paths, priority waterfall, reinvestment to fixpoint",
        &serde_json::json!({
            "fund": config.fund.name,
            "trial": trial.to_string(),
            "seed": config.monte_carlo.seed,
            "model": config.price_path.model.name(),
            "strategy": config.reinvestment.strategy.name(),
            "horizon": config.fund.term_periods,
        }),
        warnings,
        elapsed,
        result,
    ))
}
