use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::cashflow::aggregate;
use crate::config::FundConfig;
use crate::error::FundSimError;
use crate::loans::{sample_checked_exit, LoanBook, OriginationRequest, SyntheticLoanBook};
use crate::metrics::extract_metrics;
use crate::notify::{CancellationToken, NoopNotifier, ProgressNotifier, SimulationEvent};
use crate::pipeline::context::{SimulationContext, Stage};
use crate::price_path::PricePathSimulator;
use crate::reinvestment::{split_amount, ReinvestmentEngine};
use crate::rng::{RngFactory, Stream};
use crate::types::{GuardrailViolation, Severity, TrialId};
use crate::waterfall::{allocate_loans, WaterfallEngine, WaterfallResult};
use crate::FundSimResult;

/// How a trial ended when it did not fail.
#[derive(Debug)]
pub enum PipelineOutcome {
    Completed(Box<SimulationContext>),
    /// Cancelled before `stage` started.
    Cancelled { stage: Stage },
}

impl PipelineOutcome {
    pub fn context(&self) -> Option<&SimulationContext> {
        match self {
            PipelineOutcome::Completed(ctx) => Some(ctx),
            PipelineOutcome::Cancelled { .. } => None,
        }
    }
}

/// Unwrap a stage result, returning early on cancellation.
macro_rules! advance {
    ($step:expr) => {
        match $step? {
            ControlFlow::Continue(ctx) => ctx,
            ControlFlow::Break(stage) => return Ok(PipelineOutcome::Cancelled { stage }),
        }
    };
}

/// Runs single trials for one (validated) configuration.
///
/// Construction builds the price-path simulator and the waterfall and
/// reinvestment engines once; each [`Pipeline::run`] then owns a fresh
/// [`SimulationContext`].
pub struct Pipeline {
    config: Arc<FundConfig>,
    book: Arc<dyn LoanBook>,
    rngs: RngFactory,
    simulator: PricePathSimulator,
    waterfall: WaterfallEngine,
    reinvestment: ReinvestmentEngine,
    notifier: Arc<dyn ProgressNotifier>,
    cancel: CancellationToken,
    budget: Option<Duration>,
}

impl Pipeline {
    pub fn new(config: Arc<FundConfig>, book: Arc<dyn LoanBook>) -> FundSimResult<Self> {
        Ok(Self {
            rngs: RngFactory::new(config.monte_carlo.seed),
            simulator: PricePathSimulator::from_config(&config)?,
            waterfall: WaterfallEngine::from_config(&config)?,
            reinvestment: ReinvestmentEngine::from_config(&config),
            budget: config.monte_carlo.trial_timeout_ms.map(Duration::from_millis),
            notifier: Arc::new(NoopNotifier),
            cancel: CancellationToken::new(),
            config,
            book,
        })
    }

    /// Pipeline backed by the reference [`SyntheticLoanBook`].
    pub fn synthetic(config: Arc<FundConfig>) -> FundSimResult<Self> {
        let book = Arc::new(SyntheticLoanBook::new(config.loans.clone())?);
        Self::new(config, book)
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn ProgressNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_budget(mut self, budget: Option<Duration>) -> Self {
        self.budget = budget;
        self
    }

    pub fn config(&self) -> &Arc<FundConfig> {
        &self.config
    }

    /// Run one trial end to end.
    pub fn run(&self, trial: TrialId) -> FundSimResult<PipelineOutcome> {
        let started = Instant::now();
        let ctx = SimulationContext::new(Arc::clone(&self.config), trial);

        let ctx = advance!(self.step(ctx, Stage::PricePath, started, Self::price_path));
        let mut ctx = advance!(self.step(ctx, Stage::LoanSampling, started, Self::loan_sampling));

        let max_rounds = self.config.reinvestment.max_rounds;
        loop {
            ctx.round += 1;
            ctx = advance!(self.step(ctx, Stage::CashflowAggregation, started, Self::aggregation));
            ctx = advance!(self.step(ctx, Stage::Waterfall, started, Self::distribution));
            ctx = advance!(self.step(ctx, Stage::Reinvestment, started, Self::reinvest));
            if ctx.converged {
                break;
            }
            if ctx.round >= max_rounds {
                warn!(
                    "trial {}: reinvestment still changing after {max_rounds} rounds",
                    ctx.trial
                );
                ctx.guardrails.push(unconverged(max_rounds));
                break;
            }
        }

        let ctx = advance!(self.step(ctx, Stage::Metrics, started, Self::summarise));
        Ok(PipelineOutcome::Completed(Box::new(ctx)))
    }

    /// Cancellation and budget checks, then the stage, bracketed by
    /// notifier events.
    fn step<F>(
        &self,
        ctx: SimulationContext,
        stage: Stage,
        started: Instant,
        run: F,
    ) -> FundSimResult<ControlFlow<Stage, SimulationContext>>
    where
        F: FnOnce(&Self, SimulationContext) -> FundSimResult<SimulationContext>,
    {
        if self.cancel.is_cancelled() {
            debug!("trial {}: cancelled before {stage}", ctx.trial);
            return Ok(ControlFlow::Break(stage));
        }
        if let Some(budget) = self.budget {
            let elapsed = started.elapsed();
            if elapsed >= budget {
                return Err(FundSimError::TrialTimeout {
                    elapsed_ms: elapsed.as_millis() as u64,
                    budget_ms: budget.as_millis() as u64,
                });
            }
        }

        let trial = ctx.trial;
        let round = ctx.round;
        self.notifier.notify(SimulationEvent::ModuleStarted {
            module: stage.name().into(),
        });
        let stage_start = Instant::now();
        let ctx = match run(self, ctx) {
            Ok(ctx) => ctx,
            Err(e) => {
                self.notifier.notify(SimulationEvent::Error {
                    module: stage.name().into(),
                    message: e.to_string(),
                });
                return Err(e);
            }
        };
        let execution_time_ms = stage_start.elapsed().as_millis() as u64;
        debug!("trial {trial}: {stage} (round {round}) took {execution_time_ms} ms");

        self.notifier.notify(SimulationEvent::ModuleCompleted {
            module: stage.name().into(),
            execution_time_ms,
        });
        self.notifier.notify(SimulationEvent::Progress {
            module: stage.name().into(),
            percent: progress(stage, round),
            message: if stage.is_round_stage() {
                format!("trial {trial}: {stage} round {round}")
            } else {
                format!("trial {trial}: {stage}")
            },
        });
        if self.notifier.wants_intermediate_results() {
            self.notifier.notify(SimulationEvent::IntermediateResult {
                module: stage.name().into(),
                data: ctx.stage_summary(stage),
            });
        }
        Ok(ControlFlow::Continue(ctx))
    }

    // -----------------------------------------------------------------------
    // Stages
    // -----------------------------------------------------------------------

    fn price_path(&self, mut ctx: SimulationContext) -> FundSimResult<SimulationContext> {
        let mut rng = self.rngs.stream(ctx.trial, Stream::PricePath);
        let mut suburb_rng = self.rngs.stream(ctx.trial, Stream::SuburbNoise);
        ctx.paths = Some(self.simulator.generate(&mut rng, &mut suburb_rng)?);
        Ok(ctx)
    }

    /// Deploy the fund at inception by target zone mix, sample every exit
    /// and place the loans in tranches.
    fn loan_sampling(&self, mut ctx: SimulationContext) -> FundSimResult<SimulationContext> {
        let paths = ctx.paths.as_ref().ok_or_else(|| missing("price paths"))?;
        let zones: Vec<String> = self.config.zones.iter().map(|z| z.name.clone()).collect();
        let allocations = split_amount(self.config.fund.size, &zones, &self.config.target_weights())?;

        let request = OriginationRequest {
            period: 0,
            allocations,
            first_id: 0,
        };
        let mut rng = self.rngs.stream(ctx.trial, Stream::LoanOrigination);
        let loans = self.book.originate(&request, paths, &mut rng)?;

        for loan in &loans {
            let exit = sample_checked_exit(self.book.as_ref(), loan, paths, &self.rngs, ctx.trial)?;
            ctx.base_exits.insert(loan.id, exit);
        }

        let report = allocate_loans(self.waterfall.ranked(), &loans)?;
        if let Some(violation) = report.guardrail() {
            ctx.guardrails.push(violation);
        }
        ctx.allocation = Some(report);
        ctx.base_loans = loans;
        Ok(ctx)
    }

    fn aggregation(&self, mut ctx: SimulationContext) -> FundSimResult<SimulationContext> {
        let ledger = aggregate(
            &ctx.all_loans(),
            &ctx.all_exits(),
            &ctx.reinvestment.movements,
            self.config.fund.term_periods,
            self.config.fund.periods_per_year,
            self.config.fund.start_date,
        )?;
        ctx.ledger = Some(ledger);
        Ok(ctx)
    }

    fn distribution(&self, mut ctx: SimulationContext) -> FundSimResult<SimulationContext> {
        let ledger = ctx.ledger.as_ref().ok_or_else(|| missing("cashflow ledger"))?;
        ctx.waterfall = Some(self.waterfall.run(ledger)?);
        Ok(ctx)
    }

    /// Re-walk reinvestment from the base portfolio, suspended in the
    /// periods this round's waterfall spent diverting. The round has
    /// converged when the event log matches the previous round's.
    fn reinvest(&self, mut ctx: SimulationContext) -> FundSimResult<SimulationContext> {
        let paths = ctx.paths.as_ref().ok_or_else(|| missing("price paths"))?;
        let suspended = ctx
            .waterfall
            .as_ref()
            .map(WaterfallResult::diverting_periods)
            .unwrap_or_default();
        let outcome = self.reinvestment.run_suspended(
            &ctx.base_loans,
            &ctx.base_exits,
            paths,
            self.book.as_ref(),
            &self.rngs,
            ctx.trial,
            &suspended,
        )?;
        ctx.converged = outcome.events == ctx.reinvestment.events;
        ctx.reinvestment = outcome;
        Ok(ctx)
    }

    fn summarise(&self, mut ctx: SimulationContext) -> FundSimResult<SimulationContext> {
        let waterfall = ctx.waterfall.as_ref().ok_or_else(|| missing("waterfall result"))?;
        let ledger = ctx.ledger.as_ref().ok_or_else(|| missing("cashflow ledger"))?;
        let guardrails = ctx.all_guardrails();
        for violation in &guardrails {
            self.notifier.notify(SimulationEvent::GuardrailViolation {
                violation: violation.clone(),
            });
        }
        let metrics = extract_metrics(
            ctx.trial,
            waterfall,
            &ctx.reinvestment,
            ledger,
            guardrails,
            self.config.fund.periods_per_year,
            ctx.round,
        )?;
        ctx.metrics = Some(metrics);
        Ok(ctx)
    }
}

/// The ledger and waterfall reported are those of the last round run.
fn unconverged(max_rounds: u32) -> GuardrailViolation {
    GuardrailViolation {
        rule: "reinvestment_not_converged".into(),
        severity: Severity::Warning,
        message: format!("Reinvestment rounds stopped at the limit of {max_rounds}"),
        period: None,
        details: serde_json::json!({ "max_rounds": max_rounds }),
    }
}

fn missing(what: &str) -> FundSimError {
    FundSimError::WaterfallState(format!("{what} not available at this stage"))
}

/// Fractional completion after `stage`. Rounds converge geometrically
/// toward 0.9 so progress never moves backwards.
fn progress(stage: Stage, round: u32) -> f64 {
    let in_round = |k: f64| 0.2 + 0.7 * (1.0 - 0.5f64.powf(f64::from(round.max(1) - 1) + k / 3.0));
    match stage {
        Stage::PricePath => 0.1,
        Stage::LoanSampling => 0.2,
        Stage::CashflowAggregation => in_round(1.0),
        Stage::Waterfall => in_round(2.0),
        Stage::Reinvestment => in_round(3.0),
        Stage::Metrics => 1.0,
    }
}
