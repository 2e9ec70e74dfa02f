use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::{info, warn};
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::{FundConfig, Variation};
use crate::error::FundSimError;
use crate::loans::{LoanBook, SyntheticLoanBook};
use crate::metrics::MonteCarloTrialResult;
use crate::monte_carlo::frontier::{efficient_frontier, FrontierPoint};
use crate::monte_carlo::risk::{compute_risk_metrics, risk_guardrails, RiskMetrics};
use crate::monte_carlo::stress::StressOutcome;
use crate::notify::{CancellationToken, NoopNotifier, ProgressNotifier, SimulationEvent};
use crate::pipeline::{Pipeline, PipelineOutcome};
use crate::rng::{RngFactory, Stream};
use crate::types::{with_metadata_f64, ComputationOutput, GuardrailViolation, TrialId};
use crate::FundSimResult;

const MODULE: &str = "monte_carlo";

/// Builds the loan book for one (possibly perturbed) configuration.
pub type LoanBookFactory = dyn Fn(&FundConfig) -> FundSimResult<Arc<dyn LoanBook>> + Send + Sync;

/// [`LoanBookFactory`] for the reference synthetic loan book.
pub fn synthetic_loan_book(config: &FundConfig) -> FundSimResult<Arc<dyn LoanBook>> {
    Ok(Arc::new(SyntheticLoanBook::new(config.loans.clone())?))
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TrialStatus {
    Succeeded { result: MonteCarloTrialResult },
    Failed { message: String, kind: String },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub outer: u32,
    pub inner: u32,
    pub status: TrialStatus,
}

impl TrialRecord {
    pub fn result(&self) -> Option<&MonteCarloTrialResult> {
        match &self.status {
            TrialStatus::Succeeded { result } => Some(result),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepStatus {
    Complete,
    /// Cancelled part-way; completed trials are still reported.
    Partial,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OuterTrialResult {
    pub outer: u32,
    pub variation: Variation,
    pub leverage: f64,
    pub trials: Vec<TrialRecord>,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Absent when no inner trial produced a defined fund IRR.
    pub risk: Option<RiskMetrics>,
    pub guardrails: Vec<GuardrailViolation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepResult {
    pub status: SweepStatus,
    pub seed: u64,
    pub outer_trials: Vec<OuterTrialResult>,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub frontier: Vec<FrontierPoint>,
    pub execution_time_ms: u64,
}

/// One pipeline run: `slot` 0 is the base case, `slot` k the k-th stress
/// scenario.
struct Job {
    /// Position in the job list; fail-fast reports the lowest failing one.
    index: usize,
    slot: usize,
    outer: u32,
    inner: u32,
}

enum JobOutput {
    Done(MonteCarloTrialResult),
    Failed(FundSimError),
    Cancelled,
}

// ---------------------------------------------------------------------------
// Sweep
// ---------------------------------------------------------------------------

/// Configuration behind outer trial `outer`: the base configuration for
/// outer trial 0, a seeded perturbation of it otherwise.
pub fn outer_variant(config: &FundConfig, outer: u32) -> FundSimResult<(FundConfig, Variation)> {
    let (variant, variation) = if outer == 0 {
        (config.clone(), Variation::identity(config.zones.len()))
    } else {
        let rngs = RngFactory::new(config.monte_carlo.seed);
        let mut rng = rngs.stream(TrialId::new(outer, 0), Stream::Variation);
        config.perturbed(config.monte_carlo.variation_factor, &mut rng)?
    };
    variant.validate()?;
    Ok((variant, variation))
}

/// Run the full nested sweep.
///
/// Preconditions are checked before any trial runs. Trial failures are
/// recorded per trial unless `monte_carlo.fail_fast` is set, in which case
/// the lowest-indexed failure is returned.
pub fn run_monte_carlo(
    config: &FundConfig,
    book_factory: &LoanBookFactory,
    notifier: Arc<dyn ProgressNotifier>,
    cancel: &CancellationToken,
) -> FundSimResult<ComputationOutput<SweepResult>> {
    let start = Instant::now();
    config.validate()?;
    let mc = &config.monte_carlo;
    let n_outer = mc.num_simulations;
    let n_inner = mc.num_inner_simulations;
    let scenarios = &mc.stress_scenarios;

    let variants: Vec<(FundConfig, Variation)> = (0..n_outer)
        .map(|outer| outer_variant(config, outer))
        .collect::<FundSimResult<_>>()?;

    let stage_notifier: Arc<dyn ProgressNotifier> = if mc.report_trial_stages {
        Arc::clone(&notifier)
    } else {
        Arc::new(NoopNotifier)
    };
    let mut pipelines = Vec::with_capacity(variants.len() * (1 + scenarios.len()));
    for slot in 0..=scenarios.len() {
        for (variant, _) in &variants {
            let variant = match slot {
                0 => variant.clone(),
                s => variant.stressed(&scenarios[s - 1]),
            };
            let book = book_factory(&variant)?;
            pipelines.push(
                Pipeline::new(Arc::new(variant), book)?
                    .with_notifier(Arc::clone(&stage_notifier))
                    .with_cancellation(cancel.clone()),
            );
        }
    }

    let jobs: Vec<Job> = (0..=scenarios.len())
        .flat_map(|slot| {
            (0..n_outer).flat_map(move |outer| (0..n_inner).map(move |inner| (slot, outer, inner)))
        })
        .enumerate()
        .map(|(index, (slot, outer, inner))| Job {
            index,
            slot,
            outer,
            inner,
        })
        .collect();
    let total = jobs.len();
    info!(
        "monte carlo: {n_outer} outer x {n_inner} inner trials, {} stress scenarios, seed {}",
        scenarios.len(),
        mc.seed
    );
    notifier.notify(SimulationEvent::ModuleStarted {
        module: MODULE.into(),
    });

    // Under fail-fast, jobs after the lowest failure seen so far are skipped;
    // earlier ones still run so the reported failure does not depend on
    // scheduling.
    let first_failure = AtomicUsize::new(usize::MAX);
    let completed = AtomicUsize::new(0);
    let report_every = (total / 100).max(1);

    let run_job = |job: &Job| -> JobOutput {
        if job.index > first_failure.load(Ordering::SeqCst) || cancel.is_cancelled() {
            return JobOutput::Cancelled;
        }
        let pipeline = &pipelines[job.slot * n_outer as usize + job.outer as usize];
        let trial = TrialId::new(job.outer, job.inner);
        let output = match pipeline.run(trial) {
            Ok(PipelineOutcome::Completed(ctx)) => match ctx.metrics {
                Some(metrics) => JobOutput::Done(metrics),
                None => JobOutput::Failed(FundSimError::WaterfallState(format!(
                    "trial {trial} completed without metrics"
                ))),
            },
            Ok(PipelineOutcome::Cancelled { .. }) => JobOutput::Cancelled,
            Err(e) => {
                warn!("trial {trial} failed: {e}");
                if mc.fail_fast {
                    first_failure.fetch_min(job.index, Ordering::SeqCst);
                }
                JobOutput::Failed(e)
            }
        };
        let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
        if done % report_every == 0 || done == total {
            notifier.notify(SimulationEvent::Progress {
                module: MODULE.into(),
                percent: done as f64 / total as f64,
                message: format!("{done}/{total} trials"),
            });
        }
        output
    };

    let mut outputs = execute(&jobs, run_job, mc.parallel, mc.max_threads)?;

    if mc.fail_fast {
        if let Some(index) = outputs.iter().position(|o| matches!(o, JobOutput::Failed(_))) {
            if let JobOutput::Failed(e) = outputs.swap_remove(index) {
                notifier.notify(SimulationEvent::Error {
                    module: MODULE.into(),
                    message: e.to_string(),
                });
                return Err(e);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Assemble
    // -----------------------------------------------------------------------

    let outer_count = n_outer as usize;
    let mut records: Vec<Vec<TrialRecord>> = vec![Vec::new(); outer_count];
    let mut stressed: Vec<Vec<Vec<MonteCarloTrialResult>>> =
        vec![vec![Vec::new(); outer_count]; scenarios.len()];
    let mut stress_failed: Vec<Vec<usize>> = vec![vec![0; outer_count]; scenarios.len()];
    let mut any_cancelled = false;

    for (job, output) in jobs.iter().zip(outputs) {
        let o = job.outer as usize;
        if job.slot == 0 {
            let status = match output {
                JobOutput::Done(result) => TrialStatus::Succeeded { result },
                JobOutput::Failed(e) => TrialStatus::Failed {
                    message: e.to_string(),
                    kind: e.kind().into(),
                },
                JobOutput::Cancelled => {
                    any_cancelled = true;
                    TrialStatus::Cancelled
                }
            };
            records[o].push(TrialRecord {
                outer: job.outer,
                inner: job.inner,
                status,
            });
        } else {
            match output {
                JobOutput::Done(result) => stressed[job.slot - 1][o].push(result),
                JobOutput::Failed(_) => stress_failed[job.slot - 1][o] += 1,
                JobOutput::Cancelled => any_cancelled = true,
            }
        }
    }

    let mut warnings = Vec::new();
    let mut outer_trials = Vec::with_capacity(outer_count);
    for (o, ((variant, variation), trials)) in variants.into_iter().zip(records).enumerate() {
        let successes: Vec<&MonteCarloTrialResult> =
            trials.iter().filter_map(TrialRecord::result).collect();
        let failed = trials
            .iter()
            .filter(|t| matches!(t.status, TrialStatus::Failed { .. }))
            .count();
        let cancelled = trials
            .iter()
            .filter(|t| matches!(t.status, TrialStatus::Cancelled))
            .count();

        let mut risk = metrics_for(&successes, config);
        if risk.is_none() && !successes.is_empty() {
            warnings.push(format!(
                "Outer trial {o}: no trial produced a defined fund IRR; risk metrics omitted"
            ));
        }

        if let Some(metrics) = risk.as_mut() {
            for (s, scenario) in scenarios.iter().enumerate() {
                let refs: Vec<&MonteCarloTrialResult> = stressed[s][o].iter().collect();
                let stressed_metrics = metrics_for(&refs, config);
                let outcome = StressOutcome::compare(
                    &scenario.name,
                    refs.len(),
                    stress_failed[s][o],
                    stressed_metrics.as_ref(),
                    Some(metrics),
                );
                metrics.stress.push(outcome);
            }
        }

        let guardrails = risk
            .as_ref()
            .map(|m| risk_guardrails(m, &config.guardrails))
            .unwrap_or_default();
        for violation in &guardrails {
            warn!("outer trial {o}: guardrail {}: {}", violation.rule, violation.message);
            notifier.notify(SimulationEvent::GuardrailViolation {
                violation: violation.clone(),
            });
            warnings.push(format!("Outer trial {o}: {}", violation.message));
        }

        outer_trials.push(OuterTrialResult {
            outer: o as u32,
            variation,
            leverage: variant.leverage(),
            succeeded: successes.len(),
            failed,
            cancelled,
            risk,
            guardrails,
            trials,
        });
    }

    let candidates: Vec<FrontierPoint> = outer_trials
        .iter()
        .filter_map(|t| {
            t.risk.as_ref().map(|m| FrontierPoint {
                outer: t.outer,
                leverage: t.leverage,
                mean_irr: m.mean_irr(),
                irr_volatility: m.irr_volatility(),
            })
        })
        .collect();
    let frontier = efficient_frontier(&candidates, mc.max_leverage);

    let succeeded = outer_trials.iter().map(|t| t.succeeded).sum();
    let failed: usize = outer_trials.iter().map(|t| t.failed).sum();
    let cancelled = outer_trials.iter().map(|t| t.cancelled).sum();
    if failed > 0 {
        warnings.push(format!("{failed} trials failed"));
    }
    let status = if any_cancelled {
        warnings.push("Sweep cancelled; results are partial".into());
        SweepStatus::Partial
    } else {
        SweepStatus::Complete
    };

    let execution_time_ms = start.elapsed().as_millis() as u64;
    let sweep = SweepResult {
        status,
        seed: mc.seed,
        outer_trials,
        succeeded,
        failed,
        cancelled,
        frontier,
        execution_time_ms,
    };
    info!(
        "monte carlo finished in {execution_time_ms} ms: {succeeded} succeeded, {failed} failed, {cancelled} cancelled"
    );
    notifier.notify(SimulationEvent::ModuleCompleted {
        module: MODULE.into(),
        execution_time_ms,
    });
    notifier.notify(SimulationEvent::Result {
        result: serde_json::json!({
            "status": sweep.status,
            "succeeded": succeeded,
            "failed": failed,
            "cancelled": cancelled,
        }),
        execution_time_ms,
    });

    let elapsed = start.elapsed().as_micros() as u64;
    Ok(with_metadata_f64(
        "Nested Monte Carlo: perturbed outer configurations, seeded inner repetitions",
        &serde_json::json!({
            "num_simulations": n_outer,
            "num_inner_simulations": n_inner,
            "variation_factor": mc.variation_factor,
            "seed": mc.seed,
            "confidence_level": mc.confidence_level,
            "risk_free_rate": mc.risk_free_rate,
            "stress_scenarios": scenarios.iter().map(|s| s.name.clone()).collect::<Vec<_>>(),
            "parallel": mc.parallel,
        }),
        warnings,
        elapsed,
        sweep,
    ))
}

fn metrics_for(results: &[&MonteCarloTrialResult], config: &FundConfig) -> Option<RiskMetrics> {
    if results.is_empty() {
        return None;
    }
    let mc = &config.monte_carlo;
    compute_risk_metrics(results, mc.confidence_level, mc.risk_free_rate, mc.histogram_bins).ok()
}

/// Run every job, one output slot per job index.
#[cfg(feature = "parallel")]
fn execute<F>(
    jobs: &[Job],
    run: F,
    parallel: bool,
    max_threads: Option<usize>,
) -> FundSimResult<Vec<JobOutput>>
where
    F: Fn(&Job) -> JobOutput + Send + Sync,
{
    if !parallel {
        return Ok(jobs.iter().map(run).collect());
    }
    match max_threads {
        Some(threads) => {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .map_err(|e| FundSimError::ThreadPool(e.to_string()))?;
            Ok(pool.install(|| jobs.par_iter().map(&run).collect()))
        }
        None => Ok(jobs.par_iter().map(run).collect()),
    }
}

#[cfg(not(feature = "parallel"))]
fn execute<F>(
    jobs: &[Job],
    run: F,
    _parallel: bool,
    _max_threads: Option<usize>,
) -> FundSimResult<Vec<JobOutput>>
where
    F: Fn(&Job) -> JobOutput + Send + Sync,
{
    Ok(jobs.iter().map(run).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_config;
    use crate::monte_carlo::StressScenario;
    use crate::notify::CollectingNotifier;

    fn small_config() -> FundConfig {
        let mut config = sample_config();
        config.monte_carlo.num_simulations = 2;
        config.monte_carlo.num_inner_simulations = 3;
        config
    }

    fn run(config: &FundConfig) -> SweepResult {
        run_monte_carlo(
            config,
            &synthetic_loan_book,
            Arc::new(NoopNotifier),
            &CancellationToken::new(),
        )
        .unwrap()
        .result
    }

    #[test]
    fn test_sweep_shape() {
        let sweep = run(&small_config());
        assert_eq!(sweep.status, SweepStatus::Complete);
        assert_eq!(sweep.outer_trials.len(), 2);
        assert_eq!(sweep.succeeded, 6);
        assert_eq!(sweep.failed, 0);
        for (o, outer) in sweep.outer_trials.iter().enumerate() {
            assert_eq!(outer.outer, o as u32);
            let inners: Vec<u32> = outer.trials.iter().map(|t| t.inner).collect();
            assert_eq!(inners, vec![0, 1, 2]);
        }
        assert_eq!(sweep.outer_trials[0].variation, Variation::identity(3));
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let mut config = small_config();
        config.monte_carlo.parallel = true;
        config.monte_carlo.max_threads = Some(3);
        let parallel = run(&config);
        config.monte_carlo.parallel = false;
        let sequential = run(&config);
        assert_eq!(parallel.outer_trials, sequential.outer_trials);
        assert_eq!(parallel.frontier, sequential.frontier);
    }

    #[test]
    fn test_cancelled_sweep_is_partial() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let sweep = run_monte_carlo(
            &small_config(),
            &synthetic_loan_book,
            Arc::new(NoopNotifier),
            &cancel,
        )
        .unwrap()
        .result;
        assert_eq!(sweep.status, SweepStatus::Partial);
        assert_eq!(sweep.cancelled, 6);
        assert!(sweep.outer_trials.iter().all(|t| t.risk.is_none()));
    }

    #[test]
    fn test_invalid_config_fails_before_any_trial() {
        let mut config = small_config();
        config.tranches[1].priority = config.tranches[0].priority;
        let notifier = Arc::new(CollectingNotifier::new());
        let err = run_monte_carlo(&config, &synthetic_loan_book, notifier.clone(), &CancellationToken::new())
            .unwrap_err();
        assert!(err.is_precondition());
        assert!(notifier.events().is_empty());
    }

    #[test]
    fn test_stress_outcomes_reported_per_outer_trial() {
        let mut config = small_config();
        config.monte_carlo.stress_scenarios = vec![StressScenario {
            name: "downturn".into(),
            drift_shift: -0.10,
            volatility_multiplier: 1.5,
            exit_delay_periods: 0,
        }];
        let sweep = run(&config);
        for outer in &sweep.outer_trials {
            if let Some(risk) = &outer.risk {
                assert_eq!(risk.stress.len(), 1);
                assert_eq!(risk.stress[0].scenario, "downturn");
                assert_eq!(risk.stress[0].succeeded + risk.stress[0].failed, 3);
            }
        }
    }

    #[test]
    fn test_progress_reaches_completion() {
        let notifier = Arc::new(CollectingNotifier::new());
        run_monte_carlo(
            &small_config(),
            &synthetic_loan_book,
            notifier.clone(),
            &CancellationToken::new(),
        )
        .unwrap();
        let last_progress = notifier
            .events()
            .into_iter()
            .filter_map(|e| match e {
                SimulationEvent::Progress { percent, .. } => Some(percent),
                _ => None,
            })
            .last();
        assert_eq!(last_progress, Some(1.0));
        assert!(matches!(
            notifier.events().last(),
            Some(SimulationEvent::Result { .. })
        ));
    }
}
