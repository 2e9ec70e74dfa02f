use std::sync::Arc;

use fund_sim_core::error::FundSimError;
use fund_sim_core::loans::{Loan, LoanBook, LoanExit, OriginationRequest, SyntheticLoanBook};
use fund_sim_core::monte_carlo::{
    outer_variant, run_monte_carlo, synthetic_loan_book, StressScenario, SweepResult, SweepStatus,
    TrialStatus,
};
use fund_sim_core::notify::{CancellationToken, CollectingNotifier, NoopNotifier, SimulationEvent};
use fund_sim_core::pipeline::{run_single_trial, SingleTrialResult};
use fund_sim_core::price_path::PricePaths;
use fund_sim_core::{FundConfig, FundSimResult, Severity, TrialId};
use pretty_assertions::assert_eq;
use rand::rngs::StdRng;
use rand::Rng;

// ===========================================================================
// Helpers
// ===========================================================================

fn sweep_config() -> FundConfig {
    FundConfig::from_json(
        r#"{
            "fund": {
                "name": "Sweep Fund",
                "size": "40000000",
                "term_periods": 24,
                "periods_per_year": 12,
                "start_date": "2025-01-01"
            },
            "zones": [
                {"name": "inner", "target_allocation": 0.5, "drift": 0.05, "volatility": 0.12},
                {"name": "middle", "target_allocation": 0.3, "drift": 0.04, "volatility": 0.10},
                {"name": "outer", "target_allocation": 0.2, "drift": 0.02, "volatility": 0.16}
            ],
            "price_path": {"model": {"type": "gbm"}},
            "loans": {
                "min_loan_size": "1000000",
                "max_loan_size": "3000000",
                "min_ltv": 0.5,
                "max_ltv": 0.7,
                "interest_rate": "0.07",
                "appreciation_share": "0.3",
                "min_hold_periods": 6,
                "max_hold_periods": 20
            },
            "tranches": [
                {"name": "Senior", "size": "24000000", "priority": 1, "terms": {"type": "senior_debt", "rate": "0.05"}},
                {"name": "Mezzanine", "size": "10000000", "priority": 2, "terms": {"type": "mezzanine", "rate": "0.09"}},
                {"name": "Equity", "size": "6000000", "priority": 3, "terms": {"type": "equity", "hurdle_rate": "0.08", "carry": "0.2"}}
            ],
            "reinvestment": {
                "strategy": {"type": "rebalance"},
                "reinvestment_period_end": 12,
                "min_reinvestment_amount": "500000"
            },
            "monte_carlo": {
                "num_simulations": 3,
                "num_inner_simulations": 6,
                "variation_factor": 0.15,
                "seed": 2024,
                "perturb_leverage": true
            }
        }"#,
    )
    .unwrap()
}

fn sweep(config: &FundConfig) -> SweepResult {
    run_monte_carlo(config, &synthetic_loan_book, Arc::new(NoopNotifier), &CancellationToken::new())
        .unwrap()
        .result
}

// ===========================================================================
// Determinism
// ===========================================================================

#[test]
fn test_results_independent_of_thread_count() {
    let mut sequential = sweep_config();
    sequential.monte_carlo.parallel = false;
    let mut two_threads = sweep_config();
    two_threads.monte_carlo.max_threads = Some(2);
    let default_pool = sweep_config();

    let a = sweep(&sequential);
    let b = sweep(&two_threads);
    let c = sweep(&default_pool);
    assert_eq!(a.failed, 0);
    assert_eq!(a.outer_trials, b.outer_trials);
    assert_eq!(a.outer_trials, c.outer_trials);
    assert_eq!(a.frontier, c.frontier);
}

#[test]
fn test_seed_changes_results() {
    let base = sweep(&sweep_config());
    let mut reseeded = sweep_config();
    reseeded.monte_carlo.seed = 2025;
    let other = sweep(&reseeded);
    assert_eq!(other.seed, 2025);
    assert_ne!(base.outer_trials[0].trials, other.outer_trials[0].trials);
}

#[test]
fn test_outer_trials_vary_configuration() {
    let result = sweep(&sweep_config());
    assert_eq!(result.status, SweepStatus::Complete);
    assert_eq!(result.succeeded, 18);
    assert_eq!(result.failed, 0);

    let base = &result.outer_trials[0];
    assert_eq!(base.variation.leverage_multiplier, 1.0);
    assert!((base.leverage - 0.85).abs() < 1e-12);
    for outer in &result.outer_trials[1..] {
        assert!(outer.variation.drift_multipliers.iter().all(|m| (0.85..=1.15).contains(m)));
    }

    // Inner trial indices are shared across outer trials.
    let inners: Vec<u32> = result.outer_trials[2].trials.iter().map(|t| t.inner).collect();
    assert_eq!(inners, (0..6).collect::<Vec<_>>());
}

#[test]
fn test_single_trial_replays_sweep_trial() {
    let config = sweep_config();
    let result = sweep(&config);
    let record = &result.outer_trials[2].trials[4];

    let (variant, variation) = outer_variant(&config, 2).unwrap();
    assert_eq!(variation, result.outer_trials[2].variation);
    let single = run_single_trial(variant, TrialId::new(2, 4), false, Arc::new(NoopNotifier)).unwrap();
    match (&single.result, record.result()) {
        (SingleTrialResult::Completed(report), Some(expected)) => assert_eq!(&report.metrics, expected),
        (_, None) => {}
        (other, Some(_)) => panic!("expected a completed trial, got {other:?}"),
    }
}

// ===========================================================================
// Risk metrics and guardrails
// ===========================================================================

#[test]
fn test_risk_metrics_are_consistent() {
    let result = sweep(&sweep_config());
    for outer in &result.outer_trials {
        let Some(risk) = &outer.risk else { continue };
        assert_eq!(risk.trials, outer.succeeded);
        assert!(risk.irr_observations <= risk.trials);
        assert!(risk.cvar >= risk.var - 1e-12);
        assert!((0.0..=1.0).contains(&risk.probability_of_loss));
        assert!(risk.irr.min <= risk.irr.median && risk.irr.median <= risk.irr.max);
        assert_eq!(risk.confidence_level, 0.95);
    }
    for pair in result.frontier.windows(2) {
        assert!(pair[0].irr_volatility <= pair[1].irr_volatility);
        assert!(pair[0].mean_irr <= pair[1].mean_irr);
    }
}

#[test]
fn test_unreachable_return_target_raises_guardrail() {
    let mut config = sweep_config();
    config.guardrails.min_mean_irr = Some(5.0);
    let notifier = Arc::new(CollectingNotifier::new());
    let out = run_monte_carlo(&config, &synthetic_loan_book, notifier.clone(), &CancellationToken::new()).unwrap();

    let with_risk = out.result.outer_trials.iter().filter(|o| o.risk.is_some()).count();
    let raised: Vec<_> = out
        .result
        .outer_trials
        .iter()
        .flat_map(|o| &o.guardrails)
        .filter(|g| g.rule == "min_mean_irr")
        .collect();
    assert_eq!(raised.len(), with_risk);
    assert!(raised.iter().all(|g| g.severity == Severity::Warning));
    assert_eq!(notifier.guardrails().iter().filter(|g| g.rule == "min_mean_irr").count(), with_risk);
    assert!(out.warnings.iter().any(|w| w.starts_with("Outer trial")));
}

#[test]
fn test_downturn_lowers_mean_irr() {
    let mut config = sweep_config();
    config.monte_carlo.num_simulations = 1;
    config.monte_carlo.num_inner_simulations = 20;
    config.monte_carlo.stress_scenarios = vec![StressScenario {
        name: "crash".into(),
        drift_shift: -0.4,
        volatility_multiplier: 1.0,
        exit_delay_periods: 0,
    }];
    let result = sweep(&config);
    let risk = result.outer_trials[0].risk.as_ref().unwrap();
    let crash = &risk.stress[0];
    assert_eq!(crash.scenario, "crash");
    assert_eq!(crash.succeeded + crash.failed, 20);
    assert!(crash.mean_irr_delta.unwrap() < 0.0);
}

// ===========================================================================
// Failures and cancellation
// ===========================================================================

fn failing_book(_config: &FundConfig) -> FundSimResult<Arc<dyn LoanBook>> {
    Err(FundSimError::InsufficientData("loan tape unavailable".into()))
}

#[test]
fn test_loan_book_factory_error_aborts_sweep() {
    let err = run_monte_carlo(&sweep_config(), &failing_book, Arc::new(NoopNotifier), &CancellationToken::new())
        .unwrap_err();
    assert!(err.to_string().contains("loan tape unavailable"));
}

/// Rejects roughly half of all initial originations, keyed on the trial's
/// own origination stream.
struct PatchyTape(SyntheticLoanBook);

impl LoanBook for PatchyTape {
    fn originate(
        &self,
        request: &OriginationRequest,
        paths: &PricePaths,
        rng: &mut StdRng,
    ) -> FundSimResult<Vec<Loan>> {
        let ticket: u64 = rng.gen();
        if request.period == 0 && ticket % 2 == 0 {
            return Err(FundSimError::InsufficientData(format!("tape rejected ticket {ticket}")));
        }
        self.0.originate(request, paths, rng)
    }

    fn sample_exit(&self, loan: &Loan, paths: &PricePaths, rng: &mut StdRng) -> FundSimResult<LoanExit> {
        self.0.sample_exit(loan, paths, rng)
    }
}

fn patchy_book(config: &FundConfig) -> FundSimResult<Arc<dyn LoanBook>> {
    Ok(Arc::new(PatchyTape(SyntheticLoanBook::new(config.loans.clone())?)))
}

fn fail_fast_error(parallel: bool, max_threads: Option<usize>) -> String {
    let mut config = sweep_config();
    config.monte_carlo.fail_fast = true;
    config.monte_carlo.parallel = parallel;
    config.monte_carlo.max_threads = max_threads;
    run_monte_carlo(&config, &patchy_book, Arc::new(NoopNotifier), &CancellationToken::new())
        .unwrap_err()
        .to_string()
}

#[test]
fn test_fail_fast_reports_lowest_failing_trial() {
    let mut config = sweep_config();
    config.monte_carlo.parallel = false;
    let recorded = run_monte_carlo(&config, &patchy_book, Arc::new(NoopNotifier), &CancellationToken::new())
        .unwrap()
        .result;
    assert!(recorded.failed > 0);
    let first = recorded
        .outer_trials
        .iter()
        .flat_map(|o| &o.trials)
        .find_map(|t| match &t.status {
            TrialStatus::Failed { message, .. } => Some(message.clone()),
            _ => None,
        })
        .unwrap();
    assert!(first.contains("tape rejected"));

    assert_eq!(fail_fast_error(false, None), first);
    for threads in [2, 4, 8] {
        for _ in 0..3 {
            assert_eq!(fail_fast_error(true, Some(threads)), first);
        }
    }
}

#[test]
fn test_timeouts_recorded_per_trial() {
    let mut config = sweep_config();
    config.monte_carlo.num_simulations = 1;
    config.monte_carlo.num_inner_simulations = 3;
    // Budget shorter than any real trial.
    config.monte_carlo.trial_timeout_ms = Some(1);
    config.fund.term_periods = 240;
    config.loans.max_hold_periods = 200;
    let result = sweep(&config);

    let outer = &result.outer_trials[0];
    for trial in &outer.trials {
        if let TrialStatus::Failed { kind, .. } = &trial.status {
            assert_eq!(kind, "trial_timeout");
        }
    }
    assert_eq!(outer.succeeded + outer.failed, 3);
    assert_eq!(result.status, SweepStatus::Complete);
}

#[test]
fn test_pre_cancelled_sweep_reports_every_trial_cancelled() {
    let notifier = Arc::new(CollectingNotifier::new());
    let cancel = CancellationToken::new();
    cancel.cancel();
    let out = run_monte_carlo(&sweep_config(), &synthetic_loan_book, notifier.clone(), &cancel).unwrap();

    assert_eq!(out.result.status, SweepStatus::Partial);
    assert_eq!(out.result.cancelled, 18);
    assert_eq!(out.result.succeeded, 0);
    assert!(out.result.frontier.is_empty());
    assert!(matches!(notifier.events().last(), Some(SimulationEvent::Result { .. })));
}
