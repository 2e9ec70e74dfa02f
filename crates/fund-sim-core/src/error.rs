use thiserror::Error;

#[derive(Debug, Error)]
pub enum FundSimError {
    #[error("Invalid input: {field}: {reason}")]
    InvalidInput { field: String, reason: String },

    #[error("Invalid correlation matrix: {reason}")]
    InvalidCorrelation { reason: String },

    #[error("Correlation matrix is not positive semi-definite (pivot {pivot}, residual {value:.3e})")]
    NotPositiveSemiDefinite { pivot: usize, value: f64 },

    #[error("Tranches '{first}' and '{second}' share priority {priority}")]
    DuplicatePriority {
        priority: u32,
        first: String,
        second: String,
    },

    #[error("Allocation out of tolerance: {field} sums to {sum}")]
    AllocationOutOfTolerance { field: String, sum: f64 },

    #[error("Numerical instability: {context}")]
    NumericalInstability { context: String },

    #[error("Waterfall state error: {0}")]
    WaterfallState(String),

    #[error("Coverage test '{test}' violated in period {period}")]
    CoverageViolation { test: String, period: u32 },

    #[error("Trial exceeded its time budget ({elapsed_ms} ms of {budget_ms} ms)")]
    TrialTimeout { elapsed_ms: u64, budget_ms: u64 },

    #[error("Convergence failure: {function} did not converge after {iterations} iterations")]
    ConvergenceFailure { function: String, iterations: u32 },

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Thread pool error: {0}")]
    ThreadPool(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl FundSimError {
    /// Errors raised while validating configuration, before any trial runs.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            FundSimError::InvalidInput { .. }
                | FundSimError::InvalidCorrelation { .. }
                | FundSimError::NotPositiveSemiDefinite { .. }
                | FundSimError::DuplicatePriority { .. }
                | FundSimError::AllocationOutOfTolerance { .. }
        )
    }

    /// Stable snake_case label used when a failure is recorded on a trial.
    pub fn kind(&self) -> &'static str {
        match self {
            FundSimError::InvalidInput { .. } => "invalid_input",
            FundSimError::InvalidCorrelation { .. } => "invalid_correlation",
            FundSimError::NotPositiveSemiDefinite { .. } => "not_positive_semi_definite",
            FundSimError::DuplicatePriority { .. } => "duplicate_priority",
            FundSimError::AllocationOutOfTolerance { .. } => "allocation_out_of_tolerance",
            FundSimError::NumericalInstability { .. } => "numerical_instability",
            FundSimError::WaterfallState(_) => "waterfall_state",
            FundSimError::CoverageViolation { .. } => "coverage_violation",
            FundSimError::TrialTimeout { .. } => "trial_timeout",
            FundSimError::ConvergenceFailure { .. } => "convergence_failure",
            FundSimError::InsufficientData(_) => "insufficient_data",
            FundSimError::ThreadPool(_) => "thread_pool",
            FundSimError::SerializationError(_) => "serialization",
        }
    }
}

impl From<serde_json::Error> for FundSimError {
    fn from(e: serde_json::Error) -> Self {
        FundSimError::SerializationError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precondition_classification() {
        let dup = FundSimError::DuplicatePriority {
            priority: 1,
            first: "Senior".into(),
            second: "Mezz".into(),
        };
        assert!(dup.is_precondition());
        assert_eq!(dup.kind(), "duplicate_priority");

        let timeout = FundSimError::TrialTimeout {
            elapsed_ms: 20,
            budget_ms: 10,
        };
        assert!(!timeout.is_precondition());
        assert_eq!(timeout.kind(), "trial_timeout");
    }

    #[test]
    fn test_display_includes_context() {
        let err = FundSimError::CoverageViolation {
            test: "senior_oc".into(),
            period: 7,
        };
        assert_eq!(
            err.to_string(),
            "Coverage test 'senior_oc' violated in period 7"
        );
    }
}
