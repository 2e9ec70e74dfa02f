//! Progress notification and cancellation.
//!
//! The engine reports through an injected [`ProgressNotifier`]; transports
//! (websocket, queue, ...) are supplied by the caller. Implementations must
//! be `Send + Sync` because parallel trials share one notifier.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::types::{GuardrailViolation, Severity};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SimulationEvent {
    ModuleStarted {
        module: String,
    },
    Progress {
        module: String,
        /// Fractional completion in `[0, 1]`.
        percent: f64,
        message: String,
    },
    ModuleCompleted {
        module: String,
        execution_time_ms: u64,
    },
    IntermediateResult {
        module: String,
        data: serde_json::Value,
    },
    GuardrailViolation {
        #[serde(flatten)]
        violation: GuardrailViolation,
    },
    Error {
        module: String,
        message: String,
    },
    Result {
        result: serde_json::Value,
        execution_time_ms: u64,
    },
}

pub trait ProgressNotifier: Send + Sync {
    fn notify(&self, event: SimulationEvent);

    /// Whether stages should build `IntermediateResult` payloads.
    fn wants_intermediate_results(&self) -> bool {
        false
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl ProgressNotifier for NoopNotifier {
    fn notify(&self, _event: SimulationEvent) {}
}

/// Forwards events to the `log` facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl ProgressNotifier for LogNotifier {
    fn notify(&self, event: SimulationEvent) {
        match event {
            SimulationEvent::ModuleStarted { module } => debug!("{module}: started"),
            SimulationEvent::Progress {
                module,
                percent,
                message,
            } => info!("{module}: {:.1}% {message}", percent * 100.0),
            SimulationEvent::ModuleCompleted {
                module,
                execution_time_ms,
            } => debug!("{module}: completed in {execution_time_ms} ms"),
            SimulationEvent::IntermediateResult { module, .. } => {
                debug!("{module}: intermediate result")
            }
            SimulationEvent::GuardrailViolation { violation } => match violation.severity {
                Severity::Critical => error!("guardrail {}: {}", violation.rule, violation.message),
                Severity::Warning => warn!("guardrail {}: {}", violation.rule, violation.message),
                Severity::Info => info!("guardrail {}: {}", violation.rule, violation.message),
            },
            SimulationEvent::Error { module, message } => error!("{module}: {message}"),
            SimulationEvent::Result {
                execution_time_ms, ..
            } => info!("simulation finished in {execution_time_ms} ms"),
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct CollectingNotifier {
    events: Mutex<Vec<SimulationEvent>>,
    intermediate: bool,
}

impl CollectingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also ask stages for intermediate payloads.
    pub fn with_intermediate_results() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            intermediate: true,
        }
    }

    pub fn events(&self) -> Vec<SimulationEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn guardrails(&self) -> Vec<GuardrailViolation> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SimulationEvent::GuardrailViolation { violation } => Some(violation),
                _ => None,
            })
            .collect()
    }
}

impl ProgressNotifier for CollectingNotifier {
    fn notify(&self, event: SimulationEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }

    fn wants_intermediate_results(&self) -> bool {
        self.intermediate
    }
}

/// Cloneable cancellation flag shared by every trial of a run.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
