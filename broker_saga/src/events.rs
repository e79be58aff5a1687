use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// What happened to a saga, reported to any registered
/// [`SagaEventListener`]s.
#[derive(Debug, Clone)]
pub enum SagaEventKind {
    /// The saga ran its first step.
    Started,
    /// Every step completed successfully.
    Completed,
    /// A step failed; carries the failed step's name and whether the
    /// resulting compensation run fully succeeded.
    Failed {
        /// The step that failed.
        step_name: String,
        /// Whether every compensation triggered by the failure succeeded.
        compensation_succeeded: bool,
    },
    /// Compensation finished running, successful or not.
    Compensated {
        /// Whether every compensation triggered by the failure succeeded.
        compensation_succeeded: bool,
    },
}

/// A single saga lifecycle notification.
#[derive(Debug, Clone)]
pub struct SagaEvent {
    /// The saga instance this event concerns.
    pub saga_id: Uuid,
    /// The saga definition's stable name.
    pub saga_type: String,
    /// The saga's correlation id.
    pub correlation_id: String,
    /// What happened.
    pub kind: SagaEventKind,
}

/// A callback invoked for every [`SagaEvent`] the engine emits.
pub type SagaEventListener = Arc<dyn Fn(&SagaEvent) + Send + Sync>;

/// Running totals for a single saga type.
#[derive(Debug, Clone, Copy, Default)]
pub struct SagaTypeTotals {
    /// Sagas started.
    pub started: u64,
    /// Sagas that completed every step successfully.
    pub completed: u64,
    /// Sagas that hit a step failure.
    pub failed: u64,
    /// Sagas whose compensation finished running.
    pub compensated: u64,
}

/// Running totals for a single named step across every saga of its type.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepTotals {
    /// Successful executions of this step.
    pub success_count: u64,
    /// Failed executions of this step.
    pub failure_count: u64,
    total_duration: Duration,
}

impl StepTotals {
    /// The mean duration across every recorded run (success or failure) of
    /// this step. Zero if no runs have been recorded.
    pub fn average_duration(&self) -> Duration {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            Duration::ZERO
        } else {
            self.total_duration / total as u32
        }
    }
}

/// Per-saga-type and per-step counters, fed by the engine as sagas and
/// their steps run.
#[derive(Default)]
pub struct SagaMetrics {
    saga_totals: parking_lot::Mutex<HashMap<String, SagaTypeTotals>>,
    step_totals: parking_lot::Mutex<HashMap<(String, String), StepTotals>>,
}

impl SagaMetrics {
    /// Builds an empty metrics collector.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_started(&self, saga_type: &str) {
        self.saga_totals.lock().entry(saga_type.to_string()).or_default().started += 1;
    }

    pub(crate) fn record_completed(&self, saga_type: &str) {
        self.saga_totals.lock().entry(saga_type.to_string()).or_default().completed += 1;
    }

    pub(crate) fn record_failed(&self, saga_type: &str) {
        self.saga_totals.lock().entry(saga_type.to_string()).or_default().failed += 1;
    }

    pub(crate) fn record_compensated(&self, saga_type: &str) {
        self.saga_totals.lock().entry(saga_type.to_string()).or_default().compensated += 1;
    }

    pub(crate) fn record_step(&self, saga_type: &str, step_name: &str, success: bool, duration: Duration) {
        let mut totals = self.step_totals.lock();
        let entry = totals
            .entry((saga_type.to_string(), step_name.to_string()))
            .or_default();

        if success {
            entry.success_count += 1;
        } else {
            entry.failure_count += 1;
        }
        entry.total_duration += duration;
    }

    /// A snapshot of totals for a single saga type.
    pub fn saga_totals(&self, saga_type: &str) -> SagaTypeTotals {
        self.saga_totals.lock().get(saga_type).copied().unwrap_or_default()
    }

    /// A snapshot of totals for a single named step within a saga type.
    pub fn step_totals(&self, saga_type: &str, step_name: &str) -> StepTotals {
        self.step_totals
            .lock()
            .get(&(saga_type.to_string(), step_name.to_string()))
            .copied()
            .unwrap_or_default()
    }
}
