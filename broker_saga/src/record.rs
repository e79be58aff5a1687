use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// A saga's lifecycle position.
///
/// Transitions: `pending` → `running` on first step → `completed` on
/// success → `compensating` on step failure → `compensated` once
/// compensations run, successful or not → `failed` only if compensation
/// itself times out (detected by the supervisor, never by the engine).
/// `aborted` is an administrative transition outside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaState {
    /// Created but not yet started.
    Pending,
    /// At least one step has executed; more remain or are in flight.
    Running,
    /// A step failed; compensations are running in reverse order.
    Compensating,
    /// Every step executed successfully.
    Completed,
    /// Compensation finished, successful or not, after a step failure.
    Compensated,
    /// Compensation itself timed out, per the supervisor.
    Failed,
    /// Administratively abandoned.
    Aborted,
}

impl SagaState {
    /// Whether this state is one the timeout supervisor actively watches.
    pub fn is_supervised(self) -> bool {
        matches!(self, SagaState::Running | SagaState::Compensating)
    }

    /// Whether this state is a terminal resting state: nothing further will
    /// happen to the saga without an explicit administrative action.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SagaState::Completed | SagaState::Compensated | SagaState::Failed | SagaState::Aborted
        )
    }
}

/// The persisted record of a single saga instance.
///
/// `data_payload` is the saga's own business state, opaque to this crate
/// beyond needing to be cloneable and (de)serializable for storage.
/// `metadata` carries auxiliary flags such as a per-saga timeout override
/// (`"Timeout"`, seconds) or markers the supervisor sets (`"TimedOut"`,
/// `"CompensationTimedOut"`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaRecord<D> {
    /// Primary key.
    pub saga_id: Uuid,
    /// Unique secondary key linking related requests/responses.
    pub correlation_id: String,
    /// A stable name identifying which saga definition this record follows.
    pub saga_type: String,
    /// Current lifecycle state.
    pub state: SagaState,
    /// Index into the step list; the resume cursor for the engine.
    pub current_step: usize,
    /// The saga's own business state.
    pub data_payload: D,
    /// Auxiliary mapping: custom timeout, supervisor markers, caller flags.
    pub metadata: HashMap<String, serde_json::Value>,
    /// Set when a step or compensation failed.
    pub error_message: Option<String>,
    /// Set alongside `error_message` when a stack trace rendering is
    /// available.
    pub error_stack_trace: Option<String>,
    /// Incremented on every persisted change; the optimistic concurrency
    /// token for [`SagaStore::save`](crate::SagaStore::save).
    pub version: u64,
    /// Milliseconds since the Unix epoch at creation.
    pub created_at_ms: u64,
    /// Milliseconds since the Unix epoch at the last persisted change.
    pub updated_at_ms: u64,
}

impl<D> SagaRecord<D> {
    /// Builds a brand new record in the `pending` state, starting at step 0.
    pub fn new(correlation_id: impl Into<String>, saga_type: impl Into<String>, data_payload: D) -> Self {
        let now = now_ms();

        Self {
            saga_id: Uuid::new_v4(),
            correlation_id: correlation_id.into(),
            saga_type: saga_type.into(),
            state: SagaState::Pending,
            current_step: 0,
            data_payload,
            metadata: HashMap::new(),
            error_message: None,
            error_stack_trace: None,
            version: 0,
            created_at_ms: now,
            updated_at_ms: now,
        }
    }

    /// Reads the `"Timeout"` metadata entry, in seconds, if present and
    /// numeric.
    pub fn metadata_timeout_secs(&self) -> Option<u64> {
        self.metadata.get("Timeout").and_then(|value| value.as_u64())
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn new_record_starts_pending_at_step_zero() {
        // Given / When
        let record = SagaRecord::new("corr-1", "order-saga", 0u32);

        // Then
        assert_eq!(record.state, SagaState::Pending);
        assert_eq!(record.current_step, 0);
        assert_eq!(record.version, 0);
    }

    #[test]
    fn running_and_compensating_are_the_only_supervised_states() {
        assert!(SagaState::Running.is_supervised());
        assert!(SagaState::Compensating.is_supervised());
        assert!(!SagaState::Pending.is_supervised());
        assert!(!SagaState::Completed.is_supervised());
    }

    #[test]
    fn completed_compensated_failed_and_aborted_are_terminal() {
        assert!(SagaState::Completed.is_terminal());
        assert!(SagaState::Compensated.is_terminal());
        assert!(SagaState::Failed.is_terminal());
        assert!(SagaState::Aborted.is_terminal());
        assert!(!SagaState::Running.is_terminal());
    }

    #[test]
    fn metadata_timeout_reads_the_configured_seconds() {
        // Given
        let mut record = SagaRecord::new("corr-2", "order-saga", 0u32);
        record.metadata.insert("Timeout".to_string(), serde_json::Value::from(120));

        // When / Then
        assert_eq!(record.metadata_timeout_secs(), Some(120));
    }
}
