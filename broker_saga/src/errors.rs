use thiserror::Error;

/// Failures raised by [`SagaEngine::execute`](crate::SagaEngine::execute)
/// itself, as opposed to a step's own business failure (which is recorded
/// on the [`SagaRecord`](crate::SagaRecord) and surfaced via
/// [`SagaResult`](crate::SagaResult) rather than as an `Err`).
#[derive(Error, Debug)]
pub enum SagaError {
    /// The step in flight was cancelled; per contract, no compensation runs
    /// in response (cancellation is distinct from a step failure).
    #[error("saga execution cancelled at step {step_index}")]
    Cancelled {
        /// The zero-based index of the step in flight when cancellation was
        /// observed.
        step_index: usize,
    },
}

/// Failures raised by a [`SagaStore`](crate::SagaStore) implementation.
#[derive(Error, Debug)]
pub enum PersistenceError {
    /// `save` was called with a `version` that no longer matches the
    /// stored record; another writer won the race.
    #[error("saga {saga_id} concurrency conflict: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        /// The saga whose version mismatched.
        saga_id: uuid::Uuid,
        /// The version the caller expected to overwrite.
        expected: u64,
        /// The version actually stored.
        actual: u64,
    },

    /// No record exists for the given lookup key.
    #[error("saga not found: {0}")]
    NotFound(String),

    /// `correlation_id` was already in use by a different saga.
    #[error("correlation id already in use: {0}")]
    DuplicateCorrelationId(String),
}
