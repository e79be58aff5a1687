use crate::config::SagaConfig;
use crate::engine::{SagaEngine, SagaResult};
use crate::errors::{PersistenceError, SagaError};
use crate::record::{SagaRecord, SagaState};
use crate::store::SagaStore;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// A convenience wrapper pairing a [`SagaEngine`] with its [`SagaStore`],
/// handling persistence around execution and offering an opt-in
/// terminal-state short-circuit the engine itself deliberately does not
/// implement.
pub struct SagaRunner<D, E> {
    engine: SagaEngine<D, E>,
    store: Arc<dyn SagaStore<D>>,
    config: SagaConfig,
}

impl<D, E> SagaRunner<D, E>
where
    D: Clone + Send + Sync + 'static,
    E: std::fmt::Display,
{
    /// Builds a runner over the given engine and store.
    pub fn new(engine: SagaEngine<D, E>, store: Arc<dyn SagaStore<D>>, config: SagaConfig) -> Self {
        Self { engine, store, config }
    }

    /// Creates a new saga in the `pending` state, persisting it (subject to
    /// `auto_persist`) before returning it.
    pub async fn start(
        &self,
        correlation_id: impl Into<String>,
        saga_type: impl Into<String>,
        data: D,
    ) -> Result<SagaRecord<D>, PersistenceError> {
        let record = SagaRecord::new(correlation_id, saga_type, data);

        if self.config.auto_persist {
            self.store.save(&record, None).await?;
        }

        Ok(record)
    }

    /// Runs `record` through the engine unless it is already in a terminal
    /// state (`completed`, `compensated`, `failed`, `aborted`), in which
    /// case it is returned unchanged as a no-op result. Persists the
    /// outcome (subject to `auto_persist`); a persistence failure after a
    /// successful run is logged rather than discarding the run's result.
    pub async fn run_unless_terminal(
        &self,
        mut record: SagaRecord<D>,
        cancel: &CancellationToken,
        is_transient: impl Fn(&E) -> bool,
    ) -> Result<SagaResult<D>, SagaError> {
        if record.state.is_terminal() {
            return Ok(SagaResult {
                success: record.state == SagaState::Completed,
                data: record.data_payload.clone(),
                failed_step: None,
                compensation_succeeded: None,
            });
        }

        let expected_version = record.version;
        let result = self.engine.execute(&mut record, cancel, is_transient).await?;

        if self.config.auto_persist {
            if let Err(error) = self.store.save(&record, Some(expected_version)).await {
                warn!(saga_id = %record.saga_id, %error, "saga runner: failed to persist outcome");
            }
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SagaMetrics;
    use crate::step::SagaStep;
    use crate::store::InMemorySagaStore;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    struct NoopStep;

    #[async_trait]
    impl SagaStep<u32, String> for NoopStep {
        fn name(&self) -> &str {
            "noop"
        }

        async fn execute(&self, data: &mut u32, _cancel: &CancellationToken) -> Result<(), String> {
            *data += 1;
            Ok(())
        }

        async fn compensate(&self, data: &mut u32, _cancel: &CancellationToken) -> Result<(), String> {
            *data -= 1;
            Ok(())
        }
    }

    fn runner() -> SagaRunner<u32, String> {
        let engine = SagaEngine::new(vec![Box::new(NoopStep)], SagaConfig::default(), Arc::new(SagaMetrics::new()));
        let store: Arc<dyn SagaStore<u32>> = Arc::new(InMemorySagaStore::new());
        SagaRunner::new(engine, store, SagaConfig::default())
    }

    #[tokio::test]
    async fn start_persists_a_pending_record() {
        // Given
        let runner = runner();

        // When
        let record = runner.start("corr-1", "counter-saga", 0).await.unwrap();

        // Then
        assert_eq!(record.state, SagaState::Pending);
        assert_eq!(record.version, 0);
    }

    #[tokio::test]
    async fn run_unless_terminal_executes_a_pending_saga() {
        // Given
        let runner = runner();
        let record = runner.start("corr-2", "counter-saga", 0).await.unwrap();
        let cancel = CancellationToken::new();

        // When
        let result = runner
            .run_unless_terminal(record, &cancel, |_: &String| true)
            .await
            .unwrap();

        // Then
        assert!(result.success);
        assert_eq!(result.data, 1);
    }

    #[tokio::test]
    async fn run_unless_terminal_is_a_noop_for_a_completed_saga() {
        // Given
        let runner = runner();
        let mut record = runner.start("corr-3", "counter-saga", 5).await.unwrap();
        record.state = SagaState::Completed;
        let cancel = CancellationToken::new();

        // When
        let result = runner
            .run_unless_terminal(record, &cancel, |_: &String| true)
            .await
            .unwrap();

        // Then
        assert!(result.success);
        assert_eq!(result.data, 5);
    }
}
