use crate::config::SagaConfig;
use crate::errors::SagaError;
use crate::events::{SagaEvent, SagaEventKind, SagaEventListener, SagaMetrics};
use crate::record::{now_ms, SagaRecord, SagaState};
use crate::step::SagaStep;
use broker_util::Backoff;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// The outcome of a single [`SagaEngine::execute`] call.
#[derive(Debug, Clone)]
pub struct SagaResult<D> {
    /// Whether every step ran to completion without a failure.
    pub success: bool,
    /// A snapshot of the saga's business data after execution.
    pub data: D,
    /// The name of the step that failed, if any.
    pub failed_step: Option<String>,
    /// Whether every compensation triggered by a step failure succeeded.
    /// `None` when no step failed.
    pub compensation_succeeded: Option<bool>,
}

fn compensation_backoff(config: &SagaConfig) -> Backoff {
    Backoff::builder()
        .with_initial_interval(config.retry_delay)
        .with_max_interval(config.retry_delay.saturating_mul(8))
        .with_multiplier(2.0)
        .with_max_elapsed_time(None)
        .build()
}

/// Runs an ordered list of [`SagaStep`]s against a shared data type `D`,
/// advancing and persisting a [`SagaRecord`]'s progress as it goes.
///
/// The engine never short-circuits on a record's existing state: it always
/// resumes forward from `current_step`. See [`crate::SagaRunner`] for an
/// opt-in wrapper that checks terminal state before invoking this engine.
pub struct SagaEngine<D, E> {
    steps: Vec<Box<dyn SagaStep<D, E>>>,
    config: SagaConfig,
    metrics: Arc<SagaMetrics>,
    listeners: parking_lot::Mutex<Vec<SagaEventListener>>,
}

impl<D, E> SagaEngine<D, E>
where
    D: Clone + Send,
    E: std::fmt::Display,
{
    /// Builds an engine over the given ordered steps.
    pub fn new(steps: Vec<Box<dyn SagaStep<D, E>>>, config: SagaConfig, metrics: Arc<SagaMetrics>) -> Self {
        Self {
            steps,
            config,
            metrics,
            listeners: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Registers a listener invoked for every lifecycle event this engine
    /// emits while executing any saga.
    pub fn on_event(&self, listener: SagaEventListener) {
        self.listeners.lock().push(listener);
    }

    /// Executes `record` from its `current_step` forward.
    ///
    /// On a step failure, compensations run in reverse order for every step
    /// already executed, with transient-classified failures (per
    /// `is_transient`) retried up to the configured policy limits. The
    /// record always ends in `compensated`, never `failed`, regardless of
    /// whether every compensation succeeded — only the timeout supervisor
    /// can drive a saga to `failed`.
    ///
    /// Cancellation observed while a step is in flight propagates as
    /// [`SagaError::Cancelled`] without running any compensation.
    pub async fn execute(
        &self,
        record: &mut SagaRecord<D>,
        cancel: &CancellationToken,
        is_transient: impl Fn(&E) -> bool,
    ) -> Result<SagaResult<D>, SagaError> {
        if record.state == SagaState::Pending {
            record.state = SagaState::Running;
            self.metrics.record_started(&record.saga_type);
            self.emit(record, SagaEventKind::Started);
        }

        let mut failure: Option<(usize, String, String)> = None;
        let mut index = record.current_step;

        while index < self.steps.len() {
            let step = &self.steps[index];
            let started_at = Instant::now();

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(SagaError::Cancelled { step_index: index });
                }
                outcome = step.execute(&mut record.data_payload, cancel) => outcome,
            };

            self.metrics.record_step(
                &record.saga_type,
                step.name(),
                outcome.is_ok(),
                started_at.elapsed(),
            );

            match outcome {
                Ok(()) => {
                    record.current_step = index + 1;
                    record.updated_at_ms = now_ms();
                    index += 1;
                }
                Err(error) => {
                    failure = Some((index, step.name().to_string(), error.to_string()));
                    break;
                }
            }
        }

        let Some((failed_index, failed_name, failed_message)) = failure else {
            record.state = SagaState::Completed;
            record.updated_at_ms = now_ms();
            self.metrics.record_completed(&record.saga_type);
            self.emit(record, SagaEventKind::Completed);

            return Ok(SagaResult {
                success: true,
                data: record.data_payload.clone(),
                failed_step: None,
                compensation_succeeded: None,
            });
        };

        record.state = SagaState::Compensating;
        record.error_message = Some(failed_message);
        record.updated_at_ms = now_ms();
        self.metrics.record_failed(&record.saga_type);

        let compensation_succeeded = self
            .compensate(record, failed_index, cancel, &is_transient)
            .await;

        record.state = SagaState::Compensated;
        record.updated_at_ms = now_ms();

        self.emit(
            record,
            SagaEventKind::Failed {
                step_name: failed_name.clone(),
                compensation_succeeded,
            },
        );
        self.metrics.record_compensated(&record.saga_type);
        self.emit(record, SagaEventKind::Compensated { compensation_succeeded });

        Ok(SagaResult {
            success: false,
            data: record.data_payload.clone(),
            failed_step: Some(failed_name),
            compensation_succeeded: Some(compensation_succeeded),
        })
    }

    /// Runs compensation in reverse order for every step up to (but not
    /// including) `failed_index`, retrying transient-classified failures.
    /// Returns whether every compensation ultimately succeeded.
    async fn compensate(
        &self,
        record: &mut SagaRecord<D>,
        failed_index: usize,
        cancel: &CancellationToken,
        is_transient: &impl Fn(&E) -> bool,
    ) -> bool {
        let mut all_succeeded = true;

        for j in (0..failed_index).rev() {
            let step = &self.steps[j];
            let backoff = compensation_backoff(&self.config);
            let mut attempt = 0u32;

            let succeeded = loop {
                attempt += 1;
                match step.compensate(&mut record.data_payload, cancel).await {
                    Ok(()) => break true,
                    Err(error) => {
                        if !is_transient(&error) {
                            warn!(step = step.name(), "saga compensation failed, non-transient");
                            break false;
                        }
                        if attempt >= self.config.max_retry_attempts {
                            warn!(step = step.name(), attempt, "saga compensation exhausted retries");
                            break false;
                        }
                        warn!(step = step.name(), attempt, %error, "saga compensation failed, retrying");
                        backoff.sleep_next().await;
                    }
                }
            };

            if !succeeded {
                all_succeeded = false;
                if !self.config.continue_compensation_on_error {
                    break;
                }
            }
        }

        all_succeeded
    }

    fn emit(&self, record: &SagaRecord<D>, kind: SagaEventKind) {
        let event = SagaEvent {
            saga_id: record.saga_id,
            saga_type: record.saga_type.clone(),
            correlation_id: record.correlation_id.clone(),
            kind,
        };

        info!(saga_id = %event.saga_id, saga_type = %event.saga_type, "saga event");

        for listener in self.listeners.lock().iter() {
            listener(&event);
        }
    }
}
