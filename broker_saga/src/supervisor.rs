use crate::config::SagaConfig;
use crate::errors::PersistenceError;
use crate::record::{now_ms, SagaRecord, SagaState};
use crate::store::SagaStore;
use broker_sync::Gate;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// The outcome of a single timeout-sweep cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct SagaCycleResult {
    /// How many `running`/`compensating` sagas were examined.
    pub checked_count: usize,
    /// How many of those were past their effective timeout and transitioned.
    pub timed_out_count: usize,
}

/// Periodically sweeps `running` and `compensating` sagas, forcing a
/// `running` saga that has stopped progressing into `compensating`, and a
/// `compensating` saga that never finishes into `failed`.
///
/// A per-saga effective timeout comes from `metadata["Timeout"]` (seconds)
/// if present, else the configured default. A failure checking one saga is
/// logged and does not stop the sweep; shutdown via [`Gate`] is graceful —
/// the in-flight cycle completes before the loop exits.
pub struct SagaTimeoutSupervisor<D> {
    store: Arc<dyn SagaStore<D>>,
    config: SagaConfig,
}

impl<D> SagaTimeoutSupervisor<D>
where
    D: Clone + Send + Sync + 'static,
{
    /// Builds a supervisor over the given store, using the store's config
    /// for both the sweep interval and the default per-saga timeout.
    pub fn new(store: Arc<dyn SagaStore<D>>, config: SagaConfig) -> Self {
        Self { store, config }
    }

    fn effective_timeout(&self, record: &SagaRecord<D>) -> Duration {
        record
            .metadata_timeout_secs()
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.config.default_timeout())
    }

    /// Runs a single sweep cycle over every active saga, returning how many
    /// were checked and how many timed out.
    pub async fn run_cycle(&self) -> SagaCycleResult {
        let active = self.store.get_active().await;
        let checked_count = active.len();
        let mut timed_out_count = 0;

        for record in &active {
            match self.check_one(record).await {
                Ok(true) => timed_out_count += 1,
                Ok(false) => {}
                Err(error) => {
                    warn!(saga_id = %record.saga_id, %error, "saga timeout supervisor: failed to persist transition");
                }
            }
        }

        SagaCycleResult { checked_count, timed_out_count }
    }

    async fn check_one(&self, record: &SagaRecord<D>) -> Result<bool, PersistenceError> {
        let timeout = self.effective_timeout(record);
        let now = now_ms();
        let elapsed = Duration::from_millis(now.saturating_sub(record.updated_at_ms));

        if elapsed < timeout {
            return Ok(false);
        }

        let mut updated = record.clone();
        match record.state {
            SagaState::Running => {
                updated.state = SagaState::Compensating;
                updated
                    .metadata
                    .insert("TimedOut".to_string(), serde_json::Value::Bool(true));
            }
            SagaState::Compensating => {
                updated.state = SagaState::Failed;
                updated
                    .metadata
                    .insert("CompensationTimedOut".to_string(), serde_json::Value::Bool(true));
            }
            _ => return Ok(false),
        }
        updated.updated_at_ms = now;

        self.store.save(&updated, Some(record.version)).await?;

        Ok(true)
    }

    /// Runs the sweep loop at the configured interval until `shutdown`
    /// opens. The cycle in flight when shutdown is signalled always
    /// completes before the loop exits.
    pub async fn run(&self, shutdown: Gate) {
        let mut interval = tokio::time::interval(self.config.persistence_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.opened() => {
                    debug!("saga timeout supervisor: shutdown signal received, exiting");
                    break;
                }
                _ = interval.tick() => {
                    let result = self.run_cycle().await;
                    debug!(
                        checked = result.checked_count,
                        timed_out = result.timed_out_count,
                        "saga timeout supervisor: cycle complete"
                    );
                }
            }
        }
    }
}
