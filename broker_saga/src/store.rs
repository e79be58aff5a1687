use crate::errors::PersistenceError;
use crate::record::{SagaRecord, SagaState};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

/// Durable storage for [`SagaRecord`]s, with optimistic concurrency via
/// each record's `version`.
///
/// `save` is used for both the initial insert (`expected_version: None`,
/// meaning "no prior version exists") and subsequent updates
/// (`expected_version: Some(v)`, meaning "the currently stored version must
/// be `v`"). A mismatch fails [`PersistenceError::ConcurrencyConflict`]
/// without applying the write; on success the stored record's `version`
/// becomes `v + 1` (or `0` for an initial insert).
#[async_trait]
pub trait SagaStore<D>: Send + Sync {
    /// Inserts or updates `record`, enforcing `expected_version`.
    async fn save(&self, record: &SagaRecord<D>, expected_version: Option<u64>) -> Result<u64, PersistenceError>;

    /// Looks up a saga by its primary key.
    async fn get_by_id(&self, saga_id: Uuid) -> Option<SagaRecord<D>>;

    /// Looks up a saga by its unique correlation id.
    async fn get_by_correlation_id(&self, correlation_id: &str) -> Option<SagaRecord<D>>;

    /// Removes a saga entirely. A no-op if it does not exist.
    async fn delete(&self, saga_id: Uuid);

    /// Every saga in a state the timeout supervisor watches (`running` or
    /// `compensating`), oldest `created_at` first.
    async fn get_active(&self) -> Vec<SagaRecord<D>>;

    /// Every saga currently in the given state, oldest `created_at` first.
    async fn get_by_state(&self, state: SagaState) -> Vec<SagaRecord<D>>;
}

struct Inner<D> {
    by_id: HashMap<Uuid, SagaRecord<D>>,
    by_correlation: HashMap<String, Uuid>,
    by_state: HashMap<SagaState, BTreeSet<(u64, Uuid)>>,
}

impl<D> Default for Inner<D> {
    fn default() -> Self {
        Self {
            by_id: HashMap::new(),
            by_correlation: HashMap::new(),
            by_state: HashMap::new(),
        }
    }
}

impl<D> Inner<D> {
    fn index_of(&mut self, state: SagaState) -> &mut BTreeSet<(u64, Uuid)> {
        self.by_state.entry(state).or_default()
    }

    fn reindex_state(&mut self, saga_id: Uuid, created_at_ms: u64, from: Option<SagaState>, to: SagaState) {
        if let Some(from) = from {
            self.index_of(from).remove(&(created_at_ms, saga_id));
        }
        self.index_of(to).insert((created_at_ms, saga_id));
    }
}

/// An in-memory reference [`SagaStore`]: authoritative for this crate's own
/// semantics (including concurrency-conflict behavior), and suitable for
/// tests or single-process deployments. Maintains the same secondary
/// lookups a durable store's indexes would (by correlation id, by state,
/// by state+created_at) rather than literal database indexes.
pub struct InMemorySagaStore<D> {
    inner: parking_lot::Mutex<Inner<D>>,
}

impl<D> Default for InMemorySagaStore<D> {
    fn default() -> Self {
        Self {
            inner: parking_lot::Mutex::new(Inner::default()),
        }
    }
}

impl<D> InMemorySagaStore<D> {
    /// Builds an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl<D> SagaStore<D> for InMemorySagaStore<D>
where
    D: Clone + Send + Sync,
{
    async fn save(&self, record: &SagaRecord<D>, expected_version: Option<u64>) -> Result<u64, PersistenceError> {
        let mut inner = self.inner.lock();

        match expected_version {
            None => {
                if let Some(&existing) = inner.by_correlation.get(&record.correlation_id) {
                    if existing != record.saga_id {
                        return Err(PersistenceError::DuplicateCorrelationId(record.correlation_id.clone()));
                    }
                }

                let mut stored = record.clone();
                stored.version = 0;

                inner.by_correlation.insert(stored.correlation_id.clone(), stored.saga_id);
                inner.reindex_state(stored.saga_id, stored.created_at_ms, None, stored.state);
                inner.by_id.insert(stored.saga_id, stored);

                Ok(0)
            }
            Some(expected) => {
                let Some(existing) = inner.by_id.get(&record.saga_id) else {
                    return Err(PersistenceError::NotFound(record.saga_id.to_string()));
                };

                if existing.version != expected {
                    return Err(PersistenceError::ConcurrencyConflict {
                        saga_id: record.saga_id,
                        expected,
                        actual: existing.version,
                    });
                }

                let previous_state = existing.state;
                let new_version = expected + 1;

                let mut stored = record.clone();
                stored.version = new_version;

                inner.reindex_state(stored.saga_id, stored.created_at_ms, Some(previous_state), stored.state);
                inner.by_id.insert(stored.saga_id, stored);

                Ok(new_version)
            }
        }
    }

    async fn get_by_id(&self, saga_id: Uuid) -> Option<SagaRecord<D>> {
        self.inner.lock().by_id.get(&saga_id).cloned()
    }

    async fn get_by_correlation_id(&self, correlation_id: &str) -> Option<SagaRecord<D>> {
        let inner = self.inner.lock();
        let saga_id = *inner.by_correlation.get(correlation_id)?;
        inner.by_id.get(&saga_id).cloned()
    }

    async fn delete(&self, saga_id: Uuid) {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.by_id.remove(&saga_id) {
            inner.by_correlation.remove(&record.correlation_id);
            inner.index_of(record.state).remove(&(record.created_at_ms, saga_id));
        }
    }

    async fn get_active(&self) -> Vec<SagaRecord<D>> {
        let mut records = self.get_by_state(SagaState::Running).await;
        records.extend(self.get_by_state(SagaState::Compensating).await);
        records.sort_by_key(|record| record.created_at_ms);
        records
    }

    async fn get_by_state(&self, state: SagaState) -> Vec<SagaRecord<D>> {
        let inner = self.inner.lock();
        let Some(index) = inner.by_state.get(&state) else {
            return Vec::new();
        };

        index
            .iter()
            .filter_map(|(_, saga_id)| inner.by_id.get(saga_id).cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record(correlation_id: &str) -> SagaRecord<String> {
        SagaRecord::new(correlation_id, "order-saga", "payload".to_string())
    }

    #[tokio::test]
    async fn initial_save_assigns_version_zero() {
        // Given
        let store = InMemorySagaStore::new();
        let record = record("corr-1");

        // When
        let version = store.save(&record, None).await.unwrap();

        // Then
        assert_eq!(version, 0);
        assert_eq!(store.get_by_id(record.saga_id).await.unwrap().version, 0);
    }

    #[tokio::test]
    async fn update_with_stale_expected_version_conflicts() {
        // Given
        let store = InMemorySagaStore::new();
        let mut record = record("corr-2");
        store.save(&record, None).await.unwrap();
        record.state = SagaState::Running;

        // When
        let result = store.save(&record, Some(41)).await;

        // Then
        assert!(matches!(
            result,
            Err(PersistenceError::ConcurrencyConflict { expected: 41, actual: 0, .. })
        ));
    }

    #[tokio::test]
    async fn update_with_correct_expected_version_advances_it() {
        // Given
        let store = InMemorySagaStore::new();
        let mut record = record("corr-3");
        store.save(&record, None).await.unwrap();
        record.state = SagaState::Running;

        // When
        let version = store.save(&record, Some(0)).await.unwrap();

        // Then
        assert_eq!(version, 1);
    }

    #[tokio::test]
    async fn duplicate_correlation_id_under_a_different_saga_is_rejected() {
        // Given
        let store = InMemorySagaStore::new();
        store.save(&record("shared"), None).await.unwrap();
        let other = record("shared");

        // When
        let result = store.save(&other, None).await;

        // Then
        assert!(matches!(result, Err(PersistenceError::DuplicateCorrelationId(_))));
    }

    #[tokio::test]
    async fn get_active_returns_running_and_compensating_only() {
        // Given
        let store = InMemorySagaStore::new();

        let mut running = record("running");
        store.save(&running, None).await.unwrap();
        running.state = SagaState::Running;
        store.save(&running, Some(0)).await.unwrap();

        let mut completed = record("completed");
        store.save(&completed, None).await.unwrap();
        completed.state = SagaState::Completed;
        store.save(&completed, Some(0)).await.unwrap();

        // When
        let active = store.get_active().await;

        // Then
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].correlation_id, "running");
    }

    #[tokio::test]
    async fn delete_removes_record_and_its_indexes() {
        // Given
        let store = InMemorySagaStore::new();
        let record = record("corr-4");
        store.save(&record, None).await.unwrap();

        // When
        store.delete(record.saga_id).await;

        // Then
        assert!(store.get_by_id(record.saga_id).await.is_none());
        assert!(store.get_by_correlation_id("corr-4").await.is_none());
    }
}
