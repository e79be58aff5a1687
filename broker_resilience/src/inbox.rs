use async_trait::async_trait;
use broker_factory::impl_deserialize_field;
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::fmt::Formatter;
use std::time::Duration;
use tracing::debug;

/// Configuration for the inbox decorator.
#[derive(Debug, Clone, PartialEq)]
pub struct InboxConfig {
    pub(crate) enabled: bool,
    pub(crate) retention_period: Duration,
    pub(crate) cleanup_interval: Duration,
    pub(crate) consumer_name: String,
}

impl InboxConfig {
    fn default_enabled() -> bool {
        true
    }

    fn default_retention_period() -> Duration {
        Duration::from_secs(7 * 24 * 3600)
    }

    fn default_cleanup_interval() -> Duration {
        Duration::from_secs(3600)
    }

    fn default_consumer_name() -> String {
        "default".to_string()
    }
}

impl Default for InboxConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            retention_period: Self::default_retention_period(),
            cleanup_interval: Self::default_cleanup_interval(),
            consumer_name: Self::default_consumer_name(),
        }
    }
}

const _: () = {
    impl<'de> Deserialize<'de> for InboxConfig {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            deserializer.deserialize_map(InboxConfigVisitor)
        }
    }

    struct InboxConfigVisitor;

    impl<'de> Visitor<'de> for InboxConfigVisitor {
        type Value = InboxConfig;

        fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
            formatter.write_str("a map of inbox configuration")
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut enabled = None;
            let mut retention_period = None;
            let mut cleanup_interval = None;
            let mut consumer_name = None;

            while let Some(key) = map.next_key()? {
                match key {
                    InboxConfigField::enabled => key.poll(&mut map, &mut enabled)?,
                    InboxConfigField::retention_period => {
                        key.poll(&mut map, &mut retention_period)?
                    }
                    InboxConfigField::cleanup_interval => {
                        key.poll(&mut map, &mut cleanup_interval)?
                    }
                    InboxConfigField::consumer_name => key.poll(&mut map, &mut consumer_name)?,
                    InboxConfigField::__ignore => map.next_value()?,
                };
            }

            Ok(InboxConfig {
                enabled: enabled.unwrap_or_else(InboxConfig::default_enabled),
                retention_period: retention_period
                    .unwrap_or_else(InboxConfig::default_retention_period),
                cleanup_interval: cleanup_interval
                    .unwrap_or_else(InboxConfig::default_cleanup_interval),
                consumer_name: consumer_name.unwrap_or_else(InboxConfig::default_consumer_name),
            })
        }
    }

    impl_deserialize_field!(
        InboxConfigField,
        broker_deserialize::Slug::eq_as_slugs,
        enabled,
        retention_period,
        cleanup_interval,
        consumer_name,
    );
};

/// A single processed-message marker.
#[derive(Debug, Clone, PartialEq)]
pub struct InboxRecord {
    /// The message id this record tracks.
    pub message_id: String,
    /// The message's declared type tag.
    pub message_type: String,
    /// The consumer that processed this message.
    pub consumer_name: String,
    /// Milliseconds since the store's own epoch at which the record was
    /// written.
    pub processed_at_ms: u64,
}

/// Durable idempotency ledger backing the inbox decorator: an
/// already-recorded `(message_id, consumer_name)` pair means the message was
/// already handled and should be skipped rather than re-delivered to the
/// handler.
#[async_trait]
pub trait InboxStore: Send + Sync {
    /// Whether `message_id` has already been recorded for `consumer_name`.
    async fn exists(&self, message_id: &str, consumer_name: &str) -> bool;

    /// Records a processed message. Storing an id already present for the
    /// same consumer overwrites the prior record.
    async fn store(&self, record: InboxRecord);

    /// Removes every record older than `retention`, returning the count
    /// removed.
    async fn cleanup_expired(&self, retention: Duration) -> usize;
}

/// An in-memory reference [`InboxStore`], suitable for tests and for
/// single-process deployments without a durable backing store.
pub struct InMemoryInboxStore {
    records: parking_lot::Mutex<HashMap<(String, String), InboxRecord>>,
    epoch: std::time::Instant,
}

impl Default for InMemoryInboxStore {
    fn default() -> Self {
        Self {
            records: parking_lot::Mutex::new(HashMap::new()),
            epoch: std::time::Instant::now(),
        }
    }
}

impl InMemoryInboxStore {
    /// Builds an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn key(message_id: &str, consumer_name: &str) -> (String, String) {
        (message_id.to_string(), consumer_name.to_string())
    }
}

#[async_trait]
impl InboxStore for InMemoryInboxStore {
    async fn exists(&self, message_id: &str, consumer_name: &str) -> bool {
        self.records
            .lock()
            .contains_key(&Self::key(message_id, consumer_name))
    }

    async fn store(&self, record: InboxRecord) {
        let key = Self::key(&record.message_id, &record.consumer_name);
        self.records.lock().insert(key, record);
    }

    async fn cleanup_expired(&self, retention: Duration) -> usize {
        let now = self.now_ms();
        let retention_ms = retention.as_millis() as u64;
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, record| now.saturating_sub(record.processed_at_ms) < retention_ms);
        let removed = before - records.len();
        if removed > 0 {
            debug!(removed, "inbox store: cleanup removed expired records");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn unknown_message_does_not_exist() {
        // Given
        let store = InMemoryInboxStore::new();

        // When
        let exists = store.exists("msg-1", "consumer-a").await;

        // Then
        assert!(!exists);
    }

    #[tokio::test]
    async fn stored_message_exists_for_its_consumer_only() {
        // Given
        let store = InMemoryInboxStore::new();
        store
            .store(InboxRecord {
                message_id: "msg-1".to_string(),
                message_type: "OrderPlaced".to_string(),
                consumer_name: "consumer-a".to_string(),
                processed_at_ms: 0,
            })
            .await;

        // When / Then
        assert!(store.exists("msg-1", "consumer-a").await);
        assert!(!store.exists("msg-1", "consumer-b").await);
    }

    #[tokio::test]
    async fn storing_same_id_overwrites_prior_record() {
        // Given
        let store = InMemoryInboxStore::new();
        store
            .store(InboxRecord {
                message_id: "msg-1".to_string(),
                message_type: "OrderPlaced".to_string(),
                consumer_name: "consumer-a".to_string(),
                processed_at_ms: 0,
            })
            .await;

        // When
        store
            .store(InboxRecord {
                message_id: "msg-1".to_string(),
                message_type: "OrderPlaced".to_string(),
                consumer_name: "consumer-a".to_string(),
                processed_at_ms: 100,
            })
            .await;

        // Then
        assert_eq!(store.records.lock().len(), 1);
    }

    #[tokio::test]
    async fn cleanup_removes_only_expired_records() {
        // Given
        let store = InMemoryInboxStore::new();
        store
            .store(InboxRecord {
                message_id: "old".to_string(),
                message_type: "OrderPlaced".to_string(),
                consumer_name: "consumer-a".to_string(),
                processed_at_ms: 0,
            })
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        store
            .store(InboxRecord {
                message_id: "fresh".to_string(),
                message_type: "OrderPlaced".to_string(),
                consumer_name: "consumer-a".to_string(),
                processed_at_ms: store.now_ms(),
            })
            .await;

        // When
        let removed = store.cleanup_expired(Duration::from_millis(15)).await;

        // Then
        assert_eq!(removed, 1);
        assert!(!store.exists("old", "consumer-a").await);
        assert!(store.exists("fresh", "consumer-a").await);
    }
}
