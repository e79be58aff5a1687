use crate::errors::DedupError;
use broker_factory::{impl_deserialize_field, ConfigChoice};
use dashmap::DashMap;
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use sha2::{Digest, Sha256};
use std::fmt::Formatter;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Which attribute of a message a [`DedupCache`] hashes to detect duplicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ConfigChoice)]
#[field(eq_fn = broker_deserialize::Slug::eq_as_slugs)]
pub enum HashStrategy {
    /// A stable hash of the encoded payload bytes.
    #[default]
    ContentHash,
    /// The envelope's `message_id` header, verbatim.
    MessageId,
    /// A caller-supplied fingerprint, computed outside this crate.
    Custom,
}

/// Configuration for a [`DedupCache`].
#[derive(Debug, Clone, PartialEq)]
pub struct DedupConfig {
    pub(crate) enabled: bool,
    pub(crate) window: Duration,
    pub(crate) max_cache_size: usize,
    pub(crate) strategy: HashStrategy,
    pub(crate) cleanup_interval: Duration,
}

impl DedupConfig {
    fn default_enabled() -> bool {
        true
    }

    fn default_window() -> Duration {
        Duration::from_secs(300)
    }

    fn default_max_cache_size() -> usize {
        100_000
    }

    fn default_strategy() -> HashStrategy {
        HashStrategy::default()
    }

    fn default_cleanup_interval() -> Duration {
        Duration::from_secs(60)
    }

    /// Whether this configuration's window and max size are within bounds
    /// (window ≤ 24h, max_cache_size > 0).
    pub fn validate(&self) -> Result<(), DedupError> {
        if self.window > Duration::from_secs(24 * 60 * 60) {
            return Err(DedupError::ConfigInvalid(
                "window must not exceed 24 hours".into(),
            ));
        }
        if self.max_cache_size == 0 {
            return Err(DedupError::ConfigInvalid(
                "max_cache_size must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// The deduplication window.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// The configured maximum number of live entries.
    pub fn max_cache_size(&self) -> usize {
        self.max_cache_size
    }

    /// The hash strategy in use.
    pub fn strategy(&self) -> HashStrategy {
        self.strategy
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            window: Self::default_window(),
            max_cache_size: Self::default_max_cache_size(),
            strategy: Self::default_strategy(),
            cleanup_interval: Self::default_cleanup_interval(),
        }
    }
}

const _: () = {
    impl<'de> Deserialize<'de> for DedupConfig {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            deserializer.deserialize_map(DedupConfigVisitor)
        }
    }

    struct DedupConfigVisitor;

    impl<'de> Visitor<'de> for DedupConfigVisitor {
        type Value = DedupConfig;

        fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
            formatter.write_str("a map of dedup configuration")
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut enabled = None;
            let mut window = None;
            let mut max_cache_size = None;
            let mut strategy = None;
            let mut cleanup_interval = None;

            while let Some(key) = map.next_key()? {
                match key {
                    DedupConfigField::enabled => key.poll(&mut map, &mut enabled)?,
                    DedupConfigField::window => key.poll(&mut map, &mut window)?,
                    DedupConfigField::max_cache_size => {
                        key.poll(&mut map, &mut max_cache_size)?
                    }
                    DedupConfigField::strategy => key.poll(&mut map, &mut strategy)?,
                    DedupConfigField::cleanup_interval => {
                        key.poll(&mut map, &mut cleanup_interval)?
                    }
                    DedupConfigField::__ignore => map.next_value()?,
                };
            }

            Ok(DedupConfig {
                enabled: enabled.unwrap_or_else(DedupConfig::default_enabled),
                window: window.unwrap_or_else(DedupConfig::default_window),
                max_cache_size: max_cache_size.unwrap_or_else(DedupConfig::default_max_cache_size),
                strategy: strategy.unwrap_or_else(DedupConfig::default_strategy),
                cleanup_interval: cleanup_interval
                    .unwrap_or_else(DedupConfig::default_cleanup_interval),
            })
        }
    }

    impl_deserialize_field!(
        DedupConfigField,
        broker_deserialize::Slug::eq_as_slugs,
        enabled,
        window,
        max_cache_size,
        strategy,
        cleanup_interval,
    );
};

struct Entry {
    inserted_at: Instant,
    expires_at: Instant,
    last_accessed_at: parking_lot::Mutex<Instant>,
}

/// Point-in-time snapshot of a [`DedupCache`]'s counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct DedupMetrics {
    /// The number of live (non-expired) entries at the time of the snapshot.
    pub size: usize,
    /// Total number of [`is_duplicate`](DedupCache::is_duplicate) calls that
    /// found a live entry.
    pub hits: u64,
    /// Total number of [`is_duplicate`](DedupCache::is_duplicate) calls that
    /// found no live entry.
    pub misses: u64,
    /// Alias for `hits`: number of messages identified as duplicates.
    pub duplicates_detected: u64,
    /// Total number of entries removed, by expiry or by size-pressure eviction.
    pub evictions: u64,
    /// The instant the background cleanup task last completed a sweep, if
    /// it has run at least once.
    pub last_cleanup_at: Option<Instant>,
}

/// A bounded, time-windowed, concurrently accessed hash store used to detect
/// and discard repeated messages.
///
/// Backed by [`DashMap`] for lock-free concurrent reads and writes; a
/// background task periodically sweeps expired entries, and `is_duplicate`
/// opportunistically evicts an expired entry it encounters in place.
pub struct DedupCache {
    config: DedupConfig,
    entries: Arc<DashMap<String, Entry>>,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
    evictions: Arc<AtomicU64>,
    last_cleanup_at: Arc<parking_lot::Mutex<Option<Instant>>>,
    cleanup_lock: Arc<tokio::sync::Mutex<()>>,
    disposed: Arc<AtomicBool>,
    cleanup_task: Option<JoinHandle<()>>,
}

impl DedupCache {
    /// Builds a new cache from `config`, validating it eagerly and spawning
    /// the background cleanup task.
    pub fn new(config: DedupConfig) -> Result<Self, DedupError> {
        config.validate()?;

        let entries: Arc<DashMap<String, Entry>> = Arc::new(DashMap::new());
        let evictions = Arc::new(AtomicU64::new(0));
        let last_cleanup_at = Arc::new(parking_lot::Mutex::new(None));
        let cleanup_lock = Arc::new(tokio::sync::Mutex::new(()));
        let disposed = Arc::new(AtomicBool::new(false));

        let cleanup_task = if config.enabled {
            Some(tokio::spawn(cleanup_loop(
                entries.clone(),
                evictions.clone(),
                last_cleanup_at.clone(),
                cleanup_lock.clone(),
                disposed.clone(),
                config.cleanup_interval,
            )))
        } else {
            None
        };

        Ok(Self {
            config,
            entries,
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
            evictions,
            last_cleanup_at,
            cleanup_lock,
            disposed,
            cleanup_task,
        })
    }

    /// Computes the dedup hash for a message per this cache's configured
    /// [`HashStrategy`]. The `message_id` argument is required only for the
    /// [`MessageId`](HashStrategy::MessageId) strategy.
    pub fn hash_for(&self, payload: &[u8], message_id: Option<&str>) -> Result<String, DedupError> {
        match self.config.strategy {
            HashStrategy::ContentHash => {
                let mut hasher = Sha256::new();
                hasher.update(payload);
                Ok(format!("{:x}", hasher.finalize()))
            }
            HashStrategy::MessageId => {
                message_id
                    .map(str::to_string)
                    .ok_or(DedupError::MessageIdMissing)
            }
            HashStrategy::Custom => Err(DedupError::ArgumentInvalid(
                "custom strategy requires calling add()/is_duplicate() with a pre-computed hash"
                    .into(),
            )),
        }
    }

    fn require_not_disposed(&self) -> Result<(), DedupError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(DedupError::CacheDisposed);
        }
        Ok(())
    }

    fn validate_hash(hash: &str) -> Result<(), DedupError> {
        if hash.trim().is_empty() {
            return Err(DedupError::ArgumentInvalid(
                "hash must not be null, empty, or whitespace".into(),
            ));
        }
        Ok(())
    }

    /// Reports whether a non-expired entry exists for `hash`, updating
    /// hit/miss counters and, on a hit, `last_accessed_at`. An expired entry
    /// encountered here is evicted in place before returning `false`.
    pub fn is_duplicate(&self, hash: &str) -> Result<bool, DedupError> {
        self.require_not_disposed()?;
        Self::validate_hash(hash)?;

        let now = Instant::now();

        if let Some(entry) = self.entries.get(hash) {
            if entry.expires_at > now {
                *entry.last_accessed_at.lock() = now;
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(true);
            }
        }

        // Either absent, or present-but-expired: drop it if present and count a miss.
        if self.entries.remove(hash).is_some() {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        Ok(false)
    }

    /// Inserts or replaces the entry for `hash`, expiring after `ttl`.
    /// Enforces [`DedupConfig::max_cache_size`] by evicting the
    /// soonest-to-expire entries (ties broken by earliest insertion) when the
    /// cache would otherwise grow past capacity.
    pub fn add(&self, hash: impl Into<String>, ttl: Duration) -> Result<(), DedupError> {
        self.require_not_disposed()?;
        let hash = hash.into();
        Self::validate_hash(&hash)?;

        let now = Instant::now();
        self.entries.insert(
            hash,
            Entry {
                inserted_at: now,
                expires_at: now + ttl,
                last_accessed_at: parking_lot::Mutex::new(now),
            },
        );

        self.enforce_capacity();

        Ok(())
    }

    fn enforce_capacity(&self) {
        if self.entries.len() <= self.config.max_cache_size {
            return;
        }

        let overflow = self.entries.len() - self.config.max_cache_size;
        let mut candidates: Vec<(String, Instant, Instant)> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.expires_at, entry.inserted_at))
            .collect();

        candidates.sort_by(|a, b| a.1.cmp(&b.1).then(a.2.cmp(&b.2)));

        for (key, _, _) in candidates.into_iter().take(overflow) {
            if self.entries.remove(&key).is_some() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// A point-in-time snapshot of this cache's counters.
    pub fn metrics(&self) -> DedupMetrics {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);

        DedupMetrics {
            size: self.entries.len(),
            hits,
            misses,
            duplicates_detected: hits,
            evictions: self.evictions.load(Ordering::Relaxed),
            last_cleanup_at: self.last_cleanup_at(),
        }
    }

    /// The instant the background cleanup task last completed a sweep, if it
    /// has run at least once.
    pub fn last_cleanup_at(&self) -> Option<Instant> {
        *self.last_cleanup_at.lock()
    }

    /// Stops the background cleanup task. Subsequent calls to any other
    /// method fail with [`DedupError::CacheDisposed`].
    pub fn dispose(&mut self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self.cleanup_task.take() {
            task.abort();
        }
    }
}

impl Drop for DedupCache {
    fn drop(&mut self) {
        self.dispose();
    }
}

async fn cleanup_loop(
    entries: Arc<DashMap<String, Entry>>,
    evictions: Arc<AtomicU64>,
    last_cleanup_at: Arc<parking_lot::Mutex<Option<Instant>>>,
    cleanup_lock: Arc<tokio::sync::Mutex<()>>,
    disposed: Arc<AtomicBool>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        if disposed.load(Ordering::Acquire) {
            return;
        }

        // Only one scan at a time; a concurrent trigger (were this ever
        // called from more than one place) returns immediately without work.
        let Ok(_guard) = cleanup_lock.try_lock() else {
            debug!("dedup cleanup already in progress, skipping this tick");
            continue;
        };

        let now = Instant::now();
        let expired: Vec<String> = entries
            .iter()
            .filter(|entry| entry.expires_at <= now)
            .map(|entry| entry.key().clone())
            .collect();

        let removed = expired.len();
        for key in expired {
            entries.remove(&key);
        }

        if removed > 0 {
            evictions.fetch_add(removed as u64, Ordering::Relaxed);
            debug!(removed, "dedup cache cleanup removed expired entries");
        }

        *last_cleanup_at.lock() = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn add_then_is_duplicate_within_window() {
        // Given
        let cache = DedupCache::new(DedupConfig::default()).unwrap();

        // When
        cache.add("abc123", Duration::from_millis(50)).unwrap();

        // Then
        assert!(cache.is_duplicate("abc123").unwrap());
    }

    #[tokio::test]
    async fn entry_expires_after_ttl() {
        // Given
        let cache = DedupCache::new(DedupConfig::default()).unwrap();
        cache.add("abc123", Duration::from_millis(10)).unwrap();

        // When
        tokio::time::sleep(Duration::from_millis(30)).await;

        // Then
        assert!(!cache.is_duplicate("abc123").unwrap());
    }

    #[tokio::test]
    async fn rejects_empty_hash() {
        // Given
        let cache = DedupCache::new(DedupConfig::default()).unwrap();

        // When
        let result = cache.add("   ", Duration::from_secs(1));

        // Then
        assert!(matches!(result, Err(DedupError::ArgumentInvalid(_))));
    }

    #[tokio::test]
    async fn config_rejects_window_over_24h() {
        // Given
        let config = DedupConfig {
            window: Duration::from_secs(25 * 60 * 60),
            ..DedupConfig::default()
        };

        // When
        let result = DedupCache::new(config);

        // Then
        assert!(matches!(result, Err(DedupError::ConfigInvalid(_))));
    }

    #[tokio::test]
    async fn capacity_eviction_keeps_size_bounded() {
        // Given
        let config = DedupConfig {
            max_cache_size: 2,
            ..DedupConfig::default()
        };
        let cache = DedupCache::new(config).unwrap();

        // When
        cache.add("a", Duration::from_secs(10)).unwrap();
        cache.add("b", Duration::from_secs(20)).unwrap();
        cache.add("c", Duration::from_secs(30)).unwrap();

        // Then
        assert_eq!(cache.metrics().size, 2);
        assert!(!cache.is_duplicate("a").unwrap());
    }

    #[tokio::test]
    async fn message_id_strategy_requires_id() {
        // Given
        let config = DedupConfig {
            strategy: HashStrategy::MessageId,
            ..DedupConfig::default()
        };
        let cache = DedupCache::new(config).unwrap();

        // When
        let result = cache.hash_for(b"payload", None);

        // Then
        assert!(matches!(result, Err(DedupError::MessageIdMissing)));
    }

    #[tokio::test]
    async fn dispose_rejects_further_operations() {
        // Given
        let mut cache = DedupCache::new(DedupConfig::default()).unwrap();

        // When
        cache.dispose();

        // Then
        assert!(matches!(
            cache.is_duplicate("abc"),
            Err(DedupError::CacheDisposed)
        ));
    }
}
