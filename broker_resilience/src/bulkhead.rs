use crate::errors::BulkheadError;
use broker_factory::impl_deserialize_field;
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use std::fmt::Formatter;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Configuration for a [`Bulkhead`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BulkheadConfig {
    pub(crate) enabled: bool,
    pub(crate) max_concurrent: usize,
    pub(crate) max_queued: usize,
    pub(crate) acquisition_timeout: Duration,
}

impl BulkheadConfig {
    fn default_enabled() -> bool {
        true
    }

    fn default_max_concurrent() -> usize {
        16
    }

    fn default_max_queued() -> usize {
        64
    }

    fn default_acquisition_timeout() -> Duration {
        Duration::from_secs(5)
    }
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            max_concurrent: Self::default_max_concurrent(),
            max_queued: Self::default_max_queued(),
            acquisition_timeout: Self::default_acquisition_timeout(),
        }
    }
}

const _: () = {
    impl<'de> Deserialize<'de> for BulkheadConfig {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            deserializer.deserialize_map(BulkheadConfigVisitor)
        }
    }

    struct BulkheadConfigVisitor;

    impl<'de> Visitor<'de> for BulkheadConfigVisitor {
        type Value = BulkheadConfig;

        fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
            formatter.write_str("a map of bulkhead configuration")
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut enabled = None;
            let mut max_concurrent = None;
            let mut max_queued = None;
            let mut acquisition_timeout = None;

            while let Some(key) = map.next_key()? {
                match key {
                    BulkheadConfigField::enabled => key.poll(&mut map, &mut enabled)?,
                    BulkheadConfigField::max_concurrent => {
                        key.poll(&mut map, &mut max_concurrent)?
                    }
                    BulkheadConfigField::max_queued => key.poll(&mut map, &mut max_queued)?,
                    BulkheadConfigField::acquisition_timeout => {
                        key.poll(&mut map, &mut acquisition_timeout)?
                    }
                    BulkheadConfigField::__ignore => map.next_value()?,
                };
            }

            Ok(BulkheadConfig {
                enabled: enabled.unwrap_or_else(BulkheadConfig::default_enabled),
                max_concurrent: max_concurrent
                    .unwrap_or_else(BulkheadConfig::default_max_concurrent),
                max_queued: max_queued.unwrap_or_else(BulkheadConfig::default_max_queued),
                acquisition_timeout: acquisition_timeout
                    .unwrap_or_else(BulkheadConfig::default_acquisition_timeout),
            })
        }
    }

    impl_deserialize_field!(
        BulkheadConfigField,
        broker_deserialize::Slug::eq_as_slugs,
        enabled,
        max_concurrent,
        max_queued,
        acquisition_timeout,
    );
};

/// A point-in-time snapshot of a [`Bulkhead`]'s counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct BulkheadMetrics {
    /// Operations currently executing.
    pub active: usize,
    /// Operations currently waiting for a slot.
    pub queued: usize,
    /// Total operations rejected outright (queue was also full).
    pub rejected_total: u64,
    /// Total operations that ran to completion.
    pub executed_total: u64,
    /// The highest `active` count observed.
    pub max_observed_active: usize,
    /// The highest `queued` count observed.
    pub max_observed_queued: usize,
    /// The mean time a permit-holding call spent waiting for its slot,
    /// averaged over every call that eventually acquired one (immediate
    /// acquisitions count as zero wait).
    pub average_wait: Duration,
}

/// Bounds concurrent execution to `max_concurrent`, queueing up to
/// `max_queued` additional waiters (FIFO, via [`tokio::sync::Semaphore`]'s
/// own fair wake order) before rejecting outright.
pub struct Bulkhead {
    config: BulkheadConfig,
    semaphore: Arc<Semaphore>,
    queued: Arc<AtomicUsize>,
    rejected_total: Arc<std::sync::atomic::AtomicU64>,
    executed_total: Arc<std::sync::atomic::AtomicU64>,
    max_observed_active: Arc<AtomicUsize>,
    max_observed_queued: Arc<AtomicUsize>,
    total_wait_nanos: Arc<AtomicU64>,
    wait_samples: Arc<AtomicU64>,
}

impl Bulkhead {
    /// Builds a new bulkhead from the given configuration.
    pub fn new(config: BulkheadConfig) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            config,
            queued: Arc::new(AtomicUsize::new(0)),
            rejected_total: Arc::new(AtomicU64::new(0)),
            executed_total: Arc::new(AtomicU64::new(0)),
            max_observed_active: Arc::new(AtomicUsize::new(0)),
            max_observed_queued: Arc::new(AtomicUsize::new(0)),
            total_wait_nanos: Arc::new(AtomicU64::new(0)),
            wait_samples: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Runs `f`, bounding concurrency per this bulkhead's configuration.
    ///
    /// If a slot is immediately available, `f` runs right away. Otherwise,
    /// if the wait queue has room, this call waits up to
    /// [`acquisition_timeout`](BulkheadConfig) for a slot to free up; a wait
    /// that times out (or that finds the queue already full) fails with
    /// [`BulkheadError::Rejected`]. Cancelling `cancel` while queued removes
    /// the waiter without running `f` and fails with
    /// [`BulkheadError::Cancelled`].
    pub async fn execute<F, Fut, T>(&self, cancel: &CancellationToken, f: F) -> Result<T, BulkheadError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if !self.config.enabled {
            return Ok(f().await);
        }

        if cancel.is_cancelled() {
            return Err(BulkheadError::Cancelled);
        }

        let active = self.config.max_concurrent - self.semaphore.available_permits();
        let wait_start = Instant::now();

        let permit = if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
            permit
        } else {
            let queued_now = self.queued.fetch_add(1, Ordering::SeqCst) + 1;
            self.bump_max(&self.max_observed_queued, queued_now);

            if queued_now > self.config.max_queued {
                self.queued.fetch_sub(1, Ordering::SeqCst);
                self.rejected_total.fetch_add(1, Ordering::Relaxed);
                warn!(active, queued = queued_now - 1, "bulkhead rejected: queue full");
                return Err(BulkheadError::Rejected {
                    active,
                    queued: queued_now - 1,
                });
            }

            let acquired = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.queued.fetch_sub(1, Ordering::SeqCst);
                    return Err(BulkheadError::Cancelled);
                }
                acquired = timeout(
                    self.config.acquisition_timeout,
                    self.semaphore.clone().acquire_owned(),
                ) => acquired,
            };

            self.queued.fetch_sub(1, Ordering::SeqCst);

            match acquired {
                Ok(Ok(permit)) => permit,
                _ => {
                    self.rejected_total.fetch_add(1, Ordering::Relaxed);
                    return Err(BulkheadError::Rejected {
                        active: self.config.max_concurrent - self.semaphore.available_permits(),
                        queued: self.queued.load(Ordering::SeqCst),
                    });
                }
            }
        };

        self.total_wait_nanos.fetch_add(wait_start.elapsed().as_nanos() as u64, Ordering::Relaxed);
        self.wait_samples.fetch_add(1, Ordering::Relaxed);

        let active_now = self.config.max_concurrent - self.semaphore.available_permits();
        self.bump_max(&self.max_observed_active, active_now);

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                drop(permit);
                return Err(BulkheadError::Cancelled);
            }
            result = f() => result,
        };

        drop(permit);
        self.executed_total.fetch_add(1, Ordering::Relaxed);

        Ok(result)
    }

    fn bump_max(&self, slot: &AtomicUsize, observed: usize) {
        let mut current = slot.load(Ordering::Relaxed);
        while observed > current {
            match slot.compare_exchange_weak(current, observed, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    /// A point-in-time snapshot of this bulkhead's counters.
    pub fn metrics(&self) -> BulkheadMetrics {
        let samples = self.wait_samples.load(Ordering::Relaxed);
        let average_wait = if samples == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(self.total_wait_nanos.load(Ordering::Relaxed) / samples)
        };

        BulkheadMetrics {
            active: self.config.max_concurrent - self.semaphore.available_permits(),
            queued: self.queued.load(Ordering::Relaxed),
            rejected_total: self.rejected_total.load(Ordering::Relaxed),
            executed_total: self.executed_total.load(Ordering::Relaxed),
            max_observed_active: self.max_observed_active.load(Ordering::Relaxed),
            max_observed_queued: self.max_observed_queued.load(Ordering::Relaxed),
            average_wait,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn runs_immediately_when_under_limit() {
        // Given
        let bulkhead = Bulkhead::new(BulkheadConfig {
            max_concurrent: 2,
            ..BulkheadConfig::default()
        });
        let cancel = CancellationToken::new();

        // When
        let result = bulkhead.execute(&cancel, || async { 42 }).await.unwrap();

        // Then
        assert_eq!(result, 42);
        assert_eq!(bulkhead.metrics().executed_total, 1);
    }

    #[tokio::test]
    async fn rejects_when_both_active_and_queue_are_full() {
        // Given
        let bulkhead = Arc::new(Bulkhead::new(BulkheadConfig {
            max_concurrent: 1,
            max_queued: 0,
            acquisition_timeout: Duration::from_millis(50),
            ..BulkheadConfig::default()
        }));
        let in_flight = Arc::new(tokio::sync::Notify::new());
        let release = Arc::new(tokio::sync::Notify::new());
        let cancel = CancellationToken::new();

        let held = {
            let bulkhead = bulkhead.clone();
            let in_flight = in_flight.clone();
            let release = release.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                bulkhead
                    .execute(&cancel, || async move {
                        in_flight.notify_one();
                        release.notified().await;
                    })
                    .await
            })
        };
        in_flight.notified().await;

        // When
        let result = bulkhead.execute(&cancel, || async { 1 }).await;

        // Then
        assert!(matches!(result, Err(BulkheadError::Rejected { .. })));

        release.notify_one();
        held.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn queued_waiter_eventually_runs() {
        // Given
        let bulkhead = Arc::new(Bulkhead::new(BulkheadConfig {
            max_concurrent: 1,
            max_queued: 4,
            acquisition_timeout: Duration::from_millis(200),
            ..BulkheadConfig::default()
        }));
        let counter = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        // When
        let first = {
            let bulkhead = bulkhead.clone();
            let counter = counter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                bulkhead
                    .execute(&cancel, || async move {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        counter.fetch_add(1, Ordering::SeqCst);
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = bulkhead
            .execute(&cancel, || async {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        // Then
        first.await.unwrap().unwrap();
        assert!(second.is_ok());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(bulkhead.metrics().average_wait > Duration::ZERO);
    }

    #[tokio::test]
    async fn cancelling_a_queued_waiter_removes_it_without_executing() {
        // Given
        let bulkhead = Arc::new(Bulkhead::new(BulkheadConfig {
            max_concurrent: 1,
            max_queued: 4,
            acquisition_timeout: Duration::from_millis(200),
            ..BulkheadConfig::default()
        }));
        let in_flight = Arc::new(tokio::sync::Notify::new());
        let release = Arc::new(tokio::sync::Notify::new());
        let cancel = CancellationToken::new();
        let ran = Arc::new(AtomicU32::new(0));

        let held = {
            let bulkhead = bulkhead.clone();
            let in_flight = in_flight.clone();
            let release = release.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                bulkhead
                    .execute(&cancel, || async move {
                        in_flight.notify_one();
                        release.notified().await;
                    })
                    .await
            })
        };
        in_flight.notified().await;

        // When: the waiter is cancelled before a slot frees up.
        let waiter_cancel = CancellationToken::new();
        let ran_clone = ran.clone();
        let waiting = {
            let bulkhead = bulkhead.clone();
            let waiter_cancel = waiter_cancel.clone();
            tokio::spawn(async move {
                bulkhead
                    .execute(&waiter_cancel, || async move {
                        ran_clone.fetch_add(1, Ordering::SeqCst);
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        waiter_cancel.cancel();
        let result = waiting.await.unwrap();

        // Then
        assert!(matches!(result, Err(BulkheadError::Cancelled)));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(bulkhead.metrics().queued, 0);

        release.notify_one();
        held.await.unwrap().unwrap();
    }
}
