use crate::errors::RateLimiterError;
use broker_factory::impl_deserialize_field;
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use std::fmt::Formatter;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Configuration for a [`RateLimiter`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimiterConfig {
    pub(crate) capacity: u64,
    pub(crate) refill_per_second: u64,
}

impl RateLimiterConfig {
    fn default_capacity() -> u64 {
        100
    }

    fn default_refill_per_second() -> u64 {
        100
    }
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            capacity: Self::default_capacity(),
            refill_per_second: Self::default_refill_per_second(),
        }
    }
}

const _: () = {
    impl<'de> Deserialize<'de> for RateLimiterConfig {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            deserializer.deserialize_map(RateLimiterConfigVisitor)
        }
    }

    struct RateLimiterConfigVisitor;

    impl<'de> Visitor<'de> for RateLimiterConfigVisitor {
        type Value = RateLimiterConfig;

        fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
            formatter.write_str("a map of rate limiter configuration")
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut capacity = None;
            let mut refill_per_second = None;

            while let Some(key) = map.next_key()? {
                match key {
                    RateLimiterConfigField::capacity => key.poll(&mut map, &mut capacity)?,
                    RateLimiterConfigField::refill_per_second => {
                        key.poll(&mut map, &mut refill_per_second)?
                    }
                    RateLimiterConfigField::__ignore => map.next_value()?,
                };
            }

            Ok(RateLimiterConfig {
                capacity: capacity.unwrap_or_else(RateLimiterConfig::default_capacity),
                refill_per_second: refill_per_second
                    .unwrap_or_else(RateLimiterConfig::default_refill_per_second),
            })
        }
    }

    impl_deserialize_field!(
        RateLimiterConfigField,
        broker_deserialize::Slug::eq_as_slugs,
        capacity,
        refill_per_second,
    );
};

/// A token-bucket rate limiter: `capacity` tokens, refilled continuously at
/// `refill_per_second` tokens/sec, never exceeding `capacity`.
pub struct RateLimiter {
    config: RateLimiterConfig,
    state: parking_lot::Mutex<BucketState>,
    epoch: Instant,
}

struct BucketState {
    tokens: f64,
    last_refill_ms: u64,
}

impl RateLimiter {
    /// Builds a new limiter, starting with a full bucket.
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            state: parking_lot::Mutex::new(BucketState {
                tokens: config.capacity as f64,
                last_refill_ms: 0,
            }),
            config,
            epoch: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn refill(&self, state: &mut BucketState) {
        let now = self.now_ms();
        let elapsed_ms = now.saturating_sub(state.last_refill_ms);
        if elapsed_ms == 0 {
            return;
        }
        let refilled = (elapsed_ms as f64 / 1000.0) * self.config.refill_per_second as f64;
        state.tokens = (state.tokens + refilled).min(self.config.capacity as f64);
        state.last_refill_ms = now;
    }

    /// Attempts to acquire `n` tokens immediately, without waiting.
    ///
    /// Fails with [`RateLimiterError::RateLimited`] if fewer than `n` tokens
    /// are currently available, naming how long until enough tokens refill.
    pub fn try_acquire(&self, n: u64) -> Result<(), RateLimiterError> {
        let mut state = self.state.lock();
        self.refill(&mut state);

        if state.tokens >= n as f64 {
            state.tokens -= n as f64;
            return Ok(());
        }

        let deficit = n as f64 - state.tokens;
        let retry_after_ms = if self.config.refill_per_second == 0 {
            u64::MAX
        } else {
            ((deficit / self.config.refill_per_second as f64) * 1000.0).ceil() as u64
        };
        debug!(n, retry_after_ms, "rate limiter: insufficient tokens");

        Err(RateLimiterError::RateLimited {
            retry_after_ms,
            reset_at_ms: self.now_ms().saturating_add(retry_after_ms),
        })
    }

    /// Convenience for acquiring a single token.
    pub fn try_acquire_one(&self) -> Result<(), RateLimiterError> {
        self.try_acquire(1)
    }

    /// Waits (if necessary) until `n` tokens are available, then acquires
    /// them, sleeping in increments bounded by the bucket's refill rate.
    /// Cancelling `cancel` aborts the wait and fails with
    /// [`RateLimiterError::Cancelled`].
    pub async fn acquire(&self, cancel: &CancellationToken, n: u64) -> Result<(), RateLimiterError> {
        if cancel.is_cancelled() {
            return Err(RateLimiterError::Cancelled);
        }

        loop {
            match self.try_acquire(n) {
                Ok(()) => return Ok(()),
                Err(RateLimiterError::RateLimited { retry_after_ms, .. }) => {
                    if retry_after_ms == u64::MAX {
                        return Err(RateLimiterError::RateLimited {
                            retry_after_ms,
                            reset_at_ms: u64::MAX,
                        });
                    }
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(RateLimiterError::Cancelled),
                        _ = tokio::time::sleep(Duration::from_millis(retry_after_ms)) => {}
                    }
                }
                Err(RateLimiterError::Cancelled) => return Err(RateLimiterError::Cancelled),
            }
        }
    }

    /// A point-in-time snapshot of the available token count.
    pub fn available_tokens(&self) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn acquires_immediately_within_capacity() {
        // Given
        let limiter = RateLimiter::new(RateLimiterConfig {
            capacity: 5,
            refill_per_second: 1,
        });

        // When
        for _ in 0..5 {
            limiter.try_acquire_one().unwrap();
        }
        let result = limiter.try_acquire_one();

        // Then
        assert!(matches!(result, Err(RateLimiterError::RateLimited { .. })));
    }

    #[test]
    fn reports_retry_after_when_exhausted() {
        // Given
        let limiter = RateLimiter::new(RateLimiterConfig {
            capacity: 1,
            refill_per_second: 10,
        });
        limiter.try_acquire_one().unwrap();

        // When
        let err = limiter.try_acquire_one().unwrap_err();

        // Then
        match err {
            RateLimiterError::RateLimited { retry_after_ms, .. } => {
                assert!(retry_after_ms > 0 && retry_after_ms <= 200);
            }
        }
    }

    #[tokio::test]
    async fn refills_over_time() {
        // Given
        let limiter = RateLimiter::new(RateLimiterConfig {
            capacity: 2,
            refill_per_second: 100,
        });
        limiter.try_acquire(2).unwrap();

        // When
        tokio::time::sleep(Duration::from_millis(30)).await;

        // Then
        assert!(limiter.available_tokens() > 0.0);
    }

    #[tokio::test]
    async fn acquire_waits_for_refill() {
        // Given
        let limiter = RateLimiter::new(RateLimiterConfig {
            capacity: 1,
            refill_per_second: 50,
        });
        limiter.try_acquire_one().unwrap();
        let cancel = CancellationToken::new();

        // When
        let result =
            tokio::time::timeout(Duration::from_millis(500), limiter.acquire(&cancel, 1)).await;

        // Then
        assert!(result.unwrap().is_ok());
    }

    #[tokio::test]
    async fn cancelling_the_wait_aborts_without_acquiring() {
        // Given
        let limiter = RateLimiter::new(RateLimiterConfig {
            capacity: 1,
            refill_per_second: 1,
        });
        limiter.try_acquire_one().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        // When
        let result = limiter.acquire(&cancel, 1).await;

        // Then
        assert!(matches!(result, Err(RateLimiterError::Cancelled)));
    }
}
