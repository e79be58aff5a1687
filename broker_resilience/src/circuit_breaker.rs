use crate::errors::CircuitBreakerError;
use broker_factory::impl_deserialize_field;
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use std::fmt::Formatter;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// The lifecycle state of a [`CircuitBreaker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls are let through normally.
    Closed,
    /// Calls are short-circuited without running the wrapped operation.
    Open,
    /// A single probe call is admitted; others are short-circuited.
    HalfOpen,
}

/// Configuration for a [`CircuitBreaker`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircuitBreakerConfig {
    pub(crate) failure_threshold: u32,
    pub(crate) failure_rate_threshold: f64,
    pub(crate) min_throughput: u32,
    pub(crate) break_duration: Duration,
    pub(crate) success_threshold: u32,
}

impl CircuitBreakerConfig {
    fn default_failure_threshold() -> u32 {
        5
    }

    fn default_failure_rate_threshold() -> f64 {
        0.5
    }

    fn default_min_throughput() -> u32 {
        10
    }

    fn default_break_duration() -> Duration {
        Duration::from_secs(30)
    }

    fn default_success_threshold() -> u32 {
        2
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: Self::default_failure_threshold(),
            failure_rate_threshold: Self::default_failure_rate_threshold(),
            min_throughput: Self::default_min_throughput(),
            break_duration: Self::default_break_duration(),
            success_threshold: Self::default_success_threshold(),
        }
    }
}

const _: () = {
    impl<'de> Deserialize<'de> for CircuitBreakerConfig {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            deserializer.deserialize_map(CircuitBreakerConfigVisitor)
        }
    }

    struct CircuitBreakerConfigVisitor;

    impl<'de> Visitor<'de> for CircuitBreakerConfigVisitor {
        type Value = CircuitBreakerConfig;

        fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
            formatter.write_str("a map of circuit breaker configuration")
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut failure_threshold = None;
            let mut failure_rate_threshold = None;
            let mut min_throughput = None;
            let mut break_duration = None;
            let mut success_threshold = None;

            while let Some(key) = map.next_key()? {
                match key {
                    CircuitBreakerConfigField::failure_threshold => {
                        key.poll(&mut map, &mut failure_threshold)?
                    }
                    CircuitBreakerConfigField::failure_rate_threshold => {
                        key.poll(&mut map, &mut failure_rate_threshold)?
                    }
                    CircuitBreakerConfigField::min_throughput => {
                        key.poll(&mut map, &mut min_throughput)?
                    }
                    CircuitBreakerConfigField::break_duration => {
                        key.poll(&mut map, &mut break_duration)?
                    }
                    CircuitBreakerConfigField::success_threshold => {
                        key.poll(&mut map, &mut success_threshold)?
                    }
                    CircuitBreakerConfigField::__ignore => map.next_value()?,
                };
            }

            Ok(CircuitBreakerConfig {
                failure_threshold: failure_threshold
                    .unwrap_or_else(CircuitBreakerConfig::default_failure_threshold),
                failure_rate_threshold: failure_rate_threshold
                    .unwrap_or_else(CircuitBreakerConfig::default_failure_rate_threshold),
                min_throughput: min_throughput
                    .unwrap_or_else(CircuitBreakerConfig::default_min_throughput),
                break_duration: break_duration
                    .unwrap_or_else(CircuitBreakerConfig::default_break_duration),
                success_threshold: success_threshold
                    .unwrap_or_else(CircuitBreakerConfig::default_success_threshold),
            })
        }
    }

    impl_deserialize_field!(
        CircuitBreakerConfigField,
        broker_deserialize::Slug::eq_as_slugs,
        failure_threshold,
        failure_rate_threshold,
        min_throughput,
        break_duration,
        success_threshold,
    );
};

#[derive(Debug)]
struct Counters {
    success: AtomicU32,
    failure: AtomicU32,
    total: AtomicU32,
    consecutive_failure: AtomicU32,
}

impl Counters {
    fn new() -> Self {
        Self {
            success: AtomicU32::new(0),
            failure: AtomicU32::new(0),
            total: AtomicU32::new(0),
            consecutive_failure: AtomicU32::new(0),
        }
    }

    fn reset(&self) {
        self.success.store(0, Ordering::Relaxed);
        self.failure.store(0, Ordering::Relaxed);
        self.total.store(0, Ordering::Relaxed);
        self.consecutive_failure.store(0, Ordering::Relaxed);
    }
}

/// A failure-rate state machine: once a downstream dependency fails enough,
/// the breaker opens and short-circuits further calls for a cooldown period
/// before probing recovery.
///
/// Only failures the caller's classifier (passed to
/// [`call`](CircuitBreaker::call)) marks as transient count toward opening;
/// non-transient failures pass through without affecting breaker state.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: parking_lot::RwLock<CircuitState>,
    counters: Counters,
    opened_at_ms: AtomicU64,
    half_open_probe_in_flight: std::sync::atomic::AtomicBool,
    epoch: Instant,
}

impl CircuitBreaker {
    /// Builds a new breaker, starting [closed](CircuitState::Closed).
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: parking_lot::RwLock::new(CircuitState::Closed),
            counters: Counters::new(),
            opened_at_ms: AtomicU64::new(0),
            half_open_probe_in_flight: std::sync::atomic::AtomicBool::new(false),
            epoch: Instant::now(),
        }
    }

    /// The breaker's current state, transitioning out of
    /// [`Open`](CircuitState::Open) into [`HalfOpen`](CircuitState::HalfOpen)
    /// first if `break_duration` has elapsed.
    pub fn state(&self) -> CircuitState {
        self.maybe_transition_to_half_open();
        *self.state.read()
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn maybe_transition_to_half_open(&self) {
        let mut state = self.state.write();
        if *state != CircuitState::Open {
            return;
        }

        let opened_at = self.opened_at_ms.load(Ordering::Acquire);
        if self.now_ms().saturating_sub(opened_at) >= self.config.break_duration.as_millis() as u64 {
            *state = CircuitState::HalfOpen;
            debug!("circuit breaker transitioning open -> half-open");
        }
    }

    /// Runs `f`, short-circuiting with [`CircuitBreakerError::CircuitOpen`]
    /// when this breaker is open (or half-open with a probe already
    /// in-flight). `is_transient` classifies a returned error as
    /// breaker-relevant; non-transient errors pass through unaffected.
    /// Cancelling `cancel` aborts `f` (if already admitted) and fails with
    /// [`CircuitBreakerError::Cancelled`] without affecting breaker state.
    pub async fn call<F, Fut, T, E>(
        &self,
        cancel: &CancellationToken,
        is_transient: impl Fn(&E) -> bool,
        f: F,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if cancel.is_cancelled() {
            return Err(CircuitBreakerError::Cancelled);
        }

        let admitted_half_open = match self.state() {
            CircuitState::Open => {
                warn!("circuit breaker open, short-circuiting call");
                return Err(CircuitBreakerError::CircuitOpen {
                    state: CircuitState::Open,
                    consecutive_failures: self.counters.consecutive_failure.load(Ordering::Relaxed),
                });
            }
            CircuitState::HalfOpen => {
                if self
                    .half_open_probe_in_flight
                    .swap(true, Ordering::AcqRel)
                {
                    return Err(CircuitBreakerError::CircuitOpen {
                        state: CircuitState::HalfOpen,
                        consecutive_failures: self.counters.consecutive_failure.load(Ordering::Relaxed),
                    });
                }
                true
            }
            CircuitState::Closed => false,
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                if admitted_half_open {
                    self.half_open_probe_in_flight.store(false, Ordering::Release);
                }
                return Err(CircuitBreakerError::Cancelled);
            }
            result = f() => result,
        };
        let was_half_open = *self.state.read() == CircuitState::HalfOpen;

        match &result {
            Ok(_) => self.on_success(was_half_open),
            Err(error) if is_transient(error) => self.on_transient_failure(was_half_open),
            Err(_) => {}
        }

        if was_half_open {
            self.half_open_probe_in_flight.store(false, Ordering::Release);
        }

        result.map_err(CircuitBreakerError::Inner)
    }

    fn on_success(&self, was_half_open: bool) {
        self.counters.success.fetch_add(1, Ordering::Relaxed);
        self.counters.total.fetch_add(1, Ordering::Relaxed);
        self.counters.consecutive_failure.store(0, Ordering::Relaxed);

        if was_half_open {
            let successes = self.counters.success.fetch_add(0, Ordering::Relaxed);
            if successes >= self.config.success_threshold {
                *self.state.write() = CircuitState::Closed;
                self.counters.reset();
                debug!("circuit breaker transitioning half-open -> closed");
            }
        }
    }

    fn on_transient_failure(&self, was_half_open: bool) {
        self.counters.failure.fetch_add(1, Ordering::Relaxed);
        let total = self.counters.total.fetch_add(1, Ordering::Relaxed) + 1;
        let consecutive = self.counters.consecutive_failure.fetch_add(1, Ordering::Relaxed) + 1;

        if was_half_open {
            self.open();
            return;
        }

        let failure_count = self.counters.failure.load(Ordering::Relaxed);
        let failure_rate = failure_count as f64 / total as f64;

        if consecutive >= self.config.failure_threshold
            || (failure_rate >= self.config.failure_rate_threshold && total >= self.config.min_throughput)
        {
            self.open();
        }
    }

    fn open(&self) {
        *self.state.write() = CircuitState::Open;
        self.opened_at_ms.store(self.now_ms(), Ordering::Release);
        warn!("circuit breaker transitioning to open");
    }

    /// Administratively forces the breaker open, bypassing the normal
    /// failure-rate gating.
    pub fn isolate(&self) {
        self.open();
    }

    /// Administratively resets the breaker to
    /// [closed](CircuitState::Closed), clearing all counters.
    pub fn reset(&self) {
        *self.state.write() = CircuitState::Closed;
        self.counters.reset();
        self.half_open_probe_in_flight.store(false, Ordering::Release);
        debug!("circuit breaker administratively reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 2,
            min_throughput: 1,
            break_duration: Duration::from_millis(30),
            success_threshold: 1,
            ..CircuitBreakerConfig::default()
        }
    }

    fn no_cancel() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn opens_after_consecutive_transient_failures() {
        // Given
        let breaker = CircuitBreaker::new(config());

        // When
        for _ in 0..2 {
            let _ = breaker
                .call(&no_cancel(), |_: &&str| true, || async { Err::<(), _>("boom") })
                .await;
        }

        // Then
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn open_breaker_short_circuits_without_running_operation() {
        // Given
        let breaker = CircuitBreaker::new(config());
        breaker.isolate();
        let ran = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran_clone = ran.clone();

        // When
        let result = breaker
            .call(&no_cancel(), |_: &&str| true, || async move {
                ran_clone.store(true, Ordering::SeqCst);
                Ok::<_, &str>(())
            })
            .await;

        // Then
        assert!(matches!(
            result,
            Err(CircuitBreakerError::CircuitOpen { .. })
        ));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn recovers_after_break_duration_and_successful_probe() {
        // Given
        let breaker = CircuitBreaker::new(config());
        breaker.isolate();

        // When
        tokio::time::sleep(Duration::from_millis(40)).await;
        let result = breaker
            .call(&no_cancel(), |_: &&str| true, || async { Ok::<_, &str>(()) })
            .await;

        // Then
        assert!(result.is_ok());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn non_transient_failures_do_not_open_breaker() {
        // Given
        let breaker = CircuitBreaker::new(config());

        // When
        for _ in 0..5 {
            let _ = breaker
                .call(&no_cancel(), |_: &&str| false, || async { Err::<(), _>("argument invalid") })
                .await;
        }

        // Then
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn cancelling_an_in_flight_call_aborts_without_counting_as_a_failure() {
        // Given
        let breaker = CircuitBreaker::new(config());
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();

        // When
        let result = breaker
            .call(&cancel, |_: &&str| true, || async move {
                cancel_clone.cancel();
                std::future::pending::<Result<(), &str>>().await
            })
            .await;

        // Then
        assert!(matches!(result, Err(CircuitBreakerError::Cancelled)));
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
