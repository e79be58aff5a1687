use thiserror::Error;

/// Failures raised by the [deduplication cache](crate::dedup::DedupCache).
#[derive(Error, Debug)]
pub enum DedupError {
    /// A hash was null, empty, or whitespace-only.
    #[error("argument invalid: {0}")]
    ArgumentInvalid(String),

    /// `window` exceeded 24 hours, or `max_size` was not positive.
    #[error("config invalid: {0}")]
    ConfigInvalid(String),

    /// The `message-id` hash strategy was selected but the envelope carried
    /// no message id.
    #[error("message id missing for dedup hash computation")]
    MessageIdMissing,

    /// The cache's background cleanup task has been stopped and the cache
    /// disposed.
    #[error("dedup cache has been disposed")]
    CacheDisposed,
}

/// Failures raised by the [bulkhead](crate::bulkhead::Bulkhead).
#[derive(Error, Debug)]
pub enum BulkheadError {
    /// Both the concurrent-execution slots and the wait queue were full.
    #[error("bulkhead rejected: {active} active, {queued} queued")]
    Rejected {
        /// The number of operations executing when the rejection occurred.
        active: usize,
        /// The number of operations already waiting when the rejection occurred.
        queued: usize,
    },

    /// The waiting operation was cancelled before acquiring a slot.
    #[error("bulkhead wait cancelled")]
    Cancelled,
}

/// Failures raised by the [circuit breaker](crate::circuit_breaker::CircuitBreaker).
#[derive(Error, Debug)]
pub enum CircuitBreakerError<E> {
    /// The breaker is [open](crate::circuit_breaker::CircuitState::Open) (or
    /// [half-open](crate::circuit_breaker::CircuitState::HalfOpen) with a
    /// probe already in flight); the call was short-circuited without
    /// invoking the wrapped operation.
    #[error("circuit breaker is open ({state:?}, {consecutive_failures} consecutive failures)")]
    CircuitOpen {
        /// The breaker's state at rejection time.
        state: crate::circuit_breaker::CircuitState,
        /// The number of consecutive failures leading up to the rejection.
        consecutive_failures: u32,
    },

    /// The wrapped operation ran and failed on its own terms.
    #[error(transparent)]
    Inner(E),

    /// The call was cancelled before the breaker admitted it, or while the
    /// wrapped operation was still in flight.
    #[error("circuit breaker call cancelled")]
    Cancelled,
}

/// Failures raised by the [rate limiter](crate::rate_limiter::RateLimiter).
#[derive(Error, Debug)]
pub enum RateLimiterError {
    /// Not enough tokens were available, and the caller's wait budget (if
    /// any) was exhausted.
    #[error("rate limit exceeded: retry after {retry_after_ms}ms")]
    RateLimited {
        /// Milliseconds to wait before the next attempt is likely to succeed.
        retry_after_ms: u64,
        /// The instant, relative to the limiter's own clock, at which the
        /// bucket is expected to hold at least one token again.
        reset_at_ms: u64,
    },

    /// The wait for tokens was cancelled before enough accumulated.
    #[error("rate limiter wait cancelled")]
    Cancelled,
}

/// Failures raised by [`RetryPolicy::run`](crate::retry::RetryPolicy::run).
#[derive(Error, Debug)]
pub enum RetryError<E> {
    /// Every attempt (first try plus retries) was exhausted without success.
    #[error("retry attempts exhausted after {attempts} tries")]
    Exhausted {
        /// The total number of attempts made.
        attempts: u32,
        /// The last error observed.
        #[source]
        last_error: E,
    },

    /// The operation failed with an error the classifier deemed
    /// non-transient; no further attempts were made.
    #[error(transparent)]
    NonTransient(E),

    /// The operation (or the backoff sleep between attempts) was cancelled.
    #[error("retry cancelled")]
    Cancelled,
}
