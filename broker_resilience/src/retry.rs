use crate::errors::RetryError;
use broker_factory::impl_deserialize_field;
use broker_util::Backoff;
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use std::fmt::Formatter;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Configuration for a [`RetryPolicy`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    pub(crate) max_attempts: u32,
    pub(crate) initial_delay: Duration,
    pub(crate) max_delay: Duration,
    pub(crate) multiplier: f64,
    pub(crate) use_exponential: bool,
}

impl RetryConfig {
    fn default_max_attempts() -> u32 {
        3
    }

    fn default_initial_delay() -> Duration {
        Duration::from_secs(1)
    }

    fn default_max_delay() -> Duration {
        Duration::from_secs(30)
    }

    fn default_multiplier() -> f64 {
        2.0
    }

    fn default_use_exponential() -> bool {
        true
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: Self::default_max_attempts(),
            initial_delay: Self::default_initial_delay(),
            max_delay: Self::default_max_delay(),
            multiplier: Self::default_multiplier(),
            use_exponential: Self::default_use_exponential(),
        }
    }
}

const _: () = {
    impl<'de> Deserialize<'de> for RetryConfig {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            deserializer.deserialize_map(RetryConfigVisitor)
        }
    }

    struct RetryConfigVisitor;

    impl<'de> Visitor<'de> for RetryConfigVisitor {
        type Value = RetryConfig;

        fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
            formatter.write_str("a map of retry configuration")
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut max_attempts = None;
            let mut initial_delay = None;
            let mut max_delay = None;
            let mut multiplier = None;
            let mut use_exponential = None;

            while let Some(key) = map.next_key()? {
                match key {
                    RetryConfigField::max_attempts => key.poll(&mut map, &mut max_attempts)?,
                    RetryConfigField::initial_delay => key.poll(&mut map, &mut initial_delay)?,
                    RetryConfigField::max_delay => key.poll(&mut map, &mut max_delay)?,
                    RetryConfigField::multiplier => key.poll(&mut map, &mut multiplier)?,
                    RetryConfigField::use_exponential => {
                        key.poll(&mut map, &mut use_exponential)?
                    }
                    RetryConfigField::__ignore => map.next_value()?,
                };
            }

            Ok(RetryConfig {
                max_attempts: max_attempts.unwrap_or_else(RetryConfig::default_max_attempts),
                initial_delay: initial_delay.unwrap_or_else(RetryConfig::default_initial_delay),
                max_delay: max_delay.unwrap_or_else(RetryConfig::default_max_delay),
                multiplier: multiplier.unwrap_or_else(RetryConfig::default_multiplier),
                use_exponential: use_exponential
                    .unwrap_or_else(RetryConfig::default_use_exponential),
            })
        }
    }

    impl_deserialize_field!(
        RetryConfigField,
        broker_deserialize::Slug::eq_as_slugs,
        max_attempts,
        initial_delay,
        max_delay,
        multiplier,
        use_exponential,
    );
};

fn backoff_for(config: &RetryConfig) -> Backoff {
    Backoff::builder()
        .with_initial_interval(config.initial_delay)
        .with_max_interval(config.max_delay)
        .with_multiplier(if config.use_exponential {
            config.multiplier
        } else {
            1.0
        })
        .with_max_elapsed_time(None)
        .build()
}

/// Retries a fallible async operation with backoff, stopping as soon as the
/// caller's classifier deems an error non-transient.
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Builds a new policy from the given configuration.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Runs `f` up to `max_attempts` times. Between attempts it sleeps the
    /// backoff's next delay. `is_transient` classifies the returned error;
    /// a non-transient error aborts retrying immediately with
    /// [`RetryError::NonTransient`]. Exhausting every attempt returns
    /// [`RetryError::Exhausted`] wrapping the final error. Cancelling
    /// `cancel` aborts the in-flight attempt or the backoff sleep and fails
    /// with [`RetryError::Cancelled`].
    pub async fn run<F, Fut, T, E>(
        &self,
        cancel: &CancellationToken,
        is_transient: impl Fn(&E) -> bool,
        mut f: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        let backoff = backoff_for(&self.config);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                outcome = f(attempt) => outcome,
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if !is_transient(&error) {
                        return Err(RetryError::NonTransient(error));
                    }

                    if attempt >= self.config.max_attempts {
                        return Err(RetryError::Exhausted {
                            attempts: attempt,
                            last_error: error,
                        });
                    }

                    warn!(attempt, "retry policy: attempt failed, backing off");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                        _ = backoff.sleep_next() => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_cancel() -> CancellationToken {
        CancellationToken::new()
    }

    fn fast_config() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
            use_exponential: true,
        }
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt_without_retrying() {
        // Given
        let policy = RetryPolicy::new(fast_config());
        let calls = AtomicU32::new(0);

        // When
        let result = policy
            .run(
                &no_cancel(),
                |_: &&str| true,
                |_attempt| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok::<_, &str>(7) }
                },
            )
            .await;

        // Then
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_failures_then_succeeds() {
        // Given
        let policy = RetryPolicy::new(fast_config());
        let calls = AtomicU32::new(0);

        // When
        let result = policy
            .run(
                &no_cancel(),
                |_: &&str| true,
                |attempt| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if attempt < 3 {
                            Err("still failing")
                        } else {
                            Ok(attempt)
                        }
                    }
                },
            )
            .await;

        // Then
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_attempts_and_reports_last_error() {
        // Given
        let policy = RetryPolicy::new(fast_config());

        // When
        let result = policy
            .run(&no_cancel(), |_: &&str| true, |_attempt| async { Err::<(), _>("nope") })
            .await;

        // Then
        match result {
            Err(RetryError::Exhausted { attempts, last_error }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last_error, "nope");
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stops_immediately_on_non_transient_error() {
        // Given
        let policy = RetryPolicy::new(fast_config());
        let calls = AtomicU32::new(0);

        // When
        let result = policy
            .run(
                &no_cancel(),
                |_: &&str| false,
                |_attempt| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>("argument invalid") }
                },
            )
            .await;

        // Then
        assert!(matches!(result, Err(RetryError::NonTransient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelling_during_backoff_stops_further_attempts() {
        // Given
        let policy = RetryPolicy::new(fast_config());
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let cancel_clone = cancel.clone();

        // When
        let result = policy
            .run(&cancel, |_: &&str| true, |_attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                cancel_clone.cancel();
                async { Err::<(), _>("still failing") }
            })
            .await;

        // Then
        assert!(matches!(result, Err(RetryError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
