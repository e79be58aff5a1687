use broker_factory::impl_deserialize_field;
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use std::fmt::Formatter;
use std::time::Duration;

/// Configuration shared by the saga engine, its timeout supervisor, and its
/// compensation retry policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SagaConfig {
    pub(crate) default_timeout: Duration,
    pub(crate) auto_persist: bool,
    pub(crate) persistence_interval: Duration,
    pub(crate) max_retry_attempts: u32,
    pub(crate) retry_delay: Duration,
    pub(crate) auto_compensate_on_failure: bool,
    pub(crate) continue_compensation_on_error: bool,
}

impl SagaConfig {
    fn default_default_timeout() -> Duration {
        Duration::from_secs(5 * 60)
    }

    fn default_auto_persist() -> bool {
        true
    }

    fn default_persistence_interval() -> Duration {
        Duration::from_secs(30)
    }

    fn default_max_retry_attempts() -> u32 {
        3
    }

    fn default_retry_delay() -> Duration {
        Duration::from_secs(1)
    }

    fn default_auto_compensate_on_failure() -> bool {
        true
    }

    fn default_continue_compensation_on_error() -> bool {
        true
    }

    /// The configured default timeout, applied to a saga when neither its
    /// `metadata["Timeout"]` nor a custom per-saga value is present.
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// The supervisor's check-interval between sweep cycles.
    pub fn persistence_interval(&self) -> Duration {
        self.persistence_interval
    }
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            default_timeout: Self::default_default_timeout(),
            auto_persist: Self::default_auto_persist(),
            persistence_interval: Self::default_persistence_interval(),
            max_retry_attempts: Self::default_max_retry_attempts(),
            retry_delay: Self::default_retry_delay(),
            auto_compensate_on_failure: Self::default_auto_compensate_on_failure(),
            continue_compensation_on_error: Self::default_continue_compensation_on_error(),
        }
    }
}

const _: () = {
    impl<'de> Deserialize<'de> for SagaConfig {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            deserializer.deserialize_map(SagaConfigVisitor)
        }
    }

    struct SagaConfigVisitor;

    impl<'de> Visitor<'de> for SagaConfigVisitor {
        type Value = SagaConfig;

        fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
            formatter.write_str("a map of saga configuration")
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut default_timeout = None;
            let mut auto_persist = None;
            let mut persistence_interval = None;
            let mut max_retry_attempts = None;
            let mut retry_delay = None;
            let mut auto_compensate_on_failure = None;
            let mut continue_compensation_on_error = None;

            while let Some(key) = map.next_key()? {
                match key {
                    SagaConfigField::default_timeout => key.poll(&mut map, &mut default_timeout)?,
                    SagaConfigField::auto_persist => key.poll(&mut map, &mut auto_persist)?,
                    SagaConfigField::persistence_interval => {
                        key.poll(&mut map, &mut persistence_interval)?
                    }
                    SagaConfigField::max_retry_attempts => {
                        key.poll(&mut map, &mut max_retry_attempts)?
                    }
                    SagaConfigField::retry_delay => key.poll(&mut map, &mut retry_delay)?,
                    SagaConfigField::auto_compensate_on_failure => {
                        key.poll(&mut map, &mut auto_compensate_on_failure)?
                    }
                    SagaConfigField::continue_compensation_on_error => {
                        key.poll(&mut map, &mut continue_compensation_on_error)?
                    }
                    SagaConfigField::__ignore => map.next_value()?,
                };
            }

            Ok(SagaConfig {
                default_timeout: default_timeout
                    .unwrap_or_else(SagaConfig::default_default_timeout),
                auto_persist: auto_persist.unwrap_or_else(SagaConfig::default_auto_persist),
                persistence_interval: persistence_interval
                    .unwrap_or_else(SagaConfig::default_persistence_interval),
                max_retry_attempts: max_retry_attempts
                    .unwrap_or_else(SagaConfig::default_max_retry_attempts),
                retry_delay: retry_delay.unwrap_or_else(SagaConfig::default_retry_delay),
                auto_compensate_on_failure: auto_compensate_on_failure
                    .unwrap_or_else(SagaConfig::default_auto_compensate_on_failure),
                continue_compensation_on_error: continue_compensation_on_error
                    .unwrap_or_else(SagaConfig::default_continue_compensation_on_error),
            })
        }
    }

    impl_deserialize_field!(
        SagaConfigField,
        broker_deserialize::Slug::eq_as_slugs,
        default_timeout,
        auto_persist,
        persistence_interval,
        max_retry_attempts,
        retry_delay,
        auto_compensate_on_failure,
        continue_compensation_on_error,
    );
};
