#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![cfg_attr(test, deny(warnings))]

mod bulkhead;
mod chain;
mod circuit_breaker;
mod dedup;
mod errors;
mod health;
mod inbox;
mod rate_limiter;
mod retry;

pub use bulkhead::{Bulkhead, BulkheadConfig, BulkheadMetrics};
pub use chain::{
    BulkheadHandler, BulkheadBroker, CircuitBreakerBroker, DedupBroker, InboxHandler,
    PublishChainBuilder, RateLimiterBroker, RetryBroker,
};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use dedup::{DedupCache, DedupConfig, DedupMetrics, HashStrategy};
pub use errors::{BulkheadError, CircuitBreakerError, DedupError, RateLimiterError, RetryError};
pub use health::{
    HealthCheckSummary, HealthEntry, HealthException, HealthRegistry, HealthReport, HealthStatus,
};
pub use inbox::{InMemoryInboxStore, InboxConfig, InboxRecord, InboxStore};
pub use rate_limiter::{RateLimiter, RateLimiterConfig};
pub use retry::{RetryConfig, RetryPolicy};
