#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![cfg_attr(test, deny(warnings))]

/// An in-process, in-memory reference [`TransportAdapter`].
pub mod memory;

pub use broker_core::{
    type_tag, Acknowledgement, Broker, BrokerError, BrokerKernel, CancellationToken, Codec,
    Compression, CompressionError, DecodeError, DeliveryContext, EncodeError, Encoding, Envelope,
    EnvelopeBuilder, Handler, HandlerError, HeaderValue, Headers, KernelConfig, RawDelivery,
    SubscriptionId, SubscriptionOptions, SubscriptionRegistry, SubscriptionState, TransportAdapter,
    TransportError, PublishOptions,
};
pub use broker_resilience::{
    Bulkhead, BulkheadBroker, BulkheadConfig, BulkheadError, BulkheadHandler, BulkheadMetrics,
    CircuitBreaker, CircuitBreakerBroker, CircuitBreakerConfig, CircuitBreakerError, CircuitState,
    DedupBroker, DedupCache, DedupConfig, DedupError, DedupMetrics, HashStrategy,
    HealthCheckSummary, HealthEntry, HealthException, HealthRegistry, HealthReport, HealthStatus,
    InMemoryInboxStore, InboxConfig, InboxHandler, InboxRecord, InboxStore, PublishChainBuilder,
    RateLimiter, RateLimiterBroker, RateLimiterConfig, RateLimiterError, RetryBroker, RetryConfig,
    RetryError, RetryPolicy,
};
pub use broker_saga::{
    InMemorySagaStore, PersistenceError, SagaConfig, SagaCycleResult, SagaEngine, SagaError,
    SagaEvent, SagaEventKind, SagaEventListener, SagaMetrics, SagaRecord, SagaResult, SagaRunner,
    SagaState, SagaStep, SagaStore, SagaTimeoutSupervisor, SagaTypeTotals, StepTotals,
};
