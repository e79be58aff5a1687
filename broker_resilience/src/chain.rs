use crate::bulkhead::Bulkhead;
use crate::circuit_breaker::CircuitBreaker;
use crate::dedup::DedupCache;
use crate::inbox::{InboxRecord, InboxStore};
use crate::rate_limiter::RateLimiter;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use broker_core::{Broker, BrokerError, DeliveryContext, Envelope, Handler, HandlerError, PublishOptions};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::debug;

fn is_transient_broker_error(error: &BrokerError) -> bool {
    matches!(error, BrokerError::Transport(_))
}

/// Discards a publish outright if its payload (or message id, depending on
/// the configured [strategy](crate::dedup::HashStrategy)) was already seen
/// within the cache's window. A discarded duplicate reports success to the
/// caller without reaching the wrapped broker.
pub struct DedupBroker {
    inner: Arc<dyn Broker>,
    cache: Arc<DedupCache>,
    window: std::time::Duration,
}

impl DedupBroker {
    /// Wraps `inner` with deduplication backed by `cache`, whose entries are
    /// kept alive for `window`.
    pub fn new(inner: Arc<dyn Broker>, cache: Arc<DedupCache>, window: std::time::Duration) -> Self {
        Self { inner, cache, window }
    }
}

#[async_trait]
impl Broker for DedupBroker {
    async fn publish_envelope(&self, envelope: Envelope, options: PublishOptions) -> Result<(), BrokerError> {
        let hash = self
            .cache
            .hash_for(envelope.payload(), Some(envelope.message_id()))
            .map_err(|error| BrokerError::Rejected(error.to_string()))?;

        let is_duplicate = self
            .cache
            .is_duplicate(&hash)
            .map_err(|error| BrokerError::Rejected(error.to_string()))?;

        if is_duplicate {
            debug!(message_id = envelope.message_id(), "dedup: discarding duplicate publish");
            return Ok(());
        }

        self.inner.publish_envelope(envelope, options).await?;
        self.cache
            .add(hash, self.window)
            .map_err(|error| BrokerError::Rejected(error.to_string()))?;
        Ok(())
    }

    async fn start(&self) -> Result<(), BrokerError> {
        self.inner.start().await
    }

    async fn stop(&self) -> Result<(), BrokerError> {
        self.inner.stop().await
    }

    async fn dispose(&self) -> Result<(), BrokerError> {
        // `DedupCache` stops its own cleanup task when its last `Arc` clone
        // drops (see its `Drop` impl); this decorator holds no exclusive
        // ownership to dispose it eagerly.
        self.inner.dispose().await
    }
}

/// Bounds concurrent publishes to the wrapped broker.
pub struct BulkheadBroker {
    inner: Arc<dyn Broker>,
    bulkhead: Arc<Bulkhead>,
}

impl BulkheadBroker {
    /// Wraps `inner`, bounding concurrency per `bulkhead`.
    pub fn new(inner: Arc<dyn Broker>, bulkhead: Arc<Bulkhead>) -> Self {
        Self { inner, bulkhead }
    }
}

#[async_trait]
impl Broker for BulkheadBroker {
    async fn publish_envelope(&self, envelope: Envelope, options: PublishOptions) -> Result<(), BrokerError> {
        let inner = self.inner.clone();
        let cancel = options.cancel.clone();
        self.bulkhead
            .execute(&cancel, || async move { inner.publish_envelope(envelope, options).await })
            .await
            .map_err(|error| BrokerError::Rejected(error.to_string()))?
    }

    async fn start(&self) -> Result<(), BrokerError> {
        self.inner.start().await
    }

    async fn stop(&self) -> Result<(), BrokerError> {
        self.inner.stop().await
    }

    async fn dispose(&self) -> Result<(), BrokerError> {
        self.inner.dispose().await
    }
}

/// Short-circuits publishes while the wrapped broker is considered
/// unhealthy. Only [transport failures](BrokerError::Transport) count toward
/// opening the breaker.
pub struct CircuitBreakerBroker {
    inner: Arc<dyn Broker>,
    breaker: Arc<CircuitBreaker>,
}

impl CircuitBreakerBroker {
    /// Wraps `inner` with `breaker`.
    pub fn new(inner: Arc<dyn Broker>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { inner, breaker }
    }
}

#[async_trait]
impl Broker for CircuitBreakerBroker {
    async fn publish_envelope(&self, envelope: Envelope, options: PublishOptions) -> Result<(), BrokerError> {
        let inner = self.inner.clone();
        let cancel = options.cancel.clone();
        self.breaker
            .call(&cancel, is_transient_broker_error, || async move {
                inner.publish_envelope(envelope, options).await
            })
            .await
            .map_err(|error| BrokerError::Rejected(error.to_string()))
    }

    async fn start(&self) -> Result<(), BrokerError> {
        self.inner.start().await
    }

    async fn stop(&self) -> Result<(), BrokerError> {
        self.inner.stop().await
    }

    async fn dispose(&self) -> Result<(), BrokerError> {
        self.inner.dispose().await
    }
}

/// Bounds the rate of publishes to the wrapped broker, waiting for the
/// bucket to refill rather than rejecting outright.
pub struct RateLimiterBroker {
    inner: Arc<dyn Broker>,
    limiter: Arc<RateLimiter>,
}

impl RateLimiterBroker {
    /// Wraps `inner`, governed by `limiter`.
    pub fn new(inner: Arc<dyn Broker>, limiter: Arc<RateLimiter>) -> Self {
        Self { inner, limiter }
    }
}

#[async_trait]
impl Broker for RateLimiterBroker {
    async fn publish_envelope(&self, envelope: Envelope, options: PublishOptions) -> Result<(), BrokerError> {
        self.limiter
            .acquire(&options.cancel, 1)
            .await
            .map_err(|error| BrokerError::Rejected(error.to_string()))?;
        self.inner.publish_envelope(envelope, options).await
    }

    async fn start(&self) -> Result<(), BrokerError> {
        self.inner.start().await
    }

    async fn stop(&self) -> Result<(), BrokerError> {
        self.inner.stop().await
    }

    async fn dispose(&self) -> Result<(), BrokerError> {
        self.inner.dispose().await
    }
}

/// Retries a failed publish against the wrapped broker with backoff. Only
/// [transport failures](BrokerError::Transport) are retried.
pub struct RetryBroker {
    inner: Arc<dyn Broker>,
    policy: Arc<RetryPolicy>,
}

impl RetryBroker {
    /// Wraps `inner`, retried per `policy`.
    pub fn new(inner: Arc<dyn Broker>, policy: Arc<RetryPolicy>) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl Broker for RetryBroker {
    async fn publish_envelope(&self, envelope: Envelope, options: PublishOptions) -> Result<(), BrokerError> {
        let inner = self.inner.clone();
        let cancel = options.cancel.clone();
        self.policy
            .run(&cancel, is_transient_broker_error, move |_attempt| {
                let inner = inner.clone();
                let envelope = envelope.clone();
                let options = options.clone();
                async move { inner.publish_envelope(envelope, options).await }
            })
            .await
            .map_err(|error| BrokerError::Rejected(error.to_string()))
    }

    async fn start(&self) -> Result<(), BrokerError> {
        self.inner.start().await
    }

    async fn stop(&self) -> Result<(), BrokerError> {
        self.inner.stop().await
    }

    async fn dispose(&self) -> Result<(), BrokerError> {
        self.inner.dispose().await
    }
}

/// Composes the publish-side decorator chain in the canonical order: kernel
/// → dedup → bulkhead → circuit-breaker → rate-limit → retry (each step
/// wraps the previous, with retry as the outermost and first decorator the
/// caller's `publish` reaches).
pub struct PublishChainBuilder {
    broker: Arc<dyn Broker>,
}

impl PublishChainBuilder {
    /// Starts a chain rooted at `kernel`.
    pub fn new(kernel: Arc<dyn Broker>) -> Self {
        Self { broker: kernel }
    }

    /// Adds deduplication.
    pub fn with_dedup(mut self, cache: Arc<DedupCache>, window: std::time::Duration) -> Self {
        self.broker = Arc::new(DedupBroker::new(self.broker, cache, window));
        self
    }

    /// Adds bulkhead concurrency bounding.
    pub fn with_bulkhead(mut self, bulkhead: Arc<Bulkhead>) -> Self {
        self.broker = Arc::new(BulkheadBroker::new(self.broker, bulkhead));
        self
    }

    /// Adds a circuit breaker.
    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.broker = Arc::new(CircuitBreakerBroker::new(self.broker, breaker));
        self
    }

    /// Adds rate limiting.
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.broker = Arc::new(RateLimiterBroker::new(self.broker, limiter));
        self
    }

    /// Adds retry with backoff.
    pub fn with_retry(mut self, policy: Arc<RetryPolicy>) -> Self {
        self.broker = Arc::new(RetryBroker::new(self.broker, policy));
        self
    }

    /// Finalizes the chain.
    pub fn build(self) -> Arc<dyn Broker> {
        self.broker
    }
}

/// Bounds concurrent handler execution for a single subscription.
pub struct BulkheadHandler<T, H> {
    inner: H,
    bulkhead: Arc<Bulkhead>,
    _marker: std::marker::PhantomData<fn(T)>,
}

impl<T, H> BulkheadHandler<T, H> {
    /// Wraps `inner`, bounding concurrency per `bulkhead`.
    pub fn new(inner: H, bulkhead: Arc<Bulkhead>) -> Self {
        Self {
            inner,
            bulkhead,
            _marker: std::marker::PhantomData,
        }
    }
}

#[async_trait]
impl<T, H> Handler<T> for BulkheadHandler<T, H>
where
    T: Send + 'static,
    H: Handler<T>,
{
    async fn handle(&self, message: T, context: DeliveryContext) -> Result<(), HandlerError> {
        let cancel = context.cancel().clone();
        self.bulkhead
            .execute(&cancel, || self.inner.handle(message, context))
            .await
            .map_err(|error| HandlerError::application(error.to_string(), true))?
    }
}

/// Skips re-processing a message already recorded as handled for this
/// consumer, acknowledging it outright. On handler success, records the
/// message as processed; on failure, leaves the inbox untouched so the
/// transport's own redelivery can retry it.
pub struct InboxHandler<T, H> {
    inner: H,
    store: Arc<dyn InboxStore>,
    consumer_name: String,
    _marker: std::marker::PhantomData<fn(T)>,
}

impl<T, H> InboxHandler<T, H> {
    /// Wraps `inner`, tracked in `store` under `consumer_name`.
    pub fn new(inner: H, store: Arc<dyn InboxStore>, consumer_name: impl Into<String>) -> Self {
        Self {
            inner,
            store,
            consumer_name: consumer_name.into(),
            _marker: std::marker::PhantomData,
        }
    }
}

#[async_trait]
impl<T, H> Handler<T> for InboxHandler<T, H>
where
    T: Send + 'static,
    H: Handler<T>,
{
    async fn handle(&self, message: T, context: DeliveryContext) -> Result<(), HandlerError> {
        let message_id = context.message_id().to_string();

        if self.store.exists(&message_id, &self.consumer_name).await {
            debug!(message_id, "inbox: skipping already-processed message");
            context.acknowledge();
            return Ok(());
        }

        let message_type = broker_core::type_tag::<T>().to_string();
        self.inner.handle(message, context).await?;

        self.store
            .store(InboxRecord {
                message_id,
                message_type,
                consumer_name: self.consumer_name.clone(),
                processed_at_ms: SystemTime::now()
                    .duration_since(SystemTime::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_millis() as u64,
            })
            .await;

        Ok(())
    }
}
