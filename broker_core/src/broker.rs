use crate::codec::{DecodeError, EncodeError};
use crate::envelope::Envelope;
use crate::headers::Headers;
use crate::transport::TransportError;
use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Represents a failure raised by the [broker kernel](crate::Broker) or by one
/// of its decorators, distinct from a per-message
/// [`HandlerError`](crate::HandlerError).
#[derive(Error, Debug)]
pub enum BrokerError {
    /// A required argument was missing or empty.
    #[error("argument invalid: {0}")]
    ArgumentInvalid(String),

    /// The message could not be encoded for publishing.
    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// A delivered message could not be decoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The underlying transport adapter failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The operation was rejected by a decorator further down the chain
    /// (bulkhead at capacity, circuit open, rate limit exceeded, and so on).
    /// The decorator crate that raised it carries the specific reason; this
    /// variant only carries its rendered message, since `broker-core` does
    /// not depend on `broker-resilience`.
    #[error("rejected by decorator: {0}")]
    Rejected(String),

    /// The broker (or one of its decorators) has already been disposed.
    #[error("broker has been disposed")]
    Disposed,
}

/// Options accompanying a single [`publish`](crate::BrokerKernel::publish)
/// call. Every field is optional; unspecified fields fall back to the
/// kernel's configured defaults.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Overrides the routing key the kernel would otherwise derive from its
    /// configured pattern.
    pub routing_key: Option<String>,
    /// The exchange/topic to publish to, for transports that have one.
    pub exchange: Option<String>,
    /// Extra headers to attach to the outgoing envelope.
    pub headers: Headers,
    /// Whether the message should survive a broker restart, for transports
    /// that support persistence.
    pub persistent: bool,
    /// A priority hint in the 0-9 range, for transports that support it.
    pub priority: Option<u8>,
    /// How long, in milliseconds, the transport should retain the message
    /// before giving up on delivery.
    pub expiration_ms: Option<u64>,
    /// Links this message to a request/response pair or a saga chain.
    pub correlation_id: Option<String>,
    /// Where a responder should send a reply, for transports that support it.
    pub reply_to: Option<String>,
    /// Requires the transport to guarantee the message is routable,
    /// failing loudly instead of silently dropping it.
    pub mandatory: bool,
    /// Cancels this publish (and any decorator it is waiting or retrying
    /// inside) when triggered. Defaults to a fresh, never-cancelled token.
    pub cancel: CancellationToken,
}

/// The object-safe contract shared by the [broker kernel](crate::BrokerKernel)
/// and every publish-side decorator (dedup, bulkhead, circuit breaker, rate
/// limiter, retry) that wraps it.
///
/// Decorators operate on already-encoded [`Envelope`]s rather than on a
/// generic message type `T`, which keeps this trait object-safe and lets a
/// chain be built as a plain `Arc<dyn Broker>` without reflection. The
/// strongly-typed, ergonomic `publish::<T>(...)` entry point lives on
/// [`BrokerKernel`] itself and is what application code normally calls; it
/// encodes the message once and then walks the decorator chain via this
/// trait.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publishes an already-encoded envelope, applying whatever this broker
    /// (or decorator) contributes before delegating further down the chain.
    async fn publish_envelope(&self, envelope: Envelope, options: PublishOptions) -> Result<(), BrokerError>;

    /// Transitions this broker into the active state. Idempotent.
    async fn start(&self) -> Result<(), BrokerError>;

    /// Transitions this broker into the inactive state, retaining
    /// subscriptions. Idempotent.
    async fn stop(&self) -> Result<(), BrokerError>;

    /// Permanently releases this broker's resources. Idempotent; subsequent
    /// calls to any method fail with [`BrokerError::Disposed`].
    async fn dispose(&self) -> Result<(), BrokerError>;
}
