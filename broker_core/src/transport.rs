use crate::envelope::Envelope;
use crate::subscription::SubscriptionOptions;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// A message as handed off by a [`TransportAdapter`] to the
/// [broker kernel](crate::Broker) for dispatch.
///
/// `delivery_tag` is an opaque, adapter-assigned handle the kernel echoes
/// back via [`ack_raw`](TransportAdapter::ack_raw) or
/// [`reject_raw`](TransportAdapter::reject_raw); its meaning (a sequence
/// number, an offset, a native message id) is entirely up to the adapter.
#[derive(Debug, Clone)]
pub struct RawDelivery {
    /// The adapter-assigned handle used to finalize this delivery.
    pub delivery_tag: u64,
    /// The delivered envelope.
    pub envelope: Envelope,
}

/// Classifies a failure raised by a [`TransportAdapter`], so that decorators
/// (retry, circuit breaker) and the kernel can react appropriately without
/// knowing anything about the concrete backend.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Likely to succeed if retried (connection drop, timeout, broker
    /// temporarily unavailable).
    #[error("transient transport failure: {0}")]
    Transient(String),

    /// Will not succeed if retried unchanged (bad credentials, malformed
    /// request, destination does not exist).
    #[error("permanent transport failure: {0}")]
    Permanent(String),

    /// The operation was cancelled before it completed.
    #[error("transport operation cancelled")]
    Cancelled,
}

impl TransportError {
    /// Reports whether this failure is [`Transient`](TransportError::Transient)
    /// and therefore eligible for retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// The contract every concrete message-broker backend implements.
///
/// An adapter owns connection lifecycle, consumer-group semantics,
/// transport-native acknowledgement, and partition/offset bookkeeping. It
/// must **not** touch serialization, deduplication, or bulkhead state — those
/// are the kernel's and the decorator chain's concerns, layered entirely
/// above the adapter.
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    /// Establishes whatever connection or resources this adapter needs before
    /// it can publish or consume. Idempotent: calling this more than once
    /// while already started is a no-op.
    async fn start_raw(&self) -> Result<(), TransportError>;

    /// Releases this adapter's connection or resources, retaining its
    /// configuration so it can be [started](TransportAdapter::start_raw)
    /// again. Idempotent.
    async fn stop_raw(&self) -> Result<(), TransportError>;

    /// Permanently releases this adapter's resources. After this call,
    /// every other method fails with
    /// [`TransportError::Permanent`].
    async fn dispose_raw(&self) -> Result<(), TransportError>;

    /// Publishes an already-encoded envelope to the backend.
    async fn publish_raw(&self, envelope: Envelope) -> Result<(), TransportError>;

    /// Declares interest in messages of the given type and begins forwarding
    /// [`RawDelivery`] values into `deliveries` as they arrive. Returns once
    /// the subscription is established; delivery happens asynchronously via
    /// the channel.
    async fn subscribe_raw(
        &self,
        message_type: &str,
        options: &SubscriptionOptions,
        deliveries: mpsc::UnboundedSender<RawDelivery>,
    ) -> Result<(), TransportError>;

    /// Acknowledges successful processing of the delivery identified by
    /// `delivery_tag`.
    async fn ack_raw(&self, delivery_tag: u64) -> Result<(), TransportError>;

    /// Signals failed processing of the delivery identified by
    /// `delivery_tag`, optionally requesting redelivery.
    async fn reject_raw(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError>;
}
