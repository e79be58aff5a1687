use crate::codec::{Codec, DecodeError};
use crate::context::DeliveryContext;
use crate::envelope::Envelope;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::fmt::{Debug, Formatter};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Represents a failure raised while handling a single delivered message.
///
/// A handler failure never propagates as a [`BrokerError`](crate::BrokerError)
/// to the publisher; it only affects the acknowledgement decision made for
/// the message that triggered it (see [`DeliveryContext`]).
#[derive(Error, Debug)]
pub enum HandlerError {
    /// The payload could not be decoded into the type this handler expects.
    #[error("failed to decode message for handler: {0}")]
    Decode(#[from] DecodeError),

    /// The handler itself returned an application-level failure. The
    /// `transient` flag decides whether this counts as retryable for the
    /// purposes of requeue and circuit-breaker classification.
    #[error("handler failed: {message}")]
    Application {
        /// A human-readable description of the failure.
        message: String,
        /// Whether this failure should be treated as transient (retryable).
        transient: bool,
    },
}

impl HandlerError {
    /// Builds an [`Application`](HandlerError::Application) error.
    pub fn application(message: impl Into<String>, transient: bool) -> Self {
        Self::Application {
            message: message.into(),
            transient,
        }
    }

    /// Reports whether this failure should be treated as transient, i.e.
    /// eligible for requeue and for counting toward a circuit breaker.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Decode(_) => false,
            Self::Application { transient, .. } => *transient,
        }
    }
}

/// A strongly-typed message handler, invoked by the
/// [broker kernel](crate::Broker) once per delivered message of type `T` for
/// every active subscription registered against that type.
#[async_trait]
pub trait Handler<T>: Send + Sync {
    /// Handles a single decoded message.
    async fn handle(&self, message: T, context: DeliveryContext) -> Result<(), HandlerError>;
}

#[async_trait]
impl<T, F, Fut> Handler<T> for F
where
    T: Send + 'static,
    F: Fn(T, DeliveryContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, message: T, context: DeliveryContext) -> Result<(), HandlerError> {
        self(message, context).await
    }
}

/// A type-erased handler entry stored in the
/// [registry](crate::SubscriptionRegistry), decoding the envelope's payload
/// internally before delegating to the strongly-typed
/// [`Handler`](Handler).
#[async_trait]
pub(crate) trait ErasedHandler: Send + Sync {
    async fn dispatch(
        &self,
        envelope: &Envelope,
        codec: &Codec,
        context: DeliveryContext,
    ) -> Result<(), HandlerError>;
}

pub(crate) struct TypedHandler<T, H> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T, H> TypedHandler<T, H> {
    pub(crate) fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T, H> ErasedHandler for TypedHandler<T, H>
where
    T: DeserializeOwned + Send + 'static,
    H: Handler<T>,
{
    async fn dispatch(
        &self,
        envelope: &Envelope,
        codec: &Codec,
        context: DeliveryContext,
    ) -> Result<(), HandlerError> {
        let message: T = codec.decode(envelope.payload(), envelope.compression())?;
        self.handler.handle(message, context).await
    }
}

/// Options governing how a single subscription consumes messages.
///
/// Not every field is meaningful to every transport; a field a given backend
/// doesn't support is simply ignored by that backend's adapter.
#[derive(Debug, Clone)]
pub struct SubscriptionOptions {
    /// An explicit routing key override; when absent, the kernel's default
    /// pattern is used.
    pub routing_key: Option<String>,
    /// The consumer group (or queue name) this subscription belongs to.
    /// Multiple subscriptions in the same group compete for messages;
    /// subscriptions in different groups each receive their own copy.
    pub consumer_group: Option<String>,
    /// Whether the kernel should acknowledge a message automatically once
    /// every active handler for its type has completed successfully.
    pub auto_ack: bool,
    /// The number of messages the transport should prefetch per consumer.
    pub prefetch_count: u16,
    /// Whether the underlying queue/subscription should survive a restart.
    pub durable: bool,
    /// Whether this subscription should be the sole consumer of its queue.
    pub exclusive: bool,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            routing_key: None,
            consumer_group: None,
            auto_ack: true,
            prefetch_count: 10,
            durable: true,
            exclusive: false,
        }
    }
}

/// The lifecycle state of a single [`SubscriptionRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Registered but not yet receiving deliveries.
    Registered,
    /// Actively receiving and dispatching deliveries.
    Active,
    /// Temporarily not receiving deliveries; can be resumed.
    Paused,
    /// Permanently stopped; will not receive further deliveries.
    Cancelled,
}

/// A stable identifier for a single [`SubscriptionRecord`], unique within a
/// single [`Broker`](crate::Broker) instance's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

impl SubscriptionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// One registered handler for a given message type, held by the
/// [registry](crate::SubscriptionRegistry).
pub struct SubscriptionRecord {
    id: SubscriptionId,
    message_type: String,
    options: SubscriptionOptions,
    state: parking_lot::Mutex<SubscriptionState>,
    handler: Box<dyn ErasedHandler>,
}

impl Debug for SubscriptionRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRecord")
            .field("id", &self.id)
            .field("message_type", &self.message_type)
            .field("options", &self.options)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl SubscriptionRecord {
    pub(crate) fn new<T, H>(message_type: impl Into<String>, handler: H, options: SubscriptionOptions) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        H: Handler<T> + 'static,
    {
        Self {
            id: SubscriptionId::next(),
            message_type: message_type.into(),
            options,
            state: parking_lot::Mutex::new(SubscriptionState::Registered),
            handler: Box::new(TypedHandler::new(handler)),
        }
    }

    /// The identifier of this subscription.
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// The message type this subscription was registered against.
    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    /// The options this subscription was registered with.
    pub fn options(&self) -> &SubscriptionOptions {
        &self.options
    }

    /// The current lifecycle state.
    pub fn state(&self) -> SubscriptionState {
        *self.state.lock()
    }

    /// Reports whether this subscription is currently receiving deliveries.
    pub fn is_active(&self) -> bool {
        self.state() == SubscriptionState::Active
    }

    pub(crate) fn set_state(&self, state: SubscriptionState) {
        *self.state.lock() = state;
    }

    pub(crate) async fn dispatch(
        &self,
        envelope: &Envelope,
        codec: &Codec,
        context: DeliveryContext,
    ) -> Result<(), HandlerError> {
        self.handler.dispatch(envelope, codec, context).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::DeliveryContext;
    use pretty_assertions::assert_eq;
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;
    use tokio::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }

    #[tokio::test]
    async fn dispatch_decodes_and_invokes_handler() {
        // Given
        let received = Arc::new(Mutex::new(None));
        let received_clone = received.clone();
        let handler = move |message: Ping, _ctx: DeliveryContext| {
            let received = received_clone.clone();
            async move {
                *received.lock().await = Some(message);
                Ok(())
            }
        };
        let record = SubscriptionRecord::new("ping", handler, SubscriptionOptions::default());
        let codec = Codec::default();
        let (bytes, original_size, compression) = codec.encode(&Ping { n: 7 }).unwrap();
        let envelope = Envelope::builder("ping", "ping")
            .with_payload(bytes, original_size)
            .with_compression(compression)
            .build();
        let (context, _acks) = DeliveryContext::test_pair();

        // When
        record.dispatch(&envelope, &codec, context).await.unwrap();

        // Then
        assert_eq!(*received.lock().await, Some(Ping { n: 7 }));
    }

    #[test]
    fn new_records_start_registered() {
        // Given / When
        let handler = |_: Ping, _: DeliveryContext| async { Ok(()) };
        let record = SubscriptionRecord::new("ping", handler, SubscriptionOptions::default());

        // Then
        assert_eq!(record.state(), SubscriptionState::Registered);
        assert!(!record.is_active());
    }
}
