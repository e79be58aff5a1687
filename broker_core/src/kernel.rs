use crate::broker::{Broker, BrokerError, PublishOptions};
use crate::codec::Codec;
use crate::context::{Acknowledgement, DeliveryContext};
use crate::envelope::Envelope;
use crate::registry::SubscriptionRegistry;
use crate::subscription::{Handler, SubscriptionId, SubscriptionOptions};
use crate::transport::{RawDelivery, TransportAdapter};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// The lifecycle state of a [`BrokerKernel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecycleState {
    Inactive,
    Active,
    Disposed,
}

/// Configuration governing how the kernel derives routing keys and encodes
/// payloads.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// The exchange/topic used when [`PublishOptions::exchange`] is absent.
    pub default_exchange: Option<String>,
    /// A routing-key template supporting the tokens `{MessageType}`
    /// (a lowercased, short type tag) and `{MessageFullName}` (the same tag,
    /// case preserved — Rust type names don't carry a separate "full name"
    /// the way a reflective runtime would, so both tokens key off the same
    /// tag here).
    pub default_routing_key_pattern: String,
    /// The serialization/compression pipeline applied to every message.
    pub codec: Codec,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            default_exchange: None,
            default_routing_key_pattern: "{MessageType}".to_string(),
            codec: Codec::default(),
        }
    }
}

/// Derives the canonical message-type tag for `T`: the last path segment of
/// its Rust type name. Used both as the registry lookup key and as the
/// default routing-key token substitution.
pub fn type_tag<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}

fn resolve_routing_key(pattern: &str, message_type: &str) -> String {
    pattern
        .replace("{MessageType}", &message_type.to_lowercase())
        .replace("{MessageFullName}", message_type)
}

/// The broker abstraction kernel: owns the
/// [subscription registry](SubscriptionRegistry), the
/// [serialization pipeline](Codec), and a single
/// [`TransportAdapter`](crate::TransportAdapter). Implements [`Broker`]
/// directly, so it can sit at the innermost position of a decorator chain,
/// and additionally exposes the strongly-typed `publish`/`subscribe` entry
/// points application code actually calls.
pub struct BrokerKernel {
    config: KernelConfig,
    transport: Arc<dyn TransportAdapter>,
    registry: Arc<SubscriptionRegistry>,
    state: parking_lot::RwLock<LifecycleState>,
    wired_types: parking_lot::Mutex<HashSet<String>>,
    dispatch_tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl BrokerKernel {
    /// Creates a new kernel atop the given transport adapter, in the
    /// [inactive](LifecycleState::Inactive) state.
    pub fn new(transport: Arc<dyn TransportAdapter>, config: KernelConfig) -> Self {
        Self {
            config,
            transport,
            registry: Arc::new(SubscriptionRegistry::new()),
            state: parking_lot::RwLock::new(LifecycleState::Inactive),
            wired_types: parking_lot::Mutex::new(HashSet::new()),
            dispatch_tasks: parking_lot::Mutex::new(Vec::new()),
        }
    }

    fn require_not_disposed(&self) -> Result<(), BrokerError> {
        if *self.state.read() == LifecycleState::Disposed {
            return Err(BrokerError::Disposed);
        }
        Ok(())
    }

    /// Publishes a typed message, encoding it via this kernel's configured
    /// [`Codec`] and resolving its routing key from
    /// [`PublishOptions::routing_key`] or, failing that, from
    /// [`KernelConfig::default_routing_key_pattern`].
    pub async fn publish<T>(&self, message: &T, options: PublishOptions) -> Result<(), BrokerError>
    where
        T: Serialize + Send + Sync,
    {
        self.require_not_disposed()?;

        let message_type = type_tag::<T>();
        let (bytes, original_size, compression) = self.config.codec.encode(message)?;

        let routing_key = options
            .routing_key
            .clone()
            .unwrap_or_else(|| resolve_routing_key(&self.config.default_routing_key_pattern, message_type));

        let mut builder = Envelope::builder(message_type, routing_key)
            .with_payload(bytes, original_size)
            .with_compression(compression)
            .with_headers(options.headers.clone());

        if let Some(ref correlation_id) = options.correlation_id {
            builder = builder.with_correlation_id(correlation_id.clone());
        }

        let envelope = builder.build();

        self.publish_envelope(envelope, options).await
    }

    /// Registers a strongly-typed handler for messages of type `T`. May be
    /// called more than once for the same `T`; every active subscription for
    /// a type receives every message delivered for that type.
    ///
    /// If the kernel is already [active](LifecycleState::Active), the new
    /// subscription is wired to the transport immediately; otherwise it is
    /// wired the next time [`start`](Broker::start) runs.
    pub async fn subscribe<T, H>(
        &self,
        handler: H,
        options: SubscriptionOptions,
    ) -> Result<SubscriptionId, BrokerError>
    where
        T: DeserializeOwned + Send + 'static,
        H: Handler<T> + 'static,
    {
        self.require_not_disposed()?;

        let message_type = type_tag::<T>();
        let id = self.registry.subscribe::<T, H>(message_type, handler, options);

        if *self.state.read() == LifecycleState::Active {
            self.wire_type(message_type).await?;
            self.registry.activate_all();
        }

        Ok(id)
    }

    async fn wire_type(&self, message_type: &str) -> Result<(), BrokerError> {
        if !self.wired_types.lock().insert(message_type.to_string()) {
            return Ok(());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.transport
            .subscribe_raw(message_type, &SubscriptionOptions::default(), tx)
            .await?;

        let handle = tokio::spawn(dispatch_loop(
            message_type.to_string(),
            rx,
            self.registry.clone(),
            self.config.codec,
            self.transport.clone(),
        ));

        self.dispatch_tasks.lock().push(handle);

        Ok(())
    }
}

#[async_trait]
impl Broker for BrokerKernel {
    async fn publish_envelope(&self, envelope: Envelope, _options: PublishOptions) -> Result<(), BrokerError> {
        self.require_not_disposed()?;

        if envelope.message_type().is_empty() {
            return Err(BrokerError::ArgumentInvalid("message_type must not be empty".into()));
        }

        self.transport.publish_raw(envelope).await?;

        Ok(())
    }

    async fn start(&self) -> Result<(), BrokerError> {
        self.require_not_disposed()?;

        {
            let mut state = self.state.write();
            if *state == LifecycleState::Active {
                return Ok(());
            }
            *state = LifecycleState::Active;
        }

        self.transport.start_raw().await?;

        for message_type in self.registry.message_types() {
            self.wire_type(&message_type).await?;
        }

        self.registry.activate_all();

        Ok(())
    }

    async fn stop(&self) -> Result<(), BrokerError> {
        self.require_not_disposed()?;

        {
            let mut state = self.state.write();
            if *state == LifecycleState::Inactive {
                return Ok(());
            }
            *state = LifecycleState::Inactive;
        }

        self.registry.pause_all();
        self.transport.stop_raw().await?;

        Ok(())
    }

    async fn dispose(&self) -> Result<(), BrokerError> {
        if *self.state.read() == LifecycleState::Disposed {
            return Ok(());
        }

        self.registry.cancel_all();
        for handle in self.dispatch_tasks.lock().drain(..) {
            handle.abort();
        }

        if let Err(error) = self.transport.dispose_raw().await {
            warn!(?error, "transport failed to dispose cleanly");
        }

        *self.state.write() = LifecycleState::Disposed;

        Ok(())
    }
}

/// Runs for the lifetime of a single wired message type: pulls deliveries off
/// the transport's channel, fans each one out to every active subscription
/// for that type, and finalizes the delivery (ack/reject) against the
/// transport once all handlers have completed.
///
/// If every active subscription has `auto_ack` set, the kernel finalizes the
/// delivery itself based on the join outcome. If any subscription has
/// `auto_ack` disabled, finalization is left to an explicit
/// [`DeliveryContext::acknowledge`]/[`DeliveryContext::reject`] call from
/// whichever handler calls it first; the other handlers' decisions (if any)
/// are then no-ops, since the transport has already been told.
async fn dispatch_loop(
    message_type: String,
    mut rx: mpsc::UnboundedReceiver<RawDelivery>,
    registry: Arc<SubscriptionRegistry>,
    codec: Codec,
    transport: Arc<dyn TransportAdapter>,
) {
    while let Some(delivery) = rx.recv().await {
        let subscriptions = registry.active_for(&message_type);

        if subscriptions.is_empty() {
            debug!(message_type = %message_type, "dropped delivery with no active subscribers");
            continue;
        }

        let auto_ack = subscriptions.iter().all(|s| s.options().auto_ack);
        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();

        let dispatches = subscriptions.iter().map(|subscription| {
            let context = DeliveryContext::new(
                delivery.envelope.message_id().to_string(),
                delivery.envelope.correlation_id().map(str::to_string),
                delivery.envelope.timestamp(),
                delivery.envelope.routing_key().to_string(),
                delivery.envelope.headers().clone(),
                subscription.options().auto_ack,
                ack_tx.clone(),
                tokio_util::sync::CancellationToken::new(),
            );
            subscription.dispatch(&delivery.envelope, &codec, context)
        });

        let results = futures::future::join_all(dispatches).await;
        drop(ack_tx);

        let mut any_error = false;
        let mut any_transient = false;
        for result in &results {
            if let Err(error) = result {
                any_error = true;
                any_transient |= error.is_transient();
                warn!(
                    message_type = %message_type,
                    message_id = delivery.envelope.message_id(),
                    %error,
                    "handler failed while processing delivery",
                );
            }
        }

        if auto_ack {
            let decision = if any_error {
                Acknowledgement::Reject { requeue: any_transient }
            } else {
                Acknowledgement::Ack
            };
            finalize_delivery(&transport, delivery.delivery_tag, decision).await;
        } else if let Some(decision) = ack_rx.recv().await {
            finalize_delivery(&transport, delivery.delivery_tag, decision).await;
        }
    }

    debug!(message_type = %message_type, "dispatch loop ended: transport channel closed");
}

/// Finalizes a single delivery against the transport, based on the
/// acknowledgement decision gathered from the active subscriptions that
/// handled it.
async fn finalize_delivery(transport: &Arc<dyn TransportAdapter>, delivery_tag: u64, decision: Acknowledgement) {
    let result = match decision {
        Acknowledgement::Ack => transport.ack_raw(delivery_tag).await,
        Acknowledgement::Reject { requeue } => transport.reject_raw(delivery_tag, requeue).await,
    };

    if let Err(error) = result {
        error!(?error, delivery_tag, "failed to finalize delivery against transport");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope as Env;
    use pretty_assertions::assert_eq;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn resolve_routing_key_substitutes_both_tokens() {
        // Given
        let pattern = "events.{MessageType}.{MessageFullName}";

        // When
        let resolved = resolve_routing_key(pattern, "OrderPlaced");

        // Then
        assert_eq!(resolved, "events.orderplaced.OrderPlaced");
    }

    #[test]
    fn type_tag_takes_last_path_segment() {
        // Given / When
        let tag = type_tag::<std::collections::HashMap<String, i32>>();

        // Then
        assert!(tag.starts_with("HashMap<"));
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }

    /// A trivial in-memory transport used only by this module's own tests;
    /// the workspace's reference transport lives in the `broker` facade
    /// crate and is exercised by its own integration tests instead.
    #[derive(Default)]
    struct LoopbackTransport {
        sender: parking_lot::Mutex<Option<mpsc::UnboundedSender<RawDelivery>>>,
        next_tag: AtomicUsize,
        acked: parking_lot::Mutex<Vec<u64>>,
        rejected: parking_lot::Mutex<Vec<(u64, bool)>>,
    }

    #[async_trait]
    impl TransportAdapter for LoopbackTransport {
        async fn start_raw(&self) -> Result<(), crate::transport::TransportError> {
            Ok(())
        }

        async fn stop_raw(&self) -> Result<(), crate::transport::TransportError> {
            Ok(())
        }

        async fn dispose_raw(&self) -> Result<(), crate::transport::TransportError> {
            Ok(())
        }

        async fn publish_raw(&self, envelope: Env) -> Result<(), crate::transport::TransportError> {
            let tag = self.next_tag.fetch_add(1, Ordering::SeqCst) as u64;
            if let Some(sender) = self.sender.lock().as_ref() {
                let _ = sender.send(RawDelivery {
                    delivery_tag: tag,
                    envelope,
                });
            }
            Ok(())
        }

        async fn subscribe_raw(
            &self,
            _message_type: &str,
            _options: &SubscriptionOptions,
            deliveries: mpsc::UnboundedSender<RawDelivery>,
        ) -> Result<(), crate::transport::TransportError> {
            *self.sender.lock() = Some(deliveries);
            Ok(())
        }

        async fn ack_raw(&self, delivery_tag: u64) -> Result<(), crate::transport::TransportError> {
            self.acked.lock().push(delivery_tag);
            Ok(())
        }

        async fn reject_raw(&self, delivery_tag: u64, requeue: bool) -> Result<(), crate::transport::TransportError> {
            self.rejected.lock().push((delivery_tag, requeue));
            Ok(())
        }
    }

    #[tokio::test]
    async fn publish_then_subscribe_roundtrips_through_loopback() {
        // Given
        let transport = Arc::new(LoopbackTransport::default());
        let kernel = BrokerKernel::new(transport.clone(), KernelConfig::default());
        let received = Arc::new(tokio::sync::Mutex::new(None));
        let received_clone = received.clone();

        kernel
            .subscribe::<Ping, _>(
                move |message: Ping, _ctx: DeliveryContext| {
                    let received = received_clone.clone();
                    async move {
                        *received.lock().await = Some(message);
                        Ok(())
                    }
                },
                SubscriptionOptions::default(),
            )
            .await
            .unwrap();

        kernel.start().await.unwrap();

        // When
        kernel.publish(&Ping { n: 42 }, PublishOptions::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Then
        assert_eq!(*received.lock().await, Some(Ping { n: 42 }));
        assert_eq!(*transport.acked.lock(), vec![0]);
    }

    #[tokio::test]
    async fn failed_handler_rejects_with_requeue_when_transient() {
        // Given
        let transport = Arc::new(LoopbackTransport::default());
        let kernel = BrokerKernel::new(transport.clone(), KernelConfig::default());

        kernel
            .subscribe::<Ping, _>(
                |_message: Ping, _ctx: DeliveryContext| async {
                    Err(crate::subscription::HandlerError::application("boom", true))
                },
                SubscriptionOptions::default(),
            )
            .await
            .unwrap();

        kernel.start().await.unwrap();

        // When
        kernel.publish(&Ping { n: 1 }, PublishOptions::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Then
        assert_eq!(*transport.rejected.lock(), vec![(0, true)]);
        assert!(transport.acked.lock().is_empty());
    }

    #[tokio::test]
    async fn dispose_stops_accepting_new_subscriptions() {
        // Given
        let transport = Arc::new(LoopbackTransport::default());
        let kernel = BrokerKernel::new(transport, KernelConfig::default());
        kernel.dispose().await.unwrap();

        // When
        let result = kernel
            .subscribe::<Ping, _>(
                |_: Ping, _: DeliveryContext| async { Ok(()) },
                SubscriptionOptions::default(),
            )
            .await;

        // Then
        assert!(matches!(result, Err(BrokerError::Disposed)));
    }
}
