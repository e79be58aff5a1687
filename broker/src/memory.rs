use async_trait::async_trait;
use broker_core::{Envelope, RawDelivery, SubscriptionOptions, TransportAdapter, TransportError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;

/// An in-process, in-memory [`TransportAdapter`]: a per-routing-key broadcast
/// queue. Every subscriber registered for a routing key receives its own copy
/// of every envelope published to that key; there is no consumer-group
/// partitioning, no persistence across restarts, and no wire format.
///
/// This is the workspace's one concrete transport, shipped as a reference
/// implementation and as the vehicle for this crate's own integration tests.
/// A real backend (AMQP, Kafka, NATS, a cloud queue) is the explicitly
/// out-of-scope concern of a downstream adapter crate.
pub struct MemoryTransport {
    queues: parking_lot::RwLock<HashMap<String, Vec<mpsc::UnboundedSender<RawDelivery>>>>,
    next_tag: AtomicU64,
    disposed: AtomicBool,
    acked: parking_lot::Mutex<Vec<u64>>,
    rejected: parking_lot::Mutex<Vec<(u64, bool)>>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self {
            queues: parking_lot::RwLock::new(HashMap::new()),
            next_tag: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
            acked: parking_lot::Mutex::new(Vec::new()),
            rejected: parking_lot::Mutex::new(Vec::new()),
        }
    }
}

impl MemoryTransport {
    /// Builds an empty, undisposed transport with no registered subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// The delivery tags acknowledged so far, in the order they arrived.
    pub fn acked(&self) -> Vec<u64> {
        self.acked.lock().clone()
    }

    /// The delivery tags rejected so far, paired with their requeue flag, in
    /// the order they arrived.
    pub fn rejected(&self) -> Vec<(u64, bool)> {
        self.rejected.lock().clone()
    }

    fn require_not_disposed(&self) -> Result<(), TransportError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(TransportError::Permanent("transport has been disposed".into()));
        }
        Ok(())
    }

    fn resolve_key(message_type: &str, options: &SubscriptionOptions) -> String {
        options
            .routing_key
            .clone()
            .unwrap_or_else(|| message_type.to_lowercase())
    }
}

#[async_trait]
impl TransportAdapter for MemoryTransport {
    async fn start_raw(&self) -> Result<(), TransportError> {
        self.require_not_disposed()
    }

    async fn stop_raw(&self) -> Result<(), TransportError> {
        self.require_not_disposed()
    }

    async fn dispose_raw(&self) -> Result<(), TransportError> {
        self.disposed.store(true, Ordering::SeqCst);
        self.queues.write().clear();
        Ok(())
    }

    async fn publish_raw(&self, envelope: Envelope) -> Result<(), TransportError> {
        self.require_not_disposed()?;

        let queues = self.queues.read();
        if let Some(subscribers) = queues.get(envelope.routing_key()) {
            for subscriber in subscribers {
                let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
                let _ = subscriber.send(RawDelivery {
                    delivery_tag: tag,
                    envelope: envelope.clone(),
                });
            }
        }

        Ok(())
    }

    async fn subscribe_raw(
        &self,
        message_type: &str,
        options: &SubscriptionOptions,
        deliveries: mpsc::UnboundedSender<RawDelivery>,
    ) -> Result<(), TransportError> {
        self.require_not_disposed()?;

        let key = Self::resolve_key(message_type, options);
        self.queues.write().entry(key).or_default().push(deliveries);

        Ok(())
    }

    async fn ack_raw(&self, delivery_tag: u64) -> Result<(), TransportError> {
        self.require_not_disposed()?;
        self.acked.lock().push(delivery_tag);
        Ok(())
    }

    async fn reject_raw(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        self.require_not_disposed()?;
        self.rejected.lock().push((delivery_tag, requeue));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_core::Envelope as Env;
    use pretty_assertions::assert_eq;

    fn envelope(routing_key: &str) -> Env {
        Env::builder("Ping", routing_key).with_payload(b"hi".to_vec(), 2).build()
    }

    #[tokio::test]
    async fn publish_broadcasts_to_every_subscriber_on_the_same_routing_key() {
        // Given
        let transport = MemoryTransport::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        transport.subscribe_raw("Ping", &SubscriptionOptions::default(), tx_a).await.unwrap();
        transport.subscribe_raw("Ping", &SubscriptionOptions::default(), tx_b).await.unwrap();

        // When
        transport.publish_raw(envelope("ping")).await.unwrap();

        // Then
        assert!(rx_a.recv().await.is_some());
        assert!(rx_b.recv().await.is_some());
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_is_a_silent_no_op() {
        // Given
        let transport = MemoryTransport::new();

        // When / Then
        transport.publish_raw(envelope("nobody-home")).await.unwrap();
    }

    #[tokio::test]
    async fn disposed_transport_rejects_every_further_call() {
        // Given
        let transport = MemoryTransport::new();
        transport.dispose_raw().await.unwrap();

        // When
        let result = transport.publish_raw(envelope("ping")).await;

        // Then
        assert!(matches!(result, Err(TransportError::Permanent(_))));
    }

    #[tokio::test]
    async fn ack_and_reject_are_recorded_for_inspection() {
        // Given
        let transport = MemoryTransport::new();

        // When
        transport.ack_raw(1).await.unwrap();
        transport.reject_raw(2, true).await.unwrap();

        // Then
        assert_eq!(transport.acked(), vec![1]);
        assert_eq!(transport.rejected(), vec![(2, true)]);
    }
}
