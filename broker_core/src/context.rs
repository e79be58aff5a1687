use crate::headers::Headers;
use std::time::SystemTime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// The decision a handler (or the kernel, on the handler's behalf when
/// `auto_ack` is set) makes about a delivered message once processing has
/// finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgement {
    /// The message was processed successfully; the transport should consider
    /// it consumed.
    Ack,
    /// The message was not processed successfully; `requeue` decides whether
    /// the transport should attempt redelivery.
    Reject {
        /// Whether the transport should requeue the message for redelivery.
        requeue: bool,
    },
}

/// Carried alongside a decoded message into every
/// [`Handler`](crate::Handler) invocation. Exposes the envelope's identifying
/// metadata and the two ways a handler can finalize a message when
/// `auto_ack` is disabled.
#[derive(Debug)]
pub struct DeliveryContext {
    message_id: String,
    correlation_id: Option<String>,
    timestamp: SystemTime,
    routing_key: String,
    headers: Headers,
    auto_ack: bool,
    sink: Option<mpsc::UnboundedSender<Acknowledgement>>,
    cancel: CancellationToken,
}

impl DeliveryContext {
    pub(crate) fn new(
        message_id: String,
        correlation_id: Option<String>,
        timestamp: SystemTime,
        routing_key: String,
        headers: Headers,
        auto_ack: bool,
        sink: mpsc::UnboundedSender<Acknowledgement>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            message_id,
            correlation_id,
            timestamp,
            routing_key,
            headers,
            auto_ack,
            sink: Some(sink),
            cancel,
        }
    }

    /// The unique identifier of the message being handled.
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// The correlation identifier of the message being handled, if any.
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// The instant the message entered the system.
    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    /// The routing key the message was delivered on.
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// The message's header bag.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Whether this subscription is configured for automatic acknowledgement
    /// (in which case calling [`acknowledge`](DeliveryContext::acknowledge) or
    /// [`reject`](DeliveryContext::reject) explicitly is optional and merely
    /// redundant with what the kernel will do on the handler's behalf).
    pub fn is_auto_ack(&self) -> bool {
        self.auto_ack
    }

    /// Cancelled when this delivery's handling should stop: the
    /// subscription was cancelled, or the kernel is shutting down.
    pub fn cancel(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Explicitly acknowledges the message represented by this context.
    pub fn acknowledge(&self) {
        self.send(Acknowledgement::Ack);
    }

    /// Explicitly rejects the message represented by this context, optionally
    /// requesting redelivery.
    pub fn reject(&self, requeue: bool) {
        self.send(Acknowledgement::Reject { requeue });
    }

    fn send(&self, decision: Acknowledgement) {
        if let Some(sink) = &self.sink {
            // A closed receiver means the kernel already finalized this
            // delivery (e.g., via auto-ack); a late explicit call is a no-op.
            let _ = sink.send(decision);
        }
    }

    /// Builds a throwaway context and a channel for observing the
    /// acknowledgement decisions made against it. Used by this crate's own
    /// tests and by decorator crates exercising a bare handler in isolation.
    #[doc(hidden)]
    pub fn test_pair() -> (Self, mpsc::UnboundedReceiver<Acknowledgement>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let context = Self::new(
            "test-message-id".into(),
            None,
            SystemTime::now(),
            "test".into(),
            Headers::new(),
            true,
            tx,
            CancellationToken::new(),
        );
        (context, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn explicit_ack_is_observable() {
        // Given
        let (context, mut acks) = DeliveryContext::test_pair();

        // When
        context.acknowledge();

        // Then
        assert_eq!(acks.recv().await, Some(Acknowledgement::Ack));
    }

    #[tokio::test]
    async fn explicit_reject_carries_requeue_flag() {
        // Given
        let (context, mut acks) = DeliveryContext::test_pair();

        // When
        context.reject(true);

        // Then
        assert_eq!(acks.recv().await, Some(Acknowledgement::Reject { requeue: true }));
    }
}
